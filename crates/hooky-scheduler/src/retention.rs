//! Retention loop: deletes attempt history past its retention age.
//!
//! Purely storage hygiene. Task state is never read or written here, and a
//! failed purge is simply tried again on the next tick.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::Result, scheduler::Shared};

pub(crate) struct RetentionLoop {
    shared: Arc<Shared>,
    cancellation_token: CancellationToken,
}

impl RetentionLoop {
    pub(crate) fn new(shared: Arc<Shared>, cancellation_token: CancellationToken) -> Self {
        Self { shared, cancellation_token }
    }

    pub(crate) async fn run(self) -> Result<()> {
        let config = &self.shared.config;
        let Ok(retention) = chrono::Duration::from_std(config.attempt_retention) else {
            warn!(retention = ?config.attempt_retention, "retention age out of range, retention disabled");
            return Ok(());
        };

        loop {
            tokio::select! {
                () = self.shared.clock.sleep(config.retention_interval) => {},
                () = self.cancellation_token.cancelled() => break,
            }

            let Some(cutoff) = self.shared.clock.now_utc().checked_sub_signed(retention) else {
                continue;
            };
            match self.shared.store.purge_attempts(cutoff).await {
                Ok(0) => {},
                Ok(purged) => {
                    debug!(purged, %cutoff, "purged expired attempts");
                    self.shared.stats.write().await.purged += purged;
                },
                Err(error) => {
                    warn!(error = %error, "attempt purge failed, retrying next tick");
                },
            }
        }

        info!("retention loop stopped");
        Ok(())
    }
}
