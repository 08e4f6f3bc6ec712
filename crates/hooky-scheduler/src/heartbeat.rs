//! Heartbeat loop: keeps this scheduler's leases alive.
//!
//! Every `touch_interval` the loop extends all leases held by the
//! scheduler's owner identity. If the process dies the heartbeat stops with
//! it, leases run out, and other schedulers reclaim the tasks.
//!
//! Tasks this owner gave up on but could not release are retried first, so
//! the touch never keeps a lease alive that nobody is working on.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::Result, scheduler::Shared};

pub(crate) struct HeartbeatLoop {
    shared: Arc<Shared>,
    cancellation_token: CancellationToken,
}

impl HeartbeatLoop {
    pub(crate) fn new(shared: Arc<Shared>, cancellation_token: CancellationToken) -> Self {
        Self { shared, cancellation_token }
    }

    pub(crate) async fn run(self) -> Result<()> {
        let config = &self.shared.config;

        loop {
            tokio::select! {
                () = self.shared.clock.sleep(config.touch_interval) => {},
                () = self.cancellation_token.cancelled() => break,
            }

            self.shared.release_abandoned().await;

            match self.shared.store.touch(self.shared.owner, config.lease_duration).await {
                Ok(0) => {},
                Ok(touched) => {
                    debug!(owner = %self.shared.owner, touched, "extended leases");
                    self.shared.stats.write().await.touched += touched;
                },
                Err(error) => {
                    warn!(owner = %self.shared.owner, error = %error, "touch failed, retrying next tick");
                },
            }
        }

        info!("heartbeat loop stopped");
        Ok(())
    }
}
