//! Reservation workers: claim due tasks and feed the handoff queue.
//!
//! A worker only calls `reserve` after securing handoff queue slots, and
//! claims at most as many tasks as slots it holds. While execution is
//! saturated the worker blocks instead of claiming, so no lease is burned on
//! a task that cannot start.

use std::{sync::Arc, time::Duration};

use hooky_core::Task;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SchedulerError},
    scheduler::Shared,
};

enum Poll {
    /// Claimed a full batch; more is probably due.
    Full,
    /// Claimed less than asked for.
    Drained,
    /// Cancelled while waiting for queue space.
    Cancelled,
}

/// One of the N workers polling the store.
pub(crate) struct ReservationWorker {
    id: usize,
    shared: Arc<Shared>,
    queue: mpsc::Sender<Task>,
    cancellation_token: CancellationToken,
}

impl ReservationWorker {
    pub(crate) fn new(
        id: usize,
        shared: Arc<Shared>,
        queue: mpsc::Sender<Task>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, shared, queue, cancellation_token }
    }

    /// Polls until cancelled.
    pub(crate) async fn run(self) -> Result<()> {
        // Spread workers across the poll interval so they do not all hit the
        // store on the same tick.
        if self.shared.config.reservation_workers > 1 {
            let offset = start_offset(self.shared.config.poll_interval);
            if !self.wait(offset).await {
                return Ok(());
            }
        }

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.poll().await {
                Ok(Poll::Full) => {},
                Ok(Poll::Drained) => {
                    if !self.wait(self.shared.config.poll_interval).await {
                        break;
                    }
                },
                Ok(Poll::Cancelled) => break,
                Err(error) => {
                    warn!(worker_id = self.id, error = %error, "reserve failed, retrying next tick");
                    if !self.wait(self.shared.config.poll_interval).await {
                        break;
                    }
                },
            }
        }

        info!(worker_id = self.id, "reservation worker stopped");
        Ok(())
    }

    /// Sleeps for `period` or until woken. Returns false once cancelled.
    async fn wait(&self, period: Duration) -> bool {
        tokio::select! {
            () = self.shared.clock.sleep(period) => true,
            () = self.shared.wake.notified() => true,
            () = self.cancellation_token.cancelled() => false,
        }
    }

    async fn poll(&self) -> Result<Poll> {
        let first = tokio::select! {
            permit = self.queue.reserve() => {
                permit.map_err(|_| SchedulerError::internal("handoff queue closed"))?
            },
            () = self.cancellation_token.cancelled() => return Ok(Poll::Cancelled),
        };

        // Every claimed task needs a slot it already owns. Other workers
        // compete for the same slots, so size the claim from what we hold.
        let config = &self.shared.config;
        let mut permits = vec![first];
        while permits.len() < config.batch_size {
            match self.queue.try_reserve() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }
        let limit = permits.len();

        let tasks = self.shared.store.reserve(limit, self.shared.owner, config.lease_duration).await?;
        let claimed = tasks.len();
        if claimed == 0 {
            return Ok(Poll::Drained);
        }

        self.shared.stats.write().await.reserved += claimed as u64;
        debug!(worker_id = self.id, claimed, limit, "reserved tasks");

        // Unused permits are dropped here, freeing their slots.
        for (permit, task) in permits.into_iter().zip(tasks) {
            permit.send(task);
        }

        Ok(if claimed >= limit { Poll::Full } else { Poll::Drained })
    }
}

fn start_offset(poll_interval: Duration) -> Duration {
    let max_ms = u64::try_from(poll_interval.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_offset_stays_within_poll_interval() {
        for _ in 0..100 {
            assert!(start_offset(Duration::from_millis(250)) < Duration::from_millis(250));
        }
        assert_eq!(start_offset(Duration::ZERO), Duration::ZERO);
    }
}
