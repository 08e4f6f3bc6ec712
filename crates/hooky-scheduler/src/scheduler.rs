//! Scheduler lifecycle: owns every loop and joins them on stop.
//!
//! `start` spawns N reservation workers, M execution workers, one heartbeat
//! and one retention loop. `stop` cancels the workers, waits for in-flight
//! deliveries within the shutdown grace period, hands queued-but-unstarted
//! tasks back to the store, and returns only once no loop is left running.
//! The heartbeat has its own token and is cancelled last, so leases stay
//! alive for as long as a delivery may still be running.

use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use hooky_core::{BackoffPolicy, Clock, OwnerId, Task, TaskId};
use tokio::{
    sync::{mpsc, Mutex, Notify, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::Backoff,
    client::Dispatcher,
    error::{Result, SchedulerError},
    execution::{self, Execution, ExecutionWorker},
    heartbeat::HeartbeatLoop,
    reservation::ReservationWorker,
    retention::RetentionLoop,
    storage::TaskStore,
};

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrent reservation workers (N).
    pub reservation_workers: usize,

    /// Concurrent execution workers (M).
    pub execution_workers: usize,

    /// Tasks claimed per `reserve` call.
    pub batch_size: usize,

    /// Capacity of the handoff queue between the two pools.
    pub handoff_capacity: usize,

    /// Idle wait between polls when nothing was due.
    pub poll_interval: Duration,

    /// Lease granted by `reserve` and renewed by `touch`.
    pub lease_duration: Duration,

    /// Heartbeat period.
    pub touch_interval: Duration,

    /// Attempts older than this are purged.
    pub attempt_retention: Duration,

    /// Retention loop period.
    pub retention_interval: Duration,

    /// Grace period for `stop`.
    pub shutdown_timeout: Duration,

    /// Backoff for tasks without their own policy.
    pub default_backoff: Arc<dyn Backoff>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reservation_workers: crate::DEFAULT_RESERVATION_WORKERS,
            execution_workers: crate::DEFAULT_EXECUTION_WORKERS,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            handoff_capacity: crate::DEFAULT_EXECUTION_WORKERS,
            poll_interval: Duration::from_secs(1),
            lease_duration: Duration::from_secs(60),
            touch_interval: Duration::from_secs(5),
            attempt_retention: Duration::from_secs(168 * 3600),
            retention_interval: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(30),
            default_backoff: Arc::new(BackoffPolicy::Exponential {
                min_ms: 1_000,
                max_ms: 3_600_000,
                factor: 2.0,
            }),
        }
    }
}

impl SchedulerConfig {
    /// Rejects configurations the loops cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Configuration` naming the first problem.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("reservation_workers", self.reservation_workers),
            ("execution_workers", self.execution_workers),
            ("batch_size", self.batch_size),
            ("handoff_capacity", self.handoff_capacity),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(SchedulerError::configuration(format!("{name} must be greater than 0")));
        }

        let periods = [
            ("poll_interval", self.poll_interval),
            ("touch_interval", self.touch_interval),
            ("retention_interval", self.retention_interval),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| value.is_zero()) {
            return Err(SchedulerError::configuration(format!("{name} must be greater than 0")));
        }

        if self.lease_duration <= self.touch_interval {
            return Err(SchedulerError::configuration(format!(
                "lease_duration ({:?}) must exceed touch_interval ({:?})",
                self.lease_duration, self.touch_interval
            )));
        }

        let margin = self.lease_margin();
        if self.shutdown_timeout >= margin {
            return Err(SchedulerError::configuration(format!(
                "shutdown_timeout ({:?}) must be below lease_duration - touch_interval ({margin:?})",
                self.shutdown_timeout
            )));
        }

        Ok(())
    }

    /// Shortest lease left on a live task between two heartbeats.
    ///
    /// Any single blocking step on a reserved task (an HTTP request, the
    /// shutdown drain) must finish within this window.
    pub fn lease_margin(&self) -> Duration {
        self.lease_duration.saturating_sub(self.touch_interval)
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No loops running.
    Stopped,
    /// Loops are being spawned.
    Starting,
    /// All loops are live.
    Running,
    /// Loops are being cancelled and joined.
    Stopping,
}

/// Counters for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Loops currently spawned.
    pub active_workers: usize,
    /// Tasks claimed by reservation workers.
    pub reserved: u64,
    /// Successful deliveries, including recurring re-arms.
    pub delivered: u64,
    /// Retryable failures scheduled for another attempt.
    pub retried: u64,
    /// Tasks moved to Failed.
    pub failed: u64,
    /// Completions rejected because the lease had moved.
    pub lease_lost: u64,
    /// Queued tasks handed back on stop.
    pub released: u64,
    /// Tasks handed back because their outcome could not be recorded.
    pub abandoned: u64,
    /// Lease extensions written by the heartbeat.
    pub touched: u64,
    /// Attempts deleted by retention.
    pub purged: u64,
    /// Deliveries currently in progress.
    pub in_flight: u64,
}

/// State shared by every loop.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) owner: OwnerId,
    pub(crate) config: SchedulerConfig,
    pub(crate) stats: RwLock<SchedulerStats>,
    pub(crate) wake: Notify,
    /// Tasks whose release failed after a failed outcome write. The
    /// heartbeat keeps retrying them.
    pub(crate) abandoned: Mutex<HashSet<TaskId>>,
}

impl Shared {
    /// Gives up on a claimed task whose attempt or completion could not be
    /// written, returning it to Pending so it is redelivered.
    ///
    /// The heartbeat extends every lease this owner holds, so a task left
    /// Reserved here would never expire. If the release fails too, the task
    /// is parked for the heartbeat to retry.
    pub(crate) async fn abandon(&self, task_id: TaskId) {
        self.stats.write().await.abandoned += 1;
        match self.store.release(task_id, self.owner).await {
            Ok(released) => {
                debug!(task_id = %task_id, released, "handed back task after failed write");
            },
            Err(error) => {
                warn!(task_id = %task_id, error = %error, "release failed, retrying on heartbeat");
                self.abandoned.lock().await.insert(task_id);
            },
        }
    }

    /// Retries releases parked by `abandon`.
    pub(crate) async fn release_abandoned(&self) {
        let parked: Vec<TaskId> = self.abandoned.lock().await.iter().copied().collect();
        for task_id in parked {
            match self.store.release(task_id, self.owner).await {
                Ok(released) => {
                    debug!(task_id = %task_id, released, "released abandoned task");
                    self.abandoned.lock().await.remove(&task_id);
                },
                Err(error) => {
                    warn!(task_id = %task_id, error = %error, "release still failing");
                },
            }
        }
    }
}

struct Worker {
    kind: &'static str,
    id: usize,
    handle: Option<JoinHandle<Result<()>>>,
}

struct Running {
    cancellation_token: CancellationToken,
    heartbeat_token: CancellationToken,
    workers: Vec<Worker>,
    heartbeat: Worker,
    queue: Arc<Mutex<mpsc::Receiver<Task>>>,
}

/// Lease-based webhook scheduler.
///
/// Holds no task state of its own: every claim, extension and completion
/// goes through the `TaskStore`, so several schedulers can share one store.
pub struct Scheduler {
    shared: Arc<Shared>,
    dispatcher: Arc<dyn Dispatcher>,
    state: SchedulerState,
    running: Option<Running>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("owner", &self.shared.owner)
            .field("state", &self.state)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a stopped scheduler with a fresh owner identity.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Configuration` if `config` is invalid.
    pub fn new(
        store: Arc<dyn TaskStore>,
        dispatcher: Arc<dyn Dispatcher>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            store,
            clock,
            owner: OwnerId::new(),
            config,
            stats: RwLock::new(SchedulerStats::default()),
            wake: Notify::new(),
            abandoned: Mutex::new(HashSet::new()),
        });

        Ok(Self { shared, dispatcher, state: SchedulerState::Stopped, running: None })
    }

    /// Identity this scheduler reserves tasks under.
    pub fn owner(&self) -> OwnerId {
        self.shared.owner
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Snapshot of the counters.
    pub async fn stats(&self) -> SchedulerStats {
        self.shared.stats.read().await.clone()
    }

    /// Wakes idle reservation workers so they poll immediately.
    pub fn wake(&self) {
        self.shared.wake.notify_waiters();
    }

    /// Spawns every loop and returns once they are live.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyRunning` unless the scheduler is
    /// stopped.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != SchedulerState::Stopped {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.state = SchedulerState::Starting;

        let config = &self.shared.config;
        info!(
            owner = %self.shared.owner,
            reservation_workers = config.reservation_workers,
            execution_workers = config.execution_workers,
            batch_size = config.batch_size,
            "starting scheduler"
        );

        let cancellation_token = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<Task>(config.handoff_capacity);
        let queue = Arc::new(Mutex::new(rx));
        let mut workers = Vec::new();

        for id in 0..config.reservation_workers {
            let worker = ReservationWorker::new(
                id,
                self.shared.clone(),
                tx.clone(),
                cancellation_token.clone(),
            );
            workers.push(spawn("reservation", id, worker.run()));
        }
        // Reservation workers hold the only senders; the queue closes once
        // they have all exited.
        drop(tx);

        for id in 0..config.execution_workers {
            let worker = ExecutionWorker::new(
                id,
                self.shared.clone(),
                self.dispatcher.clone(),
                queue.clone(),
                cancellation_token.clone(),
            );
            workers.push(spawn("execution", id, worker.run()));
        }

        let retention = RetentionLoop::new(self.shared.clone(), cancellation_token.clone());
        workers.push(spawn("retention", 0, retention.run()));

        let heartbeat_token = CancellationToken::new();
        let heartbeat = HeartbeatLoop::new(self.shared.clone(), heartbeat_token.clone());
        let heartbeat = spawn("heartbeat", 0, heartbeat.run());

        self.shared.stats.write().await.active_workers = workers.len() + 1;
        self.running =
            Some(Running { cancellation_token, heartbeat_token, workers, heartbeat, queue });
        self.state = SchedulerState::Running;

        info!(owner = %self.shared.owner, "scheduler started");
        Ok(())
    }

    /// Cancels every loop and joins them.
    ///
    /// In-flight deliveries get up to the shutdown timeout to finish; any
    /// loop still running after that is aborted. Tasks claimed but not yet
    /// started are released back to Pending. Calling `stop` on a stopped
    /// scheduler does nothing.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if loops had to be aborted and
    /// `WorkerPanic` if a loop panicked. In both cases the scheduler is
    /// stopped when this returns.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        self.state = SchedulerState::Stopping;

        let timeout = self.shared.config.shutdown_timeout;
        info!(
            owner = %self.shared.owner,
            workers = running.workers.len() + 1,
            timeout_seconds = timeout.as_secs(),
            "stopping scheduler"
        );

        running.cancellation_token.cancel();

        let joined = tokio::time::timeout(timeout, join_all(&mut running.workers)).await;
        let mut result = match joined {
            Ok(joined) => joined,
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "loops did not stop in time, aborting"
                );
                for handle in running.workers.iter().filter_map(|w| w.handle.as_ref()) {
                    handle.abort();
                }
                // Aborted tasks still have to be joined before we return.
                let _ = join_all(&mut running.workers).await;
                Err(SchedulerError::ShutdownTimeout { timeout_secs: timeout.as_secs() })
            },
        };

        if let Err(error) = self.release_queued(&running.queue).await {
            warn!(error = %error, "failed to release queued tasks");
            result = result.and(Err(error));
        }
        self.shared.release_abandoned().await;

        // Only now is no delivery left that could need its lease extended.
        running.heartbeat_token.cancel();
        let heartbeat = join_all(std::slice::from_mut(&mut running.heartbeat)).await;
        result = result.and(heartbeat);

        self.shared.stats.write().await.active_workers = 0;
        self.state = SchedulerState::Stopped;
        info!(owner = %self.shared.owner, "scheduler stopped");

        result
    }

    /// Claims one batch and executes it on the calling task.
    ///
    /// Returns how many claimed tasks were completed by this scheduler.
    /// Every claimed task is executed even if an earlier one fails to record
    /// its outcome; such tasks are handed back to Pending.
    ///
    /// # Errors
    ///
    /// Returns a store error from `reserve`, or the first error from
    /// `append_attempt` or `complete` once the whole batch has run.
    pub async fn run_once(&self) -> Result<usize> {
        let shared = &self.shared;
        let tasks = shared
            .store
            .reserve(shared.config.batch_size, shared.owner, shared.config.lease_duration)
            .await?;
        shared.stats.write().await.reserved += tasks.len() as u64;

        let mut completed = 0;
        let mut first_error = None;
        for task in tasks {
            match execution::execute(shared, self.dispatcher.as_ref(), task).await {
                Ok(Execution::Completed(_)) => completed += 1,
                Ok(Execution::LeaseLost) => {},
                Err(error) => {
                    first_error.get_or_insert(error);
                },
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(completed),
        }
    }

    async fn release_queued(&self, queue: &Mutex<mpsc::Receiver<Task>>) -> Result<()> {
        let mut queue = queue.lock().await;
        queue.close();

        let mut released = 0;
        while let Ok(task) = queue.try_recv() {
            if self.shared.store.release(task.id, self.shared.owner).await? {
                released += 1;
            }
        }

        if released > 0 {
            debug!(released, "released queued tasks");
            self.shared.stats.write().await.released += released;
        }

        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            if !running.cancellation_token.is_cancelled() {
                warn!(
                    owner = %self.shared.owner,
                    "scheduler dropped while running, cancelling loops without joining"
                );
                running.cancellation_token.cancel();
            }
            running.heartbeat_token.cancel();
        }
    }
}

fn spawn<F>(kind: &'static str, id: usize, future: F) -> Worker
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        debug!(kind, worker_id = id, "loop starting");
        let result = future.await;
        if let Err(ref error) = result {
            error!(kind, worker_id = id, error = %error, "loop terminated with error");
        }
        result
    });

    Worker { kind, id, handle: Some(handle) }
}

/// Joins every handle still pending. Safe to call again after being
/// interrupted: finished handles are cleared.
async fn join_all(workers: &mut [Worker]) -> Result<()> {
    let mut panic = None;

    for worker in workers.iter_mut() {
        let Some(handle) = worker.handle.as_mut() else {
            continue;
        };
        let joined = handle.await;
        worker.handle = None;

        match joined {
            Ok(Ok(())) => {},
            Ok(Err(error)) => {
                warn!(
                    kind = worker.kind,
                    worker_id = worker.id,
                    error = %error,
                    "loop exited with error"
                );
            },
            Err(join_error) if join_error.is_cancelled() => {
                debug!(kind = worker.kind, worker_id = worker.id, "loop aborted");
            },
            Err(join_error) => {
                error!(
                    kind = worker.kind,
                    worker_id = worker.id,
                    error = %join_error,
                    "loop panicked"
                );
                panic.get_or_insert_with(|| SchedulerError::WorkerPanic {
                    message: format!("{} worker {}: {join_error}", worker.kind, worker.id),
                });
            },
        }
    }

    match panic {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
