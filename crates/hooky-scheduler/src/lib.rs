//! Lease-based webhook scheduler.
//!
//! Tasks live in a shared store. A scheduler claims due tasks under a
//! time-bounded lease, delivers them over HTTP, and records the outcome only
//! if it still holds the lease. Several schedulers can run against one store;
//! a crashed scheduler's work is reclaimed once its leases expire.
//!
//! # Architecture
//!
//! Four kinds of loop run concurrently once the scheduler is started:
//!
//! 1. **Reservation** - N workers claim due tasks in batches and push them
//!    onto a bounded handoff queue
//! 2. **Execution** - M workers pop tasks, dispatch them, append the attempt
//!    and write the completion
//! 3. **Heartbeat** - extends every lease this scheduler holds
//! 4. **Retention** - purges attempt history past its retention age
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hooky_core::{storage::Storage, RealClock};
//! use hooky_scheduler::{
//!     ClientConfig, HttpDispatcher, PostgresTaskStore, Scheduler, SchedulerConfig,
//!     SchedulerError,
//! };
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), SchedulerError> {
//! let clock = Arc::new(RealClock::new());
//! let store = Arc::new(PostgresTaskStore::new(Arc::new(Storage::new(pool)), clock.clone()));
//! let dispatcher = Arc::new(HttpDispatcher::new(ClientConfig::default(), clock.clone())?);
//!
//! let mut scheduler = Scheduler::new(store, dispatcher, SchedulerConfig::default(), clock)?;
//! scheduler.start().await?;
//! // ...
//! scheduler.stop().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backoff;
pub mod client;
pub mod error;
pub mod execution;
mod heartbeat;
mod reservation;
mod retention;
pub mod scheduler;
pub mod storage;

pub use backoff::{Backoff, FnBackoff};
pub use client::{ClientConfig, DispatchResponse, Dispatcher, HttpDispatcher};
pub use error::{DispatchError, Result, SchedulerError};
pub use execution::Execution;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerState, SchedulerStats};
pub use storage::{PostgresTaskStore, TaskStore};

/// Default number of reservation workers.
pub const DEFAULT_RESERVATION_WORKERS: usize = 1;

/// Default number of execution workers.
pub const DEFAULT_EXECUTION_WORKERS: usize = 20;

/// Default number of tasks claimed per `reserve` call.
pub const DEFAULT_BATCH_SIZE: usize = 10;
