//! Core domain models and storage for the hooky webhook scheduler.
//!
//! Provides strongly-typed identifiers, the `Task` and `Attempt` records,
//! the clock abstraction used for lease arithmetic, and the PostgreSQL
//! repositories that implement the atomic reservation protocol.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    Attempt, AttemptId, AttemptOutcome, BackoffPolicy, Completion, NewTask, OwnerId, Task,
    TaskId, TaskStatus,
};
pub use time::{Clock, RealClock, TestClock};
