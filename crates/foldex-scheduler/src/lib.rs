//! Scheduling around the foldex coordinator
//!
//! The staleness scheduler turns folders whose index went stale into jobs,
//! [`index_folder`] wraps a worker's indexing in the lock protocol, and the
//! lease sweeper releases locks left behind by crashed workers.

mod error;
mod scheduler;
mod sweeper;
mod worker;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{IndexJob, SchedulerCommand, SchedulerEvent, StalenessScheduler};
pub use sweeper::LeaseSweeper;
pub use worker::{index_folder, IndexOutcome};
