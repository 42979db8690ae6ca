//! Polling worker pool
//!
//! This module provides:
//! - [`StepWorkerPool`] for concurrent step execution with graceful shutdown
//! - [`StepPoller`] for adaptive-backoff step claiming

mod poller;
mod pool;

pub use poller::{PollerConfig, StepPoller};
pub use pool::{StepWorkerPool, WorkerConfig, WorkerError, WorkerStatus};
