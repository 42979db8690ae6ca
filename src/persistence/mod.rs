//! Persistence layer for processes and steps
//!
//! This module provides:
//! - [`ProcessStore`] trait for process and step persistence
//! - [`InMemoryProcessStore`] for testing and embedded use
//! - [`PostgresProcessStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryProcessStore;
pub use postgres::PostgresProcessStore;
pub use store::{ClaimedStep, ProcessStore, StalledProcess, StepEnqueue, StoreError};
