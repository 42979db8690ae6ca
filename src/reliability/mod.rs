//! Reliability policies
//!
//! This module provides:
//! - [`RetriggerPolicy`] - backoff schedule for automatically created
//!   retrigger steps

mod retrigger;

pub use retrigger::RetriggerPolicy;
