//! Process engine: creation, step execution, transitions
//!
//! This module provides:
//! - [`ProcessRegistry`] for creating processes of catalog-known types
//! - [`StepExecutor`] for running claimed steps and applying transitions

mod executor;
mod registry;

pub use executor::{EngineError, ProcessResolution, StepExecutor, StepOutcome};
pub use registry::ProcessRegistry;
