//! Catalog types and lookups

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::builder::CatalogBuilder;

/// Errors from catalog construction and lookups
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// A process type was declared twice
    #[error("duplicate process type: {0}")]
    DuplicateProcessType(String),

    /// A step type was declared twice within one process type
    #[error("duplicate step type {step_type} in process type {process_type}")]
    DuplicateStepType {
        process_type: String,
        step_type: String,
    },

    /// A transition references a step type that was never declared
    #[error("step type {step_type} in process type {process_type} references undeclared step type {referenced}")]
    UnknownStepReference {
        process_type: String,
        step_type: String,
        referenced: String,
    },

    /// A process type was declared without any steps
    #[error("process type {0} has no step types")]
    EmptyProcessType(String),

    /// Builder method called before a process type / step was opened
    #[error("invalid builder call: {0}")]
    InvalidBuilder(String),
}

/// Definition of one step type within a process type
///
/// Transitions are explicit data: `on_success` names the step type the
/// executor schedules after this one completes, `on_failure` names the
/// retrigger step type created when this one fails. Either may be absent
/// (terminal on success, stalls on failure).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepDef {
    /// Step type scheduled after successful completion
    pub on_success: Option<String>,

    /// Retrigger step type created after failure
    pub on_failure: Option<String>,

    /// Deprecated step types remain valid for historical steps but can no
    /// longer be scheduled
    pub deprecated: bool,
}

impl StepDef {
    pub(crate) fn new() -> Self {
        Self {
            on_success: None,
            on_failure: None,
            deprecated: false,
        }
    }
}

/// All step types of one process type
#[derive(Debug, Clone)]
pub struct ProcessTypeDef {
    steps: HashMap<String, StepDef>,
}

impl ProcessTypeDef {
    pub(crate) fn new(steps: HashMap<String, StepDef>) -> Self {
        Self { steps }
    }

    /// Look up a step definition
    pub fn step(&self, step_type: &str) -> Option<&StepDef> {
        self.steps.get(step_type)
    }

    /// Iterate over the legal step type labels
    pub fn step_types(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(|s| s.as_str())
    }

    /// Number of declared step types
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no step types are declared
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Immutable catalog of process types and their step-type state machines
///
/// Built once via [`CatalogBuilder`] and shared behind an `Arc`. Lookups
/// never touch storage, so the state machine can be unit tested without a
/// database.
#[derive(Debug, Clone)]
pub struct StepCatalog {
    process_types: HashMap<String, ProcessTypeDef>,
}

impl StepCatalog {
    pub(crate) fn new(process_types: HashMap<String, ProcessTypeDef>) -> Self {
        Self { process_types }
    }

    /// Start building a catalog
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::new()
    }

    /// Whether a process type is known
    pub fn contains_process_type(&self, process_type: &str) -> bool {
        self.process_types.contains_key(process_type)
    }

    /// The step-type set of a process type
    pub fn process_type(&self, process_type: &str) -> Option<&ProcessTypeDef> {
        self.process_types.get(process_type)
    }

    /// The legal step types for a process type
    pub fn valid_step_types(&self, process_type: &str) -> Option<Vec<&str>> {
        self.process_types
            .get(process_type)
            .map(|p| p.step_types().collect())
    }

    /// Look up a step definition within a process type
    pub fn step(&self, process_type: &str, step_type: &str) -> Option<&StepDef> {
        self.process_types.get(process_type)?.step(step_type)
    }

    /// The successor scheduled when `step_type` completes
    pub fn on_success(&self, process_type: &str, step_type: &str) -> Option<&str> {
        self.step(process_type, step_type)?.on_success.as_deref()
    }

    /// The retrigger step type created when `step_type` fails
    pub fn retrigger_for(&self, process_type: &str, step_type: &str) -> Option<&str> {
        self.step(process_type, step_type)?.on_failure.as_deref()
    }

    /// Iterate over the known process type labels
    pub fn process_types(&self) -> impl Iterator<Item = &str> {
        self.process_types.keys().map(|s| s.as_str())
    }
}
