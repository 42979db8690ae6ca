//! Step catalog: the per-process-type state machine definition
//!
//! The catalog is data, not code. It is built once at startup and shared
//! immutably: a map from process type to its legal step types, where each
//! step type carries an explicit transition record (`on_success` successor,
//! `on_failure` retrigger). Step types referenced by historical steps are
//! never removed, only marked deprecated.

mod builder;
mod definition;

pub use builder::CatalogBuilder;
pub use definition::{CatalogError, ProcessTypeDef, StepCatalog, StepDef};
