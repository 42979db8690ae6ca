//! # Process/Step Orchestration Engine
//!
//! A PostgreSQL-backed engine for durable, multi-step business processes.
//!
//! ## Features
//!
//! - **Typed processes**: every process carries a type fixed at creation; the
//!   catalog defines which step types are legal for it
//! - **Data-driven transitions**: each step type declares its on-success
//!   successor and its on-failure retrigger explicitly, no naming conventions
//! - **Durable steps**: a failed step stays failed forever; recovery creates a
//!   new retrigger step, preserving the full execution history
//! - **Lease-based claiming**: workers claim steps atomically (todo ->
//!   in_progress) and stale claims are reclaimed after a heartbeat lease
//!   expires, so a crashed worker never strands a step
//! - **Append-only audit**: one immutable snapshot row per tracked entity
//!   mutation, with per-entity schema generations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              ProcessRegistry / StepExecutor                  │
//! │  (creates processes, claims + executes steps, schedules     │
//! │   successors and retriggers per the StepCatalog)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ProcessStore                           │
//! │  (PostgreSQL: processes, process_steps; or in-memory)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      StepWorkerPool                          │
//! │  (polls for claimable steps, runs the bound StepAction,     │
//! │   heartbeats the lease, reclaims stale claims)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use process_engine::prelude::*;
//!
//! let catalog = StepCatalog::builder()
//!     .process_type("OFFER_SUBSCRIPTION")
//!     .step("TRIGGER_PROVIDER")
//!     .on_success("OFFERSUBSCRIPTION_CLIENT_CREATION")
//!     .retrigger("RETRIGGER_PROVIDER")
//!     .step("RETRIGGER_PROVIDER")
//!     .on_success("OFFERSUBSCRIPTION_CLIENT_CREATION")
//!     .step("OFFERSUBSCRIPTION_CLIENT_CREATION")
//!     .build()?;
//!
//! let store = Arc::new(InMemoryProcessStore::new());
//! let registry = ProcessRegistry::new(store, Arc::new(catalog));
//!
//! let process_id = registry.create_process("OFFER_SUBSCRIPTION").await?;
//! ```

pub mod action;
pub mod audit;
pub mod catalog;
pub mod engine;
pub mod persistence;
pub mod process;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::action::{ActionError, ActionRegistry, StepAction, StepContext};
    pub use crate::audit::{
        AuditEntry, AuditError, AuditMutation, AuditOperation, AuditRecorder,
        AuditSchemaRegistry, InMemoryAuditLog, PostgresAuditRecorder,
    };
    pub use crate::catalog::{CatalogBuilder, CatalogError, StepCatalog, StepDef};
    pub use crate::engine::{
        EngineError, ProcessRegistry, ProcessResolution, StepExecutor, StepOutcome,
    };
    pub use crate::persistence::{
        ClaimedStep, InMemoryProcessStore, PostgresProcessStore, ProcessStore, StalledProcess,
        StepEnqueue, StoreError,
    };
    pub use crate::process::{Process, ProcessStep, ProcessStepStatus};
    pub use crate::reliability::RetriggerPolicy;
    pub use crate::worker::{StepWorkerPool, WorkerConfig, WorkerError};
}

// Re-export key types at crate root
pub use action::{ActionError, ActionRegistry, StepAction, StepContext};
pub use audit::{
    AuditEntry, AuditError, AuditMutation, AuditOperation, AuditRecorder, AuditSchemaRegistry,
    InMemoryAuditLog, PostgresAuditRecorder,
};
pub use catalog::{CatalogBuilder, CatalogError, StepCatalog, StepDef};
pub use engine::{EngineError, ProcessRegistry, ProcessResolution, StepExecutor, StepOutcome};
pub use persistence::{
    ClaimedStep, InMemoryProcessStore, PostgresProcessStore, ProcessStore, StalledProcess,
    StepEnqueue, StoreError,
};
pub use process::{Process, ProcessStep, ProcessStepStatus};
pub use reliability::RetriggerPolicy;
pub use worker::{StepWorkerPool, WorkerConfig, WorkerError};
