//! ProcessStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::process::{Process, ProcessStep, ProcessStepStatus};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Process not found
    #[error("process not found: {0}")]
    ProcessNotFound(Uuid),

    /// Step not found
    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    /// A process with this ID already exists
    #[error("process already exists: {0}")]
    DuplicateProcess(Uuid),

    /// Another worker holds the claim on this step
    #[error("step already claimed: {0}")]
    StepAlreadyClaimed(Uuid),

    /// Requested status change is not a legal transition
    #[error("invalid transition for step {step_id}: {from} -> {to}")]
    InvalidTransition {
        step_id: Uuid,
        from: ProcessStepStatus,
        to: ProcessStepStatus,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),
}

/// Definition of a step to be enqueued
#[derive(Debug, Clone)]
pub struct StepEnqueue {
    pub process_id: Uuid,
    pub step_type: String,
    pub attempt_of: Option<Uuid>,

    /// Delay before the step becomes visible to claiming workers
    pub delay: Duration,
}

impl StepEnqueue {
    /// Create an immediately visible step
    pub fn new(process_id: Uuid, step_type: impl Into<String>) -> Self {
        Self {
            process_id,
            step_type: step_type.into(),
            attempt_of: None,
            delay: Duration::ZERO,
        }
    }

    /// Mark this step as the retrigger of a failed step
    pub fn with_attempt_of(mut self, failed_step_id: Uuid) -> Self {
        self.attempt_of = Some(failed_step_id);
        self
    }

    /// Delay visibility (backoff-delayed retriggers)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A step that has been claimed by a worker
#[derive(Debug, Clone)]
pub struct ClaimedStep {
    pub id: Uuid,
    pub process_id: Uuid,
    pub process_type: String,
    pub step_type: String,
    pub claimed_at: DateTime<Utc>,
}

/// A process stuck on a failed step with no recovery step created
///
/// Surfaced so operators can retrigger or skip manually.
#[derive(Debug, Clone)]
pub struct StalledProcess {
    pub process_id: Uuid,
    pub process_type: String,
    pub step_id: Uuid,
    pub step_type: String,
    pub message: Option<String>,
    pub failed_at: DateTime<Utc>,
}

/// Store for processes and their steps
///
/// Implementations must be thread-safe and support concurrent access from
/// workers running as separate OS processes; claim atomicity rests on the
/// store's own transaction isolation, never on in-memory locks of one
/// worker.
#[async_trait]
pub trait ProcessStore: Send + Sync + 'static {
    // =========================================================================
    // Process Operations
    // =========================================================================

    /// Create a new process with no steps, optionally correlated to a
    /// domain entity
    async fn create_process(
        &self,
        process_id: Uuid,
        process_type: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<(), StoreError>;

    /// Fetch a process
    async fn get_process(&self, process_id: Uuid) -> Result<Process, StoreError>;

    // =========================================================================
    // Step Operations
    // =========================================================================

    /// Append a new step in `todo` state
    async fn enqueue_step(&self, step: StepEnqueue) -> Result<Uuid, StoreError>;

    /// Fetch a single step
    async fn get_step(&self, step_id: Uuid) -> Result<ProcessStep, StoreError>;

    /// All steps of a process in creation order
    async fn list_steps(&self, process_id: Uuid) -> Result<Vec<ProcessStep>, StoreError>;

    /// Steps of a process currently in `todo` state and past their
    /// `visible_at` delay, in creation order
    async fn pending_steps(&self, process_id: Uuid) -> Result<Vec<ProcessStep>, StoreError>;

    /// Claim up to `max_steps` runnable steps across processes
    ///
    /// A step is runnable when it is the oldest `todo` step of its process,
    /// its visibility delay has elapsed, no sibling step is `in_progress`,
    /// and its type is in `step_types`. Claiming transitions the step
    /// atomically to `in_progress`; concurrent claimers never receive the
    /// same step.
    async fn claim_next_steps(
        &self,
        worker_id: &str,
        step_types: &[String],
        max_steps: usize,
    ) -> Result<Vec<ClaimedStep>, StoreError>;

    /// Claim one specific step
    ///
    /// Fails with [`StoreError::StepAlreadyClaimed`] if another worker holds
    /// it, or [`StoreError::InvalidTransition`] if the step is terminal.
    async fn claim_step(&self, step_id: Uuid, worker_id: &str) -> Result<ClaimedStep, StoreError>;

    /// Renew the claim lease; returns false if the claim was lost
    async fn heartbeat_step(&self, step_id: Uuid, worker_id: &str) -> Result<bool, StoreError>;

    /// Record successful completion (`in_progress` -> `done`)
    async fn complete_step(&self, step_id: Uuid, message: Option<&str>)
        -> Result<(), StoreError>;

    /// Record failure (`in_progress` -> `failed`); the step stays failed
    /// forever, recovery creates a new step
    async fn fail_step(&self, step_id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Operator override (`todo` or `failed` -> `skipped`)
    async fn skip_step(&self, step_id: Uuid, reason: &str) -> Result<(), StoreError>;

    /// Revert `in_progress` steps whose heartbeat lease expired back to
    /// `todo`, returning the reverted step IDs
    async fn reclaim_stale_steps(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // Operator Queries
    // =========================================================================

    /// Processes stuck on a failed step with no recovery step and no
    /// remaining pending work
    async fn stalled_processes(&self) -> Result<Vec<StalledProcess>, StoreError>;
}
