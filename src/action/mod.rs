//! External step-action contract
//!
//! The engine does not implement business actions (mail sending, identity
//! provisioning, clearing-house calls). It only defines the seam: given a
//! step type, invoke the bound action and report success or failure. Actions
//! are registered per step type in an [`ActionRegistry`], either as structs
//! implementing [`StepAction`] or as async closures.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error type for step-action failures
///
/// The `retryable` flag is the action's own verdict on whether a retrigger
/// makes sense: a timeout talking to a downstream service is retryable, a
/// rejected request is not. Non-retryable failures suppress the catalog's
/// retrigger and stall the process for operator attention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionError {
    /// Error message, persisted on the failed step
    pub message: String,

    /// Whether a retrigger step should be created (if the catalog defines one)
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub detail: Option<serde_json::Value>,
}

impl ActionError {
    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            detail: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            detail: None,
        }
    }

    /// Add error details
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActionError {}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Context handed to an action when its step executes
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The executing step
    pub step_id: Uuid,

    /// The owning process
    pub process_id: Uuid,

    /// The process's type label
    pub process_type: String,

    /// The step's type label
    pub step_type: String,
}

/// Result of running a step action: an optional outcome message, or an error
pub type ActionResult = Result<Option<String>, ActionError>;

/// An external action bound to one step type
///
/// # Example
///
/// ```ignore
/// struct SendMail { mailer: MailClient }
///
/// #[async_trait]
/// impl StepAction for SendMail {
///     fn step_type(&self) -> &str {
///         "SEND_MAIL"
///     }
///
///     async fn run(&self, ctx: StepContext) -> ActionResult {
///         self.mailer.send(ctx.process_id).await?;
///         Ok(Some("mail queued".into()))
///     }
/// }
/// ```
#[async_trait]
pub trait StepAction: Send + Sync + 'static {
    /// The step type this action handles
    fn step_type(&self) -> &str;

    /// Execute the action
    ///
    /// # Errors
    ///
    /// Return [`ActionError::retryable`] for transient failures that should
    /// produce a retrigger step, [`ActionError::non_retryable`] for permanent
    /// ones.
    async fn run(&self, ctx: StepContext) -> ActionResult;
}

type BoxedAction =
    Arc<dyn Fn(StepContext) -> Pin<Box<dyn std::future::Future<Output = ActionResult> + Send>> + Send + Sync>;

/// Registry mapping step types to their actions
///
/// Built at startup alongside the catalog; execution looks actions up by
/// the step's type label.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, BoxedAction>,
}

impl ActionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure for a step type
    pub fn register<F, Fut>(&mut self, step_type: impl Into<String>, action: F)
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ActionResult> + Send + 'static,
    {
        let boxed: BoxedAction = Arc::new(move |ctx| Box::pin(action(ctx)));
        self.actions.insert(step_type.into(), boxed);
    }

    /// Register a [`StepAction`] implementation
    pub fn register_action<A: StepAction>(&mut self, action: A) {
        let step_type = action.step_type().to_string();
        let action = Arc::new(action);
        let boxed: BoxedAction = Arc::new(move |ctx| {
            let action = Arc::clone(&action);
            Box::pin(async move { action.run(ctx).await })
        });
        self.actions.insert(step_type, boxed);
    }

    /// Look up the action for a step type
    pub(crate) fn get(&self, step_type: &str) -> Option<BoxedAction> {
        self.actions.get(step_type).map(Arc::clone)
    }

    /// Whether an action is registered for a step type
    pub fn contains(&self, step_type: &str) -> bool {
        self.actions.contains_key(step_type)
    }

    /// The registered step type labels
    pub fn step_types(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(|s| s.as_str())
    }

    /// Number of registered actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("step_types", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}
