//! Step execution and transition logic
//!
//! The executor binds the three halves of the engine together: the catalog
//! says which step types exist and what follows them, the action registry
//! says what running a step means, and the store records what happened.
//!
//! Execution is two-phase. The claim is committed before the action runs,
//! and the outcome is a second store call afterwards, so no transaction
//! stays open across external I/O. A worker crash between the two phases
//! leaves the step `in_progress` until its heartbeat lease expires.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::action::{ActionRegistry, StepContext};
use crate::catalog::StepCatalog;
use crate::persistence::{ClaimedStep, ProcessStore, StalledProcess, StepEnqueue, StoreError};
use crate::process::{ProcessStep, ProcessStepStatus};
use crate::reliability::RetriggerPolicy;

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Process type is not in the catalog
    #[error("invalid process type: {0}")]
    InvalidProcessType(String),

    /// Step type is not valid for the process type
    #[error("invalid step type {step_type} for process type {process_type}")]
    InvalidStepType {
        process_type: String,
        step_type: String,
    },

    /// Step type is deprecated and closed for new scheduling
    #[error("deprecated step type {step_type} for process type {process_type}")]
    DeprecatedStepType {
        process_type: String,
        step_type: String,
    },

    /// No action bound to this step type
    #[error("no action registered for step type: {0}")]
    NoActionRegistered(String),

    /// Catalog defines no retrigger for this step type
    #[error("no retrigger defined for step type {step_type} in process type {process_type}")]
    NoRetriggerDefined {
        process_type: String,
        step_type: String,
    },

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of executing one claimed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Action succeeded; the successor step, if the catalog defines one
    Completed { step_id: Uuid, successor: Option<Uuid> },

    /// Action failed; the retrigger step, if one was scheduled
    Failed { step_id: Uuid, retrigger: Option<Uuid> },
}

/// Where a process stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResolution {
    /// Has pending or running steps
    Active,

    /// All steps terminal, every failure recovered or skipped
    Resolved,

    /// Stuck on a failed step with no recovery step; needs an operator
    Stalled,
}

impl std::fmt::Display for ProcessResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessResolution::Active => write!(f, "active"),
            ProcessResolution::Resolved => write!(f, "resolved"),
            ProcessResolution::Stalled => write!(f, "stalled"),
        }
    }
}

/// Runs claimed steps and applies catalog transitions to their outcomes
pub struct StepExecutor<S> {
    store: Arc<S>,
    catalog: Arc<StepCatalog>,
    actions: ActionRegistry,
    retrigger_policy: RetriggerPolicy,
}

impl<S> Clone for StepExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            catalog: Arc::clone(&self.catalog),
            actions: self.actions.clone(),
            retrigger_policy: self.retrigger_policy.clone(),
        }
    }
}

impl<S: ProcessStore> StepExecutor<S> {
    pub fn new(
        store: Arc<S>,
        catalog: Arc<StepCatalog>,
        actions: ActionRegistry,
        retrigger_policy: RetriggerPolicy,
    ) -> Self {
        Self {
            store,
            catalog,
            actions,
            retrigger_policy,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn catalog(&self) -> &StepCatalog {
        &self.catalog
    }

    /// Step types this executor can run
    pub fn runnable_step_types(&self) -> Vec<String> {
        self.actions.step_types().map(String::from).collect()
    }

    /// Schedule a new step for a process
    ///
    /// The step type must be valid for the process type and not deprecated.
    #[instrument(skip(self))]
    pub async fn enqueue_step(
        &self,
        process_id: Uuid,
        step_type: &str,
    ) -> Result<Uuid, EngineError> {
        let process = self.store.get_process(process_id).await?;
        self.check_schedulable(&process.process_type, step_type)?;

        let step_id = self
            .store
            .enqueue_step(StepEnqueue::new(process_id, step_type))
            .await?;
        debug!(%step_id, %process_id, %step_type, "enqueued step");
        Ok(step_id)
    }

    /// Execute one claimed step end to end
    ///
    /// Runs the bound action, records the outcome, then applies the
    /// catalog transition: the on-success successor after `done`, the
    /// on-failure retrigger (a new step, backoff-delayed) after `failed`.
    /// Action failures never surface as `Err`; they become step state.
    #[instrument(skip(self, claimed), fields(step_id = %claimed.id, step_type = %claimed.step_type))]
    pub async fn execute_claimed(&self, claimed: &ClaimedStep) -> Result<StepOutcome, EngineError> {
        let action = self
            .actions
            .get(&claimed.step_type)
            .ok_or_else(|| EngineError::NoActionRegistered(claimed.step_type.clone()))?;

        let ctx = StepContext {
            step_id: claimed.id,
            process_id: claimed.process_id,
            process_type: claimed.process_type.clone(),
            step_type: claimed.step_type.clone(),
        };

        match action(ctx).await {
            Ok(message) => {
                self.store
                    .complete_step(claimed.id, message.as_deref())
                    .await?;
                info!(step_id = %claimed.id, "step completed");

                let successor = self.enqueue_successor(claimed).await?;
                Ok(StepOutcome::Completed {
                    step_id: claimed.id,
                    successor,
                })
            }
            Err(action_err) => {
                self.store
                    .fail_step(claimed.id, &action_err.to_string())
                    .await?;
                warn!(step_id = %claimed.id, error = %action_err, "step failed");

                let retrigger = if action_err.retryable {
                    self.enqueue_retrigger(claimed).await?
                } else {
                    debug!(step_id = %claimed.id, "non-retryable failure, no retrigger");
                    None
                };
                Ok(StepOutcome::Failed {
                    step_id: claimed.id,
                    retrigger,
                })
            }
        }
    }

    /// Claim and execute the oldest pending step of one process
    ///
    /// Step-through variant for embedded use; the worker pool drives
    /// [`execute_claimed`](Self::execute_claimed) from its own poll loop
    /// instead. Returns `None` when the process has nothing pending.
    pub async fn execute_next(
        &self,
        process_id: Uuid,
        worker_id: &str,
    ) -> Result<Option<StepOutcome>, EngineError> {
        let pending = self.store.pending_steps(process_id).await?;
        let Some(step) = pending.first() else {
            return Ok(None);
        };
        let claimed = self.store.claim_step(step.id, worker_id).await?;
        Ok(Some(self.execute_claimed(&claimed).await?))
    }

    /// Pending steps of a process in execution order
    pub async fn pending_steps(&self, process_id: Uuid) -> Result<Vec<ProcessStep>, EngineError> {
        Ok(self.store.pending_steps(process_id).await?)
    }

    /// Operator override: mark a pending or failed step skipped
    #[instrument(skip(self, reason))]
    pub async fn skip_step(&self, step_id: Uuid, reason: &str) -> Result<(), EngineError> {
        self.store.skip_step(step_id, reason).await?;
        info!(%step_id, "step skipped");
        Ok(())
    }

    /// Operator override: schedule an immediate retrigger for a failed step
    ///
    /// Bypasses the automatic retrigger bound and its backoff delay. The
    /// catalog must define a retrigger for the step type.
    #[instrument(skip(self))]
    pub async fn retrigger_step(&self, step_id: Uuid) -> Result<Uuid, EngineError> {
        let step = self.store.get_step(step_id).await?;
        if step.status != ProcessStepStatus::Failed {
            return Err(EngineError::Store(StoreError::InvalidTransition {
                step_id,
                from: step.status,
                to: ProcessStepStatus::Todo,
            }));
        }

        let process = self.store.get_process(step.process_id).await?;
        let retrigger_type = self
            .catalog
            .retrigger_for(&process.process_type, &step.step_type)
            .ok_or_else(|| EngineError::NoRetriggerDefined {
                process_type: process.process_type.clone(),
                step_type: step.step_type.clone(),
            })?
            .to_string();

        let retrigger_id = self
            .store
            .enqueue_step(
                StepEnqueue::new(step.process_id, retrigger_type).with_attempt_of(step_id),
            )
            .await?;
        info!(%step_id, %retrigger_id, "manual retrigger scheduled");
        Ok(retrigger_id)
    }

    /// Where the process stands: active, resolved, or stalled
    pub async fn resolution(&self, process_id: Uuid) -> Result<ProcessResolution, EngineError> {
        let steps = self.store.list_steps(process_id).await?;

        let active = steps.iter().any(|s| {
            matches!(
                s.status,
                ProcessStepStatus::Todo | ProcessStepStatus::InProgress
            )
        });
        if active {
            return Ok(ProcessResolution::Active);
        }

        let stalled = steps
            .iter()
            .filter(|s| s.status == ProcessStepStatus::Failed)
            .any(|failed| !steps.iter().any(|s| s.attempt_of == Some(failed.id)));
        if stalled {
            return Ok(ProcessResolution::Stalled);
        }

        Ok(ProcessResolution::Resolved)
    }

    /// Processes waiting for operator action
    pub async fn stalled(&self) -> Result<Vec<StalledProcess>, EngineError> {
        Ok(self.store.stalled_processes().await?)
    }

    fn check_schedulable(&self, process_type: &str, step_type: &str) -> Result<(), EngineError> {
        let def = self.catalog.step(process_type, step_type).ok_or_else(|| {
            if self.catalog.contains_process_type(process_type) {
                EngineError::InvalidStepType {
                    process_type: process_type.to_string(),
                    step_type: step_type.to_string(),
                }
            } else {
                EngineError::InvalidProcessType(process_type.to_string())
            }
        })?;
        if def.deprecated {
            return Err(EngineError::DeprecatedStepType {
                process_type: process_type.to_string(),
                step_type: step_type.to_string(),
            });
        }
        Ok(())
    }

    async fn enqueue_successor(&self, claimed: &ClaimedStep) -> Result<Option<Uuid>, EngineError> {
        let Some(successor_type) = self
            .catalog
            .on_success(&claimed.process_type, &claimed.step_type)
        else {
            return Ok(None);
        };
        let successor_type = successor_type.to_string();

        // Historical steps may point at a since-deprecated successor; the
        // process then stops here instead of scheduling it.
        if self.check_schedulable(&claimed.process_type, &successor_type).is_err() {
            warn!(
                step_id = %claimed.id,
                %successor_type,
                "successor not schedulable, transition dropped"
            );
            return Ok(None);
        }

        let successor = self
            .store
            .enqueue_step(StepEnqueue::new(claimed.process_id, successor_type.clone()))
            .await?;
        debug!(step_id = %claimed.id, %successor, %successor_type, "enqueued successor");
        Ok(Some(successor))
    }

    async fn enqueue_retrigger(&self, claimed: &ClaimedStep) -> Result<Option<Uuid>, EngineError> {
        let Some(retrigger_type) = self
            .catalog
            .retrigger_for(&claimed.process_type, &claimed.step_type)
        else {
            debug!(step_id = %claimed.id, "no retrigger in catalog, process stalls");
            return Ok(None);
        };
        let retrigger_type = retrigger_type.to_string();

        // Attempt number counts the whole retrigger lineage within the
        // process, not just direct children of this step.
        let steps = self.store.list_steps(claimed.process_id).await?;
        let attempt = prior_attempts(&steps, &retrigger_type) + 1;

        if !self.retrigger_policy.allows(attempt) {
            warn!(
                step_id = %claimed.id,
                attempt,
                "retrigger bound exhausted, process stalls"
            );
            return Ok(None);
        }

        let delay = self.retrigger_policy.delay_for(attempt);
        let retrigger = self
            .store
            .enqueue_step(
                StepEnqueue::new(claimed.process_id, retrigger_type.clone())
                    .with_attempt_of(claimed.id)
                    .with_delay(delay),
            )
            .await?;
        info!(
            step_id = %claimed.id,
            %retrigger,
            %retrigger_type,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "enqueued retrigger"
        );
        Ok(Some(retrigger))
    }
}

fn prior_attempts(steps: &[ProcessStep], retrigger_type: &str) -> u32 {
    steps
        .iter()
        .filter(|s| s.step_type == retrigger_type)
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::action::ActionError;
    use crate::persistence::InMemoryProcessStore;

    fn catalog() -> Arc<StepCatalog> {
        Arc::new(
            StepCatalog::builder()
                .process_type("OFFER_SUBSCRIPTION")
                .step("TRIGGER_PROVIDER")
                .on_success("OFFERSUBSCRIPTION_CLIENT_CREATION")
                .retrigger("RETRIGGER_PROVIDER")
                .step("RETRIGGER_PROVIDER")
                .retrigger("RETRIGGER_PROVIDER")
                .step("OFFERSUBSCRIPTION_CLIENT_CREATION")
                .step("LEGACY_PORTAL_SETUP")
                .deprecated()
                .build()
                .unwrap(),
        )
    }

    fn executor(
        store: Arc<InMemoryProcessStore>,
        actions: ActionRegistry,
    ) -> StepExecutor<InMemoryProcessStore> {
        StepExecutor::new(store, catalog(), actions, RetriggerPolicy::immediate(3))
    }

    async fn seeded_process(store: &InMemoryProcessStore) -> Uuid {
        let process_id = Uuid::now_v7();
        store
            .create_process(process_id, "OFFER_SUBSCRIPTION", None)
            .await
            .unwrap();
        process_id
    }

    #[tokio::test]
    async fn test_enqueue_validates_step_type() {
        let store = Arc::new(InMemoryProcessStore::new());
        let executor = executor(store.clone(), ActionRegistry::new());
        let process_id = seeded_process(&store).await;

        assert!(executor
            .enqueue_step(process_id, "TRIGGER_PROVIDER")
            .await
            .is_ok());

        let err = executor.enqueue_step(process_id, "CREATE_IDENTITY_WALLET").await;
        assert!(matches!(err, Err(EngineError::InvalidStepType { .. })));

        let err = executor.enqueue_step(process_id, "LEGACY_PORTAL_SETUP").await;
        assert!(matches!(err, Err(EngineError::DeprecatedStepType { .. })));
    }

    #[tokio::test]
    async fn test_success_enqueues_catalog_successor() {
        let store = Arc::new(InMemoryProcessStore::new());
        let mut actions = ActionRegistry::new();
        actions.register("TRIGGER_PROVIDER", |_ctx| async {
            Ok(Some("provider notified".to_string()))
        });
        let executor = executor(store.clone(), actions);
        let process_id = seeded_process(&store).await;
        executor
            .enqueue_step(process_id, "TRIGGER_PROVIDER")
            .await
            .unwrap();

        let outcome = executor
            .execute_next(process_id, "worker-1")
            .await
            .unwrap()
            .unwrap();
        let StepOutcome::Completed { step_id, successor } = outcome else {
            panic!("expected completion");
        };

        let step = store.get_step(step_id).await.unwrap();
        assert_eq!(step.status, ProcessStepStatus::Done);
        assert_eq!(step.message.as_deref(), Some("provider notified"));

        let successor = store.get_step(successor.unwrap()).await.unwrap();
        assert_eq!(successor.step_type, "OFFERSUBSCRIPTION_CLIENT_CREATION");
        assert_eq!(successor.status, ProcessStepStatus::Todo);
    }

    #[tokio::test]
    async fn test_failure_enqueues_retrigger_as_new_step() {
        let store = Arc::new(InMemoryProcessStore::new());
        let mut actions = ActionRegistry::new();
        actions.register("TRIGGER_PROVIDER", |_ctx| async {
            Err(ActionError::retryable("provider timeout"))
        });
        let executor = executor(store.clone(), actions);
        let process_id = seeded_process(&store).await;
        executor
            .enqueue_step(process_id, "TRIGGER_PROVIDER")
            .await
            .unwrap();

        let outcome = executor
            .execute_next(process_id, "worker-1")
            .await
            .unwrap()
            .unwrap();
        let StepOutcome::Failed { step_id, retrigger } = outcome else {
            panic!("expected failure");
        };

        // The failed step stays failed; recovery is a new row.
        let failed = store.get_step(step_id).await.unwrap();
        assert_eq!(failed.status, ProcessStepStatus::Failed);
        assert!(failed.message.unwrap().contains("provider timeout"));

        let retrigger = store.get_step(retrigger.unwrap()).await.unwrap();
        assert_eq!(retrigger.step_type, "RETRIGGER_PROVIDER");
        assert_eq!(retrigger.attempt_of, Some(step_id));
        assert_eq!(retrigger.status, ProcessStepStatus::Todo);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_stalls() {
        let store = Arc::new(InMemoryProcessStore::new());
        let mut actions = ActionRegistry::new();
        actions.register("TRIGGER_PROVIDER", |_ctx| async {
            Err(ActionError::non_retryable("subscription rejected"))
        });
        let executor = executor(store.clone(), actions);
        let process_id = seeded_process(&store).await;
        executor
            .enqueue_step(process_id, "TRIGGER_PROVIDER")
            .await
            .unwrap();

        let outcome = executor
            .execute_next(process_id, "worker-1")
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { retrigger: None, .. }));
        assert_eq!(
            executor.resolution(process_id).await.unwrap(),
            ProcessResolution::Stalled
        );
    }

    #[tokio::test]
    async fn test_retrigger_bound_exhausts() {
        let store = Arc::new(InMemoryProcessStore::new());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let mut actions = ActionRegistry::new();
        actions.register("TRIGGER_PROVIDER", |_ctx| async {
            Err(ActionError::retryable("provider down"))
        });
        actions.register("RETRIGGER_PROVIDER", move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ActionError::retryable("provider still down"))
            }
        });
        let executor = StepExecutor::new(
            store.clone(),
            catalog(),
            actions,
            RetriggerPolicy::immediate(2),
        );
        let process_id = seeded_process(&store).await;
        executor
            .enqueue_step(process_id, "TRIGGER_PROVIDER")
            .await
            .unwrap();

        // Drive until no step is claimable any more.
        while executor
            .execute_next(process_id, "worker-1")
            .await
            .unwrap()
            .is_some()
        {}

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(
            executor.resolution(process_id).await.unwrap(),
            ProcessResolution::Stalled
        );
        assert_eq!(executor.stalled().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolution_lifecycle() {
        let store = Arc::new(InMemoryProcessStore::new());
        let mut actions = ActionRegistry::new();
        actions.register("OFFERSUBSCRIPTION_CLIENT_CREATION", |_ctx| async {
            Ok(None)
        });
        let executor = executor(store.clone(), actions);
        let process_id = seeded_process(&store).await;

        assert_eq!(
            executor.resolution(process_id).await.unwrap(),
            ProcessResolution::Resolved
        );

        executor
            .enqueue_step(process_id, "OFFERSUBSCRIPTION_CLIENT_CREATION")
            .await
            .unwrap();
        assert_eq!(
            executor.resolution(process_id).await.unwrap(),
            ProcessResolution::Active
        );

        executor.execute_next(process_id, "worker-1").await.unwrap();
        assert_eq!(
            executor.resolution(process_id).await.unwrap(),
            ProcessResolution::Resolved
        );
    }

    #[tokio::test]
    async fn test_manual_retrigger() {
        let store = Arc::new(InMemoryProcessStore::new());
        let mut actions = ActionRegistry::new();
        actions.register("OFFERSUBSCRIPTION_CLIENT_CREATION", |_ctx| async {
            Err(ActionError::retryable("idp unavailable"))
        });
        let executor = executor(store.clone(), actions);
        let process_id = seeded_process(&store).await;
        executor
            .enqueue_step(process_id, "OFFERSUBSCRIPTION_CLIENT_CREATION")
            .await
            .unwrap();

        let outcome = executor
            .execute_next(process_id, "worker-1")
            .await
            .unwrap()
            .unwrap();
        let StepOutcome::Failed { step_id, retrigger } = outcome else {
            panic!("expected failure");
        };
        // No catalog retrigger for this step type.
        assert!(retrigger.is_none());
        let err = executor.retrigger_step(step_id).await;
        assert!(matches!(err, Err(EngineError::NoRetriggerDefined { .. })));

        // Skipping the failure resolves the process instead.
        executor.skip_step(step_id, "operator override").await.unwrap();
        assert_eq!(
            executor.resolution(process_id).await.unwrap(),
            ProcessResolution::Resolved
        );
    }

    #[tokio::test]
    async fn test_manual_retrigger_creates_step() {
        let store = Arc::new(InMemoryProcessStore::new());
        let mut actions = ActionRegistry::new();
        actions.register("TRIGGER_PROVIDER", |_ctx| async {
            Err(ActionError::non_retryable("rejected"))
        });
        let executor = executor(store.clone(), actions);
        let process_id = seeded_process(&store).await;
        executor
            .enqueue_step(process_id, "TRIGGER_PROVIDER")
            .await
            .unwrap();
        let outcome = executor
            .execute_next(process_id, "worker-1")
            .await
            .unwrap()
            .unwrap();
        let StepOutcome::Failed { step_id, .. } = outcome else {
            panic!("expected failure");
        };

        let retrigger_id = executor.retrigger_step(step_id).await.unwrap();
        let retrigger = store.get_step(retrigger_id).await.unwrap();
        assert_eq!(retrigger.step_type, "RETRIGGER_PROVIDER");
        assert_eq!(retrigger.attempt_of, Some(step_id));

        // Only failed steps can be retriggered.
        let err = executor.retrigger_step(retrigger_id).await;
        assert!(matches!(
            err,
            Err(EngineError::Store(StoreError::InvalidTransition { .. }))
        ));
    }
}
