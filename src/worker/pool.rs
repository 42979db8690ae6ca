//! Worker pool for step execution
//!
//! Polls the store for runnable steps, executes them through the
//! [`StepExecutor`] with a bounded concurrency, keeps claim leases alive
//! with per-step heartbeats, and reclaims steps whose lease expired.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, StepPoller};
use crate::engine::{EngineError, StepExecutor};
use crate::persistence::{ClaimedStep, ProcessStore, StoreError};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Maximum concurrent step executions
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Claim lease renewal interval
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Stale step reclamation interval
    #[serde(with = "duration_millis")]
    pub stale_reclaim_interval: Duration,

    /// How long without a heartbeat before a claim is considered stale
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            poller: PollerConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Running and claiming steps
    Running,
    /// Completing current steps, not claiming new ones
    Draining,
    /// Stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Engine error
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Worker pool executing steps through a [`StepExecutor`]
///
/// # Example
///
/// ```ignore
/// use process_engine::{StepWorkerPool, WorkerConfig};
///
/// let config = WorkerConfig::new().with_max_concurrency(10);
/// let pool = StepWorkerPool::new(executor, config);
///
/// pool.start().await?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct StepWorkerPool<S> {
    executor: Arc<StepExecutor<S>>,
    config: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: std::sync::RwLock<WorkerStatus>,
    active_steps: Arc<Semaphore>,
    poll_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    reclaim_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S: ProcessStore> StepWorkerPool<S> {
    pub fn new(executor: Arc<StepExecutor<S>>, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            executor,
            active_steps: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            shutdown_rx,
            status: std::sync::RwLock::new(WorkerStatus::Stopped),
            poll_handle: std::sync::Mutex::new(None),
            reclaim_handle: std::sync::Mutex::new(None),
        }
    }

    /// Start the worker pool
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerError> {
        {
            let status = *self.status.read().unwrap();
            if status == WorkerStatus::Running {
                return Err(WorkerError::AlreadyRunning);
            }
        }

        info!(
            worker_id = %self.config.worker_id,
            step_types = ?self.executor.runnable_step_types(),
            max_concurrency = self.config.max_concurrency,
            "Starting worker pool"
        );

        *self.status.write().unwrap() = WorkerStatus::Running;

        self.start_poll_loop();
        self.start_reclaim_loop();

        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// Stops claiming, waits for in-flight steps to finish up to the
    /// configured timeout.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        {
            let status = *self.status.read().unwrap();
            if status == WorkerStatus::Stopped {
                return Ok(());
            }
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");

        *self.status.write().unwrap() = WorkerStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_steps.available_permits();
            if available == self.config.max_concurrency {
                debug!("All steps completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_steps = self.config.max_concurrency - available,
                    "Shutdown timeout reached"
                );
                return Err(WorkerError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        *self.status.write().unwrap() = WorkerStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.read().unwrap()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Steps currently executing
    pub fn active_steps(&self) -> usize {
        self.config.max_concurrency - self.active_steps.available_permits()
    }

    fn start_poll_loop(&self) {
        let executor = Arc::clone(&self.executor);
        let config = self.config.clone();
        let active_steps = Arc::clone(&self.active_steps);
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut poller = StepPoller::new(
                Arc::clone(executor.store()),
                config.worker_id.clone(),
                executor.runnable_step_types(),
                config.poller.clone(),
                shutdown_rx,
            );

            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                let available_slots = active_steps.available_permits();
                if available_slots == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available_slots).await {
                    Ok(steps) => {
                        for claimed in steps {
                            let permit = match active_steps.clone().try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => {
                                    debug!("No permits available");
                                    break;
                                }
                            };

                            let executor = Arc::clone(&executor);
                            let worker_id = config.worker_id.clone();
                            let heartbeat_interval = config.heartbeat_interval;

                            tokio::spawn(async move {
                                execute_with_heartbeat(
                                    executor,
                                    claimed,
                                    worker_id,
                                    heartbeat_interval,
                                )
                                .await;
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!("Poll error: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        });

        *self.poll_handle.lock().unwrap() = Some(handle);
    }

    fn start_reclaim_loop(&self) {
        let store = Arc::clone(self.executor.store());
        let interval = self.config.stale_reclaim_interval;
        let threshold = self.config.stale_threshold;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.reclaim_stale_steps(threshold).await {
                            Ok(reclaimed) if !reclaimed.is_empty() => {
                                warn!(count = reclaimed.len(), "Reclaimed stale steps");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!("Stale step reclaim failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Reclaim loop: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.reclaim_handle.lock().unwrap() = Some(handle);
    }
}

/// Run one claimed step, renewing its lease while the action is in flight
async fn execute_with_heartbeat<S: ProcessStore>(
    executor: Arc<StepExecutor<S>>,
    claimed: ClaimedStep,
    worker_id: String,
    heartbeat_interval: Duration,
) {
    let step_id = claimed.id;
    let mut exec = std::pin::pin!(executor.execute_claimed(&claimed));

    let start = tokio::time::Instant::now() + heartbeat_interval;
    let mut ticker = tokio::time::interval_at(start, heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            result = &mut exec => break result,
            _ = ticker.tick() => {
                match executor.store().heartbeat_step(step_id, &worker_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        // Lease lost; the action keeps running but another
                        // worker may now hold the step.
                        warn!(%step_id, "Heartbeat rejected, claim lost");
                    }
                    Err(e) => {
                        error!(%step_id, "Heartbeat failed: {}", e);
                    }
                }
            }
        }
    };

    if let Err(e) = result {
        error!(%step_id, "Step execution error: {}", e);
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::action::{ActionError, ActionRegistry};
    use crate::catalog::StepCatalog;
    use crate::engine::ProcessResolution;
    use crate::persistence::InMemoryProcessStore;
    use crate::reliability::RetriggerPolicy;

    fn catalog() -> Arc<StepCatalog> {
        Arc::new(
            StepCatalog::builder()
                .process_type("OFFER_SUBSCRIPTION")
                .step("TRIGGER_PROVIDER")
                .on_success("ACTIVATE_SUBSCRIPTION")
                .retrigger("RETRIGGER_PROVIDER")
                .step("RETRIGGER_PROVIDER")
                .retrigger("RETRIGGER_PROVIDER")
                .step("ACTIVATE_SUBSCRIPTION")
                .build()
                .unwrap(),
        )
    }

    fn fast_config(worker_id: &str) -> WorkerConfig {
        WorkerConfig::new()
            .with_worker_id(worker_id)
            .with_max_concurrency(4)
            .with_poller(
                PollerConfig::new()
                    .with_min_interval(Duration::from_millis(5))
                    .with_max_interval(Duration::from_millis(20)),
            )
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_pool_drives_process_to_resolution() {
        let store = Arc::new(InMemoryProcessStore::new());
        let mut actions = ActionRegistry::new();
        actions.register("TRIGGER_PROVIDER", |_ctx| async { Ok(None) });
        actions.register("ACTIVATE_SUBSCRIPTION", |_ctx| async {
            Ok(Some("subscription active".to_string()))
        });
        let executor = Arc::new(StepExecutor::new(
            store.clone(),
            catalog(),
            actions,
            RetriggerPolicy::immediate(3),
        ));

        let process_id = Uuid::now_v7();
        store
            .create_process(process_id, "OFFER_SUBSCRIPTION", None)
            .await
            .unwrap();
        executor
            .enqueue_step(process_id, "TRIGGER_PROVIDER")
            .await
            .unwrap();

        let pool = StepWorkerPool::new(executor.clone(), fast_config("pool-test"));
        pool.start().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if executor.resolution(process_id).await.unwrap() == ProcessResolution::Resolved {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "process did not resolve in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), WorkerStatus::Stopped);

        let steps = store.list_steps(process_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].step_type, "ACTIVATE_SUBSCRIPTION");
    }

    #[tokio::test]
    async fn test_pool_retriggers_failed_step() {
        let store = Arc::new(InMemoryProcessStore::new());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let mut actions = ActionRegistry::new();
        actions.register("TRIGGER_PROVIDER", |_ctx| async {
            Err(ActionError::retryable("provider timeout"))
        });
        actions.register("RETRIGGER_PROVIDER", move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some("provider reached".to_string()))
            }
        });
        let executor = Arc::new(StepExecutor::new(
            store.clone(),
            catalog(),
            actions,
            RetriggerPolicy::immediate(3),
        ));

        let process_id = Uuid::now_v7();
        store
            .create_process(process_id, "OFFER_SUBSCRIPTION", None)
            .await
            .unwrap();
        executor
            .enqueue_step(process_id, "TRIGGER_PROVIDER")
            .await
            .unwrap();

        let pool = StepWorkerPool::new(executor.clone(), fast_config("pool-retrigger"));
        pool.start().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if executor.resolution(process_id).await.unwrap() == ProcessResolution::Resolved {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "process did not resolve in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.shutdown().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let store = Arc::new(InMemoryProcessStore::new());
        let executor = Arc::new(StepExecutor::new(
            store,
            catalog(),
            ActionRegistry::new(),
            RetriggerPolicy::immediate(3),
        ));
        let pool = StepWorkerPool::new(executor, fast_config("pool-double"));

        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(WorkerError::AlreadyRunning)));
        pool.shutdown().await.unwrap();
    }
}
