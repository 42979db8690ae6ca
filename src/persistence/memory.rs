//! In-memory store implementation for testing and embedded use

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::persistence::store::{
    ClaimedStep, ProcessStore, StalledProcess, StepEnqueue, StoreError,
};
use crate::process::{Process, ProcessStep, ProcessStepStatus};

/// Per-step bookkeeping the public [`ProcessStep`] does not carry
#[derive(Debug, Clone)]
struct StepState {
    step: ProcessStep,
    seq: u64,
    visible_at: DateTime<Utc>,
    claimed_by: Option<String>,
    heartbeat_at: Option<DateTime<Utc>>,
}

/// In-memory implementation of ProcessStore
///
/// All claim paths take the steps write lock for their full critical
/// section, which gives the same no-double-claim guarantee the Postgres
/// store gets from row locking.
#[derive(Default)]
pub struct InMemoryProcessStore {
    processes: RwLock<HashMap<Uuid, Process>>,
    steps: RwLock<HashMap<Uuid, StepState>>,
    seq: AtomicU64,
}

impl InMemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored processes
    pub fn process_count(&self) -> usize {
        self.processes.read().len()
    }

    /// Number of stored steps across all processes
    pub fn step_count(&self) -> usize {
        self.steps.read().len()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Oldest `todo` step per process, skipping processes that currently
    /// have an `in_progress` step. Returned in claim priority order.
    fn claim_candidates(steps: &HashMap<Uuid, StepState>) -> Vec<Uuid> {
        let mut busy: HashMap<Uuid, bool> = HashMap::new();
        let mut oldest: HashMap<Uuid, (u64, Uuid)> = HashMap::new();

        for state in steps.values() {
            match state.step.status {
                ProcessStepStatus::InProgress => {
                    busy.insert(state.step.process_id, true);
                }
                ProcessStepStatus::Todo => {
                    let entry = oldest
                        .entry(state.step.process_id)
                        .or_insert((state.seq, state.step.id));
                    if state.seq < entry.0 {
                        *entry = (state.seq, state.step.id);
                    }
                }
                _ => {}
            }
        }

        let mut candidates: Vec<(u64, Uuid)> = oldest
            .iter()
            .filter(|(process_id, _)| !busy.contains_key(process_id))
            .map(|(_, entry)| *entry)
            .collect();
        candidates.sort_by_key(|(seq, _)| *seq);
        candidates.into_iter().map(|(_, id)| id).collect()
    }
}

impl std::fmt::Debug for InMemoryProcessStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProcessStore")
            .field("processes", &self.process_count())
            .field("steps", &self.step_count())
            .finish()
    }
}

#[async_trait]
impl ProcessStore for InMemoryProcessStore {
    async fn create_process(
        &self,
        process_id: Uuid,
        process_type: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let mut processes = self.processes.write();
        if processes.contains_key(&process_id) {
            return Err(StoreError::DuplicateProcess(process_id));
        }
        processes.insert(
            process_id,
            Process {
                id: process_id,
                process_type: process_type.to_string(),
                correlation_id,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_process(&self, process_id: Uuid) -> Result<Process, StoreError> {
        self.processes
            .read()
            .get(&process_id)
            .cloned()
            .ok_or(StoreError::ProcessNotFound(process_id))
    }

    async fn enqueue_step(&self, enqueue: StepEnqueue) -> Result<Uuid, StoreError> {
        if !self.processes.read().contains_key(&enqueue.process_id) {
            return Err(StoreError::ProcessNotFound(enqueue.process_id));
        }

        let now = Utc::now();
        let id = Uuid::now_v7();
        let state = StepState {
            step: ProcessStep {
                id,
                process_id: enqueue.process_id,
                step_type: enqueue.step_type,
                status: ProcessStepStatus::Todo,
                message: None,
                attempt_of: enqueue.attempt_of,
                created_at: now,
                modified_at: now,
            },
            seq: self.next_seq(),
            visible_at: now
                + chrono::Duration::from_std(enqueue.delay).unwrap_or(chrono::Duration::zero()),
            claimed_by: None,
            heartbeat_at: None,
        };
        self.steps.write().insert(id, state);
        Ok(id)
    }

    async fn get_step(&self, step_id: Uuid) -> Result<ProcessStep, StoreError> {
        self.steps
            .read()
            .get(&step_id)
            .map(|s| s.step.clone())
            .ok_or(StoreError::StepNotFound(step_id))
    }

    async fn list_steps(&self, process_id: Uuid) -> Result<Vec<ProcessStep>, StoreError> {
        let steps = self.steps.read();
        let mut found: Vec<&StepState> = steps
            .values()
            .filter(|s| s.step.process_id == process_id)
            .collect();
        found.sort_by_key(|s| s.seq);
        Ok(found.into_iter().map(|s| s.step.clone()).collect())
    }

    async fn pending_steps(&self, process_id: Uuid) -> Result<Vec<ProcessStep>, StoreError> {
        let now = Utc::now();
        let steps = self.steps.read();
        let mut found: Vec<&StepState> = steps
            .values()
            .filter(|s| {
                s.step.process_id == process_id
                    && s.step.status == ProcessStepStatus::Todo
                    && s.visible_at <= now
            })
            .collect();
        found.sort_by_key(|s| s.seq);
        Ok(found.into_iter().map(|s| s.step.clone()).collect())
    }

    async fn claim_next_steps(
        &self,
        worker_id: &str,
        step_types: &[String],
        max_steps: usize,
    ) -> Result<Vec<ClaimedStep>, StoreError> {
        let processes = self.processes.read();
        let mut steps = self.steps.write();
        let now = Utc::now();

        let candidates = Self::claim_candidates(&steps);
        let mut claimed = Vec::new();

        for step_id in candidates {
            if claimed.len() >= max_steps {
                break;
            }
            let state = match steps.get_mut(&step_id) {
                Some(s) => s,
                None => continue,
            };
            // An unelapsed delay or an unhandled step type blocks the whole
            // process: later siblings must not overtake the head of the queue.
            if state.visible_at > now || !step_types.contains(&state.step.step_type) {
                continue;
            }

            state.step.status = ProcessStepStatus::InProgress;
            state.step.modified_at = now;
            state.claimed_by = Some(worker_id.to_string());
            state.heartbeat_at = Some(now);

            let process_type = processes
                .get(&state.step.process_id)
                .map(|p| p.process_type.clone())
                .unwrap_or_default();
            claimed.push(ClaimedStep {
                id: state.step.id,
                process_id: state.step.process_id,
                process_type,
                step_type: state.step.step_type.clone(),
                claimed_at: now,
            });
        }

        Ok(claimed)
    }

    async fn claim_step(&self, step_id: Uuid, worker_id: &str) -> Result<ClaimedStep, StoreError> {
        let processes = self.processes.read();
        let mut steps = self.steps.write();
        let now = Utc::now();

        let state = steps
            .get_mut(&step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;
        match state.step.status {
            ProcessStepStatus::Todo => {}
            ProcessStepStatus::InProgress => {
                return Err(StoreError::StepAlreadyClaimed(step_id));
            }
            from => {
                return Err(StoreError::InvalidTransition {
                    step_id,
                    from,
                    to: ProcessStepStatus::InProgress,
                });
            }
        }

        state.step.status = ProcessStepStatus::InProgress;
        state.step.modified_at = now;
        state.claimed_by = Some(worker_id.to_string());
        state.heartbeat_at = Some(now);

        let process_type = processes
            .get(&state.step.process_id)
            .map(|p| p.process_type.clone())
            .unwrap_or_default();
        Ok(ClaimedStep {
            id: state.step.id,
            process_id: state.step.process_id,
            process_type,
            step_type: state.step.step_type.clone(),
            claimed_at: now,
        })
    }

    async fn heartbeat_step(&self, step_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let mut steps = self.steps.write();
        let state = steps
            .get_mut(&step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;
        if state.step.status != ProcessStepStatus::InProgress
            || state.claimed_by.as_deref() != Some(worker_id)
        {
            return Ok(false);
        }
        state.heartbeat_at = Some(Utc::now());
        Ok(true)
    }

    async fn complete_step(
        &self,
        step_id: Uuid,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut steps = self.steps.write();
        let state = steps
            .get_mut(&step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;
        if state.step.status != ProcessStepStatus::InProgress {
            return Err(StoreError::InvalidTransition {
                step_id,
                from: state.step.status,
                to: ProcessStepStatus::Done,
            });
        }
        state.step.status = ProcessStepStatus::Done;
        state.step.message = message.map(|m| m.to_string());
        state.step.modified_at = Utc::now();
        state.claimed_by = None;
        state.heartbeat_at = None;
        Ok(())
    }

    async fn fail_step(&self, step_id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut steps = self.steps.write();
        let state = steps
            .get_mut(&step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;
        if state.step.status != ProcessStepStatus::InProgress {
            return Err(StoreError::InvalidTransition {
                step_id,
                from: state.step.status,
                to: ProcessStepStatus::Failed,
            });
        }
        state.step.status = ProcessStepStatus::Failed;
        state.step.message = Some(error.to_string());
        state.step.modified_at = Utc::now();
        state.claimed_by = None;
        state.heartbeat_at = None;
        Ok(())
    }

    async fn skip_step(&self, step_id: Uuid, reason: &str) -> Result<(), StoreError> {
        let mut steps = self.steps.write();
        let state = steps
            .get_mut(&step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;
        match state.step.status {
            ProcessStepStatus::Todo | ProcessStepStatus::Failed => {}
            from => {
                return Err(StoreError::InvalidTransition {
                    step_id,
                    from,
                    to: ProcessStepStatus::Skipped,
                });
            }
        }
        state.step.status = ProcessStepStatus::Skipped;
        state.step.message = Some(reason.to_string());
        state.step.modified_at = Utc::now();
        Ok(())
    }

    async fn reclaim_stale_steps(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut steps = self.steps.write();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_threshold).unwrap_or(chrono::Duration::zero());
        let mut reclaimed = Vec::new();
        for state in steps.values_mut() {
            if state.step.status == ProcessStepStatus::InProgress
                && state.heartbeat_at.map(|hb| hb < cutoff).unwrap_or(true)
            {
                state.step.status = ProcessStepStatus::Todo;
                state.step.modified_at = Utc::now();
                state.claimed_by = None;
                state.heartbeat_at = None;
                reclaimed.push(state.step.id);
            }
        }
        Ok(reclaimed)
    }

    async fn stalled_processes(&self) -> Result<Vec<StalledProcess>, StoreError> {
        let processes = self.processes.read();
        let steps = self.steps.read();

        let mut stalled = Vec::new();
        for state in steps.values() {
            if state.step.status != ProcessStepStatus::Failed {
                continue;
            }
            let recovered = steps
                .values()
                .any(|s| s.step.attempt_of == Some(state.step.id));
            let active = steps.values().any(|s| {
                s.step.process_id == state.step.process_id
                    && matches!(
                        s.step.status,
                        ProcessStepStatus::Todo | ProcessStepStatus::InProgress
                    )
            });
            if recovered || active {
                continue;
            }
            let process_type = processes
                .get(&state.step.process_id)
                .map(|p| p.process_type.clone())
                .unwrap_or_default();
            stalled.push(StalledProcess {
                process_id: state.step.process_id,
                process_type,
                step_id: state.step.id,
                step_type: state.step.step_type.clone(),
                message: state.step.message.clone(),
                failed_at: state.step.modified_at,
            });
        }
        stalled.sort_by_key(|s| s.failed_at);
        Ok(stalled)
    }
}
