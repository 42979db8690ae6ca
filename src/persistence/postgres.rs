//! PostgreSQL implementation of ProcessStore
//!
//! Production persistence with:
//! - Atomic step claiming via FOR UPDATE SKIP LOCKED
//! - Strict per-process FIFO enforced in the claim query itself
//! - Heartbeat leases so crashed workers release their steps

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::process::{Process, ProcessStep, ProcessStepStatus};

/// PostgreSQL implementation of ProcessStore
///
/// Uses a connection pool shared across workers. Claim atomicity holds
/// across OS processes: two workers polling the same database never
/// receive the same step.
///
/// # Example
///
/// ```ignore
/// use process_engine::PostgresProcessStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresProcessStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresProcessStore {
    pool: PgPool,
}

impl PostgresProcessStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Distinguish "row missing" from "row in the wrong state" after a
    /// guarded UPDATE matched nothing
    async fn transition_error(
        &self,
        step_id: Uuid,
        to: ProcessStepStatus,
    ) -> StoreError {
        match self.get_step(step_id).await {
            Ok(step) => StoreError::InvalidTransition {
                step_id,
                from: step.status,
                to,
            },
            Err(e) => e,
        }
    }
}

fn row_to_step(row: &sqlx::postgres::PgRow) -> Result<ProcessStep, StoreError> {
    let status: String = row.get("status");
    Ok(ProcessStep {
        id: row.get("id"),
        process_id: row.get("process_id"),
        step_type: row.get("step_type"),
        status: status
            .parse()
            .map_err(|_| StoreError::Database(format!("unknown step status: {status}")))?,
        message: row.get("message"),
        attempt_of: row.get("attempt_of"),
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    })
}

#[async_trait]
impl ProcessStore for PostgresProcessStore {
    #[instrument(skip(self))]
    async fn create_process(
        &self,
        process_id: Uuid,
        process_type: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processes (id, process_type, correlation_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(process_id)
        .bind(process_type)
        .bind(correlation_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create process: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateProcess(process_id));
        }

        debug!(%process_id, %process_type, "created process");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_process(&self, process_id: Uuid) -> Result<Process, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, process_type, correlation_id, created_at FROM processes WHERE id = $1
            "#,
        )
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get process: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::ProcessNotFound(process_id))?;

        Ok(Process {
            id: row.get("id"),
            process_type: row.get("process_type"),
            correlation_id: row.get("correlation_id"),
            created_at: row.get("created_at"),
        })
    }

    #[instrument(skip(self, enqueue), fields(process_id = %enqueue.process_id, step_type = %enqueue.step_type))]
    async fn enqueue_step(&self, enqueue: StepEnqueue) -> Result<Uuid, StoreError> {
        // FK violation would surface as an opaque database error; check
        // existence up front for a typed one.
        self.get_process(enqueue.process_id).await?;

        let id = Uuid::now_v7();
        let visible_at = Utc::now()
            + chrono::Duration::from_std(enqueue.delay).unwrap_or_else(|_| chrono::Duration::zero());

        sqlx::query(
            r#"
            INSERT INTO process_steps (id, process_id, step_type, status, attempt_of, visible_at)
            VALUES ($1, $2, $3, 'todo', $4, $5)
            "#,
        )
        .bind(id)
        .bind(enqueue.process_id)
        .bind(&enqueue.step_type)
        .bind(enqueue.attempt_of)
        .bind(visible_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue step: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(step_id = %id, "enqueued step");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_step(&self, step_id: Uuid) -> Result<ProcessStep, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, process_id, step_type, status, message, attempt_of, created_at, modified_at
            FROM process_steps
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get step: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::StepNotFound(step_id))?;

        row_to_step(&row)
    }

    #[instrument(skip(self))]
    async fn list_steps(&self, process_id: Uuid) -> Result<Vec<ProcessStep>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, process_id, step_type, status, message, attempt_of, created_at, modified_at
            FROM process_steps
            WHERE process_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list steps: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(row_to_step).collect()
    }

    #[instrument(skip(self))]
    async fn pending_steps(&self, process_id: Uuid) -> Result<Vec<ProcessStep>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, process_id, step_type, status, message, attempt_of, created_at, modified_at
            FROM process_steps
            WHERE process_id = $1 AND status = 'todo' AND visible_at <= NOW()
            ORDER BY created_at, id
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list pending steps: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(row_to_step).collect()
    }

    #[instrument(skip(self, step_types))]
    async fn claim_next_steps(
        &self,
        worker_id: &str,
        step_types: &[String],
        max_steps: usize,
    ) -> Result<Vec<ClaimedStep>, StoreError> {
        // The claim query enforces strict FIFO per process:
        // - only the oldest `todo` step of a process is claimable
        // - a delayed or unhandled head blocks its siblings
        // - an `in_progress` sibling blocks the whole process
        // SKIP LOCKED keeps concurrent pollers from fighting over rows.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT s.id
                FROM process_steps s
                WHERE s.status = 'todo'
                  AND s.step_type = ANY($1)
                  AND s.visible_at <= NOW()
                  AND NOT EXISTS (
                      SELECT 1 FROM process_steps e
                      WHERE e.process_id = s.process_id
                        AND e.status = 'todo'
                        AND (e.created_at, e.id) < (s.created_at, s.id)
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM process_steps r
                      WHERE r.process_id = s.process_id
                        AND r.status = 'in_progress'
                  )
                ORDER BY s.created_at, s.id
                LIMIT $2
                FOR UPDATE OF s SKIP LOCKED
            )
            UPDATE process_steps t
            SET status = 'in_progress',
                claimed_by = $3,
                claimed_at = NOW(),
                heartbeat_at = NOW(),
                modified_at = NOW()
            FROM claimable c, processes p
            WHERE t.id = c.id AND p.id = t.process_id
            RETURNING t.id, t.process_id, p.process_type, t.step_type, t.claimed_at
            "#,
        )
        .bind(step_types)
        .bind(max_steps as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim steps: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let claimed: Vec<ClaimedStep> = rows
            .iter()
            .map(|row| ClaimedStep {
                id: row.get("id"),
                process_id: row.get("process_id"),
                process_type: row.get("process_type"),
                step_type: row.get("step_type"),
                claimed_at: row.get("claimed_at"),
            })
            .collect();

        if !claimed.is_empty() {
            debug!(count = claimed.len(), %worker_id, "claimed steps");
        }

        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn claim_step(&self, step_id: Uuid, worker_id: &str) -> Result<ClaimedStep, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE process_steps t
            SET status = 'in_progress',
                claimed_by = $2,
                claimed_at = NOW(),
                heartbeat_at = NOW(),
                modified_at = NOW()
            FROM processes p
            WHERE t.id = $1 AND t.status = 'todo' AND p.id = t.process_id
            RETURNING t.id, t.process_id, p.process_type, t.step_type, t.claimed_at
            "#,
        )
        .bind(step_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim step: {}", e);
            StoreError::Database(e.to_string())
        })?;

        match row {
            Some(row) => Ok(ClaimedStep {
                id: row.get("id"),
                process_id: row.get("process_id"),
                process_type: row.get("process_type"),
                step_type: row.get("step_type"),
                claimed_at: row.get("claimed_at"),
            }),
            None => {
                let step = self.get_step(step_id).await?;
                if step.status == ProcessStepStatus::InProgress {
                    Err(StoreError::StepAlreadyClaimed(step_id))
                } else {
                    Err(StoreError::InvalidTransition {
                        step_id,
                        from: step.status,
                        to: ProcessStepStatus::InProgress,
                    })
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn heartbeat_step(&self, step_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE process_steps
            SET heartbeat_at = NOW()
            WHERE id = $1 AND status = 'in_progress' AND claimed_by = $2
            "#,
        )
        .bind(step_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to heartbeat step: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Claim lost, or the step never existed.
        self.get_step(step_id).await?;
        Ok(false)
    }

    #[instrument(skip(self, message))]
    async fn complete_step(
        &self,
        step_id: Uuid,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE process_steps
            SET status = 'done',
                message = $2,
                claimed_by = NULL,
                heartbeat_at = NULL,
                modified_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(step_id)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to complete step: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(step_id, ProcessStepStatus::Done).await);
        }

        debug!(%step_id, "step completed");
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail_step(&self, step_id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE process_steps
            SET status = 'failed',
                message = $2,
                claimed_by = NULL,
                heartbeat_at = NULL,
                modified_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(step_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fail step: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(step_id, ProcessStepStatus::Failed).await);
        }

        debug!(%step_id, "step failed");
        Ok(())
    }

    #[instrument(skip(self, reason))]
    async fn skip_step(&self, step_id: Uuid, reason: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE process_steps
            SET status = 'skipped',
                message = $2,
                modified_at = NOW()
            WHERE id = $1 AND status IN ('todo', 'failed')
            "#,
        )
        .bind(step_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to skip step: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(self
                .transition_error(step_id, ProcessStepStatus::Skipped)
                .await);
        }

        debug!(%step_id, "step skipped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_steps(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cutoff: DateTime<Utc> =
            Utc::now() - chrono::Duration::from_std(stale_threshold).unwrap_or_default();

        let rows = sqlx::query(
            r#"
            UPDATE process_steps
            SET status = 'todo',
                claimed_by = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL,
                modified_at = NOW()
            WHERE status = 'in_progress'
              AND heartbeat_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to reclaim stale steps: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let reclaimed: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();

        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed stale steps");
        }

        Ok(reclaimed)
    }

    #[instrument(skip(self))]
    async fn stalled_processes(&self) -> Result<Vec<StalledProcess>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.id AS process_id, p.process_type,
                   s.id AS step_id, s.step_type, s.message, s.modified_at
            FROM process_steps s
            JOIN processes p ON p.id = s.process_id
            WHERE s.status = 'failed'
              AND NOT EXISTS (
                  SELECT 1 FROM process_steps r WHERE r.attempt_of = s.id
              )
              AND NOT EXISTS (
                  SELECT 1 FROM process_steps a
                  WHERE a.process_id = s.process_id
                    AND a.status IN ('todo', 'in_progress')
              )
            ORDER BY s.modified_at, s.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to query stalled processes: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows
            .iter()
            .map(|row| StalledProcess {
                process_id: row.get("process_id"),
                process_type: row.get("process_type"),
                step_id: row.get("step_id"),
                step_type: row.get("step_type"),
                message: row.get("message"),
                failed_at: row.get("modified_at"),
            })
            .collect())
    }
}
