//! PostgreSQL audit recorder
//!
//! One row per mutation, written into the generation-suffixed table the
//! schema registry currently points at. `record_with` takes a live
//! connection so the audit row commits or rolls back together with the
//! business write it describes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::schema::table_name_for;
use super::{AuditEntry, AuditError, AuditMutation, AuditRecorder, AuditSchemaRegistry};

/// PostgreSQL implementation of [`AuditRecorder`]
#[derive(Clone)]
pub struct PostgresAuditRecorder {
    pool: PgPool,
    registry: Arc<AuditSchemaRegistry>,
}

impl PostgresAuditRecorder {
    pub fn new(pool: PgPool, registry: Arc<AuditSchemaRegistry>) -> Self {
        Self { pool, registry }
    }

    pub fn registry(&self) -> &AuditSchemaRegistry {
        &self.registry
    }

    /// Create the audit table for the entity's current generation if it
    /// does not exist yet
    ///
    /// Table and generation names come from the registry, which only admits
    /// validated identifiers, so splicing them into DDL is safe.
    #[instrument(skip(self))]
    pub async fn ensure_generation_table(&self, entity: &str) -> Result<(), AuditError> {
        let table = self.registry.table_name(entity)?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                audit_id     UUID PRIMARY KEY,
                entity_id    UUID NOT NULL,
                operation    SMALLINT NOT NULL,
                snapshot     JSONB NOT NULL,
                editor_id    UUID,
                recorded_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create audit table {}: {}", table, e);
            AuditError::Database(e.to_string())
        })?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_entity ON {table} (entity_id, recorded_at)"
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| AuditError::Database(e.to_string()))?;

        debug!(%entity, %table, "ensured audit table");
        Ok(())
    }

    /// Record a mutation on an existing connection so it joins the
    /// caller's transaction
    pub async fn record_with(
        &self,
        conn: &mut PgConnection,
        mutation: AuditMutation,
    ) -> Result<Uuid, AuditError> {
        let table = self.registry.table_name(&mutation.entity)?;
        let audit_id = Uuid::now_v7();

        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (audit_id, entity_id, operation, snapshot, editor_id)
            VALUES ($1, $2, $3, $4, $5)
            "#
        ))
        .bind(audit_id)
        .bind(mutation.entity_id)
        .bind(mutation.operation.code())
        .bind(&mutation.snapshot)
        .bind(mutation.editor_id)
        .execute(conn)
        .await
        .map_err(|e| {
            error!("Failed to record audit entry: {}", e);
            AuditError::Database(e.to_string())
        })?;

        debug!(%audit_id, entity = %mutation.entity, operation = %mutation.operation, "recorded audit entry");
        Ok(audit_id)
    }
}

#[async_trait]
impl AuditRecorder for PostgresAuditRecorder {
    #[instrument(skip(self, mutation), fields(entity = %mutation.entity, operation = %mutation.operation))]
    async fn record(&self, mutation: AuditMutation) -> Result<Uuid, AuditError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| AuditError::Database(e.to_string()))?;
        self.record_with(&mut conn, mutation).await
    }

    #[instrument(skip(self))]
    async fn entries_for(
        &self,
        entity: &str,
        entity_id: Uuid,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        let mut entries = Vec::new();

        // Read across all generations, oldest first; frozen tables stay
        // part of the history.
        for generation in self.registry.generations(entity)? {
            let table = table_name_for(entity, &generation);
            let rows = sqlx::query(&format!(
                r#"
                SELECT audit_id, entity_id, operation, snapshot, editor_id, recorded_at
                FROM {table}
                WHERE entity_id = $1
                  AND ($2::timestamptz IS NULL OR recorded_at >= $2)
                  AND ($3::timestamptz IS NULL OR recorded_at <= $3)
                ORDER BY recorded_at, audit_id
                "#
            ))
            .bind(entity_id)
            .bind(since)
            .bind(until)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to read audit entries from {}: {}", table, e);
                AuditError::Database(e.to_string())
            })?;

            for row in rows {
                let code: i16 = row.get("operation");
                entries.push(AuditEntry {
                    audit_id: row.get("audit_id"),
                    entity: entity.to_string(),
                    entity_id: row.get("entity_id"),
                    operation: super::AuditOperation::from_code(code).ok_or_else(|| {
                        AuditError::Database(format!("unknown audit operation code: {code}"))
                    })?,
                    snapshot: row.get("snapshot"),
                    editor_id: row.get("editor_id"),
                    recorded_at: row.get("recorded_at"),
                    generation: generation.clone(),
                });
            }
        }

        entries.sort_by_key(|e| (e.recorded_at, e.audit_id));
        Ok(entries)
    }
}
