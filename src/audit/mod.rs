//! Append-only audit trail for entity mutations
//!
//! Every insert/update/delete of an audited entity produces exactly one
//! immutable audit row carrying a full snapshot of the entity. Audit tables
//! are generation-suffixed (`audit_<entity>_<generation>`); schema changes
//! open a new generation and freeze the old table rather than altering it.

mod memory;
mod postgres;
mod schema;

pub use memory::InMemoryAuditLog;
pub use postgres::PostgresAuditRecorder;
pub use schema::AuditSchemaRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error type for audit operations
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Entity has no registered audit schema
    #[error("entity not registered for auditing: {0}")]
    UnknownEntity(String),

    /// Generation already exists for this entity
    #[error("generation {generation} already registered for entity {entity}")]
    DuplicateGeneration { entity: String, generation: String },

    /// Entity or generation name is not a safe SQL identifier
    #[error("invalid audit identifier: {0}")]
    InvalidIdentifier(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),
}

/// Kind of mutation an audit entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Insert,
    Update,
    Delete,
}

impl AuditOperation {
    /// Stable numeric code stored in the audit row
    pub fn code(&self) -> i16 {
        match self {
            AuditOperation::Insert => 1,
            AuditOperation::Update => 2,
            AuditOperation::Delete => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(AuditOperation::Insert),
            2 => Some(AuditOperation::Update),
            3 => Some(AuditOperation::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditOperation::Insert => write!(f, "insert"),
            AuditOperation::Update => write!(f, "update"),
            AuditOperation::Delete => write!(f, "delete"),
        }
    }
}

/// A mutation to be recorded in the audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditMutation {
    /// Entity kind, e.g. `process_steps`
    pub entity: String,
    pub entity_id: Uuid,
    pub operation: AuditOperation,

    /// Full snapshot of the entity after the mutation (before, for deletes)
    pub snapshot: serde_json::Value,

    /// Identity that caused the mutation, if known
    pub editor_id: Option<Uuid>,
}

impl AuditMutation {
    pub fn new(
        entity: impl Into<String>,
        entity_id: Uuid,
        operation: AuditOperation,
        snapshot: serde_json::Value,
    ) -> Self {
        Self {
            entity: entity.into(),
            entity_id,
            operation,
            snapshot,
            editor_id: None,
        }
    }

    pub fn with_editor(mut self, editor_id: Uuid) -> Self {
        self.editor_id = Some(editor_id);
        self
    }
}

/// A persisted audit trail row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: Uuid,
    pub entity: String,
    pub entity_id: Uuid,
    pub operation: AuditOperation,
    pub snapshot: serde_json::Value,
    pub editor_id: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,

    /// Schema generation this entry was written under
    pub generation: String,
}

/// Sink for append-only audit entries
///
/// Entries are write-once: there is no update or delete surface, and
/// implementations must never overwrite an existing row.
#[async_trait]
pub trait AuditRecorder: Send + Sync {
    /// Record one mutation as one audit row, returning its ID
    async fn record(&self, mutation: AuditMutation) -> Result<Uuid, AuditError>;

    /// Audit history of one entity instance, oldest first, optionally
    /// bounded by a time range (spanning all generations)
    async fn entries_for(
        &self,
        entity: &str,
        entity_id: Uuid,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>, AuditError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_codes_are_stable() {
        assert_eq!(AuditOperation::Insert.code(), 1);
        assert_eq!(AuditOperation::Update.code(), 2);
        assert_eq!(AuditOperation::Delete.code(), 3);
        for op in [
            AuditOperation::Insert,
            AuditOperation::Update,
            AuditOperation::Delete,
        ] {
            assert_eq!(AuditOperation::from_code(op.code()), Some(op));
        }
        assert_eq!(AuditOperation::from_code(0), None);
        assert_eq!(AuditOperation::from_code(4), None);
    }

    #[test]
    fn test_mutation_builder() {
        let editor = Uuid::now_v7();
        let mutation = AuditMutation::new(
            "process_steps",
            Uuid::now_v7(),
            AuditOperation::Update,
            serde_json::json!({"status": "done"}),
        )
        .with_editor(editor);
        assert_eq!(mutation.entity, "process_steps");
        assert_eq!(mutation.editor_id, Some(editor));
    }
}
