//! In-memory audit log for testing and embedded use

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{AuditEntry, AuditError, AuditMutation, AuditRecorder, AuditSchemaRegistry};

/// In-memory implementation of [`AuditRecorder`]
///
/// Entries only ever get appended; the internal vector is never truncated
/// or rewritten.
pub struct InMemoryAuditLog {
    registry: Arc<AuditSchemaRegistry>,
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new(registry: Arc<AuditSchemaRegistry>) -> Self {
        Self {
            registry,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of all entries in recording order
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for InMemoryAuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryAuditLog")
            .field("entries", &self.len())
            .finish()
    }
}

#[async_trait]
impl AuditRecorder for InMemoryAuditLog {
    async fn record(&self, mutation: AuditMutation) -> Result<Uuid, AuditError> {
        let generation = self.registry.current_generation(&mutation.entity)?;
        let audit_id = Uuid::now_v7();
        self.entries.write().push(AuditEntry {
            audit_id,
            entity: mutation.entity,
            entity_id: mutation.entity_id,
            operation: mutation.operation,
            snapshot: mutation.snapshot,
            editor_id: mutation.editor_id,
            recorded_at: Utc::now(),
            generation,
        });
        Ok(audit_id)
    }

    async fn entries_for(
        &self,
        entity: &str,
        entity_id: Uuid,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        if !self.registry.is_registered(entity) {
            return Err(AuditError::UnknownEntity(entity.to_string()));
        }
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| {
                e.entity == entity
                    && e.entity_id == entity_id
                    && since.map(|s| e.recorded_at >= s).unwrap_or(true)
                    && until.map(|u| e.recorded_at <= u).unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}
