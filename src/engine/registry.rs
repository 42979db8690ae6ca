//! Process creation and lookup

use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use crate::catalog::StepCatalog;
use crate::engine::EngineError;
use crate::persistence::ProcessStore;
use crate::process::Process;

/// Creates processes of catalog-known types
///
/// The registry only creates the process shell; scheduling its first step
/// is a separate [`StepExecutor`](crate::engine::StepExecutor) call.
pub struct ProcessRegistry<S> {
    store: Arc<S>,
    catalog: Arc<StepCatalog>,
}

impl<S> Clone for ProcessRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            catalog: Arc::clone(&self.catalog),
        }
    }
}

impl<S: ProcessStore> ProcessRegistry<S> {
    pub fn new(store: Arc<S>, catalog: Arc<StepCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Create a new process of the given type
    ///
    /// The type is fixed for the lifetime of the process.
    pub async fn create_process(&self, process_type: &str) -> Result<Uuid, EngineError> {
        self.create_process_for(process_type, None).await
    }

    /// Create a new process correlated to a domain entity
    ///
    /// The correlation is opaque to the engine; callers use it to find the
    /// processes working on a given entity.
    #[instrument(skip(self))]
    pub async fn create_process_for(
        &self,
        process_type: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<Uuid, EngineError> {
        if !self.catalog.contains_process_type(process_type) {
            return Err(EngineError::InvalidProcessType(process_type.to_string()));
        }

        let process_id = Uuid::now_v7();
        self.store
            .create_process(process_id, process_type, correlation_id)
            .await?;

        info!(%process_id, %process_type, "created process");
        Ok(process_id)
    }

    pub async fn get_process(&self, process_id: Uuid) -> Result<Process, EngineError> {
        Ok(self.store.get_process(process_id).await?)
    }

    pub fn catalog(&self) -> &StepCatalog {
        &self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StepCatalog;
    use crate::persistence::InMemoryProcessStore;

    fn catalog() -> Arc<StepCatalog> {
        Arc::new(
            StepCatalog::builder()
                .process_type("OFFER_SUBSCRIPTION")
                .step("TRIGGER_PROVIDER")
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_create_process_of_known_type() {
        let registry = ProcessRegistry::new(Arc::new(InMemoryProcessStore::new()), catalog());
        let id = registry.create_process("OFFER_SUBSCRIPTION").await.unwrap();

        let process = registry.get_process(id).await.unwrap();
        assert_eq!(process.process_type, "OFFER_SUBSCRIPTION");
        assert_eq!(process.correlation_id, None);
    }

    #[tokio::test]
    async fn test_correlation_id_round_trips() {
        let registry = ProcessRegistry::new(Arc::new(InMemoryProcessStore::new()), catalog());
        let offer_id = Uuid::now_v7();
        let id = registry
            .create_process_for("OFFER_SUBSCRIPTION", Some(offer_id))
            .await
            .unwrap();

        let process = registry.get_process(id).await.unwrap();
        assert_eq!(process.correlation_id, Some(offer_id));
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let registry = ProcessRegistry::new(Arc::new(InMemoryProcessStore::new()), catalog());
        let err = registry.create_process("APPLICATION_CHECKLIST").await;
        assert!(matches!(err, Err(EngineError::InvalidProcessType(_))));
    }
}
