//! Audit schema generations
//!
//! Maps each audited entity to an append-only list of schema generations.
//! New rows always target the latest generation; older generation tables
//! are frozen and kept for reads.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::AuditError;

/// Registry of audited entities and their schema generations
///
/// Generations are dated tags like `20231115`. Registering a new generation
/// never touches existing ones; there is deliberately no removal surface.
#[derive(Debug, Default)]
pub struct AuditSchemaRegistry {
    entities: RwLock<HashMap<String, Vec<String>>>,
}

impl AuditSchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity with its first generation
    ///
    /// Registering an already known entity adds a generation, same as
    /// [`add_generation`](Self::add_generation).
    pub fn register(
        &self,
        entity: impl Into<String>,
        generation: impl Into<String>,
    ) -> Result<(), AuditError> {
        let entity = entity.into();
        let generation = generation.into();
        validate_identifier(&entity)?;
        validate_identifier(&generation)?;

        let mut entities = self.entities.write();
        let generations = entities.entry(entity.clone()).or_default();
        if generations.contains(&generation) {
            return Err(AuditError::DuplicateGeneration { entity, generation });
        }
        generations.push(generation);
        Ok(())
    }

    /// Open a new generation for an already registered entity
    pub fn add_generation(
        &self,
        entity: &str,
        generation: impl Into<String>,
    ) -> Result<(), AuditError> {
        if !self.entities.read().contains_key(entity) {
            return Err(AuditError::UnknownEntity(entity.to_string()));
        }
        self.register(entity, generation)
    }

    /// Latest generation of an entity, the one new rows target
    pub fn current_generation(&self, entity: &str) -> Result<String, AuditError> {
        self.entities
            .read()
            .get(entity)
            .and_then(|g| g.last().cloned())
            .ok_or_else(|| AuditError::UnknownEntity(entity.to_string()))
    }

    /// All generations of an entity, oldest first
    pub fn generations(&self, entity: &str) -> Result<Vec<String>, AuditError> {
        self.entities
            .read()
            .get(entity)
            .cloned()
            .ok_or_else(|| AuditError::UnknownEntity(entity.to_string()))
    }

    /// Table name new rows for this entity are written to
    pub fn table_name(&self, entity: &str) -> Result<String, AuditError> {
        let generation = self.current_generation(entity)?;
        Ok(table_name_for(entity, &generation))
    }

    pub fn is_registered(&self, entity: &str) -> bool {
        self.entities.read().contains_key(entity)
    }

    pub fn entities(&self) -> Vec<String> {
        self.entities.read().keys().cloned().collect()
    }
}

/// Table name for a specific entity generation
pub(crate) fn table_name_for(entity: &str, generation: &str) -> String {
    format!("audit_{entity}_{generation}")
}

/// Accept only identifiers that are safe to splice into DDL/DML:
/// lowercase ASCII letters, digits and underscores, starting with a letter.
fn validate_identifier(name: &str) -> Result<(), AuditError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(AuditError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_table_name() {
        let registry = AuditSchemaRegistry::new();
        registry.register("company", "v20230614").unwrap();
        assert_eq!(registry.table_name("company").unwrap(), "audit_company_v20230614");
        assert!(registry.is_registered("company"));
    }

    #[test]
    fn test_new_generation_becomes_current() {
        let registry = AuditSchemaRegistry::new();
        registry.register("company", "v20230614").unwrap();
        registry.add_generation("company", "v20231115").unwrap();

        assert_eq!(registry.current_generation("company").unwrap(), "v20231115");
        assert_eq!(
            registry.generations("company").unwrap(),
            vec!["v20230614".to_string(), "v20231115".to_string()]
        );
    }

    #[test]
    fn test_duplicate_generation_rejected() {
        let registry = AuditSchemaRegistry::new();
        registry.register("company", "v20230614").unwrap();
        let err = registry.add_generation("company", "v20230614");
        assert!(matches!(err, Err(AuditError::DuplicateGeneration { .. })));
    }

    #[test]
    fn test_unknown_entity() {
        let registry = AuditSchemaRegistry::new();
        assert!(matches!(
            registry.current_generation("nope"),
            Err(AuditError::UnknownEntity(_))
        ));
        assert!(matches!(
            registry.add_generation("nope", "v1"),
            Err(AuditError::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_identifier_validation() {
        let registry = AuditSchemaRegistry::new();
        assert!(matches!(
            registry.register("Company", "v1"),
            Err(AuditError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            registry.register("company; drop table", "v1"),
            Err(AuditError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            registry.register("company", "1v"),
            Err(AuditError::InvalidIdentifier(_))
        ));
        assert!(registry.register("offer_subscription2", "v1").is_ok());
    }
}
