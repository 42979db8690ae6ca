//! Fluent catalog construction with validation at build time

use std::collections::HashMap;

use super::definition::{CatalogError, ProcessTypeDef, StepCatalog, StepDef};

/// Builder for [`StepCatalog`]
///
/// `on_success`, `retrigger` and `deprecated` apply to the most recently
/// opened step. Validation happens in [`build`](Self::build): duplicate
/// labels and transitions referencing undeclared step types are rejected,
/// so a catalog that builds is internally consistent.
pub struct CatalogBuilder {
    process_types: Vec<(String, Vec<(String, StepDef)>)>,
    error: Option<CatalogError>,
}

impl CatalogBuilder {
    pub(crate) fn new() -> Self {
        Self {
            process_types: Vec::new(),
            error: None,
        }
    }

    /// Open a new process type; subsequent `step` calls belong to it
    pub fn process_type(mut self, label: impl Into<String>) -> Self {
        if self.error.is_some() {
            return self;
        }
        self.process_types.push((label.into(), Vec::new()));
        self
    }

    /// Declare a step type within the current process type
    pub fn step(mut self, label: impl Into<String>) -> Self {
        if self.error.is_some() {
            return self;
        }
        match self.process_types.last_mut() {
            Some((_, steps)) => steps.push((label.into(), StepDef::new())),
            None => {
                self.error = Some(CatalogError::InvalidBuilder(
                    "step() called before process_type()".into(),
                ));
            }
        }
        self
    }

    /// Set the on-success successor of the current step
    pub fn on_success(mut self, next: impl Into<String>) -> Self {
        self.with_current_step(|def| def.on_success = Some(next.into()));
        self
    }

    /// Set the on-failure retrigger of the current step
    pub fn retrigger(mut self, retrigger: impl Into<String>) -> Self {
        self.with_current_step(|def| def.on_failure = Some(retrigger.into()));
        self
    }

    /// Mark the current step deprecated (valid for history, not schedulable)
    pub fn deprecated(mut self) -> Self {
        self.with_current_step(|def| def.deprecated = true);
        self
    }

    fn with_current_step(&mut self, f: impl FnOnce(&mut StepDef)) {
        if self.error.is_some() {
            return;
        }
        match self
            .process_types
            .last_mut()
            .and_then(|(_, steps)| steps.last_mut())
        {
            Some((_, def)) => f(def),
            None => {
                self.error = Some(CatalogError::InvalidBuilder(
                    "transition set before any step() was declared".into(),
                ));
            }
        }
    }

    /// Validate and build the catalog
    pub fn build(self) -> Result<StepCatalog, CatalogError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let mut process_types = HashMap::new();
        for (process_type, steps) in self.process_types {
            if steps.is_empty() {
                return Err(CatalogError::EmptyProcessType(process_type));
            }

            let mut step_map: HashMap<String, StepDef> = HashMap::with_capacity(steps.len());
            for (step_type, def) in steps {
                if step_map.insert(step_type.clone(), def).is_some() {
                    return Err(CatalogError::DuplicateStepType {
                        process_type,
                        step_type,
                    });
                }
            }

            // Every transition target must be a declared step of the same
            // process type
            for (step_type, def) in &step_map {
                for referenced in [def.on_success.as_deref(), def.on_failure.as_deref()]
                    .into_iter()
                    .flatten()
                {
                    if !step_map.contains_key(referenced) {
                        return Err(CatalogError::UnknownStepReference {
                            process_type,
                            step_type: step_type.clone(),
                            referenced: referenced.to_string(),
                        });
                    }
                }
            }

            if process_types
                .insert(process_type.clone(), ProcessTypeDef::new(step_map))
                .is_some()
            {
                return Err(CatalogError::DuplicateProcessType(process_type));
            }
        }

        Ok(StepCatalog::new(process_types))
    }
}
