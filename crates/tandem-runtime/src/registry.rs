use std::collections::HashMap;
use std::sync::RwLock;

use tandem_core::definition::{ModelOptions, StepDefinition};
use tandem_core::error::{Result, SagaError};

/// A registered transaction model.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredModel {
    pub definition: StepDefinition,
    pub options: ModelOptions,
}

/// Registry of transaction models, keyed by model id.
///
/// Registration is write-once per id: re-registering an identical definition
/// is a no-op, a conflicting one is rejected. Reads are concurrent.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, RegisteredModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model. Fails with `IllegalState` when the id is already
    /// taken by a different definition. Re-registering an equal definition
    /// is a no-op, even with different options: the first registration wins.
    pub fn register(
        &self,
        model_id: impl Into<String>,
        definition: StepDefinition,
        options: ModelOptions,
    ) -> Result<()> {
        let model_id = model_id.into();
        let entry = RegisteredModel {
            definition,
            options,
        };
        let mut models = self.models.write().unwrap();
        match models.get(&model_id) {
            Some(existing) if existing.definition == entry.definition => Ok(()),
            Some(_) => Err(SagaError::IllegalState(format!(
                "model '{model_id}' is already registered with a different definition"
            ))),
            None => {
                models.insert(model_id, entry);
                Ok(())
            }
        }
    }

    /// Look up a model by id.
    pub fn get(&self, model_id: &str) -> Option<RegisteredModel> {
        self.models.read().unwrap().get(model_id).cloned()
    }

    /// All registered model ids.
    pub fn names(&self) -> Vec<String> {
        self.models.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.models.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> StepDefinition {
        StepDefinition::root(vec![StepDefinition::action("a")])
    }

    #[test]
    fn test_register_and_get() {
        let registry = ModelRegistry::new();
        registry
            .register("orders", definition(), ModelOptions::default())
            .unwrap();
        let model = registry.get("orders").unwrap();
        assert_eq!(model.definition, definition());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_identical_reregistration_is_noop() {
        let registry = ModelRegistry::new();
        registry
            .register("orders", definition(), ModelOptions::default())
            .unwrap();
        registry
            .register("orders", definition(), ModelOptions::default())
            .unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_definition_with_different_options_is_noop() {
        let registry = ModelRegistry::new();
        registry
            .register("orders", definition(), ModelOptions::default())
            .unwrap();
        let other_options = ModelOptions {
            timeout: Some(60),
            idempotent: true,
            ..ModelOptions::default()
        };
        registry
            .register("orders", definition(), other_options)
            .unwrap();
        // The first registration wins.
        let model = registry.get("orders").unwrap();
        assert_eq!(model.options, ModelOptions::default());
    }

    #[test]
    fn test_conflicting_registration_rejected() {
        let registry = ModelRegistry::new();
        registry
            .register("orders", definition(), ModelOptions::default())
            .unwrap();
        let other = StepDefinition::root(vec![StepDefinition::action("b")]);
        let err = registry
            .register("orders", other, ModelOptions::default())
            .unwrap_err();
        assert!(matches!(err, SagaError::IllegalState(_)));
    }
}
