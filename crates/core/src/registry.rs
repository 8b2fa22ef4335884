use std::collections::HashMap;

use crate::domain::model::{ModelConfig, ModelName};
use crate::errors::DomainError;

/// Ordered catalog of invocable models. The ordering is the fallback
/// traversal order; the registry is read-only after construction and safe
/// to share across conversations without locking.
#[derive(Clone, Debug)]
pub struct ModelRegistry {
    models: Vec<ModelConfig>,
    positions: HashMap<String, usize>,
}

impl ModelRegistry {
    pub fn new(models: Vec<ModelConfig>) -> Result<Self, DomainError> {
        if models.is_empty() {
            return Err(DomainError::EmptyModelRegistry);
        }

        let mut positions = HashMap::with_capacity(models.len());
        let mut ordered = Vec::with_capacity(models.len());
        for (position, mut model) in models.into_iter().enumerate() {
            if positions.insert(model.name.0.clone(), position).is_some() {
                return Err(DomainError::InvariantViolation(format!(
                    "duplicate model name `{}` in registry",
                    model.name.0
                )));
            }
            model.position = position;
            ordered.push(model);
        }

        Ok(Self { models: ordered, positions })
    }

    pub fn list_models(&self) -> &[ModelConfig] {
        &self.models
    }

    pub fn get(&self, name: &ModelName) -> Result<&ModelConfig, DomainError> {
        self.position_of(name)
            .map(|position| &self.models[position])
            .ok_or_else(|| DomainError::ModelNotFound { name: name.0.clone() })
    }

    pub fn position_of(&self, name: &ModelName) -> Option<usize> {
        self.positions.get(&name.0).copied()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
