//! Model Registry - table name to model lookup
//!
//! Associations name their target by table. The registry resolves those names
//! on first use, so models may reference each other in any definition order.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{ModelError, ModelResult};
use crate::model::Model;

/// Thread-safe registry of the models defined on one connection
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Arc<DashMap<String, Model>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `model` under its table name, replacing any previous one.
    pub fn register(&self, model: Model) -> Option<Model> {
        self.models.insert(model.table().to_string(), model)
    }

    pub fn get(&self, table: &str) -> Option<Model> {
        self.models.get(table).map(|entry| entry.value().clone())
    }

    /// Like [`get`](Self::get), failing with `NotDefined` for unknown tables.
    pub fn resolve(&self, from: &str, table: &str) -> ModelResult<Model> {
        self.get(table)
            .ok_or_else(|| ModelError::not_defined(from, table))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.models.contains_key(table)
    }

    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.models.iter().map(|e| e.key().clone()).collect();
        tables.sort();
        tables
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn clear(&self) {
        self.models.clear();
    }
}
