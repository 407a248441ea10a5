//! Lazily loaded properties
//!
//! Columns declared `lazyload` are left out of every find; the first read
//! fetches just that column and keeps it on the instance.

use serde_json::Value;

use crate::error::ModelResult;
use crate::instance::Instance;

pub struct LazyAccessor<'a> {
    instance: &'a Instance,
    property: &'a str,
}

impl<'a> LazyAccessor<'a> {
    pub(crate) fn new(instance: &'a Instance, property: &'a str) -> Self {
        Self { instance, property }
    }

    pub fn property(&self) -> &str {
        self.property
    }

    /// Whether the value is already in memory.
    pub fn is_loaded(&self) -> bool {
        self.instance.get(self.property).is_some()
    }

    pub async fn get(&self) -> ModelResult<Value> {
        self.instance.load(self.property).await
    }

    /// Update the in-memory value; written on the next save.
    pub fn set(&self, value: impl Into<Value>) -> ModelResult<()> {
        self.instance.set(self.property, value)
    }

    /// Null the value; written on the next save.
    pub fn remove(&self) -> ModelResult<()> {
        self.instance.set(self.property, Value::Null)
    }
}
