//! One associations: a foreign key on the owner's table pointing at a
//! single row of the target model.

use serde_json::Value;
use tracing::debug;

use super::{AssociationState, AssociationValue};
use crate::error::{ModelError, ModelResult};
use crate::identity_map::Ancestry;
use crate::instance::Instance;
use crate::model::{GetOptions, Model};

#[derive(Debug, Clone, PartialEq)]
pub struct OneAssociation {
    pub name: String,
    /// Table of the target model
    pub target: String,
    /// Foreign key columns on the owner, in target id order
    pub field: Vec<String>,
    pub required: bool,
    pub auto_fetch: bool,
    /// Depth for this association, overriding the model's limit
    pub auto_fetch_limit: Option<u32>,
}

impl OneAssociation {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            field: Vec::new(),
            required: false,
            auto_fetch: false,
            auto_fetch_limit: None,
        }
    }

    pub fn field<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn auto_fetch(mut self, enabled: bool) -> Self {
        self.auto_fetch = enabled;
        self
    }

    pub fn auto_fetch_limit(mut self, limit: u32) -> Self {
        self.auto_fetch_limit = Some(limit);
        self
    }

    /// Fill the default foreign key `<name>_<target id>`.
    pub(crate) fn resolve(&mut self, target_ids: &[String]) {
        if self.field.is_empty() {
            self.field = target_ids
                .iter()
                .map(|id| format!("{}_{}", self.name, id))
                .collect();
        }
    }
}

pub struct OneAccessor<'a> {
    instance: &'a Instance,
    assoc: &'a OneAssociation,
}

impl<'a> OneAccessor<'a> {
    pub(crate) fn new(instance: &'a Instance, assoc: &'a OneAssociation) -> Self {
        Self { instance, assoc }
    }

    pub fn association(&self) -> &OneAssociation {
        self.assoc
    }

    pub fn target(&self) -> ModelResult<Model> {
        self.instance.model().resolve(&self.assoc.target)
    }

    /// Foreign key values, or `None` while any of them is null.
    pub fn key(&self) -> Option<Vec<Value>> {
        let values: Vec<Value> = self
            .assoc
            .field
            .iter()
            .map(|f| self.instance.get(f).unwrap_or(Value::Null))
            .collect();
        values.iter().all(|v| !v.is_null()).then_some(values)
    }

    /// The related instance; cached after the first fetch.
    pub async fn get(&self) -> ModelResult<Option<Instance>> {
        if let AssociationState::Fetched(AssociationValue::One(related)) =
            self.instance.association_state(&self.assoc.name)
        {
            return Ok(related);
        }
        self.fetch(GetOptions::default(), Ancestry::default()).await
    }

    pub(crate) async fn fetch(
        &self,
        options: GetOptions,
        ancestry: Ancestry,
    ) -> ModelResult<Option<Instance>> {
        let Some(key) = self.key() else {
            self.store(None);
            return Ok(None);
        };

        self.instance.mark_fetching(&self.assoc.name);
        let target = self.target()?;
        let related = target.get_inner(key, options, ancestry).await?;
        self.store(Some(related.clone()));
        Ok(Some(related))
    }

    fn store(&self, related: Option<Instance>) {
        self.instance.set_association(
            &self.assoc.name,
            AssociationState::Fetched(AssociationValue::One(related)),
        );
    }

    /// Point the foreign key at `related`, saving it first when new.
    pub async fn set(&self, related: &Instance) -> ModelResult<()> {
        if related.is_new() {
            related.save().await?;
        }
        self.set_key(related.id())?;
        self.store(Some(related.clone()));
        Ok(())
    }

    /// Write raw foreign key values. The cached related instance is dropped.
    pub fn set_key(&self, key: Vec<Value>) -> ModelResult<()> {
        if key.len() != self.assoc.field.len() {
            return Err(ModelError::ParamMismatch {
                model: self.instance.model().table().to_string(),
                expected: self.assoc.field.len(),
                given: key.len(),
            });
        }
        for (field, value) in self.assoc.field.iter().zip(key) {
            self.instance.set(field, value)?;
        }
        self.instance
            .set_association(&self.assoc.name, AssociationState::Unfetched);
        Ok(())
    }

    /// Whether the foreign key points at an existing row.
    pub async fn has(&self) -> ModelResult<bool> {
        match self.key() {
            Some(key) => self.target()?.exists(key).await,
            None => Ok(false),
        }
    }

    /// Clear the foreign key.
    pub fn remove(&self) -> ModelResult<()> {
        for field in &self.assoc.field {
            self.instance.set(field, Value::Null)?;
        }
        self.store(None);
        Ok(())
    }
}

/// Auto-fetch step for one association during construction.
pub(crate) async fn auto_fetch(
    instance: &Instance,
    assoc: &OneAssociation,
    limit: u32,
    ancestry: &Ancestry,
) -> ModelResult<()> {
    debug!(table = instance.model().table(), association = %assoc.name, "auto-fetch one");
    let accessor = OneAccessor::new(instance, assoc);
    let options = GetOptions::default()
        .auto_fetch(limit > 1)
        .auto_fetch_limit(limit.saturating_sub(1));

    match accessor.fetch(options, ancestry.clone()).await {
        Ok(_) => Ok(()),
        Err(err) if err.is_not_found() => {
            accessor.store(None);
            Ok(())
        }
        Err(err) => {
            instance.set_association(&assoc.name, AssociationState::Unfetched);
            Err(err)
        }
    }
}
