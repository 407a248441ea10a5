//! Save, remove, validate and lazy loading for instances.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tracing::{debug, warn};

use super::Instance;
use crate::backends::{QueryOptions, Row};
use crate::error::{ModelError, ModelResult};
use crate::hooks::Hook;
use crate::model::identity_key;
use crate::relationships::{AssociationState, AssociationValue};
use crate::validation::{ValidationContext, ValidationError, ValidationErrors};

impl Instance {
    /// Persist the instance.
    ///
    /// New instances run `beforeValidation`, validators, `beforeCreate`,
    /// `beforeSave`, the insert, pending association writes, `afterCreate` and
    /// `afterSave`. Persisted instances skip the create hooks and only write
    /// changed columns.
    pub fn save(&self) -> BoxFuture<'static, ModelResult<()>> {
        let this = self.clone();
        async move { this.save_inner().await }.boxed()
    }

    async fn save_inner(&self) -> ModelResult<()> {
        let model = self.model().clone();
        let ctx = model.context()?;
        let hooks = model.hooks();

        hooks.wait(Hook::BeforeValidation, self).await?;
        self.check_validations(model.options().return_all_errors)
            .await
            .map_err(ModelError::Validation)?;

        let was_new = self.is_new();
        if was_new {
            hooks.wait(Hook::BeforeCreate, self).await?;
        }
        hooks.wait(Hook::BeforeSave, self).await?;

        self.link_pending_one().await?;

        if was_new {
            let data: Row = {
                let state = self.inner.state.read();
                model
                    .columns()
                    .iter()
                    .filter_map(|c| state.fields.get(c).map(|v| (c.clone(), v.clone())))
                    .collect()
            };
            debug!(table = model.table(), "insert");
            let ids = ctx
                .driver
                .insert(model.table(), &data, model.id())
                .await
                .map_err(|e| ModelError::from_driver(e, model.table()))?;

            {
                let mut state = self.inner.state.write();
                state.fields.extend(ids);
                state.is_new = false;
                state.changes.retain(|c| model.extension_of(c).is_some());
            }

            if self.has_id() && model.options().cache.is_enabled() {
                let key = model.identity_key(&self.id());
                if self.assign_uid(key.clone()) {
                    ctx.identity_map.adopt(&key, self, model.options().cache.ttl());
                }
            }
        } else {
            let (changes, conditions) = {
                let state = self.inner.state.read();
                let changes: Row = state
                    .changes
                    .iter()
                    .filter(|c| model.is_column(c))
                    .filter_map(|c| state.fields.get(c).map(|v| (c.clone(), v.clone())))
                    .collect();
                (changes, self.id_conditions())
            };
            if !changes.is_empty() {
                debug!(table = model.table(), columns = changes.len(), "update");
                ctx.driver
                    .update(model.table(), &changes, &conditions)
                    .await
                    .map_err(|e| ModelError::from_driver(e, model.table()))?;
            }
            self.inner
                .state
                .write()
                .changes
                .retain(|c| model.extension_of(c).is_some());
        }

        self.save_associations().await?;
        self.inner.state.write().changes.clear();

        if was_new {
            hooks.wait(Hook::AfterCreate, self).await?;
        }
        hooks.wait(Hook::AfterSave, self).await?;
        Ok(())
    }

    /// Resolve One association data given at construction into foreign keys.
    async fn link_pending_one(&self) -> ModelResult<()> {
        let model = self.model().clone();
        let pending: Vec<(String, Value)> = {
            let mut state = self.inner.state.write();
            let (one, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending_associations)
                .into_iter()
                .partition(|(name, _)| model.one_association(name).is_some());
            state.pending_associations = rest;
            one
        };

        for (name, value) in pending {
            let accessor = self.one(&name)?;
            match value {
                Value::Object(row) => {
                    let target = accessor.target()?;
                    let related = target.build(row).await?;
                    accessor.set(&related).await?;
                }
                Value::Null => accessor.remove()?,
                scalar => accessor.set_key(vec![scalar])?,
            }
        }
        Ok(())
    }

    async fn save_associations(&self) -> ModelResult<()> {
        let model = self.model().clone();

        for assoc in model.extend_associations() {
            let pending = self
                .inner
                .state
                .write()
                .pending_extension
                .remove(&assoc.name);
            let accessor = self.extension(&assoc.name)?;

            match (self.association_state(&assoc.name), pending) {
                (AssociationState::Fetched(AssociationValue::Extend(Some(ext))), pending) => {
                    for (key, value) in pending.unwrap_or_default() {
                        ext.set(&key, value)?;
                    }
                    if ext.is_dirty() {
                        ext.save().await?;
                    }
                }
                (_, Some(pending)) => match accessor.get().await? {
                    Some(ext) => {
                        for (key, value) in pending {
                            ext.set(&key, value)?;
                        }
                        ext.save().await?;
                    }
                    None => {
                        accessor.set(pending).await?;
                    }
                },
                (_, None) => {}
            }
        }

        let staged = std::mem::take(&mut self.inner.state.write().staged);
        for (name, items) in staged {
            let accessor = self.many(&name)?;
            for (item, props) in items {
                accessor.add_with_props(&item, props).await?;
            }
        }

        let pending = std::mem::take(&mut self.inner.state.write().pending_associations);
        for (name, value) in pending {
            if let Some(assoc) = model.many_association(&name) {
                let target = model.resolve(&assoc.target)?;
                let mut items = Vec::new();
                for entry in as_list(value) {
                    if let Value::Object(row) = entry {
                        items.push(target.build(row).await?);
                    }
                }
                self.many(&name)?.add(&items).await?;
            } else if model.extend_association(&name).is_some() {
                if let Value::Object(row) = value {
                    self.extension(&name)?.set(row).await?;
                }
            }
        }

        Ok(())
    }

    /// Delete the row, its extension rows and (with cascade) its join rows.
    pub fn remove(&self) -> BoxFuture<'static, ModelResult<()>> {
        let this = self.clone();
        async move { this.remove_inner().await }.boxed()
    }

    async fn remove_inner(&self) -> ModelResult<()> {
        if self.is_new() {
            return Ok(());
        }

        let model = self.model().clone();
        let ctx = model.context()?;
        let hooks = model.hooks();
        let ids = self.id();

        hooks.wait(Hook::BeforeRemove, self).await?;

        for assoc in model.extend_associations() {
            let conditions = assoc.field.iter().cloned().zip(ids.iter().cloned()).collect();
            ctx.driver
                .remove(&assoc.table, &conditions)
                .await
                .map_err(|e| ModelError::from_driver(e, &assoc.table))?;
            ctx.identity_map
                .evict(&identity_key(model.driver_uid(), &assoc.table, &ids));
            self.set_association(&assoc.name, AssociationState::Fetched(AssociationValue::Extend(None)));
        }

        if self.cascade_remove() {
            for assoc in model.many_associations() {
                let conditions = assoc.merge_id.iter().cloned().zip(ids.iter().cloned()).collect();
                ctx.driver
                    .remove(&assoc.merge_table, &conditions)
                    .await
                    .map_err(|e| ModelError::from_driver(e, &assoc.merge_table))?;
            }
        }

        debug!(table = model.table(), "remove");
        ctx.driver
            .remove(model.table(), &self.id_conditions())
            .await
            .map_err(|e| ModelError::from_driver(e, model.table()))?;

        let key = self
            .uid()
            .map(str::to_string)
            .unwrap_or_else(|| model.identity_key(&ids));
        ctx.identity_map.evict(&key);

        hooks.wait(Hook::AfterRemove, self).await?;
        Ok(())
    }

    /// Run every validator and collect all failures.
    pub async fn validate(&self) -> Result<(), ValidationErrors> {
        self.check_validations(true).await
    }

    async fn check_validations(&self, all: bool) -> Result<(), ValidationErrors> {
        let model = self.model().clone();
        let mut errors = ValidationErrors::new();

        for (property, validators) in model.validations() {
            // Unloaded columns of a persisted row are not re-checked.
            let value = match self.get(property) {
                Some(value) => value,
                None if !self.is_new() && model.is_deferred(property, self.is_shell()) => continue,
                None => Value::Null,
            };

            let ctx = ValidationContext {
                property,
                instance: self,
            };
            for validator in validators {
                if let Err(message) = validator.validate(&value, &ctx).await {
                    errors.push(ValidationError {
                        property: property.clone(),
                        value: value.clone(),
                        message,
                        rule: validator.rule_name().to_string(),
                    });
                    if !all {
                        return Err(errors);
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Value of `name`, fetching the single column on first access when it
    /// was not part of the initial load.
    pub async fn load(&self, name: &str) -> ModelResult<Value> {
        if let Some(value) = self.get(name) {
            return Ok(value);
        }

        let model = self.model().clone();
        if !model.is_column(name) {
            return Err(ModelError::not_defined(model.table(), name));
        }
        if self.is_new() {
            return Ok(Value::Null);
        }

        let ctx = model.context()?;
        debug!(table = model.table(), property = name, "lazy load");
        let rows = ctx
            .driver
            .find(
                &[name.to_string()],
                model.table(),
                &self.id_conditions(),
                &QueryOptions::limit(1),
            )
            .await
            .map_err(|e| ModelError::from_driver(e, model.table()))?;

        let value = match rows.into_iter().next() {
            Some(mut row) => row.remove(name).unwrap_or(Value::Null),
            None => {
                warn!(table = model.table(), property = name, "row vanished before lazy load");
                Value::Null
            }
        };

        let mut state = self.inner.state.write();
        Ok(state
            .fields
            .entry(name.to_string())
            .or_insert(value)
            .clone())
    }
}

fn as_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        single => vec![single],
    }
}
