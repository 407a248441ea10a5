//! Schema declarations
//!
//! A [`ModelSchema`] is the declarative input of [`Orm::define`]: table name,
//! id columns, raw property declarations, validators, hooks, associations and
//! per-model settings overrides. Nothing is normalized here; the model factory
//! does that when the schema is defined.
//!
//! [`Orm::define`]: crate::database::Orm::define

pub mod property;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ModelError, ModelResult};
use crate::hooks::{Hook, HookHandler};
use crate::relationships::{ExtendAssociation, ManyAssociation, OneAssociation};
use crate::settings::CachePolicy;
use crate::validation::{SharedValidator, Validator};

pub use property::{
    normalize, CustomType, Property, PropertyClass, PropertyDecl, PropertyOptions, PropertyType,
};

/// Builder for one model definition.
#[derive(Clone, Default)]
pub struct ModelSchema {
    pub(crate) table: String,
    pub(crate) id: Vec<String>,
    pub(crate) properties: Vec<(String, PropertyDecl)>,
    pub(crate) validations: Vec<(String, Vec<SharedValidator>)>,
    pub(crate) one: Vec<OneAssociation>,
    pub(crate) many: Vec<ManyAssociation>,
    pub(crate) extend: Vec<ExtendAssociation>,
    pub(crate) hooks: Vec<(Hook, Arc<dyn HookHandler>)>,
    pub(crate) cache: Option<CachePolicy>,
    pub(crate) auto_fetch: Option<bool>,
    pub(crate) auto_fetch_limit: Option<u32>,
    pub(crate) cascade_remove: Option<bool>,
    pub(crate) indexes: Vec<String>,
    pub(crate) extension: bool,
}

impl ModelSchema {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Id columns, in key order. Defaults to the configured primary key.
    pub fn id<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.id = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Declare a property; redeclaring a name replaces it in place.
    pub fn property(mut self, name: impl Into<String>, decl: impl Into<PropertyDecl>) -> Self {
        let name = name.into();
        let decl = decl.into();
        match self.properties.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = decl,
            None => self.properties.push((name, decl)),
        }
        self
    }

    /// Declare properties from a JSON object of `name: declaration` pairs.
    pub fn properties_from_json(mut self, value: &Value) -> ModelResult<Self> {
        let Value::Object(map) = value else {
            return Err(ModelError::Schema(format!(
                "properties of '{}' must be an object",
                self.table
            )));
        };
        for (name, raw) in map {
            let decl: PropertyDecl = serde_json::from_value(raw.clone()).map_err(|e| {
                ModelError::Schema(format!("property '{name}' of '{}': {e}", self.table))
            })?;
            self = self.property(name.clone(), decl);
        }
        Ok(self)
    }

    /// Append a validator for `property`; validators run in declaration order.
    pub fn validation(self, property: impl Into<String>, validator: impl Validator + 'static) -> Self {
        self.validations(property, vec![Arc::new(validator) as SharedValidator])
    }

    pub fn validations(mut self, property: impl Into<String>, validators: Vec<SharedValidator>) -> Self {
        let property = property.into();
        match self.validations.iter_mut().find(|(p, _)| *p == property) {
            Some((_, list)) => list.extend(validators),
            None => self.validations.push((property, validators)),
        }
        self
    }

    pub fn has_one(mut self, association: OneAssociation) -> Self {
        self.one.push(association);
        self
    }

    pub fn has_many(mut self, association: ManyAssociation) -> Self {
        self.many.push(association);
        self
    }

    pub fn extend_to(mut self, association: ExtendAssociation) -> Self {
        self.extend.push(association);
        self
    }

    /// Register `handler` for `hook`, replacing any earlier one.
    pub fn hook(mut self, hook: Hook, handler: impl HookHandler + 'static) -> Self {
        self.hooks.retain(|(h, _)| *h != hook);
        self.hooks.push((hook, Arc::new(handler)));
        self
    }

    pub fn cache(mut self, cache: impl Into<CachePolicy>) -> Self {
        self.cache = Some(cache.into());
        self
    }

    pub fn auto_fetch(mut self, enabled: bool) -> Self {
        self.auto_fetch = Some(enabled);
        self
    }

    pub fn auto_fetch_limit(mut self, limit: u32) -> Self {
        self.auto_fetch_limit = Some(limit);
        self
    }

    pub fn cascade_remove(mut self, enabled: bool) -> Self {
        self.cascade_remove = Some(enabled);
        self
    }

    pub fn index(mut self, column: impl Into<String>) -> Self {
        self.indexes.push(column.into());
        self
    }

    /// Mark the schema as the satellite table of an Extend association.
    pub(crate) fn extension(mut self) -> Self {
        self.extension = true;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl fmt::Debug for ModelSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let validations: Vec<(&str, usize)> = self
            .validations
            .iter()
            .map(|(p, v)| (p.as_str(), v.len()))
            .collect();
        let hooks: Vec<&str> = self.hooks.iter().map(|(h, _)| h.name()).collect();
        f.debug_struct("ModelSchema")
            .field("table", &self.table)
            .field("id", &self.id)
            .field("properties", &self.properties)
            .field("validations", &validations)
            .field("one", &self.one)
            .field("many", &self.many)
            .field("extend", &self.extend)
            .field("hooks", &hooks)
            .field("extension", &self.extension)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validators;
    use serde_json::json;

    #[test]
    fn test_redeclared_property_keeps_position() {
        let schema = ModelSchema::new("person")
            .property("name", "text")
            .property("age", "integer")
            .property("name", PropertyDecl::text().required());

        assert_eq!(schema.properties.len(), 2);
        assert_eq!(schema.properties[0].0, "name");
        assert_eq!(schema.properties[0].1, PropertyDecl::text().required());
    }

    #[test]
    fn test_properties_from_json() {
        let schema = ModelSchema::new("person")
            .properties_from_json(&json!({
                "name": "text",
                "mood": ["happy", "sad"],
                "age": { "type": "integer", "required": true }
            }))
            .unwrap();

        assert_eq!(schema.properties.len(), 3);
        assert!(ModelSchema::new("x")
            .properties_from_json(&json!(["name"]))
            .is_err());
    }

    #[test]
    fn test_validations_accumulate_per_property() {
        let schema = ModelSchema::new("person")
            .validation("age", validators::range(Some(0.0), None))
            .validation("age", validators::range(None, Some(150.0)))
            .validation("name", validators::length(Some(1), None));

        assert_eq!(schema.validations.len(), 2);
        assert_eq!(schema.validations[0].1.len(), 2);
    }

    #[test]
    fn test_hook_replaces_previous_handler() {
        let schema = ModelSchema::new("person")
            .hook(Hook::BeforeSave, |_i: crate::instance::Instance| async {
                Ok::<(), crate::hook_error::HookError>(())
            })
            .hook(Hook::BeforeSave, |_i: crate::instance::Instance| async {
                Ok::<(), crate::hook_error::HookError>(())
            });

        assert_eq!(schema.hooks.len(), 1);
    }
}
