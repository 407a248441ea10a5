//! Extend associations: a satellite table, keyed by the owner's ids, whose
//! columns read as properties of the owner.

use std::collections::HashMap;

use tracing::debug;

use super::{AssociationState, AssociationValue};
use crate::backends::{Conditions, Row};
use crate::error::{ModelError, ModelResult};
use crate::identity_map::Ancestry;
use crate::instance::Instance;
use crate::model::{identity_key, GetOptions, Model};
use crate::schema::{normalize, CustomType, ModelSchema, Property, PropertyClass, PropertyDecl, PropertyType};
use crate::settings::PropertySettings;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtendAssociation {
    pub name: String,
    /// Satellite table
    pub table: String,
    /// Satellite columns holding the owner's ids
    pub field: Vec<String>,
    pub props: Vec<(String, PropertyDecl)>,
    /// Normalized `props`, tagged [`PropertyClass::Extend`]
    pub properties: Vec<Property>,
    pub auto_fetch: bool,
    /// Depth for this association, overriding the model's limit
    pub auto_fetch_limit: Option<u32>,
}

impl ExtendAssociation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: String::new(),
            field: Vec::new(),
            props: Vec::new(),
            properties: Vec::new(),
            auto_fetch: false,
            auto_fetch_limit: None,
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn field<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn property(mut self, name: impl Into<String>, decl: impl Into<PropertyDecl>) -> Self {
        self.props.push((name.into(), decl.into()));
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

    pub(crate) fn resolve(
        &mut self,
        owner_table: &str,
        owner_ids: &[String],
        custom_types: &HashMap<String, CustomType>,
        settings: &PropertySettings,
    ) -> ModelResult<()> {
        if self.table.is_empty() {
            self.table = format!("{}_{}", owner_table, self.name);
        }
        if self.field.is_empty() {
            self.field = owner_ids
                .iter()
                .map(|id| format!("{owner_table}_{id}"))
                .collect();
        }
        if self.field.len() != owner_ids.len() {
            return Err(ModelError::Schema(format!(
                "extension '{}' needs {} key columns",
                self.name,
                owner_ids.len()
            )));
        }

        self.properties = self
            .props
            .iter()
            .map(|(name, decl)| {
                let mut property = normalize(name, decl, custom_types, settings)?;
                property.klass = PropertyClass::Extend;
                Ok(property)
            })
            .collect::<ModelResult<_>>()?;
        Ok(())
    }

    /// Schema of the satellite model, keyed like the owner.
    pub(crate) fn extension_schema(&self, owner_keys: &[Property]) -> ModelSchema {
        let mut schema = ModelSchema::new(&self.table).id(self.field.clone()).extension();
        for (column, key) in self.field.iter().zip(owner_keys) {
            let kind = match &key.kind {
                PropertyType::Serial => PropertyType::Integer,
                other => other.clone(),
            };
            schema = schema.property(column, PropertyDecl::from(kind).key());
        }
        for (name, decl) in &self.props {
            schema = schema.property(name, decl.clone());
        }
        schema
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.iter().any(|p| p.name == name)
    }
}

pub struct ExtendAccessor<'a> {
    instance: &'a Instance,
    assoc: &'a ExtendAssociation,
}

impl<'a> ExtendAccessor<'a> {
    pub(crate) fn new(instance: &'a Instance, assoc: &'a ExtendAssociation) -> Self {
        Self { instance, assoc }
    }

    pub fn association(&self) -> &ExtendAssociation {
        self.assoc
    }

    /// The satellite model.
    pub fn model(&self) -> ModelResult<Model> {
        self.instance.model().resolve(&self.assoc.table)
    }

    fn owner_conditions(&self) -> Conditions {
        self.assoc
            .field
            .iter()
            .cloned()
            .zip(self.instance.id())
            .collect()
    }

    /// The extension row as an instance, or `None` when there is none.
    pub async fn get(&self) -> ModelResult<Option<Instance>> {
        if let AssociationState::Fetched(AssociationValue::Extend(ext)) =
            self.instance.association_state(&self.assoc.name)
        {
            return Ok(ext);
        }
        self.fetch(GetOptions::default(), Ancestry::default()).await
    }

    pub(crate) async fn fetch(
        &self,
        options: GetOptions,
        ancestry: Ancestry,
    ) -> ModelResult<Option<Instance>> {
        if self.instance.is_new() {
            return Ok(None);
        }

        self.instance.mark_fetching(&self.assoc.name);
        let found = match self
            .model()?
            .get_inner(self.instance.id(), options, ancestry)
            .await
        {
            Ok(ext) => Some(ext),
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                self.instance
                    .set_association(&self.assoc.name, AssociationState::Unfetched);
                return Err(err);
            }
        };
        self.store(found.clone());
        Ok(found)
    }

    fn store(&self, ext: Option<Instance>) {
        self.instance.set_association(
            &self.assoc.name,
            AssociationState::Fetched(AssociationValue::Extend(ext)),
        );
    }

    /// Replace the extension row with `data`, saving the owner first when new.
    pub async fn set(&self, data: Row) -> ModelResult<Instance> {
        if self.instance.is_new() {
            self.instance.save().await?;
        }
        self.delete_row().await?;

        let model = self.model()?;
        let mut row = data;
        row.extend(self.owner_conditions());
        let ext = model.build_new(row).await?;
        ext.save().await?;

        self.store(Some(ext.clone()));
        Ok(ext)
    }

    pub async fn has(&self) -> ModelResult<bool> {
        if self.instance.is_new() {
            return Ok(false);
        }
        self.model()?.exists(self.instance.id()).await
    }

    /// Delete the extension row.
    pub async fn remove(&self) -> ModelResult<()> {
        if self.instance.is_new() {
            return Ok(());
        }
        self.delete_row().await?;
        self.store(None);
        Ok(())
    }

    async fn delete_row(&self) -> ModelResult<()> {
        let owner = self.instance.model();
        let ctx = owner.context()?;
        debug!(table = %self.assoc.table, "remove extension row");
        ctx.driver
            .remove(&self.assoc.table, &self.owner_conditions())
            .await
            .map_err(|e| ModelError::from_driver(e, &self.assoc.table))?;
        ctx.identity_map.evict(&identity_key(
            owner.driver_uid(),
            &self.assoc.table,
            &self.instance.id(),
        ));
        Ok(())
    }
}

/// Auto-fetch step for one association during construction.
pub(crate) async fn auto_fetch(
    instance: &Instance,
    assoc: &ExtendAssociation,
    limit: u32,
    ancestry: &Ancestry,
) -> ModelResult<()> {
    debug!(table = instance.model().table(), association = %assoc.name, "auto-fetch extend");
    let options = GetOptions::default()
        .auto_fetch(limit > 1)
        .auto_fetch_limit(limit.saturating_sub(1));
    ExtendAccessor::new(instance, assoc)
        .fetch(options, ancestry.clone())
        .await
        .map(|_| ())
}
