//! Many associations through a join table
//!
//! Join rows hold the owner's ids under `merge_id` and the related row's ids
//! under `merge_assoc_id`, plus any extra association properties. `add`,
//! `set` and `remove` write join rows immediately; `stage` defers them to the
//! owner's next save.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use super::{AssociationState, AssociationValue};
use crate::backends::{Conditions, OrderBy, QueryOptions, Row};
use crate::error::{ModelError, ModelResult};
use crate::identity_map::Ancestry;
use crate::instance::Instance;
use crate::model::{FindOptions, Model};
use crate::query::standardize_order;
use crate::schema::{normalize, CustomType, Property, PropertyDecl};
use crate::settings::PropertySettings;

#[derive(Debug, Clone, PartialEq)]
pub struct ManyAssociation {
    pub name: String,
    /// Table of the target model
    pub target: String,
    pub merge_table: String,
    pub merge_id: Vec<String>,
    pub merge_assoc_id: Vec<String>,
    /// Extra join-row columns as declared
    pub props: Vec<(String, PropertyDecl)>,
    /// Normalized `props`
    pub properties: Vec<Property>,
    pub auto_fetch: bool,
    /// Depth for this association, overriding the model's limit
    pub auto_fetch_limit: Option<u32>,
}

impl ManyAssociation {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            merge_table: String::new(),
            merge_id: Vec::new(),
            merge_assoc_id: Vec::new(),
            props: Vec::new(),
            properties: Vec::new(),
            auto_fetch: false,
            auto_fetch_limit: None,
        }
    }

    pub fn merge_table(mut self, table: impl Into<String>) -> Self {
        self.merge_table = table.into();
        self
    }

    pub fn merge_id<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.merge_id = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn merge_assoc_id<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.merge_assoc_id = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Declare an extra column on the join rows.
    pub fn prop(mut self, name: impl Into<String>, decl: impl Into<PropertyDecl>) -> Self {
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
        target_ids: &[String],
        custom_types: &HashMap<String, CustomType>,
        settings: &PropertySettings,
    ) -> ModelResult<()> {
        if self.merge_table.is_empty() {
            self.merge_table = format!("{}_{}", owner_table, self.name);
        }
        if self.merge_id.is_empty() {
            self.merge_id = owner_ids
                .iter()
                .map(|id| format!("{owner_table}_{id}"))
                .collect();
        }
        if self.merge_assoc_id.is_empty() {
            self.merge_assoc_id = target_ids
                .iter()
                .map(|id| format!("{}_{}", self.name, id))
                .collect();
        }
        self.properties = self
            .props
            .iter()
            .map(|(name, decl)| normalize(name, decl, custom_types, settings))
            .collect::<ModelResult<_>>()?;
        Ok(())
    }
}

/// Filter, order and limit for [`ManyAccessor::get_with`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManyQuery {
    pub conditions: Conditions,
    pub order: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl ManyQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_(mut self, conditions: Row) -> Self {
        self.conditions.extend(conditions);
        self
    }

    /// Order shorthand; a leading `-` sorts descending.
    pub fn order(mut self, spec: &str) -> Self {
        self.order.extend(standardize_order(&[spec]));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn is_unfiltered(&self) -> bool {
        self == &ManyQuery::default()
    }
}

pub struct ManyAccessor<'a> {
    instance: &'a Instance,
    assoc: &'a ManyAssociation,
}

impl<'a> ManyAccessor<'a> {
    pub(crate) fn new(instance: &'a Instance, assoc: &'a ManyAssociation) -> Self {
        Self { instance, assoc }
    }

    pub fn association(&self) -> &ManyAssociation {
        self.assoc
    }

    pub fn target(&self) -> ModelResult<Model> {
        self.instance.model().resolve(&self.assoc.target)
    }

    fn owner_conditions(&self) -> Conditions {
        self.assoc
            .merge_id
            .iter()
            .cloned()
            .zip(self.instance.id())
            .collect()
    }

    fn link_conditions(&self, related: &Instance) -> Conditions {
        let mut conditions = self.owner_conditions();
        conditions.extend(self.assoc.merge_assoc_id.iter().cloned().zip(related.id()));
        conditions
    }

    fn merge_error(&self, err: crate::error::DriverError) -> ModelError {
        ModelError::from_driver(err, &self.assoc.merge_table)
    }

    /// Id tuples of the linked rows.
    async fn linked_ids(&self) -> ModelResult<Vec<Vec<Value>>> {
        let ctx = self.instance.model().context()?;
        let rows = ctx
            .driver
            .find(
                &self.assoc.merge_assoc_id,
                &self.assoc.merge_table,
                &self.owner_conditions(),
                &QueryOptions::default(),
            )
            .await
            .map_err(|e| self.merge_error(e))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                self.assoc
                    .merge_assoc_id
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect())
    }

    /// All linked instances; cached after the first unfiltered fetch.
    pub async fn get(&self) -> ModelResult<Vec<Instance>> {
        self.get_with(ManyQuery::default()).await
    }

    pub async fn get_with(&self, query: ManyQuery) -> ModelResult<Vec<Instance>> {
        if query.is_unfiltered() {
            if let AssociationState::Fetched(AssociationValue::Many(items)) =
                self.instance.association_state(&self.assoc.name)
            {
                return Ok(items);
            }
        }
        self.fetch(query, FindOptions::default(), Ancestry::default())
            .await
    }

    pub(crate) async fn fetch(
        &self,
        query: ManyQuery,
        options: FindOptions,
        ancestry: Ancestry,
    ) -> ModelResult<Vec<Instance>> {
        if self.instance.is_new() {
            return Ok(Vec::new());
        }

        let cache_result = query.is_unfiltered();
        if cache_result {
            self.instance.mark_fetching(&self.assoc.name);
        }

        let linked = self.linked_ids().await?;
        let items = if linked.is_empty() {
            Vec::new()
        } else {
            let target = self.target()?;
            let options = FindOptions {
                order: query.order.clone(),
                limit: query.limit,
                ..options
            };

            if let [id_column] = target.id() {
                let mut conditions = query.conditions.clone();
                let ids: Vec<Value> = linked.into_iter().filter_map(|mut t| t.pop()).collect();
                conditions.insert(id_column.clone(), Value::Array(ids));
                target
                    .chain(conditions, options)
                    .with_ancestry(ancestry)
                    .run()
                    .await?
            } else {
                let mut items = Vec::new();
                for tuple in linked {
                    let mut conditions = query.conditions.clone();
                    conditions.extend(target.id().iter().cloned().zip(tuple));
                    let found = target
                        .chain(conditions, options.clone())
                        .with_ancestry(ancestry.clone())
                        .first()
                        .await?;
                    items.extend(found);
                }
                if let Some(limit) = query.limit {
                    items.truncate(limit);
                }
                items
            }
        };

        if cache_result {
            self.store(items.clone());
        }
        Ok(items)
    }

    fn store(&self, items: Vec<Instance>) {
        self.instance.set_association(
            &self.assoc.name,
            AssociationState::Fetched(AssociationValue::Many(items)),
        );
    }

    fn update_cache(&self, update: impl FnOnce(&mut Vec<Instance>)) {
        if let AssociationState::Fetched(AssociationValue::Many(mut items)) =
            self.instance.association_state(&self.assoc.name)
        {
            update(&mut items);
            self.store(items);
        }
    }

    async fn prepare(&self, items: &[Instance]) -> ModelResult<()> {
        if self.instance.is_new() {
            self.instance.save().await?;
        }
        for item in items {
            if item.is_new() {
                item.save().await?;
            }
        }
        Ok(())
    }

    /// Link `items` now, saving the owner and any new item first.
    pub async fn add(&self, items: &[Instance]) -> ModelResult<()> {
        for item in items {
            self.add_with_props(item, Row::new()).await?;
        }
        Ok(())
    }

    /// Link one item with extra join-row values.
    pub async fn add_with_props(&self, item: &Instance, props: Row) -> ModelResult<()> {
        self.prepare(std::slice::from_ref(item)).await?;

        for key in props.keys() {
            if !self.assoc.properties.iter().any(|p| &p.name == key) {
                return Err(ModelError::not_defined(&self.assoc.merge_table, key));
            }
        }

        let mut row = self.link_conditions(item);
        row.extend(props);

        let ctx = self.instance.model().context()?;
        debug!(table = %self.assoc.merge_table, "link");
        ctx.driver
            .insert(&self.assoc.merge_table, &row, &[])
            .await
            .map_err(|e| self.merge_error(e))?;

        self.update_cache(|cached| {
            if !cached.iter().any(|c| c.ptr_eq(item)) {
                cached.push(item.clone());
            }
        });
        Ok(())
    }

    /// Queue `items` to be linked on the owner's next save.
    pub fn stage(&self, items: &[Instance]) {
        let mut state = self.instance.inner_state().write();
        state
            .staged
            .entry(self.assoc.name.clone())
            .or_default()
            .extend(items.iter().map(|i| (i.clone(), Row::new())));
    }

    /// Replace every link with `items`.
    pub async fn set(&self, items: &[Instance]) -> ModelResult<()> {
        self.prepare(items).await?;
        self.remove(&[]).await?;
        self.store(Vec::new());
        self.add(items).await
    }

    /// Whether every one of `items` is linked; with no items, whether any
    /// link exists. Related rows are never materialized.
    pub async fn has(&self, items: &[Instance]) -> ModelResult<bool> {
        if self.instance.is_new() {
            return Ok(false);
        }
        let ctx = self.instance.model().context()?;

        if items.is_empty() {
            let count = ctx
                .driver
                .count(&self.assoc.merge_table, &self.owner_conditions())
                .await
                .map_err(|e| self.merge_error(e))?;
            return Ok(count > 0);
        }

        for item in items {
            if item.is_new() {
                return Ok(false);
            }
            let count = ctx
                .driver
                .count(&self.assoc.merge_table, &self.link_conditions(item))
                .await
                .map_err(|e| self.merge_error(e))?;
            if count == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Unlink `items`; with no items, unlink everything.
    pub async fn remove(&self, items: &[Instance]) -> ModelResult<()> {
        if self.instance.is_new() {
            return Ok(());
        }
        let ctx = self.instance.model().context()?;

        if items.is_empty() {
            ctx.driver
                .remove(&self.assoc.merge_table, &self.owner_conditions())
                .await
                .map_err(|e| self.merge_error(e))?;
            self.update_cache(Vec::clear);
            return Ok(());
        }

        for item in items {
            ctx.driver
                .remove(&self.assoc.merge_table, &self.link_conditions(item))
                .await
                .map_err(|e| self.merge_error(e))?;
        }
        self.update_cache(|cached| cached.retain(|c| !items.iter().any(|i| i.ptr_eq(c))));
        Ok(())
    }
}

/// Auto-fetch step for one association during construction.
pub(crate) async fn auto_fetch(
    instance: &Instance,
    assoc: &ManyAssociation,
    limit: u32,
    ancestry: &Ancestry,
) -> ModelResult<()> {
    debug!(table = instance.model().table(), association = %assoc.name, "auto-fetch many");
    let accessor = ManyAccessor::new(instance, assoc);
    let options = FindOptions {
        auto_fetch: Some(limit > 1),
        auto_fetch_limit: Some(limit.saturating_sub(1)),
        ..Default::default()
    };

    match accessor.fetch(ManyQuery::default(), options, ancestry.clone()).await {
        Ok(_) => Ok(()),
        Err(err) => {
            instance.set_association(&assoc.name, AssociationState::Unfetched);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::OrderDirection;

    #[test]
    fn test_default_merge_columns() {
        let mut assoc = ManyAssociation::new("pets", "animal");
        assoc
            .resolve(
                "person",
                &["id".to_string()],
                &["id".to_string()],
                &HashMap::new(),
                &PropertySettings::default(),
            )
            .unwrap();

        assert_eq!(assoc.merge_table, "person_pets");
        assert_eq!(assoc.merge_id, vec!["person_id"]);
        assert_eq!(assoc.merge_assoc_id, vec!["pets_id"]);
    }

    #[test]
    fn test_join_props_are_normalized() {
        let mut assoc = ManyAssociation::new("friends", "person").prop("since", "date");
        assoc
            .resolve(
                "person",
                &["id".to_string()],
                &["id".to_string()],
                &HashMap::new(),
                &PropertySettings::default(),
            )
            .unwrap();

        assert_eq!(assoc.properties.len(), 1);
        assert_eq!(assoc.properties[0].name, "since");
    }

    #[test]
    fn test_query_builder() {
        let query = ManyQuery::new().order("-name").limit(3);

        assert_eq!(query.order[0].column, "name");
        assert_eq!(query.order[0].direction, OrderDirection::Desc);
        assert!(!query.is_unfiltered());
        assert!(ManyQuery::new().is_unfiltered());
    }
}
