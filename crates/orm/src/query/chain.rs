//! Deferred multi-row find
//!
//! A [`ChainFind`] holds a find until it is awaited or `run`. It can be refined
//! and re-run; every run queries the driver, sharing the round-trip with an
//! identical find already in flight, and routes each row through the identity
//! map.

use std::future::IntoFuture;
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture, FutureExt};
use tracing::debug;

use crate::backends::{Conditions, OrderBy, QueryOptions, Row};
use crate::error::{ModelError, ModelResult};
use crate::identity_map::Ancestry;
use crate::instance::Instance;
use crate::model::{FindOptions, Model};
use crate::query::dedup::QueryKey;
use crate::query::{check_conditions, standardize_order};

#[derive(Debug, Clone)]
pub struct ChainFind {
    model: Model,
    conditions: Conditions,
    options: FindOptions,
    ancestry: Ancestry,
}

impl ChainFind {
    pub(crate) fn new(model: Model, conditions: Conditions, options: FindOptions) -> Self {
        Self {
            model,
            conditions,
            options,
            ancestry: Ancestry::default(),
        }
    }

    /// Add conditions; later keys replace earlier ones.
    pub fn where_(mut self, conditions: Row) -> Self {
        let conditions = check_conditions(&self.model, conditions);
        self.conditions.extend(conditions);
        self
    }

    /// Append order tokens, e.g. `"-name"` or `"name Z"`.
    pub fn order(mut self, spec: &str) -> Self {
        let tokens: Vec<&str> = spec.split_whitespace().collect();
        self.options.order.extend(standardize_order(&tokens));
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.options.order.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.options.offset = Some(offset);
        self
    }

    /// Fetch only these columns (ids are always fetched).
    pub fn only<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.only = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub(crate) fn with_ancestry(mut self, ancestry: Ancestry) -> Self {
        self.ancestry = ancestry;
        self
    }

    pub fn conditions(&self) -> &Conditions {
        &self.conditions
    }

    pub fn options(&self) -> &FindOptions {
        &self.options
    }

    fn fields(&self) -> Vec<String> {
        match &self.options.only {
            Some(only) => {
                let mut fields = self.model.id().to_vec();
                for column in only.iter().chain(&self.options.extra) {
                    if !fields.contains(column) {
                        fields.push(column.clone());
                    }
                }
                fields
            }
            None if self.options.extra.is_empty() => self.model.fetch_fields().to_vec(),
            // Extra columns are not part of the schema; fetch every column.
            None => Vec::new(),
        }
    }

    /// Execute the find; instances come back in driver order.
    pub async fn run(&self) -> ModelResult<Vec<Instance>> {
        let ctx = self.model.context()?;
        let table = self.model.table();
        let query = QueryOptions {
            limit: self.options.limit,
            offset: self.options.offset,
            order: self.options.order.clone(),
        };

        let fields = self.fields();
        let key = QueryKey::find(table, &fields, &self.conditions, &query);
        let driver = Arc::clone(&ctx.driver);
        let owned_table = table.to_string();
        let conditions = self.conditions.clone();
        let fetch = async move {
            debug!(table = %owned_table, conditions = conditions.len(), "find");
            driver
                .find(&fields, &owned_table, &conditions, &query)
                .await
                .map_err(|e| ModelError::from_driver(e, &owned_table))
        }
        .boxed();
        let rows = ctx.queries.execute(key, fetch).await?;

        try_join_all(
            rows.iter()
                .map(|row| self.model.materialize(row.clone(), &self.options, &self.ancestry)),
        )
        .await
    }

    /// Count the matching rows without materializing them.
    pub async fn count(&self) -> ModelResult<u64> {
        let ctx = self.model.context()?;
        ctx.driver
            .count(self.model.table(), &self.conditions)
            .await
            .map_err(|e| ModelError::from_driver(e, self.model.table()))
    }

    pub async fn first(&self) -> ModelResult<Option<Instance>> {
        let found = self.clone().limit(1).run().await?;
        Ok(found.into_iter().next())
    }
}

impl IntoFuture for ChainFind {
    type Output = ModelResult<Vec<Instance>>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.run().await }.boxed()
    }
}
