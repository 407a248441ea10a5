//! Query methods - keyed lookups, finds, counts and aggregates

use futures::future::FutureExt;
use serde_json::Value;
use tracing::debug;

use super::{FindArg, FindOptions, GetOptions, InstanceOptions, Model};
use crate::backends::{Conditions, QueryOptions, Row};
use crate::error::{ModelError, ModelResult};
use crate::identity_map::{Ancestry, LookupOptions};
use crate::instance::Instance;
use crate::model::ExistsQuery;
use crate::query::{check_conditions, standardize_order, AggregateBuilder, ChainFind};

impl Model {
    /// Fetch the row with the given id values.
    ///
    /// With caching on, every call for the same ids yields the same live
    /// instance, and concurrent calls share one driver fetch.
    pub async fn get<I, V>(&self, ids: I) -> ModelResult<Instance>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.get_with(ids, GetOptions::default()).await
    }

    pub async fn get_with<I, V>(&self, ids: I, options: GetOptions) -> ModelResult<Instance>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let ids = ids.into_iter().map(Into::into).collect();
        self.get_inner(ids, options, Ancestry::default()).await
    }

    pub(crate) async fn get_inner(
        &self,
        ids: Vec<Value>,
        options: GetOptions,
        ancestry: Ancestry,
    ) -> ModelResult<Instance> {
        self.check_key_count(ids.len())?;
        let ctx = self.context()?;

        let defaults = self.options();
        let auto_fetch_limit = options.auto_fetch_limit.unwrap_or(defaults.auto_fetch_limit);
        let key = self.identity_key(&ids);
        let instance_options = InstanceOptions {
            uid: Some(key.clone()),
            is_new: false,
            is_shell: false,
            auto_fetch: auto_fetch_limit > 0 && options.auto_fetch.unwrap_or(defaults.auto_fetch),
            auto_fetch_limit,
            cascade_remove: options.cascade_remove.unwrap_or(defaults.cascade_remove),
            extra: Vec::new(),
            ancestry: ancestry.clone(),
        };
        let lookup = LookupOptions {
            cache: options.cache.unwrap_or(defaults.cache),
            save_check: defaults.cache_save_check,
            ancestry,
        };

        let model = self.clone();
        let conditions: Conditions = self.id().iter().cloned().zip(ids).collect();
        let build = async move {
            let ctx = model.context()?;
            debug!(table = model.table(), "get");
            let mut rows = ctx
                .driver
                .find(
                    model.fetch_fields(),
                    model.table(),
                    &conditions,
                    &QueryOptions::limit(1),
                )
                .await
                .map_err(|e| ModelError::from_driver(e, model.table()))?;
            if rows.is_empty() {
                return Err(ModelError::not_found(model.table()));
            }
            let row = rows.swap_remove(0);
            model.create_instance(row, instance_options).await
        }
        .boxed();

        ctx.identity_map.get(&key, &lookup, build).await
    }

    /// Deferred find over `conditions`; await it (or call `run`) to execute.
    pub fn find(&self, conditions: Row) -> ChainFind {
        self.chain(conditions, FindOptions::default())
    }

    /// Deferred find over every row.
    pub fn all(&self) -> ChainFind {
        self.find(Row::new())
    }

    /// Deferred find with explicit options.
    pub fn chain(&self, conditions: Conditions, options: FindOptions) -> ChainFind {
        let conditions = check_conditions(self, conditions);
        ChainFind::new(self.clone(), conditions, options)
    }

    /// Find from positional arguments told apart by shape: a number is the
    /// limit, a list is the order, a string is an order shorthand, the first
    /// object is the conditions and a second object is the options.
    pub fn find_by<I>(&self, args: I) -> ModelResult<ChainFind>
    where
        I: IntoIterator<Item = FindArg>,
    {
        let mut conditions: Option<Row> = None;
        let mut options = FindOptions::default();
        let mut limit = None;
        let mut order = None;

        for arg in args {
            match arg {
                FindArg::Limit(n) => limit = Some(n),
                FindArg::Order(tokens) if tokens.is_empty() => {}
                FindArg::Order(tokens) => order = Some(standardize_order(&tokens)),
                FindArg::OrderShorthand(spec) => order = Some(standardize_order(&[spec])),
                FindArg::Object(object) if conditions.is_none() => conditions = Some(object),
                FindArg::Object(object) => options = FindOptions::from_row(&object)?,
                FindArg::Options(given) => options = given,
            }
        }

        if let Some(limit) = limit {
            options.limit = Some(limit);
        }
        if let Some(order) = order {
            options.order = order;
        }
        Ok(self.chain(conditions.unwrap_or_default(), options))
    }

    /// First row matching `conditions`, if any.
    pub async fn one(&self, conditions: Row) -> ModelResult<Option<Instance>> {
        self.find(conditions).first().await
    }

    pub async fn count(&self, conditions: Row) -> ModelResult<u64> {
        let ctx = self.context()?;
        let conditions = check_conditions(self, conditions);
        debug!(table = self.table(), "count");
        ctx.driver
            .count(self.table(), &conditions)
            .await
            .map_err(|e| ModelError::from_driver(e, self.table()))
    }

    /// Whether a row matches the id values or the condition map.
    pub async fn exists(&self, query: impl Into<ExistsQuery>) -> ModelResult<bool> {
        let conditions = match query.into() {
            ExistsQuery::Ids(ids) => {
                self.check_key_count(ids.len())?;
                self.id().iter().cloned().zip(ids).collect()
            }
            ExistsQuery::Conditions(conditions) => conditions,
        };
        Ok(self.count(conditions).await? > 0)
    }

    /// Aggregate builder over `conditions`; `properties` are the default
    /// columns of functions called without one.
    pub fn aggregate<I, S>(&self, conditions: Row, properties: I) -> AggregateBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let conditions = check_conditions(self, conditions);
        AggregateBuilder::new(
            self.clone(),
            conditions,
            properties.into_iter().map(Into::into).collect(),
        )
    }

    /// Route one fetched row through the identity map.
    pub(crate) async fn materialize(
        &self,
        row: Row,
        options: &FindOptions,
        ancestry: &Ancestry,
    ) -> ModelResult<Instance> {
        let defaults = self.options();
        let auto_fetch_limit = options.auto_fetch_limit.unwrap_or(defaults.auto_fetch_limit);
        let ids: Vec<Value> = self
            .id()
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        let keyed = ids.iter().all(|v| !v.is_null());
        let key = keyed.then(|| self.identity_key(&ids));

        let instance_options = InstanceOptions {
            uid: key.clone(),
            is_new: false,
            is_shell: false,
            auto_fetch: auto_fetch_limit > 0 && options.auto_fetch.unwrap_or(defaults.auto_fetch),
            auto_fetch_limit,
            cascade_remove: options.cascade_remove.unwrap_or(defaults.cascade_remove),
            extra: options.extra.clone(),
            ancestry: ancestry.clone(),
        };
        let build = self.create_instance(row, instance_options);

        match key {
            Some(key) => {
                let ctx = self.context()?;
                let lookup = LookupOptions {
                    cache: options.cache.unwrap_or(defaults.cache),
                    save_check: defaults.cache_save_check,
                    ancestry: ancestry.clone(),
                };
                ctx.identity_map.get(&key, &lookup, build).await
            }
            None => build.await,
        }
    }

    pub(crate) fn check_key_count(&self, given: usize) -> ModelResult<()> {
        if given == self.id().len() {
            Ok(())
        } else {
            Err(ModelError::ParamMismatch {
                model: self.table().to_string(),
                expected: self.id().len(),
                given,
            })
        }
    }
}
