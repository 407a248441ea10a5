//! Model System - schema-bound instance factories
//!
//! A [`Model`] is compiled once from a [`ModelSchema`] and then shared (it is
//! a cheap handle). The work is split the same way as the public surface:
//!
//! - `lifecycle`: instance construction and the readiness join
//! - `query_methods`: get / find / one / count / exists / aggregate
//! - `crud_operations`: create / build / shell / clear / drop / sync / hooks

pub mod crud_operations;
pub mod lifecycle;
pub mod query_methods;

use std::fmt;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::info;

use crate::backends::{OrderBy, Row};
use crate::database::OrmContext;
use crate::error::{ModelError, ModelResult};
use crate::hooks::HookRegistry;
use crate::relationships::{
    CapabilityTable, ExtendAssociation, ManyAssociation, OneAssociation,
};
use crate::schema::{normalize, ModelSchema, Property};
use crate::settings::{CachePolicy, OrmSettings};
use crate::validation::{validators, SharedValidator};

pub use lifecycle::InstanceOptions;

/// Identity-map key of one row: `driver-uid/table/id1/id2/...`.
///
/// `%` and `/` inside string ids are percent-encoded so distinct composite
/// ids never share a key.
pub fn identity_key(driver_uid: &str, table: &str, ids: &[Value]) -> String {
    let mut key = format!("{driver_uid}/{table}");
    for id in ids {
        key.push('/');
        match id {
            Value::String(s) => {
                for c in s.chars() {
                    match c {
                        '%' => key.push_str("%25"),
                        '/' => key.push_str("%2F"),
                        c => key.push(c),
                    }
                }
            }
            other => key.push_str(&other.to_string()),
        }
    }
    key
}

/// Model-level instance behaviour after settings and schema overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOptions {
    pub cache: CachePolicy,
    pub cache_save_check: bool,
    pub auto_fetch: bool,
    pub auto_fetch_limit: u32,
    pub cascade_remove: bool,
    pub return_all_errors: bool,
}

impl ModelOptions {
    fn from_schema(settings: &OrmSettings, schema: &ModelSchema) -> Self {
        let defaults = &settings.instance;
        Self {
            cache: schema.cache.unwrap_or(defaults.cache),
            cache_save_check: defaults.cache_save_check,
            auto_fetch: schema.auto_fetch.unwrap_or(defaults.auto_fetch),
            auto_fetch_limit: schema.auto_fetch_limit.unwrap_or(defaults.auto_fetch_limit),
            cascade_remove: schema.cascade_remove.unwrap_or(defaults.cascade_remove),
            return_all_errors: defaults.return_all_errors,
        }
    }
}

/// Per-call overrides for [`Model::get_with`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetOptions {
    pub cache: Option<CachePolicy>,
    pub auto_fetch: Option<bool>,
    pub auto_fetch_limit: Option<u32>,
    pub cascade_remove: Option<bool>,
}

impl GetOptions {
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
}

/// Options of a multi-row find.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order: Vec<OrderBy>,
    /// Column subset to fetch; id columns are always added
    pub only: Option<Vec<String>>,
    pub cache: Option<CachePolicy>,
    pub auto_fetch: Option<bool>,
    pub auto_fetch_limit: Option<u32>,
    pub cascade_remove: Option<bool>,
    /// Extra columns kept on the instances although not in the schema
    pub extra: Vec<String>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    pub fn only<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = Some(columns.into_iter().map(Into::into).collect());
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

    pub fn extra<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Read options from a JSON object (`limit`, `offset`, `order`, `only`,
    /// `cache`, `autoFetch`, `autoFetchLimit`, `cascadeRemove`, `extra`).
    pub fn from_row(options: &Row) -> ModelResult<Self> {
        let mut out = FindOptions::default();
        for (key, value) in options {
            match key.as_str() {
                "limit" => out.limit = Some(as_usize(key, value)?),
                "offset" => out.offset = Some(as_usize(key, value)?),
                "order" => out.order = crate::query::standardize_order(&as_strings(key, value)?),
                "only" => out.only = Some(as_strings(key, value)?),
                "cache" => out.cache = Some(serde_json::from_value(value.clone())?),
                "autoFetch" | "auto_fetch" => out.auto_fetch = Some(as_bool(key, value)?),
                "autoFetchLimit" | "auto_fetch_limit" => {
                    out.auto_fetch_limit = Some(as_u32(key, value)?)
                }
                "cascadeRemove" | "cascade_remove" => {
                    out.cascade_remove = Some(as_bool(key, value)?)
                }
                "extra" => {
                    out.extra = match value {
                        Value::Object(map) => map.keys().cloned().collect(),
                        other => as_strings(key, other)?,
                    }
                }
                _ => tracing::warn!(option = %key, "ignoring unknown find option"),
            }
        }
        Ok(out)
    }
}

fn push_column(columns: &mut Vec<String>, name: &str) {
    if !columns.iter().any(|c| c == name) {
        columns.push(name.to_string());
    }
}

fn bad_option(key: &str, expected: &str) -> ModelError {
    ModelError::Query {
        message: format!("find option '{key}' must be {expected}"),
        original_code: None,
    }
}

fn as_usize(key: &str, value: &Value) -> ModelResult<usize> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| bad_option(key, "a non-negative integer"))
}

fn as_u32(key: &str, value: &Value) -> ModelResult<u32> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| bad_option(key, "an integer between 0 and 4294967295"))
}

fn as_bool(key: &str, value: &Value) -> ModelResult<bool> {
    value.as_bool().ok_or_else(|| bad_option(key, "a boolean"))
}

fn as_strings(key: &str, value: &Value) -> ModelResult<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| bad_option(key, "a list of strings")),
        _ => Err(bad_option(key, "a string or a list of strings")),
    }
}

/// One positional argument of [`Model::find_by`], told apart by its shape.
#[derive(Debug, Clone, PartialEq)]
pub enum FindArg {
    /// A number: row limit
    Limit(usize),
    /// A list: order tokens
    Order(Vec<String>),
    /// A string: order shorthand, `-column` for descending
    OrderShorthand(String),
    /// An object: conditions the first time, options the second time
    Object(Row),
    Options(FindOptions),
}

impl From<usize> for FindArg {
    fn from(limit: usize) -> Self {
        FindArg::Limit(limit)
    }
}

impl From<&str> for FindArg {
    fn from(order: &str) -> Self {
        FindArg::OrderShorthand(order.to_string())
    }
}

impl From<Vec<&str>> for FindArg {
    fn from(order: Vec<&str>) -> Self {
        FindArg::Order(order.into_iter().map(str::to_string).collect())
    }
}

impl From<Row> for FindArg {
    fn from(object: Row) -> Self {
        FindArg::Object(object)
    }
}

impl From<FindOptions> for FindArg {
    fn from(options: FindOptions) -> Self {
        FindArg::Options(options)
    }
}

impl TryFrom<Value> for FindArg {
    type Error = ModelError;

    fn try_from(value: Value) -> ModelResult<Self> {
        match value {
            Value::Number(n) => n
                .as_u64()
                .map(|n| FindArg::Limit(n as usize))
                .ok_or_else(|| bad_option("limit", "a non-negative integer")),
            Value::String(s) => Ok(FindArg::OrderShorthand(s)),
            Value::Array(_) => Ok(FindArg::Order(as_strings("order", &value)?)),
            Value::Object(map) => Ok(FindArg::Object(map)),
            other => Err(ModelError::Query {
                message: format!("unsupported find argument {other}"),
                original_code: None,
            }),
        }
    }
}

/// Argument of [`Model::exists`]: id values or a condition map.
#[derive(Debug, Clone, PartialEq)]
pub enum ExistsQuery {
    Ids(Vec<Value>),
    Conditions(Row),
}

impl From<Vec<Value>> for ExistsQuery {
    fn from(ids: Vec<Value>) -> Self {
        ExistsQuery::Ids(ids)
    }
}

impl From<Row> for ExistsQuery {
    fn from(conditions: Row) -> Self {
        ExistsQuery::Conditions(conditions)
    }
}

impl From<Value> for ExistsQuery {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => ExistsQuery::Conditions(map),
            Value::Array(ids) => ExistsQuery::Ids(ids),
            single => ExistsQuery::Ids(vec![single]),
        }
    }
}

pub(crate) struct ModelInner {
    table: String,
    id: Vec<String>,
    /// Declared properties, normalized
    properties: Vec<Property>,
    /// Declared properties plus implicit keys and extension properties
    all_properties: Vec<Property>,
    /// Every column stored on this table
    columns: Vec<String>,
    /// Columns selected by default: ids first, lazy columns left out
    fetch_fields: Vec<String>,
    lazy: Vec<String>,
    one: Vec<OneAssociation>,
    many: Vec<ManyAssociation>,
    extend: Vec<ExtendAssociation>,
    validations: Vec<(String, Vec<SharedValidator>)>,
    hooks: HookRegistry,
    capabilities: CapabilityTable,
    options: ModelOptions,
    indexes: Vec<String>,
    extension: bool,
    custom_types: Vec<String>,
    driver_uid: String,
    context: Weak<OrmContext>,
}

/// Compiled, schema-bound model. Clones share the same definition.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl Model {
    /// Normalize `schema` against the connection's settings and custom types.
    pub(crate) fn compile(schema: ModelSchema, ctx: &Arc<OrmContext>) -> ModelResult<Model> {
        let settings = &ctx.settings;
        let table = schema.table.clone();
        if table.is_empty() {
            return Err(ModelError::Schema("model needs a table name".to_string()));
        }

        let id = if schema.id.is_empty() {
            vec![settings.properties.primary_key.clone()]
        } else {
            schema.id.clone()
        };
        let custom_types = ctx.custom_types.read().clone();

        let mut properties = Vec::with_capacity(schema.properties.len());
        for (name, decl) in &schema.properties {
            let mut property = normalize(name, decl, &custom_types, &settings.properties)?;
            if id.contains(name) {
                property.key = true;
                if property.lazyload {
                    return Err(ModelError::Schema(format!(
                        "id column '{name}' of '{table}' cannot be lazy"
                    )));
                }
            }
            properties.push(property);
        }

        let mut all_properties = properties.clone();
        for column in &id {
            if !properties.iter().any(|p| &p.name == column) {
                all_properties.push(Property::implicit_key(column));
            }
        }

        let mut validations = schema.validations.clone();
        for property in properties.iter().filter(|p| p.required) {
            let required: SharedValidator = Arc::new(validators::required());
            match validations.iter_mut().find(|(p, _)| *p == property.name) {
                Some((_, list)) => list.insert(0, required),
                None => validations.push((property.name.clone(), vec![required])),
            }
        }

        let lazy: Vec<String> = properties
            .iter()
            .filter(|p| p.lazyload)
            .map(|p| p.name.clone())
            .collect();

        let mut columns: Vec<String> = id.clone();
        for property in &properties {
            push_column(&mut columns, &property.name);
        }

        let target_ids = |target: &str| -> Vec<String> {
            if target == table {
                id.clone()
            } else {
                ctx.registry
                    .get(target)
                    .map(|m| m.id().to_vec())
                    .unwrap_or_else(|| vec![settings.properties.primary_key.clone()])
            }
        };

        let mut one = schema.one.clone();
        for assoc in &mut one {
            assoc.resolve(&target_ids(&assoc.target));
            for field in &assoc.field {
                push_column(&mut columns, field);
            }
        }

        let mut many = schema.many.clone();
        for assoc in &mut many {
            let targets = target_ids(&assoc.target);
            assoc.resolve(&table, &id, &targets, &custom_types, &settings.properties)?;
        }

        let mut extend = schema.extend.clone();
        for assoc in &mut extend {
            assoc.resolve(&table, &id, &custom_types, &settings.properties)?;
            for property in &assoc.properties {
                if columns.contains(&property.name) {
                    return Err(ModelError::Schema(format!(
                        "extension property '{}' shadows a column of '{table}'",
                        property.name
                    )));
                }
                all_properties.push(property.clone());
            }
        }

        let mut fetch_fields = id.clone();
        for column in &columns {
            if !fetch_fields.contains(column) && !lazy.contains(column) {
                fetch_fields.push(column.clone());
            }
        }

        let capabilities = CapabilityTable::build(&lazy, &one, &many, &extend)?;

        let hooks = HookRegistry::new();
        for (hook, handler) in &schema.hooks {
            hooks.set(*hook, Some(Arc::clone(handler)));
        }

        let options = ModelOptions::from_schema(settings, &schema);
        let mut type_names: Vec<String> = custom_types.keys().cloned().collect();
        type_names.sort();

        info!(
            table = %table,
            columns = columns.len(),
            associations = one.len() + many.len() + extend.len(),
            "model defined"
        );

        Ok(Model {
            inner: Arc::new(ModelInner {
                table,
                id,
                properties,
                all_properties,
                columns,
                fetch_fields,
                lazy,
                one,
                many,
                extend,
                validations,
                hooks,
                capabilities,
                options,
                indexes: schema.indexes,
                extension: schema.extension,
                custom_types: type_names,
                driver_uid: ctx.driver.uid().to_string(),
                context: Arc::downgrade(ctx),
            }),
        })
    }

    /// Satellite schema of every Extend association, keyed like this model.
    pub(crate) fn extension_schemas(&self) -> Vec<ModelSchema> {
        let keys: Vec<Property> = self
            .inner
            .id
            .iter()
            .filter_map(|column| self.property(column).cloned())
            .collect();
        self.inner
            .extend
            .iter()
            .map(|assoc| {
                let schema = assoc.extension_schema(&keys);
                match self.inner.options.cache {
                    CachePolicy::Disabled => schema.cache(false),
                    _ => schema,
                }
            })
            .collect()
    }

    pub(crate) fn context(&self) -> ModelResult<Arc<OrmContext>> {
        match self.inner.context.upgrade() {
            Some(ctx) if !ctx.is_closed() => Ok(ctx),
            _ => Err(ModelError::Disconnected),
        }
    }

    /// Resolve an associated model by table name.
    pub fn resolve(&self, table: &str) -> ModelResult<Model> {
        self.context()?.registry.resolve(&self.inner.table, table)
    }

    pub fn table(&self) -> &str {
        &self.inner.table
    }

    /// Id column names, in key order.
    pub fn id(&self) -> &[String] {
        &self.inner.id
    }

    /// Declared properties.
    pub fn properties(&self) -> &[Property] {
        &self.inner.properties
    }

    /// Declared properties, implicit keys and extension properties.
    pub fn all_properties(&self) -> &[Property] {
        &self.inner.all_properties
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.inner.all_properties.iter().find(|p| p.name == name)
    }

    /// Columns stored on this model's table, foreign keys included.
    pub fn columns(&self) -> &[String] {
        &self.inner.columns
    }

    /// Columns fetched by default.
    pub fn fetch_fields(&self) -> &[String] {
        &self.inner.fetch_fields
    }

    pub fn lazy_properties(&self) -> &[String] {
        &self.inner.lazy
    }

    pub fn is_column(&self, name: &str) -> bool {
        self.inner.columns.iter().any(|c| c == name)
    }

    /// Whether `name` is left unloaded by default construction.
    pub fn is_deferred(&self, name: &str, is_shell: bool) -> bool {
        if self.inner.id.iter().any(|c| c == name) {
            return false;
        }
        is_shell || self.inner.lazy.iter().any(|c| c == name)
    }

    /// Index of the Extend association that owns property `name`.
    pub fn extension_of(&self, name: &str) -> Option<usize> {
        self.inner
            .extend
            .iter()
            .position(|assoc| assoc.has_property(name))
    }

    pub fn one_associations(&self) -> &[OneAssociation] {
        &self.inner.one
    }

    pub fn many_associations(&self) -> &[ManyAssociation] {
        &self.inner.many
    }

    pub fn extend_associations(&self) -> &[ExtendAssociation] {
        &self.inner.extend
    }

    pub fn one_association(&self, name: &str) -> Option<&OneAssociation> {
        self.inner.one.iter().find(|a| a.name == name)
    }

    pub fn many_association(&self, name: &str) -> Option<&ManyAssociation> {
        self.inner.many.iter().find(|a| a.name == name)
    }

    pub fn extend_association(&self, name: &str) -> Option<&ExtendAssociation> {
        self.inner.extend.iter().find(|a| a.name == name)
    }

    /// Whether `name` is an association of any kind.
    pub fn is_association(&self, name: &str) -> bool {
        self.one_association(name).is_some()
            || self.many_association(name).is_some()
            || self.extend_association(name).is_some()
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.inner.capabilities
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    /// Validators per property, `required` first where declared.
    pub fn validations(&self) -> &[(String, Vec<SharedValidator>)] {
        &self.inner.validations
    }

    pub fn options(&self) -> &ModelOptions {
        &self.inner.options
    }

    pub fn indexes(&self) -> &[String] {
        &self.inner.indexes
    }

    /// Whether this model stores the rows of an Extend association.
    pub fn is_extension(&self) -> bool {
        self.inner.extension
    }

    pub fn driver_uid(&self) -> &str {
        &self.inner.driver_uid
    }

    /// Model uid: `driver-uid/table/id-columns`.
    pub fn uid(&self) -> String {
        format!(
            "{}/{}/{}",
            self.inner.driver_uid,
            self.inner.table,
            self.inner.id.join("/")
        )
    }

    pub fn identity_key(&self, ids: &[Value]) -> String {
        identity_key(&self.inner.driver_uid, &self.inner.table, ids)
    }

    pub fn ptr_eq(&self, other: &Model) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("table", &self.inner.table)
            .field("id", &self.inner.id)
            .field("columns", &self.inner.columns)
            .field("one", &self.inner.one.len())
            .field("many", &self.inner.many.len())
            .field("extend", &self.inner.extend.len())
            .finish()
    }
}
