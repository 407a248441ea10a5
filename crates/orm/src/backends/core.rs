//! Core Driver Contract
//!
//! The mapping engine never issues dialect-specific statements. Everything it
//! needs from storage goes through [`Driver`]: keyed find / count / insert /
//! update / remove over a table and a column-equality condition map, plus a few
//! optional schema capabilities that report [`DriverError::Unsupported`] by
//! default.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::DriverError;
use crate::schema::Property;

/// One stored row, keyed by column name.
pub type Row = Map<String, Value>;

/// Column-equality conditions. An array value matches any of its elements.
pub type Conditions = Row;

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Build a [`Row`] from a JSON object. Anything else yields an empty row.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn is_desc(self) -> bool {
        matches!(self, OrderDirection::Desc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: OrderDirection,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Desc,
        }
    }
}

/// Paging and ordering for [`Driver::find`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order: Vec<OrderBy>,
}

impl QueryOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn name(self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

/// One aggregate column requested from [`Driver::aggregate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateSpec {
    pub function: AggregateFunction,
    /// `None` only makes sense for `Count` (count rows)
    pub column: Option<String>,
    /// Key of the result column
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OneDescriptor {
    pub name: String,
    pub target: String,
    pub field: Vec<String>,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManyDescriptor {
    pub name: String,
    pub target: String,
    pub merge_table: String,
    pub merge_id: Vec<String>,
    pub merge_assoc_id: Vec<String>,
    pub props: Vec<Property>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtendDescriptor {
    pub name: String,
    pub table: String,
    pub field: Vec<String>,
}

/// Everything a driver needs to create or drop a model's storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaDescriptor {
    pub table: String,
    pub id: Vec<String>,
    pub properties: Vec<Property>,
    pub all_properties: Vec<Property>,
    pub indexes: Vec<String>,
    pub one: Vec<OneDescriptor>,
    pub many: Vec<ManyDescriptor>,
    pub extend: Vec<ExtendDescriptor>,
    pub extension: bool,
    pub custom_types: Vec<String>,
}

/// Storage driver consumed by models
#[async_trait]
pub trait Driver: Send + Sync {
    /// Unique id used to namespace identity-map keys
    fn uid(&self) -> &str;

    /// Fetch rows. An empty `fields` slice selects every column.
    async fn find(
        &self,
        fields: &[String],
        table: &str,
        conditions: &Conditions,
        options: &QueryOptions,
    ) -> DriverResult<Vec<Row>>;

    /// Count rows matching `conditions`
    async fn count(&self, table: &str, conditions: &Conditions) -> DriverResult<u64>;

    /// Insert a row and return the values of `id_columns` as stored
    async fn insert(&self, table: &str, data: &Row, id_columns: &[String]) -> DriverResult<Row>;

    /// Apply `changes` to every row matching `conditions`
    async fn update(&self, table: &str, changes: &Row, conditions: &Conditions)
        -> DriverResult<()>;

    /// Delete every row matching `conditions`
    async fn remove(&self, table: &str, conditions: &Conditions) -> DriverResult<()>;

    /// Delete every row of `table`
    async fn clear(&self, _table: &str) -> DriverResult<()> {
        Err(DriverError::unsupported("clear"))
    }

    /// Drop the storage described by `schema`
    async fn drop_table(&self, _schema: &SchemaDescriptor) -> DriverResult<()> {
        Err(DriverError::unsupported("drop"))
    }

    /// Create the storage described by `schema`
    async fn sync(&self, _schema: &SchemaDescriptor) -> DriverResult<()> {
        Err(DriverError::unsupported("sync"))
    }

    /// Compute aggregates, one output row per distinct `group_by` tuple
    async fn aggregate(
        &self,
        _table: &str,
        _conditions: &Conditions,
        _aggregates: &[AggregateSpec],
        _group_by: &[String],
    ) -> DriverResult<Vec<Row>> {
        Err(DriverError::unsupported("aggregate"))
    }

    /// Release driver resources
    async fn close(&self) -> DriverResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_from_object() {
        let r = row(json!({ "id": 1, "name": "test1" }));
        assert_eq!(r.get("name"), Some(&json!("test1")));
    }

    #[test]
    fn test_row_from_non_object_is_empty() {
        assert!(row(json!([1, 2])).is_empty());
        assert!(row(Value::Null).is_empty());
    }

    struct Bare;

    #[async_trait]
    impl Driver for Bare {
        fn uid(&self) -> &str {
            "bare"
        }

        async fn find(
            &self,
            _fields: &[String],
            _table: &str,
            _conditions: &Conditions,
            _options: &QueryOptions,
        ) -> DriverResult<Vec<Row>> {
            Ok(Vec::new())
        }

        async fn count(&self, _table: &str, _conditions: &Conditions) -> DriverResult<u64> {
            Ok(0)
        }

        async fn insert(&self, _table: &str, _data: &Row, _ids: &[String]) -> DriverResult<Row> {
            Ok(Row::new())
        }

        async fn update(&self, _t: &str, _c: &Row, _w: &Conditions) -> DriverResult<()> {
            Ok(())
        }

        async fn remove(&self, _table: &str, _conditions: &Conditions) -> DriverResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_optional_capabilities_default_to_unsupported() {
        let driver = Bare;

        assert_eq!(
            driver.clear("person").await,
            Err(DriverError::unsupported("clear"))
        );
        assert_eq!(
            driver
                .aggregate("person", &Conditions::new(), &[], &[])
                .await,
            Err(DriverError::unsupported("aggregate"))
        );
        assert!(driver.close().await.is_ok());
    }
}
