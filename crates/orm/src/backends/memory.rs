//! In-memory driver
//!
//! Stores rows in insertion order per table. Every operation is counted and
//! journaled, yields to the scheduler once, and can be made to fail on demand,
//! which makes it the test double for the whole crate.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Number, Value};

use super::core::{
    AggregateFunction, AggregateSpec, Conditions, Driver, DriverResult, QueryOptions, Row,
    SchemaDescriptor,
};
use crate::error::DriverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Find,
    Count,
    Insert,
    Update,
    Remove,
    Clear,
    Drop,
    Sync,
    Aggregate,
}

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Row>,
    last_id: i64,
}

impl Table {
    fn bump_serial(&mut self, value: &Value) {
        if let Some(id) = value.as_i64() {
            self.last_id = self.last_id.max(id);
        }
    }
}

pub struct MemoryDriver {
    uid: String,
    tables: Mutex<HashMap<String, Table>>,
    calls: Mutex<HashMap<Operation, u64>>,
    journal: Mutex<Vec<(Operation, String)>>,
    requested_fields: Mutex<Vec<(String, Vec<String>)>>,
    faults: Mutex<HashMap<Operation, DriverError>>,
    latency: Option<Duration>,
    schema_ops: bool,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            tables: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            journal: Mutex::new(Vec::new()),
            requested_fields: Mutex::new(Vec::new()),
            faults: Mutex::new(HashMap::new()),
            latency: None,
            schema_ops: true,
        }
    }

    /// Driver without clear / drop / sync / aggregate.
    pub fn minimal() -> Self {
        Self {
            schema_ops: false,
            ..Self::new()
        }
    }

    /// Delay every operation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Insert rows verbatim, bypassing counters.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut tables = self.tables.lock();
        let entry = tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Some(id) = row.get("id") {
                entry.bump_serial(id);
            }
            entry.rows.push(row);
        }
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.lock().contains_key(table)
    }

    pub fn calls(&self, op: Operation) -> u64 {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.lock().values().sum()
    }

    /// Operations in the order they were issued.
    pub fn journal(&self) -> Vec<(Operation, String)> {
        self.journal.lock().clone()
    }

    /// Field lists of every find, with its table, in issue order.
    pub fn requested_fields(&self) -> Vec<(String, Vec<String>)> {
        self.requested_fields.lock().clone()
    }

    pub fn reset_counters(&self) {
        self.calls.lock().clear();
        self.journal.lock().clear();
        self.requested_fields.lock().clear();
    }

    /// Make the next `op` fail with `error`.
    pub fn fail_next(&self, op: Operation, error: DriverError) {
        self.faults.lock().insert(op, error);
    }

    async fn enter(&self, op: Operation, table: &str) -> DriverResult<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        self.journal.lock().push((op, table.to_string()));

        match self.latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }

        match self.faults.lock().remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDriver")
            .field("uid", &self.uid)
            .field("tables", &self.tables.lock().len())
            .finish()
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => as_f64(a)
            .partial_cmp(&as_f64(b))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn matches(row: &Row, conditions: &Conditions) -> bool {
    conditions.iter().all(|(column, expected)| {
        let actual = row.get(column).unwrap_or(&Value::Null);
        match expected {
            Value::Array(options) => options.iter().any(|option| values_equal(actual, option)),
            _ => values_equal(actual, expected),
        }
    })
}

fn project(row: &Row, fields: &[String]) -> Row {
    if fields.is_empty() {
        return row.clone();
    }
    fields
        .iter()
        .filter_map(|field| row.get(field).map(|v| (field.clone(), v.clone())))
        .collect()
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn compute(spec: &AggregateSpec, rows: &[&Row]) -> Value {
    let column_values = || {
        rows.iter().filter_map(|row| {
            spec.column
                .as_ref()
                .and_then(|column| row.get(column))
                .filter(|v| !v.is_null())
        })
    };

    match spec.function {
        AggregateFunction::Count => match &spec.column {
            None => Value::from(rows.len() as u64),
            Some(_) => Value::from(column_values().count() as u64),
        },
        AggregateFunction::Sum => number(column_values().filter_map(as_f64).sum()),
        AggregateFunction::Avg => {
            let numbers: Vec<f64> = column_values().filter_map(as_f64).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                number(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AggregateFunction::Min => column_values()
            .min_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        AggregateFunction::Max => column_values()
            .max_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn uid(&self) -> &str {
        &self.uid
    }

    async fn find(
        &self,
        fields: &[String],
        table: &str,
        conditions: &Conditions,
        options: &QueryOptions,
    ) -> DriverResult<Vec<Row>> {
        self.requested_fields
            .lock()
            .push((table.to_string(), fields.to_vec()));
        self.enter(Operation::Find, table).await?;

        let tables = self.tables.lock();
        let Some(stored) = tables.get(table) else {
            return Ok(Vec::new());
        };

        let mut found: Vec<&Row> = stored.rows.iter().filter(|r| matches(r, conditions)).collect();
        if !options.order.is_empty() {
            found.sort_by(|a, b| {
                options
                    .order
                    .iter()
                    .map(|order| {
                        let left = a.get(&order.column).unwrap_or(&Value::Null);
                        let right = b.get(&order.column).unwrap_or(&Value::Null);
                        let ord = compare_values(left, right);
                        if order.direction.is_desc() {
                            ord.reverse()
                        } else {
                            ord
                        }
                    })
                    .find(|ord| ord.is_ne())
                    .unwrap_or(Ordering::Equal)
            });
        }

        Ok(found
            .into_iter()
            .skip(options.offset.unwrap_or(0))
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|r| project(r, fields))
            .collect())
    }

    async fn count(&self, table: &str, conditions: &Conditions) -> DriverResult<u64> {
        self.enter(Operation::Count, table).await?;

        let tables = self.tables.lock();
        Ok(tables
            .get(table)
            .map(|t| t.rows.iter().filter(|r| matches(r, conditions)).count() as u64)
            .unwrap_or(0))
    }

    async fn insert(&self, table: &str, data: &Row, id_columns: &[String]) -> DriverResult<Row> {
        self.enter(Operation::Insert, table).await?;

        let mut tables = self.tables.lock();
        let stored = tables.entry(table.to_string()).or_default();
        let mut data = data.clone();

        if let [serial] = id_columns {
            match data.get(serial) {
                Some(value) if !value.is_null() => stored.bump_serial(value),
                _ => {
                    stored.last_id += 1;
                    data.insert(serial.clone(), Value::from(stored.last_id));
                }
            }
        }

        let key: Conditions = id_columns
            .iter()
            .filter_map(|column| data.get(column).map(|v| (column.clone(), v.clone())))
            .collect();
        if key.len() == id_columns.len()
            && !id_columns.is_empty()
            && stored.rows.iter().any(|r| matches(r, &key))
        {
            return Err(DriverError::with_code(
                format!("duplicate key in table '{table}'"),
                "ER_DUP_ENTRY",
            ));
        }

        stored.rows.push(data);
        Ok(key)
    }

    async fn update(
        &self,
        table: &str,
        changes: &Row,
        conditions: &Conditions,
    ) -> DriverResult<()> {
        self.enter(Operation::Update, table).await?;

        let mut tables = self.tables.lock();
        if let Some(stored) = tables.get_mut(table) {
            for row in stored.rows.iter_mut().filter(|r| matches(r, conditions)) {
                for (column, value) in changes {
                    row.insert(column.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, table: &str, conditions: &Conditions) -> DriverResult<()> {
        self.enter(Operation::Remove, table).await?;

        let mut tables = self.tables.lock();
        if let Some(stored) = tables.get_mut(table) {
            stored.rows.retain(|r| !matches(r, conditions));
        }
        Ok(())
    }

    async fn clear(&self, table: &str) -> DriverResult<()> {
        if !self.schema_ops {
            return Err(DriverError::unsupported("clear"));
        }
        self.enter(Operation::Clear, table).await?;

        if let Some(stored) = self.tables.lock().get_mut(table) {
            stored.rows.clear();
            stored.last_id = 0;
        }
        Ok(())
    }

    async fn drop_table(&self, schema: &SchemaDescriptor) -> DriverResult<()> {
        if !self.schema_ops {
            return Err(DriverError::unsupported("drop"));
        }
        self.enter(Operation::Drop, &schema.table).await?;

        let mut tables = self.tables.lock();
        tables.remove(&schema.table);
        for many in &schema.many {
            tables.remove(&many.merge_table);
        }
        Ok(())
    }

    async fn sync(&self, schema: &SchemaDescriptor) -> DriverResult<()> {
        if !self.schema_ops {
            return Err(DriverError::unsupported("sync"));
        }
        self.enter(Operation::Sync, &schema.table).await?;

        let mut tables = self.tables.lock();
        tables.entry(schema.table.clone()).or_default();
        for many in &schema.many {
            tables.entry(many.merge_table.clone()).or_default();
        }
        Ok(())
    }

    async fn aggregate(
        &self,
        table: &str,
        conditions: &Conditions,
        aggregates: &[AggregateSpec],
        group_by: &[String],
    ) -> DriverResult<Vec<Row>> {
        if !self.schema_ops {
            return Err(DriverError::unsupported("aggregate"));
        }
        self.enter(Operation::Aggregate, table).await?;

        let tables = self.tables.lock();
        let matching: Vec<&Row> = tables
            .get(table)
            .map(|t| t.rows.iter().filter(|r| matches(r, conditions)).collect())
            .unwrap_or_default();

        // Groups keep first-seen order.
        let mut groups: Vec<(Vec<Value>, Vec<&Row>)> = Vec::new();
        for row in matching {
            let key: Vec<Value> = group_by
                .iter()
                .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
                .collect();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(row),
                None => groups.push((key, vec![row])),
            }
        }
        if groups.is_empty() && group_by.is_empty() {
            groups.push((Vec::new(), Vec::new()));
        }

        Ok(groups
            .into_iter()
            .map(|(key, members)| {
                let mut out: Row = group_by.iter().cloned().zip(key).collect();
                for spec in aggregates {
                    out.insert(spec.alias.clone(), compute(spec, &members));
                }
                out
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::core::{row, OrderBy};
    use serde_json::json;

    fn ids() -> Vec<String> {
        vec!["id".to_string()]
    }

    #[tokio::test]
    async fn test_insert_assigns_serial_ids() {
        let driver = MemoryDriver::new();

        let first = driver
            .insert("person", &row(json!({ "name": "a" })), &ids())
            .await
            .unwrap();
        let second = driver
            .insert("person", &row(json!({ "name": "b" })), &ids())
            .await
            .unwrap();

        assert_eq!(first.get("id"), Some(&json!(1)));
        assert_eq!(second.get("id"), Some(&json!(2)));
        assert_eq!(driver.calls(Operation::Insert), 2);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected() {
        let driver = MemoryDriver::new();
        driver.seed("person", [row(json!({ "id": 7 }))]);

        let err = driver
            .insert("person", &row(json!({ "id": 7 })), &ids())
            .await
            .unwrap_err();

        assert!(matches!(err, DriverError::Failed { code: Some(ref c), .. } if c == "ER_DUP_ENTRY"));
    }

    #[tokio::test]
    async fn test_find_filters_orders_and_projects() {
        let driver = MemoryDriver::new();
        driver.seed(
            "person",
            [
                row(json!({ "id": 1, "name": "c", "age": 30 })),
                row(json!({ "id": 2, "name": "a", "age": 20 })),
                row(json!({ "id": 3, "name": "b", "age": 30 })),
            ],
        );

        let options = QueryOptions {
            order: vec![OrderBy::asc("name")],
            ..Default::default()
        };
        let found = driver
            .find(
                &["id".to_string()],
                "person",
                &row(json!({ "age": 30 })),
                &options,
            )
            .await
            .unwrap();

        assert_eq!(found, vec![row(json!({ "id": 3 })), row(json!({ "id": 1 }))]);
    }

    #[tokio::test]
    async fn test_array_condition_matches_any() {
        let driver = MemoryDriver::new();
        driver.seed(
            "pet",
            [row(json!({ "id": 1 })), row(json!({ "id": 2 })), row(json!({ "id": 3 }))],
        );

        let count = driver
            .count("pet", &row(json!({ "id": [1, 3] })))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_fail_next_fires_once() {
        let driver = MemoryDriver::new();
        driver.fail_next(Operation::Count, DriverError::failed("boom"));

        assert!(driver.count("person", &Conditions::new()).await.is_err());
        assert!(driver.count("person", &Conditions::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_minimal_driver_lacks_schema_ops() {
        let driver = MemoryDriver::minimal();

        assert_eq!(
            driver.clear("person").await,
            Err(DriverError::unsupported("clear"))
        );
        assert_eq!(driver.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_aggregate_grouped() {
        let driver = MemoryDriver::new();
        driver.seed(
            "sale",
            [
                row(json!({ "id": 1, "region": "n", "amount": 10 })),
                row(json!({ "id": 2, "region": "s", "amount": 5 })),
                row(json!({ "id": 3, "region": "n", "amount": 4 })),
            ],
        );

        let specs = [
            AggregateSpec {
                function: AggregateFunction::Sum,
                column: Some("amount".to_string()),
                alias: "sum_amount".to_string(),
            },
            AggregateSpec {
                function: AggregateFunction::Count,
                column: None,
                alias: "count".to_string(),
            },
        ];
        let out = driver
            .aggregate("sale", &Conditions::new(), &specs, &["region".to_string()])
            .await
            .unwrap();

        assert_eq!(
            out,
            vec![
                row(json!({ "region": "n", "sum_amount": 14, "count": 2 })),
                row(json!({ "region": "s", "sum_amount": 5, "count": 1 })),
            ]
        );
    }
}
