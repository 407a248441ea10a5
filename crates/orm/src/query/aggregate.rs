//! Aggregate builder
//!
//! Collects aggregate functions and grouping columns for one model and runs
//! them through the driver's optional `aggregate` capability.

use serde_json::Value;
use tracing::debug;

use crate::backends::{AggregateFunction, AggregateSpec, Conditions, Row};
use crate::error::{ModelError, ModelResult};
use crate::model::Model;

#[derive(Debug, Clone)]
pub struct AggregateBuilder {
    model: Model,
    conditions: Conditions,
    /// Columns used by functions called without one
    properties: Vec<String>,
    specs: Vec<AggregateSpec>,
    group_by: Vec<String>,
}

impl AggregateBuilder {
    pub(crate) fn new(model: Model, conditions: Conditions, properties: Vec<String>) -> Self {
        Self {
            model,
            conditions,
            properties,
            specs: Vec::new(),
            group_by: Vec::new(),
        }
    }

    /// Count matching rows, aliased `count`.
    pub fn count(mut self) -> Self {
        self.specs.push(AggregateSpec {
            function: AggregateFunction::Count,
            column: None,
            alias: "count".to_string(),
        });
        self
    }

    pub fn count_of(self, column: &str) -> Self {
        self.call(AggregateFunction::Count, &[column])
    }

    pub fn sum(self, column: &str) -> Self {
        self.call(AggregateFunction::Sum, &[column])
    }

    pub fn avg(self, column: &str) -> Self {
        self.call(AggregateFunction::Avg, &[column])
    }

    pub fn min(self, column: &str) -> Self {
        self.call(AggregateFunction::Min, &[column])
    }

    pub fn max(self, column: &str) -> Self {
        self.call(AggregateFunction::Max, &[column])
    }

    /// Apply `function` to `columns`, or to the builder's properties when
    /// `columns` is empty. Results are aliased `<function>_<column>`.
    pub fn call(mut self, function: AggregateFunction, columns: &[&str]) -> Self {
        let columns: Vec<String> = if columns.is_empty() {
            self.properties.clone()
        } else {
            columns.iter().map(|c| c.to_string()).collect()
        };
        for column in columns {
            self.specs.push(AggregateSpec {
                function,
                alias: format!("{}_{}", function.name(), column),
                column: Some(column),
            });
        }
        self
    }

    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by.extend(columns.into_iter().map(Into::into));
        self
    }

    /// One row per group, keyed by group columns and function aliases.
    pub async fn get(&self) -> ModelResult<Vec<Row>> {
        if self.specs.is_empty() {
            return Err(ModelError::Query {
                message: "Missing aggregate functions".to_string(),
                original_code: None,
            });
        }

        let ctx = self.model.context()?;
        let table = self.model.table();
        debug!(table, functions = self.specs.len(), "aggregate");
        ctx.driver
            .aggregate(table, &self.conditions, &self.specs, &self.group_by)
            .await
            .map_err(|e| ModelError::from_driver(e, table))
    }

    /// Aggregate values of the first group, in function order.
    pub async fn get_one(&self) -> ModelResult<Vec<Value>> {
        let rows = self.get().await?;
        let first = rows.into_iter().next().unwrap_or_default();
        Ok(self
            .specs
            .iter()
            .map(|spec| first.get(&spec.alias).cloned().unwrap_or(Value::Null))
            .collect())
    }
}
