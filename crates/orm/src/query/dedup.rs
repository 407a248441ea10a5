//! In-flight find deduplication
//!
//! Identical finds (same table, fields, conditions and options) issued while
//! one is still running share its driver round-trip. Entries live only while
//! the query is in flight; a find issued after completion queries again.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::backends::{Conditions, OrderDirection, QueryOptions, Row};
use crate::error::ModelResult;

type SharedRows = Shared<BoxFuture<'static, ModelResult<Arc<Vec<Row>>>>>;

/// What makes two finds interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub table: String,
    pub fields: Vec<String>,
    /// Conditions as canonical JSON
    pub conditions: String,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order: Vec<(String, OrderDirection)>,
}

impl QueryKey {
    pub fn find(table: &str, fields: &[String], conditions: &Conditions, options: &QueryOptions) -> Self {
        Self {
            table: table.to_string(),
            fields: fields.to_vec(),
            conditions: Value::Object(conditions.clone()).to_string(),
            limit: options.limit,
            offset: options.offset,
            order: options
                .order
                .iter()
                .map(|o| (o.column.clone(), o.direction))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeduplicationStats {
    pub unique_queries_executed: u64,
    pub queries_deduplicated: u64,
}

impl fmt::Display for DeduplicationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Query Stats: {} executed, {} deduplicated",
            self.unique_queries_executed, self.queries_deduplicated
        )
    }
}

#[derive(Default)]
pub struct QueryDeduplicator {
    pending: Mutex<HashMap<QueryKey, (u64, SharedRows)>>,
    generation: AtomicU64,
    executed: AtomicU64,
    deduplicated: AtomicU64,
}

impl QueryDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `execute` unless an identical query is in flight, in which case
    /// wait for that one. Errors reach every waiter.
    pub async fn execute(
        self: &Arc<Self>,
        key: QueryKey,
        execute: BoxFuture<'static, ModelResult<Vec<Row>>>,
    ) -> ModelResult<Arc<Vec<Row>>> {
        let shared = {
            let mut pending = self.pending.lock();
            match pending.get(&key) {
                Some((_, shared)) => {
                    self.deduplicated.fetch_add(1, Ordering::Relaxed);
                    debug!(table = %key.table, "joining in-flight find");
                    shared.clone()
                }
                None => {
                    self.executed.fetch_add(1, Ordering::Relaxed);
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let this = Arc::clone(self);
                    let owned_key = key.clone();
                    let shared = async move {
                        let result = execute.await.map(Arc::new);
                        this.finish(&owned_key, generation);
                        result
                    }
                    .boxed()
                    .shared();
                    pending.insert(key, (generation, shared.clone()));
                    shared
                }
            }
        };
        shared.await
    }

    fn finish(&self, key: &QueryKey, generation: u64) {
        let mut pending = self.pending.lock();
        if matches!(pending.get(key), Some((g, _)) if *g == generation) {
            pending.remove(key);
        }
    }

    pub fn has_pending_queries(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn stats(&self) -> DeduplicationStats {
        DeduplicationStats {
            unique_queries_executed: self.executed.load(Ordering::Relaxed),
            queries_deduplicated: self.deduplicated.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for QueryDeduplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDeduplicator")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{row, OrderBy};
    use futures::future::join_all;
    use serde_json::json;
    use std::time::Duration;

    fn key(conditions: Value) -> QueryKey {
        QueryKey::find(
            "person",
            &["id".to_string(), "name".to_string()],
            &row(conditions),
            &QueryOptions::default(),
        )
    }

    #[test]
    fn test_query_key_distinguishes_options() {
        let base = key(json!({ "id": 1 }));
        assert_eq!(base, key(json!({ "id": 1 })));
        assert_ne!(base, key(json!({ "id": 2 })));

        let ordered = QueryKey::find(
            "person",
            &base.fields,
            &row(json!({ "id": 1 })),
            &QueryOptions {
                order: vec![OrderBy::desc("name")],
                ..Default::default()
            },
        );
        assert_ne!(base, ordered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_queries_run_once() {
        let dedup = Arc::new(QueryDeduplicator::new());
        let runs = Arc::new(AtomicU64::new(0));

        let results = join_all((0..5).map(|_| {
            let runs = Arc::clone(&runs);
            dedup.execute(
                key(json!({ "id": 1 })),
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(vec![row(json!({ "id": 1 }))])
                }
                .boxed(),
            )
        }))
        .await;

        assert!(results.iter().all(|r| matches!(r, Ok(rows) if rows.len() == 1)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            dedup.stats(),
            DeduplicationStats {
                unique_queries_executed: 1,
                queries_deduplicated: 4,
            }
        );
        assert!(!dedup.has_pending_queries());
    }
}
