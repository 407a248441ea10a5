#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relmap_orm::{row, HookError, Instance, MemoryDriver, ModelSchema, Orm, OrmSettings, PropertyDecl, Row};
use serde_json::{json, Value};

pub fn setup() -> (Arc<MemoryDriver>, Orm) {
    setup_with(OrmSettings::default())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn setup_with(settings: OrmSettings) -> (Arc<MemoryDriver>, Orm) {
    init_tracing();
    let driver = Arc::new(MemoryDriver::new());
    let orm = Orm::connect(driver.clone(), settings);
    (driver, orm)
}

/// Driver that sleeps on every call; pair with a paused clock.
pub fn setup_slow(latency: Duration) -> (Arc<MemoryDriver>, Orm) {
    init_tracing();
    let driver = Arc::new(MemoryDriver::new().with_latency(latency));
    let orm = Orm::connect(driver.clone(), OrmSettings::default());
    (driver, orm)
}

pub fn person_schema() -> ModelSchema {
    ModelSchema::new("person")
        .property("name", PropertyDecl::text())
        .property("age", PropertyDecl::integer())
}

pub fn data(value: Value) -> Row {
    row(value)
}

pub fn seed_people(driver: &MemoryDriver) {
    driver.seed(
        "person",
        vec![
            data(json!({ "id": 1, "name": "test1", "age": 30 })),
            data(json!({ "id": 2, "name": "test2", "age": 40 })),
        ],
    );
}

/// Shared list of events recorded by hooks.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    /// Hook handler that records `event` and succeeds.
    pub fn recorder(
        &self,
        event: &'static str,
    ) -> impl Fn(Instance) -> futures::future::Ready<Result<(), HookError>> + Send + Sync + 'static {
        let journal = self.clone();
        move |_instance: Instance| {
            journal.push(event);
            futures::future::ready(Ok(()))
        }
    }
}
