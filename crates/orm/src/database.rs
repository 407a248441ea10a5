//! Database Integration - the connection context models are defined on
//!
//! An [`Orm`] owns one driver, the identity map for that driver and the
//! table-name registry of its models. Models only hold a weak handle to this
//! context; once [`Orm::close`] ran, their operations fail with
//! `Disconnected`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::backends::Driver;
use crate::error::{ModelError, ModelResult};
use crate::identity_map::IdentityMap;
use crate::query::dedup::{DeduplicationStats, QueryDeduplicator};
use crate::model::Model;
use crate::relationships::ModelRegistry;
use crate::schema::{CustomType, ModelSchema};
use crate::settings::OrmSettings;

/// Shared state of one connection.
pub(crate) struct OrmContext {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) identity_map: Arc<IdentityMap>,
    pub(crate) queries: Arc<QueryDeduplicator>,
    pub(crate) registry: ModelRegistry,
    pub(crate) settings: OrmSettings,
    pub(crate) custom_types: RwLock<HashMap<String, CustomType>>,
    closed: AtomicBool,
}

impl OrmContext {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Entry point: a driver connection plus the models defined on it.
#[derive(Clone)]
pub struct Orm {
    ctx: Arc<OrmContext>,
}

impl Orm {
    pub fn connect(driver: Arc<dyn Driver>, settings: OrmSettings) -> Self {
        info!(driver = driver.uid(), "orm connected");
        Self {
            ctx: Arc::new(OrmContext {
                driver,
                identity_map: Arc::new(IdentityMap::new()),
                queries: Arc::new(QueryDeduplicator::new()),
                registry: ModelRegistry::new(),
                settings,
                custom_types: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_open(&self) -> ModelResult<()> {
        if self.ctx.is_closed() {
            Err(ModelError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Compile and register a model, along with the satellite models of its
    /// Extend associations. Redefining a table replaces the earlier model.
    pub fn define(&self, schema: ModelSchema) -> ModelResult<Model> {
        self.ensure_open()?;
        let model = Model::compile(schema, &self.ctx)?;

        for extension in model.extension_schemas() {
            let satellite = Model::compile(extension, &self.ctx)?;
            self.ctx.registry.register(satellite);
        }
        self.ctx.registry.register(model.clone());
        Ok(model)
    }

    /// Model registered for `table`.
    pub fn model(&self, table: &str) -> ModelResult<Model> {
        self.ctx
            .registry
            .get(table)
            .ok_or_else(|| ModelError::not_defined("orm", table))
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.ctx.registry
    }

    /// Register a custom property type for models defined afterwards.
    pub fn define_type(&self, name: impl Into<String>, custom: CustomType) {
        self.ctx.custom_types.write().insert(name.into(), custom);
    }

    pub fn settings(&self) -> &OrmSettings {
        &self.ctx.settings
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.ctx.driver
    }

    pub fn identity_map(&self) -> &Arc<IdentityMap> {
        &self.ctx.identity_map
    }

    /// Finds executed against the driver versus finds that joined one in flight.
    pub fn query_stats(&self) -> DeduplicationStats {
        self.ctx.queries.stats()
    }

    /// Sync every registered model, in table-name order.
    pub async fn sync_all(&self) -> ModelResult<()> {
        self.ensure_open()?;
        for table in self.ctx.registry.tables() {
            self.model(&table)?.sync().await?;
        }
        Ok(())
    }

    /// Drop every registered model, in table-name order.
    pub async fn drop_all(&self) -> ModelResult<()> {
        self.ensure_open()?;
        for table in self.ctx.registry.tables() {
            self.model(&table)?.drop().await?;
        }
        Ok(())
    }

    /// Tear down the identity map, pending finds and the registry, then close
    /// the driver.
    pub async fn close(&self) -> ModelResult<()> {
        if self.ctx.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.ctx.identity_map.clear();
        self.ctx.queries.clear();
        self.ctx.registry.clear();
        info!(driver = self.ctx.driver.uid(), "orm closed");
        self.ctx
            .driver
            .close()
            .await
            .map_err(|e| ModelError::from_driver(e, "orm"))
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_closed()
    }
}

impl std::fmt::Debug for Orm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orm")
            .field("driver", &self.ctx.driver.uid())
            .field("models", &self.ctx.registry.tables())
            .field("closed", &self.is_closed())
            .finish()
    }
}
