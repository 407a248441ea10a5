//! # relmap-orm: schema-driven data mapper
//!
//! Turns a declarative [`ModelSchema`] into a [`Model`] that materializes,
//! caches, validates and persists [`Instance`]s over an external storage
//! [`Driver`].
//!
//! The moving parts:
//!
//! - an identity map guaranteeing one live instance per logical row,
//! - lazily loaded properties,
//! - One / Many / Extend associations with ordered auto-fetch,
//! - lifecycle hooks and validators wrapped around every save and remove.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relmap_orm::{MemoryDriver, ModelSchema, Orm, OrmSettings, PropertyDecl};
//! use serde_json::json;
//!
//! # async fn demo() -> relmap_orm::ModelResult<()> {
//! let orm = Orm::connect(Arc::new(MemoryDriver::new()), OrmSettings::default());
//! let person = orm.define(
//!     ModelSchema::new("person")
//!         .property("name", PropertyDecl::text().required())
//!         .property("age", PropertyDecl::integer()),
//! )?;
//!
//! let john = person.create(relmap_orm::row(json!({ "name": "John", "age": 30 }))).await?;
//! let again = person.get([john.id()[0].clone()]).await?;
//! assert_eq!(again.get("name"), Some(json!("John")));
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod database;
pub mod error;
pub mod hook_error;
pub mod hooks;
pub mod identity_map;
pub mod instance;
pub mod model;
pub mod query;
pub mod relationships;
pub mod schema;
pub mod settings;
pub mod validation;

pub use backends::memory::{MemoryDriver, Operation};
pub use backends::{
    row, AggregateFunction, AggregateSpec, Conditions, Driver, DriverResult, OrderBy,
    OrderDirection, QueryOptions, Row, SchemaDescriptor,
};
pub use database::Orm;
pub use error::{DriverError, ErrorCode, ModelError, ModelResult, OrmError, OrmResult};
pub use hook_error::HookError;
pub use hooks::{Hook, HookHandler, HookRegistry};
pub use identity_map::{Ancestry, IdentityMap, IdentityMapStats, LookupOptions};
pub use instance::{ConstructionStage, Instance};
pub use model::{
    identity_key, ExistsQuery, FindArg, FindOptions, GetOptions, InstanceOptions, Model,
    ModelOptions,
};
pub use query::{AggregateBuilder, ChainFind, DeduplicationStats, QueryDeduplicator, QueryKey};
pub use relationships::{
    Accessor, AccessorArg, AccessorKind, AccessorMethod, AccessorOp, AccessorOutput,
    AssociationState, AssociationValue, Capability, CapabilityTable, ExtendAccessor,
    ExtendAssociation, LazyAccessor, ManyAccessor, ManyAssociation, ManyQuery, ModelRegistry,
    OneAccessor, OneAssociation,
};
pub use schema::{
    CustomType, ModelSchema, Property, PropertyClass, PropertyDecl, PropertyOptions, PropertyType,
};
pub use settings::{CachePolicy, InstanceSettings, OrmSettings, PropertySettings};
pub use validation::{
    validators, SharedValidator, ValidationContext, ValidationError, ValidationErrors, Validator,
};
