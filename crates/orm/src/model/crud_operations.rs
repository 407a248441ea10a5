//! CRUD operations - creation, direct construction, storage management and
//! hook registration

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::lifecycle::infer_is_new;
use super::{InstanceOptions, Model};
use crate::backends::{ExtendDescriptor, ManyDescriptor, OneDescriptor, Row, SchemaDescriptor};
use crate::error::{ModelError, ModelResult};
use crate::hooks::{Hook, HookHandler};
use crate::instance::Instance;

macro_rules! hook_helpers {
    ($($fn_name:ident => $hook:ident),* $(,)?) => {
        $(
            #[doc = concat!("Register the `", stringify!($fn_name), "` hook, replacing any earlier one.")]
            pub fn $fn_name(&self, handler: impl HookHandler + 'static) -> &Self {
                self.set_hook(Hook::$hook, Some(Arc::new(handler)))
            }
        )*
    };
}

impl Model {
    /// Create and save one row.
    pub async fn create(&self, data: Row) -> ModelResult<Instance> {
        let mut created = self.create_many(vec![data]).await?;
        created
            .pop()
            .ok_or_else(|| ModelError::not_found(self.table()))
    }

    /// Create and save rows strictly in order. The first failure stops the
    /// sequence: earlier rows stay saved, later rows are never attempted and
    /// the error carries the failing index.
    pub async fn create_many(&self, rows: Vec<Row>) -> ModelResult<Vec<Instance>> {
        let mut created = Vec::with_capacity(rows.len());

        for (index, data) in rows.into_iter().enumerate() {
            let options = InstanceOptions {
                is_new: true,
                cascade_remove: self.options().cascade_remove,
                ..Default::default()
            };
            let instance = match self.create_instance(data, options).await {
                Ok(instance) => instance,
                Err(err) => return Err(self.create_failed(index, None, err)),
            };
            if let Err(err) = instance.save().await {
                return Err(self.create_failed(index, Some(instance), err));
            }
            created.push(instance);
        }

        Ok(created)
    }

    fn create_failed(&self, index: usize, instance: Option<Instance>, err: ModelError) -> ModelError {
        warn!(table = self.table(), index, error = %err, "create aborted");
        ModelError::Create {
            index,
            instance,
            source: Box::new(err),
        }
    }

    /// Construct an instance from data without touching storage.
    ///
    /// The instance counts as new when an id column is missing, and also
    /// whenever the model has a single id column not named `id`.
    pub async fn build(&self, data: Row) -> ModelResult<Instance> {
        let options = InstanceOptions {
            is_new: infer_is_new(self, &data),
            cascade_remove: self.options().cascade_remove,
            ..Default::default()
        };
        self.create_instance(data, options).await
    }

    /// Construct an instance that is always new.
    pub async fn build_new(&self, data: Row) -> ModelResult<Instance> {
        let options = InstanceOptions {
            is_new: true,
            cascade_remove: self.options().cascade_remove,
            ..Default::default()
        };
        self.create_instance(data, options).await
    }

    /// Instance holding only id values; every other column loads on demand.
    pub async fn shell<I, V>(&self, ids: I) -> ModelResult<Instance>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let ids: Vec<Value> = ids.into_iter().map(Into::into).collect();
        self.check_key_count(ids.len())?;

        let data: Row = self.id().iter().cloned().zip(ids).collect();
        let options = InstanceOptions {
            is_shell: true,
            cascade_remove: self.options().cascade_remove,
            ..Default::default()
        };
        self.create_instance(data, options).await
    }

    /// Delete every row of the table.
    pub async fn clear(&self) -> ModelResult<()> {
        let ctx = self.context()?;
        debug!(table = self.table(), "clear");
        ctx.driver
            .clear(self.table())
            .await
            .map_err(|e| ModelError::from_driver(e, self.table()))?;
        ctx.identity_map.evict_prefix(&self.key_prefix());
        Ok(())
    }

    /// Drop the table and its join tables.
    pub async fn drop(&self) -> ModelResult<()> {
        let ctx = self.context()?;
        debug!(table = self.table(), "drop");
        ctx.driver
            .drop_table(&self.descriptor())
            .await
            .map_err(|e| ModelError::from_driver(e, self.table()))?;
        ctx.identity_map.evict_prefix(&self.key_prefix());
        Ok(())
    }

    /// Create the table and its join tables.
    pub async fn sync(&self) -> ModelResult<()> {
        let ctx = self.context()?;
        debug!(table = self.table(), "sync");
        ctx.driver
            .sync(&self.descriptor())
            .await
            .map_err(|e| ModelError::from_driver(e, self.table()))
    }

    fn key_prefix(&self) -> String {
        format!("{}/{}/", self.driver_uid(), self.table())
    }

    /// Storage description handed to `sync` and `drop`.
    pub fn descriptor(&self) -> SchemaDescriptor {
        SchemaDescriptor {
            table: self.table().to_string(),
            id: self.id().to_vec(),
            properties: self.properties().to_vec(),
            all_properties: self.all_properties().to_vec(),
            indexes: self.indexes().to_vec(),
            one: self
                .one_associations()
                .iter()
                .map(|a| OneDescriptor {
                    name: a.name.clone(),
                    target: a.target.clone(),
                    field: a.field.clone(),
                    required: a.required,
                })
                .collect(),
            many: self
                .many_associations()
                .iter()
                .map(|a| ManyDescriptor {
                    name: a.name.clone(),
                    target: a.target.clone(),
                    merge_table: a.merge_table.clone(),
                    merge_id: a.merge_id.clone(),
                    merge_assoc_id: a.merge_assoc_id.clone(),
                    props: a.properties.clone(),
                })
                .collect(),
            extend: self
                .extend_associations()
                .iter()
                .map(|a| ExtendDescriptor {
                    name: a.name.clone(),
                    table: a.table.clone(),
                    field: a.field.clone(),
                })
                .collect(),
            extension: self.is_extension(),
            custom_types: self.inner.custom_types.clone(),
        }
    }

    /// Store or clear (`None`) the handler of `hook`.
    pub fn set_hook(&self, hook: Hook, handler: Option<Arc<dyn HookHandler>>) -> &Self {
        self.hooks().set(hook, handler);
        self
    }

    pub fn clear_hook(&self, hook: Hook) -> &Self {
        self.set_hook(hook, None)
    }

    hook_helpers! {
        before_create => BeforeCreate,
        after_create => AfterCreate,
        before_save => BeforeSave,
        after_save => AfterSave,
        before_validation => BeforeValidation,
        before_remove => BeforeRemove,
        after_remove => AfterRemove,
        after_load => AfterLoad,
        after_auto_fetch => AfterAutoFetch,
    }
}
