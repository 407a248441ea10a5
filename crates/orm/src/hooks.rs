//! Lifecycle hooks
//!
//! Each model stores at most one handler per [`Hook`]. The orchestrator's
//! [`HookRegistry::wait`] runs the registered handler (if any) and only
//! resolves once the handler has completed, so hooks of one operation never
//! overlap.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{ModelError, ModelResult};
use crate::hook_error::HookError;
use crate::instance::Instance;

/// Lifecycle points an instance passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    BeforeCreate,
    AfterCreate,
    BeforeSave,
    AfterSave,
    BeforeValidation,
    BeforeRemove,
    AfterRemove,
    AfterLoad,
    AfterAutoFetch,
}

impl Hook {
    pub const ALL: [Hook; 9] = [
        Hook::BeforeCreate,
        Hook::AfterCreate,
        Hook::BeforeSave,
        Hook::AfterSave,
        Hook::BeforeValidation,
        Hook::BeforeRemove,
        Hook::AfterRemove,
        Hook::AfterLoad,
        Hook::AfterAutoFetch,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Hook::BeforeCreate => "beforeCreate",
            Hook::AfterCreate => "afterCreate",
            Hook::BeforeSave => "beforeSave",
            Hook::AfterSave => "afterSave",
            Hook::BeforeValidation => "beforeValidation",
            Hook::BeforeRemove => "beforeRemove",
            Hook::AfterRemove => "afterRemove",
            Hook::AfterLoad => "afterLoad",
            Hook::AfterAutoFetch => "afterAutoFetch",
        }
    }

    pub fn from_name(name: &str) -> Option<Hook> {
        Hook::ALL.into_iter().find(|hook| hook.name() == name)
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A lifecycle callback. The instance is the receiver of the hook.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn call(&self, instance: &Instance) -> Result<(), HookError>;
}

#[async_trait]
impl<F, Fut> HookHandler for F
where
    F: Fn(Instance) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HookError>> + Send,
{
    async fn call(&self, instance: &Instance) -> Result<(), HookError> {
        (self)(instance.clone()).await
    }
}

/// Per-model hook table.
#[derive(Default)]
pub struct HookRegistry {
    handlers: RwLock<HashMap<Hook, Arc<dyn HookHandler>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handler` for `hook`; `None` clears it.
    pub fn set(&self, hook: Hook, handler: Option<Arc<dyn HookHandler>>) {
        let mut handlers = self.handlers.write();
        match handler {
            Some(handler) => {
                handlers.insert(hook, handler);
            }
            None => {
                handlers.remove(&hook);
            }
        }
    }

    pub fn get(&self, hook: Hook) -> Option<Arc<dyn HookHandler>> {
        self.handlers.read().get(&hook).cloned()
    }

    pub fn is_registered(&self, hook: Hook) -> bool {
        self.handlers.read().contains_key(&hook)
    }

    pub fn registered_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Run the handler for `hook` against `instance` and wait for it.
    pub async fn wait(&self, hook: Hook, instance: &Instance) -> ModelResult<()> {
        let Some(handler) = self.get(hook) else {
            return Ok(());
        };

        tracing::debug!(hook = hook.name(), table = instance.model().table(), "running hook");
        handler
            .call(instance)
            .await
            .map_err(|source| ModelError::Hook { hook, source })
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<&'static str> =
            self.handlers.read().keys().map(|hook| hook.name()).collect();
        f.debug_struct("HookRegistry")
            .field("registered", &registered)
            .finish()
    }
}
