//! Instance construction
//!
//! Building an instance is a two-phase join. Phase A wires the fields and runs
//! `afterLoad`; phase B runs the auto-fetch stages (One, then Many, then
//! Extend) followed by `afterAutoFetch`. The instance is handed out only once
//! both phases reported, with the first error of either phase surfaced.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tracing::{debug, trace};

use super::Model;
use crate::backends::Row;
use crate::error::{ModelError, ModelResult};
use crate::hooks::Hook;
use crate::identity_map::Ancestry;
use crate::instance::{ConstructionStage, Instance, InstanceState};
use crate::relationships::{extend, many, one};

/// How one instance is constructed.
#[derive(Debug, Clone, Default)]
pub struct InstanceOptions {
    /// Identity-map key, when the instance is cacheable
    pub uid: Option<String>,
    pub is_new: bool,
    pub is_shell: bool,
    pub auto_fetch: bool,
    pub auto_fetch_limit: u32,
    pub cascade_remove: bool,
    /// Columns kept although not part of the schema
    pub extra: Vec<String>,
    pub ancestry: Ancestry,
}

/// Completion counter of the two construction phases.
#[derive(Debug)]
pub(crate) struct Readiness {
    pending: u8,
    error: Option<ModelError>,
}

impl Readiness {
    pub(crate) fn new() -> Self {
        Self {
            pending: 2,
            error: None,
        }
    }

    /// Record one phase; returns `true` once both phases reported.
    pub(crate) fn report(&mut self, result: ModelResult<()>) -> bool {
        self.pending = self.pending.saturating_sub(1);
        if let Err(err) = result {
            match &self.error {
                None => self.error = Some(err),
                Some(first) => debug!(error = %err, first = %first, "later construction error ignored"),
            }
        }
        self.pending == 0
    }

    pub(crate) fn finish(self) -> ModelResult<()> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Model {
    /// Build an instance from a row and drive it to readiness.
    pub fn create_instance(
        &self,
        data: Row,
        options: InstanceOptions,
    ) -> BoxFuture<'static, ModelResult<Instance>> {
        let model = self.clone();
        async move { model.construct(data, options).await }.boxed()
    }

    async fn construct(&self, data: Row, options: InstanceOptions) -> ModelResult<Instance> {
        let state = self.initial_state(data, &options);
        let instance = Instance::new(self.clone(), options.uid.clone(), state);
        instance.set_stage(ConstructionStage::Wiring);

        let mut readiness = Readiness::new();

        instance.set_stage(ConstructionStage::AfterLoad);
        readiness.report(self.hooks().wait(Hook::AfterLoad, &instance).await);

        let ancestry = match &options.uid {
            Some(uid) => options.ancestry.with(uid),
            None => options.ancestry.clone(),
        };
        let fetched = self.auto_fetch(&instance, &options, &ancestry).await;
        let ready = readiness.report(match fetched {
            Ok(()) => {
                instance.set_stage(ConstructionStage::AfterAutoFetch);
                self.hooks().wait(Hook::AfterAutoFetch, &instance).await
            }
            Err(err) => Err(err),
        });

        debug_assert!(ready);
        readiness.finish()?;
        instance.set_stage(ConstructionStage::Ready);
        Ok(instance)
    }

    /// Filter unknown keys and split off association data.
    fn initial_state(&self, data: Row, options: &InstanceOptions) -> InstanceState {
        let mut state = InstanceState {
            is_new: options.is_new,
            is_shell: options.is_shell,
            cascade_remove: options.cascade_remove,
            ..Default::default()
        };

        for (key, value) in data {
            if self.is_column(&key) {
                state.fields.insert(key, value);
            } else if options.extra.contains(&key) {
                state.extra.insert(key, value);
            } else if let Some(idx) = self.extension_of(&key) {
                state
                    .pending_extension
                    .entry(self.extend_associations()[idx].name.clone())
                    .or_default()
                    .insert(key, value);
            } else if self.is_association(&key) {
                state.pending_associations.push((key, value));
            } else {
                trace!(table = self.table(), column = %key, "dropping unknown field");
            }
        }

        if options.is_new {
            for property in self.properties() {
                if let Some(default) = &property.default_value {
                    state
                        .fields
                        .entry(property.name.clone())
                        .or_insert_with(|| default.clone());
                }
            }
            // Values supplied up front count as changes of a new instance.
            state.changes = state
                .fields
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, _)| k.clone())
                .collect();
        }

        state
    }

    /// Auto-fetch stages, strictly One, then Many, then Extend.
    async fn auto_fetch(
        &self,
        instance: &Instance,
        options: &InstanceOptions,
        ancestry: &Ancestry,
    ) -> ModelResult<()> {
        let nested = options.ancestry.depth() > 0;
        let depth = |assoc_limit: Option<u32>| {
            association_depth(options.auto_fetch_limit, assoc_limit, nested)
        };
        let enabled = |assoc_flag: bool, limit: u32| {
            !options.is_new && limit > 0 && (options.auto_fetch || assoc_flag)
        };

        instance.set_stage(ConstructionStage::AutoFetchOne);
        for assoc in self.one_associations() {
            let limit = depth(assoc.auto_fetch_limit);
            if enabled(assoc.auto_fetch, limit) {
                one::auto_fetch(instance, assoc, limit, ancestry).await?;
            }
        }

        instance.set_stage(ConstructionStage::AutoFetchMany);
        for assoc in self.many_associations() {
            let limit = depth(assoc.auto_fetch_limit);
            if enabled(assoc.auto_fetch, limit) {
                many::auto_fetch(instance, assoc, limit, ancestry).await?;
            }
        }

        instance.set_stage(ConstructionStage::AutoFetchExtend);
        for assoc in self.extend_associations() {
            let limit = depth(assoc.auto_fetch_limit);
            if enabled(assoc.auto_fetch, limit) {
                extend::auto_fetch(instance, assoc, limit, ancestry).await?;
            }
        }

        Ok(())
    }
}

/// Fetch depth of one association.
///
/// At the top of a construction an association's own limit replaces the
/// instance limit. Inside a nested fetch it can only lower the depth handed
/// down, so every chain stays bounded.
pub(crate) fn association_depth(instance_limit: u32, assoc_limit: Option<u32>, nested: bool) -> u32 {
    match assoc_limit {
        None => instance_limit,
        Some(limit) if nested => limit.min(instance_limit),
        Some(limit) => limit,
    }
}

/// Whether a construction row can be treated as persisted.
///
/// Any missing id column makes it new; so does a single id column not called
/// `id`, which is kept for compatibility with custom-key schemas.
pub(crate) fn infer_is_new(model: &Model, data: &Row) -> bool {
    let missing = model
        .id()
        .iter()
        .any(|column| data.get(column).map_or(true, Value::is_null));
    let custom_key = matches!(model.id(), [single] if single != "id");
    missing || custom_key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_waits_for_both_phases() {
        let mut readiness = Readiness::new();
        assert!(!readiness.report(Ok(())));
        assert!(readiness.report(Ok(())));
        assert!(readiness.finish().is_ok());
    }

    #[test]
    fn test_readiness_keeps_first_error() {
        let mut readiness = Readiness::new();
        readiness.report(Err(ModelError::not_found("first")));
        readiness.report(Err(ModelError::not_found("second")));

        match readiness.finish() {
            Err(ModelError::NotFound { model }) => assert_eq!(model, "first"),
            other => panic!("Expected first error, got {other:?}"),
        }
    }

    #[test]
    fn test_association_depth() {
        assert_eq!(association_depth(1, None, false), 1);
        assert_eq!(association_depth(1, Some(3), false), 3);
        assert_eq!(association_depth(0, Some(2), false), 2);
        assert_eq!(association_depth(1, Some(3), true), 1);
        assert_eq!(association_depth(2, Some(1), true), 1);
    }

    #[test]
    fn test_readiness_error_from_second_phase() {
        let mut readiness = Readiness::new();
        readiness.report(Ok(()));
        readiness.report(Err(ModelError::Disconnected));
        assert!(matches!(readiness.finish(), Err(ModelError::Disconnected)));
    }
}
