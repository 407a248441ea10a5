//! Instances: the in-memory materialization of one row
//!
//! An [`Instance`] is a cheap, clonable handle; clones share state, so the
//! identity map can hand the same logical row to every caller. All mutable
//! state sits behind one synchronous lock that is never held across an await.

mod persistence;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::backends::{Conditions, Row};
use crate::error::{ModelError, ModelResult};
use crate::model::Model;
use crate::relationships::{AssociationState, AssociationValue};

/// Where construction of an instance currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConstructionStage {
    Wiring,
    AfterLoad,
    AutoFetchOne,
    AutoFetchMany,
    AutoFetchExtend,
    AfterAutoFetch,
    Ready,
}

#[derive(Debug, Default)]
pub(crate) struct InstanceState {
    pub(crate) fields: Row,
    pub(crate) extra: Row,
    pub(crate) is_new: bool,
    pub(crate) is_shell: bool,
    pub(crate) changes: BTreeSet<String>,
    pub(crate) associations: HashMap<String, AssociationState>,
    /// Many rows to link on the next save, with their join-row props
    pub(crate) staged: HashMap<String, Vec<(Instance, Row)>>,
    /// Extension properties set before the extension row was fetched
    pub(crate) pending_extension: HashMap<String, Row>,
    /// Association data supplied in the construction row
    pub(crate) pending_associations: Vec<(String, Value)>,
    pub(crate) stage: Option<ConstructionStage>,
    pub(crate) cascade_remove: bool,
}

pub(crate) struct InstanceInner {
    model: Model,
    uid: OnceLock<String>,
    pub(crate) state: RwLock<InstanceState>,
}

#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

impl Instance {
    pub(crate) fn new(model: Model, uid: Option<String>, state: InstanceState) -> Self {
        let cell = OnceLock::new();
        if let Some(uid) = uid {
            let _ = cell.set(uid);
        }
        Self {
            inner: Arc::new(InstanceInner {
                model,
                uid: cell,
                state: RwLock::new(state),
            }),
        }
    }

    pub fn model(&self) -> &Model {
        &self.inner.model
    }

    /// Identity-map key, absent for unsaved and uncached instances.
    pub fn uid(&self) -> Option<&str> {
        self.inner.uid.get().map(String::as_str)
    }

    pub(crate) fn inner_state(&self) -> &RwLock<InstanceState> {
        &self.inner.state
    }

    pub(crate) fn assign_uid(&self, uid: String) -> bool {
        self.inner.uid.set(uid).is_ok()
    }

    /// Whether both handles refer to the same live instance.
    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current value of a property, id, foreign key, extension property or
    /// extra column. `None` when not loaded.
    pub fn get(&self, name: &str) -> Option<Value> {
        let extension = self.model().extension_of(name);
        let state = self.inner.state.read();

        if let Some(value) = state.fields.get(name) {
            return Some(value.clone());
        }
        if let Some(value) = state.extra.get(name) {
            return Some(value.clone());
        }

        let idx = extension?;
        let assoc = &self.model().extend_associations()[idx];
        if let Some(value) = state
            .pending_extension
            .get(&assoc.name)
            .and_then(|pending| pending.get(name))
        {
            return Some(value.clone());
        }
        match state.associations.get(&assoc.name) {
            Some(AssociationState::Fetched(AssociationValue::Extend(Some(ext)))) => ext.get(name),
            _ => None,
        }
    }

    /// Set a value in memory and mark it changed.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> ModelResult<()> {
        let value = value.into();
        let model = self.model();

        if let Some(idx) = model.extension_of(name) {
            let assoc_name = &model.extend_associations()[idx].name;
            let fetched = {
                let state = self.inner.state.read();
                match state.associations.get(assoc_name) {
                    Some(AssociationState::Fetched(AssociationValue::Extend(Some(ext)))) => {
                        Some(ext.clone())
                    }
                    _ => None,
                }
            };
            match fetched {
                Some(ext) => ext.set(name, value)?,
                None => {
                    self.inner
                        .state
                        .write()
                        .pending_extension
                        .entry(assoc_name.clone())
                        .or_default()
                        .insert(name.to_string(), value);
                }
            }
            self.inner.state.write().changes.insert(name.to_string());
            return Ok(());
        }

        let mut state = self.inner.state.write();
        if model.is_column(name) {
            state.fields.insert(name.to_string(), value);
            state.changes.insert(name.to_string());
            Ok(())
        } else if state.extra.contains_key(name) {
            state.extra.insert(name.to_string(), value);
            Ok(())
        } else {
            Err(ModelError::not_defined(model.table(), name))
        }
    }

    /// Id values in id-column order; missing ids are null.
    pub fn id(&self) -> Vec<Value> {
        let state = self.inner.state.read();
        self.model()
            .id()
            .iter()
            .map(|column| state.fields.get(column).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// `true` when every id column holds a value.
    pub fn has_id(&self) -> bool {
        self.id().iter().all(|v| !v.is_null())
    }

    pub(crate) fn id_conditions(&self) -> Conditions {
        self.model().id().iter().cloned().zip(self.id()).collect()
    }

    pub fn is_new(&self) -> bool {
        self.inner.state.read().is_new
    }

    /// Not yet written to storage.
    pub fn saved(&self) -> bool {
        !self.is_new()
    }

    pub fn is_shell(&self) -> bool {
        self.inner.state.read().is_shell
    }

    /// Has changes that were not saved yet.
    pub fn is_dirty(&self) -> bool {
        let state = self.inner.state.read();
        !state.changes.is_empty() || state.staged.values().any(|s| !s.is_empty())
    }

    pub fn changes(&self) -> Vec<String> {
        self.inner.state.read().changes.iter().cloned().collect()
    }

    pub fn stage(&self) -> Option<ConstructionStage> {
        self.inner.state.read().stage
    }

    pub(crate) fn set_stage(&self, stage: ConstructionStage) {
        tracing::trace!(table = self.model().table(), ?stage, "construction stage");
        self.inner.state.write().stage = Some(stage);
    }

    pub fn cascade_remove(&self) -> bool {
        self.inner.state.read().cascade_remove
    }

    /// Loaded values of the model's own columns.
    pub fn fields(&self) -> Row {
        self.inner.state.read().fields.clone()
    }

    pub fn association_state(&self, name: &str) -> AssociationState {
        self.inner
            .state
            .read()
            .associations
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn set_association(&self, name: &str, state: AssociationState) {
        self.inner
            .state
            .write()
            .associations
            .insert(name.to_string(), state);
    }

    pub(crate) fn mark_fetching(&self, name: &str) {
        self.set_association(name, AssociationState::Fetching);
    }

    /// JSON view including fetched associations one level deep.
    pub fn to_json(&self) -> Value {
        self.to_json_depth(1)
    }

    fn to_json_depth(&self, depth: usize) -> Value {
        let state = self.inner.state.read();
        let mut out: Map<String, Value> = state.fields.clone();
        for (key, value) in &state.extra {
            out.entry(key.clone()).or_insert_with(|| value.clone());
        }
        for pending in state.pending_extension.values() {
            for (key, value) in pending {
                out.insert(key.clone(), value.clone());
            }
        }

        let associations: Vec<(String, AssociationValue)> = state
            .associations
            .iter()
            .filter_map(|(name, s)| s.value().map(|v| (name.clone(), v.clone())))
            .collect();
        drop(state);

        for (name, value) in associations {
            match value {
                AssociationValue::Extend(Some(ext)) => {
                    // Only the extension's own properties; its key columns mirror ours.
                    let Some(assoc) = self.model().extend_association(&name) else {
                        continue;
                    };
                    for property in &assoc.properties {
                        if let Some(value) = ext.get(&property.name) {
                            out.entry(property.name.clone()).or_insert(value);
                        }
                    }
                }
                AssociationValue::Extend(None) => {}
                _ if depth == 0 => {}
                AssociationValue::One(one) => {
                    let nested = one.map(|i| i.to_json_depth(depth - 1)).unwrap_or(Value::Null);
                    out.insert(name, nested);
                }
                AssociationValue::Many(items) => {
                    let nested = items.iter().map(|i| i.to_json_depth(depth - 1)).collect();
                    out.insert(name, Value::Array(nested));
                }
            }
        }

        Value::Object(out)
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Instance")
            .field("table", &self.model().table())
            .field("uid", &self.uid())
            .field("is_new", &state.is_new)
            .field("fields", &state.fields)
            .finish()
    }
}
