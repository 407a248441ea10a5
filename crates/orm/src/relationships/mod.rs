//! Associations and lazy properties
//!
//! Every model precomputes a [`CapabilityTable`] when it is defined: the list
//! of accessor methods (`getOwner`, `addPets`, ...) its instances expose and
//! which association or lazy property each one drives. Instances dispatch
//! over the four accessor kinds instead of carrying per-instance closures.

pub mod extend;
pub mod lazy;
pub mod many;
pub mod one;
pub mod registry;

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{ModelError, ModelResult};
use crate::instance::Instance;

pub use extend::{ExtendAccessor, ExtendAssociation};
pub use lazy::LazyAccessor;
pub use many::{ManyAccessor, ManyAssociation, ManyQuery};
pub use one::{OneAccessor, OneAssociation};
pub use registry::ModelRegistry;

/// What a capability name refers to on the owning model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Lazy { property: String },
    One(usize),
    Many(usize),
    Extend(usize),
}

impl Capability {
    pub fn kind(&self) -> AccessorKind {
        match self {
            Capability::Lazy { .. } => AccessorKind::Lazy,
            Capability::One(_) => AccessorKind::One,
            Capability::Many(_) => AccessorKind::Many,
            Capability::Extend(_) => AccessorKind::Extend,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessorKind {
    Lazy,
    One,
    Many,
    Extend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessorOp {
    Get,
    Set,
    Has,
    Add,
    Remove,
}

impl AccessorOp {
    pub fn prefix(self) -> &'static str {
        match self {
            AccessorOp::Get => "get",
            AccessorOp::Set => "set",
            AccessorOp::Has => "has",
            AccessorOp::Add => "add",
            AccessorOp::Remove => "remove",
        }
    }

    fn supported_by(kind: AccessorKind) -> &'static [AccessorOp] {
        match kind {
            AccessorKind::Lazy => &[AccessorOp::Get, AccessorOp::Set, AccessorOp::Remove],
            AccessorKind::One | AccessorKind::Extend => &[
                AccessorOp::Get,
                AccessorOp::Set,
                AccessorOp::Has,
                AccessorOp::Remove,
            ],
            AccessorKind::Many => &[
                AccessorOp::Get,
                AccessorOp::Set,
                AccessorOp::Has,
                AccessorOp::Add,
                AccessorOp::Remove,
            ],
        }
    }
}

/// One named accessor method an instance exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessorMethod {
    pub name: String,
    /// Association or property the method operates on
    pub target: String,
    pub kind: AccessorKind,
    pub op: AccessorOp,
}

fn method_name(op: AccessorOp, target: &str) -> String {
    let mut chars = target.chars();
    let capitalized: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    format!("{}{}", op.prefix(), capitalized)
}

/// Schema-derived accessor table, computed once per model.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    by_name: HashMap<String, Capability>,
    methods: Vec<AccessorMethod>,
}

impl CapabilityTable {
    pub fn build(
        lazy: &[String],
        one: &[OneAssociation],
        many: &[ManyAssociation],
        extend: &[ExtendAssociation],
    ) -> ModelResult<Self> {
        let mut table = CapabilityTable::default();

        for property in lazy {
            table.add(
                property,
                Capability::Lazy {
                    property: property.clone(),
                },
            )?;
        }
        for (idx, assoc) in one.iter().enumerate() {
            table.add(&assoc.name, Capability::One(idx))?;
        }
        for (idx, assoc) in many.iter().enumerate() {
            table.add(&assoc.name, Capability::Many(idx))?;
        }
        for (idx, assoc) in extend.iter().enumerate() {
            table.add(&assoc.name, Capability::Extend(idx))?;
        }

        Ok(table)
    }

    fn add(&mut self, name: &str, capability: Capability) -> ModelResult<()> {
        if self.by_name.contains_key(name) {
            return Err(ModelError::Schema(format!(
                "'{name}' is declared more than once"
            )));
        }

        let kind = capability.kind();
        for &op in AccessorOp::supported_by(kind) {
            let method = method_name(op, name);
            if self.methods.iter().any(|m| m.name == method) {
                return Err(ModelError::Schema(format!(
                    "accessor '{method}' would be defined twice"
                )));
            }
            self.methods.push(AccessorMethod {
                name: method,
                target: name.to_string(),
                kind,
                op,
            });
        }
        self.by_name.insert(name.to_string(), capability);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&Capability> {
        self.by_name.get(name)
    }

    pub fn method(&self, name: &str) -> Option<&AccessorMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn methods(&self) -> &[AccessorMethod] {
        &self.methods
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Fetch state of one association on one instance.
#[derive(Debug, Clone, Default)]
pub enum AssociationState {
    #[default]
    Unfetched,
    Fetching,
    Fetched(AssociationValue),
}

impl AssociationState {
    pub fn is_fetched(&self) -> bool {
        matches!(self, AssociationState::Fetched(_))
    }

    pub fn value(&self) -> Option<&AssociationValue> {
        match self {
            AssociationState::Fetched(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AssociationValue {
    One(Option<Instance>),
    Many(Vec<Instance>),
    Extend(Option<Instance>),
}

/// Typed handle for one capability of one instance.
pub enum Accessor<'a> {
    Lazy(LazyAccessor<'a>),
    One(OneAccessor<'a>),
    Many(ManyAccessor<'a>),
    Extend(ExtendAccessor<'a>),
}

impl<'a> Accessor<'a> {
    pub fn kind(&self) -> AccessorKind {
        match self {
            Accessor::Lazy(_) => AccessorKind::Lazy,
            Accessor::One(_) => AccessorKind::One,
            Accessor::Many(_) => AccessorKind::Many,
            Accessor::Extend(_) => AccessorKind::Extend,
        }
    }
}

/// Argument of a dynamically dispatched accessor call.
#[derive(Debug, Clone, Default)]
pub enum AccessorArg {
    #[default]
    None,
    Value(Value),
    Instances(Vec<Instance>),
    Query(ManyQuery),
}

/// Result of a dynamically dispatched accessor call.
#[derive(Debug, Clone)]
pub enum AccessorOutput {
    Done,
    Bool(bool),
    Value(Value),
    One(Option<Instance>),
    Many(Vec<Instance>),
}

fn mismatch(method: &str, expected: &str) -> ModelError {
    ModelError::Schema(format!("{method} expects {expected}"))
}

impl Instance {
    /// Handle for the association or lazy property called `name`.
    pub fn accessor(&self, name: &str) -> ModelResult<Accessor<'_>> {
        let model = self.model();
        let capability = model
            .capabilities()
            .lookup(name)
            .ok_or_else(|| ModelError::not_defined(model.table(), name))?;

        Ok(match capability {
            Capability::Lazy { property } => Accessor::Lazy(LazyAccessor::new(self, property)),
            Capability::One(idx) => {
                Accessor::One(OneAccessor::new(self, &model.one_associations()[*idx]))
            }
            Capability::Many(idx) => {
                Accessor::Many(ManyAccessor::new(self, &model.many_associations()[*idx]))
            }
            Capability::Extend(idx) => {
                Accessor::Extend(ExtendAccessor::new(self, &model.extend_associations()[*idx]))
            }
        })
    }

    pub fn one(&self, name: &str) -> ModelResult<OneAccessor<'_>> {
        match self.accessor(name)? {
            Accessor::One(accessor) => Ok(accessor),
            _ => Err(ModelError::not_defined(self.model().table(), name)),
        }
    }

    pub fn many(&self, name: &str) -> ModelResult<ManyAccessor<'_>> {
        match self.accessor(name)? {
            Accessor::Many(accessor) => Ok(accessor),
            _ => Err(ModelError::not_defined(self.model().table(), name)),
        }
    }

    pub fn extension(&self, name: &str) -> ModelResult<ExtendAccessor<'_>> {
        match self.accessor(name)? {
            Accessor::Extend(accessor) => Ok(accessor),
            _ => Err(ModelError::not_defined(self.model().table(), name)),
        }
    }

    pub fn lazy(&self, name: &str) -> ModelResult<LazyAccessor<'_>> {
        match self.accessor(name)? {
            Accessor::Lazy(accessor) => Ok(accessor),
            _ => Err(ModelError::not_defined(self.model().table(), name)),
        }
    }

    /// Call an accessor method by name, e.g. `getOwner` or `addPets`.
    pub async fn invoke(&self, method: &str, arg: AccessorArg) -> ModelResult<AccessorOutput> {
        let entry = self
            .model()
            .capabilities()
            .method(method)
            .cloned()
            .ok_or_else(|| ModelError::not_defined(self.model().table(), method))?;

        match (self.accessor(&entry.target)?, entry.op) {
            (Accessor::Lazy(lazy), AccessorOp::Get) => Ok(AccessorOutput::Value(lazy.get().await?)),
            (Accessor::Lazy(lazy), AccessorOp::Set) => match arg {
                AccessorArg::Value(value) => lazy.set(value).map(|_| AccessorOutput::Done),
                _ => Err(mismatch(method, "a value")),
            },
            (Accessor::Lazy(lazy), _) => lazy.remove().map(|_| AccessorOutput::Done),

            (Accessor::One(one), AccessorOp::Get) => Ok(AccessorOutput::One(one.get().await?)),
            (Accessor::One(one), AccessorOp::Set) => match arg {
                AccessorArg::Instances(items) if items.len() == 1 => {
                    one.set(&items[0]).await.map(|_| AccessorOutput::Done)
                }
                _ => Err(mismatch(method, "one instance")),
            },
            (Accessor::One(one), AccessorOp::Has) => Ok(AccessorOutput::Bool(one.has().await?)),
            (Accessor::One(one), _) => one.remove().map(|_| AccessorOutput::Done),

            (Accessor::Many(many), AccessorOp::Get) => {
                let query = match arg {
                    AccessorArg::Query(query) => query,
                    _ => ManyQuery::default(),
                };
                Ok(AccessorOutput::Many(many.get_with(query).await?))
            }
            (Accessor::Many(many), op) => {
                let items = match arg {
                    AccessorArg::Instances(items) => items,
                    AccessorArg::None if op == AccessorOp::Remove => Vec::new(),
                    _ => return Err(mismatch(method, "instances")),
                };
                match op {
                    AccessorOp::Set => many.set(&items).await.map(|_| AccessorOutput::Done),
                    AccessorOp::Add => many.add(&items).await.map(|_| AccessorOutput::Done),
                    AccessorOp::Has => Ok(AccessorOutput::Bool(many.has(&items).await?)),
                    _ => many.remove(&items).await.map(|_| AccessorOutput::Done),
                }
            }

            (Accessor::Extend(ext), AccessorOp::Get) => {
                Ok(AccessorOutput::One(ext.get().await?))
            }
            (Accessor::Extend(ext), AccessorOp::Set) => match arg {
                AccessorArg::Value(Value::Object(data)) => {
                    ext.set(data).await.map(|i| AccessorOutput::One(Some(i)))
                }
                _ => Err(mismatch(method, "an object")),
            },
            (Accessor::Extend(ext), AccessorOp::Has) => Ok(AccessorOutput::Bool(ext.has().await?)),
            (Accessor::Extend(ext), _) => ext.remove().await.map(|_| AccessorOutput::Done),
        }
    }
}
