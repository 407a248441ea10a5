//! Identity map
//!
//! One live [`Instance`] per identity key (`driver-uid/table/id1/id2...`).
//! Concurrent lookups for a key whose build is still in flight join that build
//! instead of starting another, so the build future runs at most once per
//! identity while its slot is alive.
//!
//! Nested lookups issued from inside a build (auto-fetch) never join another
//! in-flight build: two builds fetching each other would otherwise wait on one
//! another forever. They get a detached, uncached instance instead.
//!
//! The slot table is guarded by a synchronous mutex that is never held across
//! an await point; the check-then-insert step happens entirely under it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ModelResult;
use crate::instance::Instance;
use crate::settings::CachePolicy;

type SharedBuild = Shared<BoxFuture<'static, ModelResult<Instance>>>;

enum Slot {
    Building { generation: u64, build: SharedBuild },
    Ready {
        instance: Instance,
        expires_at: Option<Instant>,
    },
}

/// Identity keys of the builds currently on the stack of a construction.
///
/// A build that asks for one of its own ancestors gets a fresh, uncached
/// instance instead of waiting on itself.
#[derive(Debug, Clone, Default)]
pub struct Ancestry(Arc<Vec<String>>);

impl Ancestry {
    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|k| k == key)
    }

    pub fn with(&self, key: &str) -> Ancestry {
        let mut keys = (*self.0).clone();
        keys.push(key.to_string());
        Ancestry(Arc::new(keys))
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

/// How a single lookup may use the map.
#[derive(Debug, Clone, Default)]
pub struct LookupOptions {
    pub cache: CachePolicy,
    /// Rebuild instead of reusing a cached instance with unsaved changes
    pub save_check: bool,
    pub ancestry: Ancestry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityMapStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub stale_rebuilds: u64,
    pub uncached_builds: u64,
    pub entries: usize,
}

impl IdentityMapStats {
    /// Lookups answered without starting a build
    pub fn reuse_ratio(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.coalesced) as f64 / total as f64
        }
    }
}

impl fmt::Display for IdentityMapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IdentityMap Stats: {} entries, {} hits, {} misses, {} coalesced ({:.1}% reuse)",
            self.entries,
            self.hits,
            self.misses,
            self.coalesced,
            self.reuse_ratio() * 100.0
        )
    }
}

enum Lookup {
    Hit(Instance),
    Uncached(BoxFuture<'static, ModelResult<Instance>>),
    Detached(BoxFuture<'static, ModelResult<Instance>>),
    Join(SharedBuild),
    Lead(SharedBuild),
}

#[derive(Default)]
pub struct IdentityMap {
    slots: Mutex<HashMap<String, Slot>>,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    stale_rebuilds: AtomicU64,
    uncached_builds: AtomicU64,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `key`, polling `build` only when no usable entry exists.
    ///
    /// Errors from a build are delivered to every caller joined on it and
    /// leave no entry behind.
    pub async fn get(
        self: &Arc<Self>,
        key: &str,
        options: &LookupOptions,
        build: BoxFuture<'static, ModelResult<Instance>>,
    ) -> ModelResult<Instance> {
        if !options.cache.is_enabled() {
            self.uncached_builds.fetch_add(1, Ordering::Relaxed);
            return build.await;
        }
        if options.ancestry.contains(key) {
            debug!(key, "re-entrant build, skipping identity map");
            self.uncached_builds.fetch_add(1, Ordering::Relaxed);
            return build.await;
        }

        let lookup = {
            let mut slots = self.slots.lock();

            let expired = matches!(
                slots.get(key),
                Some(Slot::Ready { expires_at: Some(at), .. }) if *at <= Instant::now()
            );
            if expired {
                debug!(key, "identity map entry expired");
                slots.remove(key);
            }

            match slots.get(key) {
                Some(Slot::Ready { instance, .. }) => {
                    if options.save_check && instance.is_dirty() {
                        Lookup::Uncached(build)
                    } else {
                        Lookup::Hit(instance.clone())
                    }
                }
                Some(Slot::Building { .. }) if options.ancestry.depth() > 0 => {
                    Lookup::Detached(build)
                }
                Some(Slot::Building { build: shared, .. }) => Lookup::Join(shared.clone()),
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let map = Arc::clone(self);
                    let owned_key = key.to_string();
                    let ttl = options.cache.ttl();

                    let shared = async move {
                        let result = build.await;
                        map.settle(&owned_key, generation, &result, ttl);
                        result
                    }
                    .boxed()
                    .shared();

                    slots.insert(
                        key.to_string(),
                        Slot::Building {
                            generation,
                            build: shared.clone(),
                        },
                    );
                    Lookup::Lead(shared)
                }
            }
        };

        match lookup {
            Lookup::Hit(instance) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, "identity map hit");
                Ok(instance)
            }
            Lookup::Uncached(build) => {
                self.stale_rebuilds.fetch_add(1, Ordering::Relaxed);
                debug!(key, "cached instance has unsaved changes, building a fresh one");
                build.await
            }
            Lookup::Detached(build) => {
                self.uncached_builds.fetch_add(1, Ordering::Relaxed);
                debug!(key, "nested lookup during in-flight build, building detached");
                build.await
            }
            Lookup::Join(shared) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key, "joining in-flight build");
                shared.await
            }
            Lookup::Lead(shared) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key, "identity map miss");
                shared.await
            }
        }
    }

    fn settle(
        &self,
        key: &str,
        generation: u64,
        result: &ModelResult<Instance>,
        ttl: Option<std::time::Duration>,
    ) {
        let mut slots = self.slots.lock();
        let current = matches!(
            slots.get(key),
            Some(Slot::Building { generation: g, .. }) if *g == generation
        );
        if !current {
            // Evicted while building; the result is still handed to the waiters.
            return;
        }

        match result {
            Ok(instance) => {
                slots.insert(
                    key.to_string(),
                    Slot::Ready {
                        instance: instance.clone(),
                        expires_at: ttl.map(|ttl| Instant::now() + ttl),
                    },
                );
            }
            Err(err) => {
                debug!(key, error = %err, "build failed, dropping slot");
                slots.remove(key);
            }
        }
    }

    /// Store a freshly inserted instance under `key` unless the key is taken.
    pub fn adopt(&self, key: &str, instance: &Instance, ttl: Option<std::time::Duration>) -> bool {
        let mut slots = self.slots.lock();
        if slots.contains_key(key) {
            return false;
        }
        slots.insert(
            key.to_string(),
            Slot::Ready {
                instance: instance.clone(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        debug!(key, "adopted saved instance");
        true
    }

    /// Cached instance for `key`, if one is ready.
    pub fn peek(&self, key: &str) -> Option<Instance> {
        match self.slots.lock().get(key) {
            Some(Slot::Ready { instance, .. }) => Some(instance.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Drop the entry for `key`. Returns whether one existed.
    pub fn evict(&self, key: &str) -> bool {
        let removed = self.slots.lock().remove(key).is_some();
        if removed {
            debug!(key, "evicted from identity map");
        }
        removed
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn evict_prefix(&self, prefix: &str) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|key, _| !key.starts_with(prefix));
        before - slots.len()
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn stats(&self) -> IdentityMapStats {
        IdentityMapStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            stale_rebuilds: self.stale_rebuilds.load(Ordering::Relaxed),
            uncached_builds: self.uncached_builds.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    pub fn reset_stats(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.coalesced,
            &self.stale_rebuilds,
            &self.uncached_builds,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityMap")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestry_is_persistent() {
        let root = Ancestry::default();
        let child = root.with("d/person/1");
        let grandchild = child.with("d/pet/4");

        assert!(!root.contains("d/person/1"));
        assert!(child.contains("d/person/1"));
        assert!(grandchild.contains("d/person/1"));
        assert!(grandchild.contains("d/pet/4"));
        assert_eq!(grandchild.depth(), 2);
    }

    #[test]
    fn test_stats_display() {
        let stats = IdentityMapStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.reuse_ratio(), 0.75);
        assert!(stats.to_string().contains("75.0% reuse"));
    }

    #[test]
    fn test_evict_prefix() {
        let map = IdentityMap::new();
        assert_eq!(map.evict_prefix("d/person/"), 0);
        assert!(map.is_empty());
    }
}
