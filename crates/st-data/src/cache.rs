//! Content-addressed, single-flight memoization for expensive computations.
//!
//! [`CacheLayer::get_or_compute`] runs a computation at most once per
//! [`CacheKey`]: concurrent callers with the same key block on a per-key
//! slot until the first caller finishes, then reuse its value. Failed
//! computations are never stored, so the next call retries them.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use st_types::TuneResult;

use crate::storage::CacheStore;

/// Value-equality cache key.
///
/// Built from a computation name plus named arguments and seeds, serialized
/// to canonical JSON (object keys sorted). Two keys are equal exactly when
/// their canonical forms are.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: String,
    digest: Uuid,
    canonical: String,
}

impl CacheKey {
    pub fn builder(name: impl Into<String>) -> CacheKeyBuilder {
        CacheKeyBuilder {
            name: name.into(),
            args: serde_json::Map::new(),
            seeds: serde_json::Map::new(),
            error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name-based UUID (v5) of the canonical form.
    pub fn digest(&self) -> Uuid {
        self.digest
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

#[derive(Debug)]
pub struct CacheKeyBuilder {
    name: String,
    args: serde_json::Map<String, serde_json::Value>,
    seeds: serde_json::Map<String, serde_json::Value>,
    error: Option<serde_json::Error>,
}

impl CacheKeyBuilder {
    pub fn arg<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.args.insert(name.to_string(), v);
            }
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn seed(mut self, name: &str, seed: u64) -> Self {
        self.seeds.insert(name.to_string(), serde_json::Value::from(seed));
        self
    }

    pub fn build(self) -> TuneResult<CacheKey> {
        if let Some(e) = self.error {
            return Err(e.into());
        }
        let canonical = serde_json::to_string(&serde_json::json!({
            "name": self.name,
            "args": self.args,
            "seeds": self.seeds,
        }))?;
        let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, canonical.as_bytes());
        Ok(CacheKey {
            name: self.name,
            digest,
            canonical,
        })
    }
}

type Slot = Arc<Mutex<Option<serde_json::Value>>>;

/// Get-or-compute store with optional disk persistence.
#[derive(Debug)]
pub struct CacheLayer {
    slots: DashMap<CacheKey, Slot>,
    store: Option<CacheStore>,
    stats: RwLock<CacheStats>,
}

impl CacheLayer {
    /// Process-lifetime cache with no persistence.
    pub fn in_memory() -> Self {
        Self {
            slots: DashMap::new(),
            store: None,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Cache persisted under `root`, surviving process restarts.
    pub fn persistent<P: AsRef<Path>>(root: P) -> TuneResult<Self> {
        Ok(Self {
            slots: DashMap::new(),
            store: Some(CacheStore::open(root)?),
            stats: RwLock::new(CacheStats::default()),
        })
    }

    pub fn store(&self) -> Option<&CacheStore> {
        self.store.as_ref()
    }

    /// Return the value stored under `key`, running `compute` only if no
    /// value exists yet. The per-key slot is held for the duration of
    /// `compute`, so concurrent callers for the same key wait instead of
    /// duplicating work; other keys proceed independently.
    pub fn get_or_compute<V, E, F>(&self, key: &CacheKey, compute: F) -> Result<V, E>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<V, E>,
    {
        let slot = Arc::clone(self.slots.entry(key.clone()).or_default().value());
        let mut guard = slot.lock();

        if let Some(stored) = guard.as_ref() {
            match serde_json::from_value::<V>(stored.clone()) {
                Ok(value) => {
                    self.stats.write().hits += 1;
                    debug!(key = key.name(), digest = %key.digest(), "cache hit");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(key = key.name(), "Discarding undecodable cache value: {}", e);
                    *guard = None;
                }
            }
        }

        if let Some(store) = &self.store {
            match store.load(key) {
                Ok(Some(stored)) => match serde_json::from_value::<V>(stored.clone()) {
                    Ok(value) => {
                        *guard = Some(stored);
                        self.stats.write().disk_hits += 1;
                        debug!(key = key.name(), digest = %key.digest(), "cache hit on disk");
                        return Ok(value);
                    }
                    Err(e) => warn!(key = key.name(), "Ignoring undecodable disk entry: {}", e),
                },
                Ok(None) => {}
                Err(e) => warn!(key = key.name(), "Failed to read disk entry: {}", e),
            }
        }

        self.stats.write().misses += 1;
        let value = match compute() {
            Ok(value) => value,
            Err(e) => {
                self.stats.write().failures += 1;
                debug!(key = key.name(), "computation failed, nothing stored");
                return Err(e);
            }
        };

        match serde_json::to_value(&value) {
            Ok(json) => {
                if let Some(store) = &self.store {
                    if let Err(e) = store.save(key, &json) {
                        warn!(key = key.name(), "Failed to persist cache entry: {}", e);
                    }
                }
                *guard = Some(json);
                self.stats.write().stores += 1;
            }
            Err(e) => warn!(key = key.name(), "Value not cacheable: {}", e),
        }

        Ok(value)
    }

    /// Whether a value for `key` is held in memory.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.slots
            .get(key)
            .map(|slot| slot.lock().is_some())
            .unwrap_or(false)
    }

    pub fn get_stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub failures: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits + self.disk_hits;
        if hits + self.misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + self.misses) as f64
        }
    }
}
