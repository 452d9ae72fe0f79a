//! `ModelCache` — bounded, recency-ordered index of resident resources.
//!
//! ## Locking discipline
//!
//! The index (`lru::LruCache` behind a `parking_lot::Mutex`) is the single
//! piece of shared mutable state. Every critical section is short
//! bookkeeping: lookup, insert, evict. The build itself runs in
//! `spawn_blocking` with no lock held, so a slow build never stalls
//! unrelated cache operations.
//!
//! ## Build coalescing
//!
//! At most one in-flight build per resource name. The first misser becomes
//! the leader and builds; concurrent missers for the same name wait on the
//! leader's `BuildCell` and receive the same handle (or the same failure).
//!
//! ## Eviction
//!
//! Capacity eviction takes the least-recently-used entry whose priority is
//! below the protected threshold, falling back to the LRU entry regardless
//! of priority when everything resident is protected. The memory-pressure
//! pass may take protected entries too — surviving low memory outranks
//! priority protection.

pub mod batch;

pub use batch::BatchLoader;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::diagnostics::{unix_now, EngineCounters, ErrorLog};
use crate::error::{AxonError, Result};
use crate::loader::{LoaderRegistry, ModelResource, PerformanceMode};
use crate::telemetry::TelemetrySnapshot;

/// Cache-facing configuration, extracted from the engine config.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of resident resources. Default: 5.
    pub max_resident: usize,
    /// Entries at or above this priority are evicted only as a last resort
    /// and reloaded on performance-mode changes. Default: 8.
    pub protected_priority: u8,
    /// Minimum entries retained by the memory-pressure pass. Default: 2.
    pub min_retained: usize,
    /// Available memory below this (GB) triggers the pressure pass. Default: 1.0.
    pub low_memory_gb: f32,
    /// Memory usage above this (percent) triggers the pressure pass. Default: 85.
    pub high_mem_percent: f32,
    /// Bounded wait for a single build. Default: 120 s.
    pub build_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_resident: 5,
            protected_priority: 8,
            min_retained: 2,
            low_memory_gb: 1.0,
            high_mem_percent: 85.0,
            build_timeout: Duration::from_secs(120),
        }
    }
}

/// Descriptive metadata tracked per resident resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub memory_estimate_gb: f32,
    /// 1–10; 10 is evicted last.
    pub priority: u8,
    pub last_used_unix_secs: f64,
    pub load_count: u64,
}

/// Shared handle to a built resource plus its metadata.
///
/// Ownership is shared between the cache and any caller holding a clone.
/// Eviction removes only the cache's clone — a handle previously returned
/// from [`ModelCache::get_or_load`] stays valid until the caller drops it.
#[derive(Clone)]
pub struct ModelHandle {
    resource: Arc<dyn ModelResource>,
    metadata: Arc<Mutex<ResourceMetadata>>,
}

impl ModelHandle {
    pub fn resource(&self) -> Arc<dyn ModelResource> {
        Arc::clone(&self.resource)
    }

    /// Snapshot of the current metadata.
    pub fn metadata(&self) -> ResourceMetadata {
        self.metadata.lock().clone()
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.metadata.lock().name)
            .finish_non_exhaustive()
    }
}

/// Shared completion cell for one in-flight build.
#[derive(Default)]
struct BuildCell {
    outcome: Mutex<Option<std::result::Result<ModelHandle, String>>>,
    notify: Notify,
}

impl BuildCell {
    fn complete(&self, outcome: std::result::Result<ModelHandle, String>) {
        *self.outcome.lock() = Some(outcome);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> std::result::Result<ModelHandle, String> {
        loop {
            // Register before checking so a completion between the check and
            // the await cannot be missed.
            let notified = self.notify.notified();
            if let Some(outcome) = self.outcome.lock().clone() {
                return outcome;
            }
            notified.await;
        }
    }
}

/// The bounded set of resident resources.
pub struct ModelCache {
    config: CacheConfig,
    registry: Arc<LoaderRegistry>,
    mode: Arc<Mutex<PerformanceMode>>,
    index: Mutex<LruCache<String, ModelHandle>>,
    in_flight: Mutex<HashMap<String, Arc<BuildCell>>>,
    usage: Mutex<HashMap<String, u64>>,
    counters: Arc<EngineCounters>,
    errors: Arc<ErrorLog>,
}

impl ModelCache {
    pub fn new(
        config: CacheConfig,
        registry: Arc<LoaderRegistry>,
        mode: Arc<Mutex<PerformanceMode>>,
        counters: Arc<EngineCounters>,
        errors: Arc<ErrorLog>,
    ) -> Self {
        let config = CacheConfig {
            max_resident: config.max_resident.max(1),
            ..config
        };
        Self {
            config,
            registry,
            mode,
            // Capacity is enforced manually so priority rules decide the
            // victim, never the LRU structure itself.
            index: Mutex::new(LruCache::unbounded()),
            in_flight: Mutex::new(HashMap::new()),
            usage: Mutex::new(HashMap::new()),
            counters,
            errors,
        }
    }

    /// Return the resident handle for `name`, building it on a miss.
    ///
    /// Hits promote recency and bump `last_used` / `load_count` without
    /// touching the loader registry. Misses validate capabilities, then
    /// coalesce onto a single build per name.
    ///
    /// # Errors
    /// - `AxonError::UnknownResource` — nothing registered under `name`.
    /// - `AxonError::DependencyMissing` — capability check failed; cache untouched.
    /// - `AxonError::LoadFailure` / `AxonError::BuildTimeout` — build failed.
    pub async fn get_or_load(&self, name: &str, priority: u8) -> Result<ModelHandle> {
        let priority = priority.clamp(1, 10);

        if let Some(handle) = self.lookup_resident(name) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.bump_usage(name);
            debug!(name, "cache hit");
            return Ok(handle);
        }

        // Capability validation happens before any cache mutation and before
        // joining the in-flight map, so a failed check cannot poison waiters.
        let builder = self
            .registry
            .builder(name)
            .ok_or_else(|| AxonError::UnknownResource { name: name.into() })?;
        if let Some(capability) = self.registry.missing_dependencies(name).into_iter().next() {
            self.errors.record(
                format!("load:{name}"),
                format!("missing capability '{capability}'"),
            );
            return Err(AxonError::DependencyMissing {
                name: name.into(),
                capability,
            });
        }

        enum Role {
            Leader(Arc<BuildCell>),
            Follower(Arc<BuildCell>),
        }

        let role = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(name) {
                Some(cell) => Role::Follower(Arc::clone(cell)),
                None => {
                    let cell = Arc::new(BuildCell::default());
                    in_flight.insert(name.to_string(), Arc::clone(&cell));
                    Role::Leader(cell)
                }
            }
        };

        match role {
            Role::Follower(cell) => {
                debug!(name, "coalescing onto in-flight build");
                let outcome = cell.wait().await;
                if outcome.is_ok() {
                    self.bump_usage(name);
                }
                outcome.map_err(|detail| AxonError::LoadFailure {
                    name: name.into(),
                    detail,
                })
            }
            Role::Leader(cell) => {
                let result = self
                    .build_and_insert(name, priority, Arc::clone(&builder))
                    .await;
                self.in_flight.lock().remove(name);
                match &result {
                    Ok(handle) => cell.complete(Ok(handle.clone())),
                    Err(e) => cell.complete(Err(e.to_string())),
                }
                result
            }
        }
    }

    async fn build_and_insert(
        &self,
        name: &str,
        priority: u8,
        builder: Arc<dyn crate::loader::ModelBuilder>,
    ) -> Result<ModelHandle> {
        // A previous leader may have completed between our miss and our
        // registration; one more residency check avoids a duplicate build.
        if let Some(handle) = self.lookup_resident(name) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.bump_usage(name);
            return Ok(handle);
        }

        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        let mode = *self.mode.lock();
        let started = Instant::now();

        let build = {
            let builder = Arc::clone(&builder);
            tokio::task::spawn_blocking(move || builder.build(mode))
        };
        let resource = match tokio::time::timeout(self.config.build_timeout, build).await {
            Err(_) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                self.errors.record(format!("load:{name}"), "build timed out");
                warn!(name, timeout_ms = self.config.build_timeout.as_millis() as u64, "build timed out");
                return Err(AxonError::BuildTimeout { name: name.into() });
            }
            Ok(Err(join_err)) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                self.errors
                    .record(format!("load:{name}"), join_err.to_string());
                return Err(AxonError::LoadFailure {
                    name: name.into(),
                    detail: join_err.to_string(),
                });
            }
            Ok(Ok(Err(e))) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                self.errors.record(format!("load:{name}"), e.to_string());
                warn!(name, error = %e, "build failed");
                return Err(AxonError::LoadFailure {
                    name: name.into(),
                    detail: e.to_string(),
                });
            }
            Ok(Ok(Ok(resource))) => resource,
        };

        let handle = ModelHandle {
            resource,
            metadata: Arc::new(Mutex::new(ResourceMetadata {
                name: name.to_string(),
                version: builder.version(),
                dependencies: builder.dependencies(),
                memory_estimate_gb: builder.memory_estimate_gb(),
                priority,
                last_used_unix_secs: unix_now(),
                load_count: 1,
            })),
        };

        {
            let mut index = self.index.lock();
            index.put(name.to_string(), handle.clone());
            self.evict_over_capacity(&mut index);
        }

        self.counters.loads_completed.fetch_add(1, Ordering::Relaxed);
        self.bump_usage(name);
        info!(
            name,
            priority,
            mode = ?mode,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "resource loaded"
        );
        Ok(handle)
    }

    /// Remove `name` from the cache, giving the resource a cleanup chance.
    ///
    /// Idempotent: returns `false` when `name` is not resident. Handles held
    /// by callers remain valid.
    pub fn unload(&self, name: &str) -> bool {
        let removed = self.index.lock().pop(name);
        match removed {
            Some(handle) => {
                handle.resource.release();
                self.counters.unloads.fetch_add(1, Ordering::Relaxed);
                info!(name, "resource unloaded");
                true
            }
            None => false,
        }
    }

    /// Memory-pressure pass: when telemetry reports low available memory or
    /// high usage, evict oldest-first down to `min_retained`, still
    /// preferring unprotected entries but taking protected ones if needed.
    pub fn handle_memory_pressure(&self, snapshot: &TelemetrySnapshot) {
        let low_available = snapshot.available_mem_gb > 0.0
            && snapshot.available_mem_gb < self.config.low_memory_gb;
        let high_usage = snapshot.mem_percent > self.config.high_mem_percent;
        if !low_available && !high_usage {
            return;
        }

        warn!(
            available_gb = snapshot.available_mem_gb,
            mem_percent = snapshot.mem_percent,
            "memory pressure — shrinking model cache"
        );
        self.evict_down_to(self.config.min_retained);
    }

    /// Evict until at most `retained` entries remain.
    pub fn evict_down_to(&self, retained: usize) {
        let mut index = self.index.lock();
        while index.len() > retained {
            let Some(victim) = Self::select_victim(&index, self.config.protected_priority) else {
                break;
            };
            Self::evict_entry(&mut index, &victim, "pressure", &self.counters);
        }
    }

    /// Unload and rebuild every protected-priority entry so its load-time
    /// parameters reflect `mode`. Failures are logged and skipped; the
    /// remaining entries still reload.
    pub async fn reload_protected(&self) {
        let protected: Vec<(String, u8)> = {
            let index = self.index.lock();
            index
                .iter()
                .filter(|(_, handle)| {
                    handle.metadata().priority >= self.config.protected_priority
                })
                .map(|(name, handle)| (name.clone(), handle.metadata().priority))
                .collect()
        };

        for (name, priority) in protected {
            self.unload(&name);
            if let Err(e) = self.get_or_load(&name, priority).await {
                self.errors
                    .record(format!("reload:{name}"), e.to_string());
                warn!(name = %name, error = %e, "protected reload failed");
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.lock().contains(name)
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    /// Resident names, most recently used first.
    pub fn resident_names(&self) -> Vec<String> {
        self.index.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Metadata snapshots for every resident resource, most recent first.
    pub fn metadata_snapshot(&self) -> Vec<ResourceMetadata> {
        self.index
            .lock()
            .iter()
            .map(|(_, handle)| handle.metadata())
            .collect()
    }

    /// The `n` most-used names that are not currently resident.
    pub fn top_unresident_usage(&self, n: usize) -> Vec<String> {
        let mut entries: Vec<(String, u64)> = {
            let usage = self.usage.lock();
            let index = self.index.lock();
            usage
                .iter()
                .filter(|(name, _)| !index.contains(name.as_str()))
                .map(|(name, count)| (name.clone(), *count))
                .collect()
        };
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.into_iter().take(n).map(|(name, _)| name).collect()
    }

    pub fn usage_count(&self, name: &str) -> u64 {
        self.usage.lock().get(name).copied().unwrap_or(0)
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn lookup_resident(&self, name: &str) -> Option<ModelHandle> {
        let mut index = self.index.lock();
        let handle = index.get(name)?.clone();
        {
            let mut meta = handle.metadata.lock();
            meta.last_used_unix_secs = unix_now();
            meta.load_count += 1;
        }
        Some(handle)
    }

    fn bump_usage(&self, name: &str) {
        *self.usage.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    fn evict_over_capacity(&self, index: &mut LruCache<String, ModelHandle>) {
        while index.len() > self.config.max_resident {
            let Some(victim) = Self::select_victim(index, self.config.protected_priority) else {
                break;
            };
            Self::evict_entry(index, &victim, "capacity", &self.counters);
        }
    }

    /// Least-recently-used entry below the protected threshold, falling back
    /// to the plain LRU entry when everything is protected.
    fn select_victim(
        index: &LruCache<String, ModelHandle>,
        protected_priority: u8,
    ) -> Option<String> {
        let unprotected = index
            .iter()
            .rev()
            .find(|(_, handle)| handle.metadata().priority < protected_priority)
            .map(|(name, _)| name.clone());
        match unprotected {
            Some(name) => Some(name),
            None => index.iter().rev().next().map(|(name, _)| name.clone()),
        }
    }

    fn evict_entry(
        index: &mut LruCache<String, ModelHandle>,
        name: &str,
        reason: &str,
        counters: &EngineCounters,
    ) {
        if let Some(handle) = index.pop(name) {
            handle.resource.release();
            counters.evictions.fetch_add(1, Ordering::Relaxed);
            info!(name, reason, "resource evicted");
        }
    }
}
