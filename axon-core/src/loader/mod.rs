//! Loader registry — name → build function.
//!
//! The `ModelBuilder` trait is the primary extensibility point: new resource
//! kinds (speech, vision, language) are added by registering an implementation
//! at startup, never by string-based dynamic lookup. The cache consults the
//! registry on every miss; the registry itself is immutable after
//! construction, so lookups need no locking.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Process-wide policy setting affecting how resources are built.
///
/// Changed only by the auto-optimizer or an explicit manual override;
/// a transition triggers a reload of protected-priority cache entries so
/// load-time parameters reflect the new mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMode {
    /// Maximum throughput — larger batch sizes, full precision.
    Extreme,
    /// Default trade-off.
    #[default]
    Balanced,
    /// Thermal / battery relief — smaller footprints, reduced precision.
    PowerSaver,
}

/// An expensively constructed in-memory resource (a "model").
///
/// Implementors may hold GPU sessions, weight tensors, decoder state, etc.
/// The engine treats the resource as opaque.
pub trait ModelResource: Send + Sync + 'static {
    /// Release external state (GPU memory, file locks) ahead of drop.
    ///
    /// Called when the cache unloads or evicts the resource. Callers holding
    /// a shared handle may still use the resource afterwards; this is a
    /// cooperative cleanup hook, not an invalidation.
    fn release(&self) {}
}

/// Contract for building a named resource.
pub trait ModelBuilder: Send + Sync + 'static {
    /// Construct the resource. May take seconds; the cache never invokes this
    /// under its index lock, and bounds the wait with a timeout.
    ///
    /// # Errors
    /// Returns an error if model files are missing, corrupt, or the backend
    /// fails to initialise.
    fn build(&self, mode: PerformanceMode) -> Result<Arc<dyn ModelResource>>;

    /// Capabilities the collaborator environment must resolve before a build
    /// is attempted (e.g. `"gpu"`, `"onnx-runtime"`).
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Version string recorded in the resource metadata.
    fn version(&self) -> String {
        "0.0.0".into()
    }

    /// Estimated resident memory in GB, recorded in the metadata.
    fn memory_estimate_gb(&self) -> f32 {
        0.5
    }
}

/// Resolves capability identifiers declared by builders.
pub trait CapabilityResolver: Send + Sync + 'static {
    fn resolves(&self, capability: &str) -> bool;
}

/// Default resolver: every capability is considered available.
pub struct AllowAll;

impl CapabilityResolver for AllowAll {
    fn resolves(&self, _capability: &str) -> bool {
        true
    }
}

/// Immutable mapping from resource name to its builder.
pub struct LoaderRegistry {
    builders: HashMap<String, Arc<dyn ModelBuilder>>,
    resolver: Arc<dyn CapabilityResolver>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(AllowAll))
    }

    pub fn with_resolver(resolver: Arc<dyn CapabilityResolver>) -> Self {
        Self {
            builders: HashMap::new(),
            resolver,
        }
    }

    /// Register a builder under `name`, replacing any previous registration.
    pub fn register<B: ModelBuilder>(&mut self, name: impl Into<String>, builder: B) -> &mut Self {
        self.builders.insert(name.into(), Arc::new(builder));
        self
    }

    pub fn builder(&self, name: &str) -> Option<Arc<dyn ModelBuilder>> {
        self.builders.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Capabilities declared by `name`'s builder that the resolver cannot
    /// satisfy. Empty when the build may proceed.
    pub fn missing_dependencies(&self, name: &str) -> Vec<String> {
        let Some(builder) = self.builders.get(name) else {
            return Vec::new();
        };
        builder
            .dependencies()
            .into_iter()
            .filter(|cap| !self.resolver.resolves(cap))
            .collect()
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderRegistry")
            .field("builders", &self.builders.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
