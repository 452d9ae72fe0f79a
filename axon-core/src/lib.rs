//! # axon-core
//!
//! Adaptive model loading, caching, and dispatch engine.
//!
//! ## Architecture
//!
//! ```text
//! caller ──► AxonEngine ──► Dispatcher ──► TaskRegistry (candidate backends)
//!                │               │
//!                │               └──► PerformanceHistory (latency samples)
//!                │
//!                └──► ModelCache ──► LoaderRegistry (cache miss → build)
//!                       ▲   ▲
//!        AutoOptimizer ─┘   └─ PredictivePreloader
//!               │
//!        SystemMonitor (telemetry snapshots, anomaly detection)
//! ```
//!
//! Model construction is expensive (seconds) and residency is costly
//! (hundreds of MB to several GB), so the cache coalesces concurrent builds
//! per name, evicts by recency and priority, and reacts to telemetry
//! (memory pressure, thermal, battery) through the background optimizer.
//! Collaborators supply the build functions, the task backends, and the
//! telemetry readings; this crate never performs inference itself.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod cache;
pub mod diagnostics;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod loader;
pub mod optimize;
pub mod telemetry;

// Convenience re-exports for downstream crates
pub use cache::{BatchLoader, ModelCache, ModelHandle, ResourceMetadata};
pub use diagnostics::{DiagnosticsReport, EngineCounters, HealthReport, HealthStatus};
pub use dispatch::{Dispatcher, TaskBackend, TaskRegistry};
pub use engine::{AxonEngine, EngineConfig};
pub use error::AxonError;
pub use loader::{
    CapabilityResolver, LoaderRegistry, ModelBuilder, ModelResource, PerformanceMode,
};
pub use optimize::{AutoOptimizer, OptimizerSettings, PredictivePreloader};
pub use telemetry::{SystemMonitor, TelemetryProbe, TelemetrySnapshot};
