//! Top-level engine: owns the cache, dispatcher, and background loops.
//!
//! `AxonEngine` is the single object an embedding application holds. It wires
//! the collaborator registries and the telemetry probe into the cache,
//! dispatcher, optimizer, and preloader, sharing one counter block and one
//! error log across all of them. Background loops are opt-in: the engine is
//! fully usable for loads and dispatches without ever calling
//! [`AxonEngine::start_background`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{BatchLoader, CacheConfig, ModelCache, ModelHandle};
use crate::diagnostics::{
    health_report, unix_now, DiagnosticsReport, EngineCounters, ErrorLog, HealthReport,
};
use crate::dispatch::{Dispatcher, PerformanceHistory, TaskRegistry};
use crate::error::{AxonError, Result};
use crate::loader::{LoaderRegistry, PerformanceMode};
use crate::optimize::{AutoOptimizer, OptimizerSettings, PredictivePreloader};
use crate::telemetry::{SystemMonitor, TelemetryProbe};

/// How many recent errors, anomalies, and task records a diagnostics report
/// carries.
const REPORT_TAIL: usize = 20;

/// Engine-wide tunables. `Default` matches the production deployment profile.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum resident resources before eviction. Default: 5.
    pub max_resident: usize,
    /// Priority at or above which entries survive capacity eviction. Default: 8.
    pub protected_priority: u8,
    /// Floor of resident entries kept through memory-pressure eviction. Default: 2.
    pub min_retained: usize,
    /// Available memory (GB) below which pressure eviction starts. Default: 1.0.
    pub low_memory_gb: f32,
    /// Memory usage percent above which pressure eviction starts. Default: 85.
    pub high_mem_percent: f32,
    /// Bound on a single resource build. Default: 120s.
    pub build_timeout: Duration,
    /// Bound on a single task invocation. Default: 30s.
    pub invoke_timeout: Duration,
    /// Bound on one telemetry probe read. Default: 2s.
    pub telemetry_timeout: Duration,
    /// Telemetry sampling period for the monitor loop. Default: 2.5s.
    pub telemetry_period: Duration,
    /// Optimizer and preloader cycle period. Default: 2.5s.
    pub optimizer_period: Duration,
    /// Mode-derivation thresholds.
    pub optimizer: OptimizerSettings,
    /// How many absent resources each preload cycle warms. Default: 2.
    pub preload_top_n: usize,
    /// Priority assigned to preloaded resources. Default: 6.
    pub preload_priority: u8,
    /// Concurrent build bound for batch loads. Default: 4.
    pub max_concurrent_loads: usize,
    /// Fixed dispatcher RNG seed; `None` seeds from entropy.
    pub dispatch_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_resident: 5,
            protected_priority: 8,
            min_retained: 2,
            low_memory_gb: 1.0,
            high_mem_percent: 85.0,
            build_timeout: Duration::from_secs(120),
            invoke_timeout: Duration::from_secs(30),
            telemetry_timeout: Duration::from_secs(2),
            telemetry_period: Duration::from_millis(2500),
            optimizer_period: Duration::from_millis(2500),
            optimizer: OptimizerSettings::default(),
            preload_top_n: 2,
            preload_priority: 6,
            max_concurrent_loads: 4,
            dispatch_seed: None,
        }
    }
}

/// The assembled engine. Cheap to share behind an `Arc`.
pub struct AxonEngine {
    config: EngineConfig,
    counters: Arc<EngineCounters>,
    errors: Arc<ErrorLog>,
    mode: Arc<Mutex<PerformanceMode>>,
    cache: Arc<ModelCache>,
    batch: BatchLoader,
    history: Arc<PerformanceHistory>,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<SystemMonitor>,
    optimizer: Arc<AutoOptimizer>,
    preloader: Arc<PredictivePreloader>,
    background: Mutex<Option<Background>>,
}

struct Background {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl AxonEngine {
    pub fn new(
        config: EngineConfig,
        loaders: LoaderRegistry,
        tasks: TaskRegistry,
        probe: Arc<dyn TelemetryProbe>,
    ) -> Self {
        let counters = Arc::new(EngineCounters::default());
        let errors = Arc::new(ErrorLog::new());
        let mode = Arc::new(Mutex::new(PerformanceMode::default()));

        let cache = Arc::new(ModelCache::new(
            CacheConfig {
                max_resident: config.max_resident,
                protected_priority: config.protected_priority,
                min_retained: config.min_retained,
                low_memory_gb: config.low_memory_gb,
                high_mem_percent: config.high_mem_percent,
                build_timeout: config.build_timeout,
            },
            Arc::new(loaders),
            Arc::clone(&mode),
            Arc::clone(&counters),
            Arc::clone(&errors),
        ));
        let batch = BatchLoader::new(Arc::clone(&cache), config.max_concurrent_loads);

        let history = Arc::new(PerformanceHistory::new());
        let dispatcher = Arc::new(match config.dispatch_seed {
            Some(seed) => Dispatcher::with_seed(
                Arc::new(tasks),
                Arc::clone(&history),
                config.invoke_timeout,
                Arc::clone(&counters),
                Arc::clone(&errors),
                seed,
            ),
            None => Dispatcher::new(
                Arc::new(tasks),
                Arc::clone(&history),
                config.invoke_timeout,
                Arc::clone(&counters),
                Arc::clone(&errors),
            ),
        });

        let monitor = Arc::new(SystemMonitor::new(
            probe,
            config.telemetry_timeout,
            config.optimizer.high_temp_c,
            Arc::clone(&counters),
        ));
        let optimizer = Arc::new(AutoOptimizer::new(
            Arc::clone(&cache),
            Arc::clone(&monitor),
            Arc::clone(&mode),
            config.optimizer.clone(),
            Arc::clone(&counters),
        ));
        let preloader = Arc::new(PredictivePreloader::new(
            Arc::clone(&cache),
            config.preload_top_n,
            config.preload_priority,
            Arc::clone(&counters),
            Arc::clone(&errors),
        ));

        Self {
            config,
            counters,
            errors,
            mode,
            cache,
            batch,
            history,
            dispatcher,
            monitor,
            optimizer,
            preloader,
            background: Mutex::new(None),
        }
    }

    // ── Resource loading ─────────────────────────────────────────────────

    pub async fn get_or_load(&self, name: &str, priority: u8) -> Result<ModelHandle> {
        self.cache.get_or_load(name, priority).await
    }

    pub fn unload(&self, name: &str) -> bool {
        self.cache.unload(name)
    }

    pub async fn load_batch(
        &self,
        requests: &[(String, u8)],
    ) -> std::collections::HashMap<String, Result<ModelHandle>> {
        self.batch.load_batch(requests).await
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    pub async fn dispatch(&self, task: &str, payload: Value, context: Value) -> Result<Value> {
        self.dispatcher.dispatch(task, payload, context).await
    }

    // ── Mode control ─────────────────────────────────────────────────────

    pub fn performance_mode(&self) -> PerformanceMode {
        *self.mode.lock()
    }

    /// Manual override; reloads protected entries like an automatic switch.
    /// The optimizer will keep adjusting afterwards if it is running.
    pub async fn set_performance_mode(&self, mode: PerformanceMode) {
        self.optimizer.apply_mode(mode).await;
    }

    // ── Background loops ─────────────────────────────────────────────────

    /// Spawn the monitor, optimizer, and preloader loops.
    ///
    /// # Errors
    /// `AxonError::AlreadyRunning` when the loops are active.
    pub fn start_background(&self) -> Result<()> {
        let mut background = self.background.lock();
        if background.is_some() {
            return Err(AxonError::AlreadyRunning);
        }

        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(Arc::clone(&self.monitor).run(self.config.telemetry_period, rx.clone())),
            tokio::spawn(
                Arc::clone(&self.optimizer).run(self.config.optimizer_period, rx.clone()),
            ),
            tokio::spawn(Arc::clone(&self.preloader).run(self.config.optimizer_period, rx)),
        ];
        *background = Some(Background { shutdown, tasks });
        info!("background loops started");
        Ok(())
    }

    /// Signal the loops to stop and wait for them to exit.
    ///
    /// # Errors
    /// `AxonError::NotRunning` when no loops are active.
    pub async fn shutdown(&self) -> Result<()> {
        let Background { shutdown, tasks } = self
            .background
            .lock()
            .take()
            .ok_or(AxonError::NotRunning)?;

        // Receivers are alive until the loops exit; send cannot fail here,
        // but a panicked loop may already have dropped its end.
        let _ = shutdown.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }
        info!("background loops stopped");
        Ok(())
    }

    // ── Diagnostics ──────────────────────────────────────────────────────

    pub fn health_report(&self) -> HealthReport {
        health_report(
            self.errors.len(),
            self.monitor.anomaly_count(),
            self.monitor.latest().mem_percent,
        )
    }

    pub fn diagnostics_report(&self) -> DiagnosticsReport {
        let mut anomalies = self.monitor.anomalies_snapshot();
        if anomalies.len() > REPORT_TAIL {
            anomalies.drain(..anomalies.len() - REPORT_TAIL);
        }

        DiagnosticsReport {
            generated_at_unix_secs: unix_now(),
            performance_mode: self.performance_mode(),
            cached: self.cache.metadata_snapshot(),
            performance_averages: self.history.averages(),
            recent_errors: self.errors.recent(REPORT_TAIL),
            recent_anomalies: anomalies,
            recent_tasks: self.dispatcher.recent_tasks(REPORT_TAIL),
            counters: self.counters.snapshot(),
            telemetry: self.monitor.latest(),
            health: self.health_report(),
        }
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<SystemMonitor> {
        &self.monitor
    }
}

impl std::fmt::Debug for AxonEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AxonEngine")
            .field("mode", &self.performance_mode())
            .field("resident", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::dispatch::TaskBackend;
    use crate::error::Result;
    use crate::loader::{ModelBuilder, ModelResource};
    use crate::telemetry::TelemetrySnapshot;

    struct NullResource;
    impl ModelResource for NullResource {}

    struct CountingBuilder {
        builds: Arc<AtomicUsize>,
    }

    impl ModelBuilder for CountingBuilder {
        fn build(&self, _mode: PerformanceMode) -> Result<Arc<dyn ModelResource>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullResource))
        }
    }

    struct EchoBackend;
    impl TaskBackend for EchoBackend {
        fn name(&self) -> &str {
            "echo"
        }

        fn invoke(&self, payload: &Value, _context: &Value) -> Result<Value> {
            Ok(json!({ "echoed": payload }))
        }
    }

    struct IdleProbe;
    impl crate::telemetry::TelemetryProbe for IdleProbe {
        fn snapshot(&self) -> Result<TelemetrySnapshot> {
            Ok(TelemetrySnapshot {
                cpu_percent: 12.0,
                mem_percent: 40.0,
                available_mem_gb: 8.0,
                temperature_c: 50.0,
                battery_percent: Some(90.0),
                plugged_in: Some(true),
            })
        }
    }

    fn engine() -> (Arc<AxonEngine>, Arc<AtomicUsize>) {
        let builds = Arc::new(AtomicUsize::new(0));
        let mut loaders = LoaderRegistry::new();
        for name in ["llm", "stt", "tts"] {
            loaders.register(
                name,
                CountingBuilder {
                    builds: Arc::clone(&builds),
                },
            );
        }
        let mut tasks = TaskRegistry::new();
        tasks.register("echo", EchoBackend);

        let config = EngineConfig {
            optimizer_period: Duration::from_millis(10),
            telemetry_period: Duration::from_millis(10),
            dispatch_seed: Some(7),
            ..EngineConfig::default()
        };
        let engine = Arc::new(AxonEngine::new(config, loaders, tasks, Arc::new(IdleProbe)));
        (engine, builds)
    }

    #[tokio::test]
    async fn serves_loads_and_dispatches_without_background_loops() {
        let (engine, builds) = engine();

        let handle = engine.get_or_load("llm", 7).await.unwrap();
        assert_eq!(handle.metadata().name, "llm");
        engine.get_or_load("llm", 7).await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        let reply = engine
            .dispatch("echo", json!({"text": "hi"}), json!({}))
            .await
            .unwrap();
        assert_eq!(reply["echoed"]["text"], "hi");
    }

    #[tokio::test]
    async fn batch_load_goes_through_the_shared_cache() {
        let (engine, builds) = engine();

        let results = engine
            .load_batch(&[("llm".into(), 8), ("stt".into(), 5), ("tts".into(), 5)])
            .await;
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| r.is_ok()));
        assert_eq!(builds.load(Ordering::SeqCst), 3);
        assert!(engine.cache().contains("llm"));
    }

    #[tokio::test]
    async fn background_lifecycle_guards_double_start_and_double_stop() {
        let (engine, _) = engine();

        engine.start_background().unwrap();
        assert!(matches!(
            engine.start_background(),
            Err(AxonError::AlreadyRunning)
        ));

        // Let the loops tick at least once.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(engine.diagnostics_report().counters.optimizer_cycles >= 1);

        tokio::time::timeout(Duration::from_secs(2), engine.shutdown())
            .await
            .expect("shutdown should not hang")
            .unwrap();
        assert!(matches!(engine.shutdown().await, Err(AxonError::NotRunning)));
    }

    #[tokio::test]
    async fn manual_mode_override_reloads_protected_entries() {
        let (engine, builds) = engine();

        engine.get_or_load("llm", 9).await.unwrap();
        engine.get_or_load("stt", 4).await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);

        engine
            .set_performance_mode(PerformanceMode::PowerSaver)
            .await;

        assert_eq!(engine.performance_mode(), PerformanceMode::PowerSaver);
        assert_eq!(builds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn diagnostics_report_reflects_engine_activity() {
        let (engine, _) = engine();

        engine.get_or_load("llm", 7).await.unwrap();
        engine
            .dispatch("echo", json!({"text": "ping"}), json!({}))
            .await
            .unwrap();
        let _ = engine.dispatch("missing", json!({}), json!({})).await;

        let report = engine.diagnostics_report();
        assert_eq!(report.cached.len(), 1);
        assert_eq!(report.cached[0].name, "llm");
        assert!(report.performance_averages.contains_key("echo/echo"));
        assert_eq!(report.recent_tasks.len(), 2);
        assert_eq!(report.counters.dispatch_calls, 2);
        assert_eq!(report.counters.dispatch_failures, 1);
        assert_eq!(report.recent_errors.len(), 1);
        assert!(report.health.health_score <= 100);

        let encoded = serde_json::to_string(&report).unwrap();
        assert!(encoded.contains("performanceMode"));
    }

    #[tokio::test]
    async fn health_report_degrades_as_errors_accumulate() {
        let (engine, _) = engine();
        let healthy = engine.health_report();
        assert_eq!(healthy.health_score, 100);

        for _ in 0..6 {
            let _ = engine.dispatch("missing", json!({}), json!({})).await;
        }
        let degraded = engine.health_report();
        assert!(degraded.health_score < healthy.health_score);
        assert_eq!(degraded.issue_count, 6);
    }
}
