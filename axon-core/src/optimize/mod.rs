//! Auto-optimization — telemetry-driven performance-mode selection.
//!
//! The optimizer runs on a fixed period, independent of caller traffic. Each
//! cycle takes a telemetry snapshot, derives a target mode from ordered
//! threshold rules (first match wins), reloads protected cache entries on a
//! transition, and runs the memory-pressure eviction pass. Cycle errors are
//! contained: logged, counted, and the loop continues.

pub mod preload;

pub use preload::PredictivePreloader;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cache::ModelCache;
use crate::diagnostics::EngineCounters;
use crate::loader::PerformanceMode;
use crate::telemetry::{SystemMonitor, TelemetrySnapshot};

/// Threshold rules for mode derivation.
#[derive(Debug, Clone)]
pub struct OptimizerSettings {
    /// Temperature over this (°C) forces power-saver. Default: 75.
    pub high_temp_c: f32,
    /// Battery below this percent (on battery power) forces power-saver. Default: 20.
    pub low_battery_percent: f32,
    /// Average temperature above this counts as "running warm". Default: 65.
    pub warm_temp_c: f32,
    /// Average temperature below this counts as "running cool". Default: 45.
    pub cool_temp_c: f32,
    /// A CPU reading above this percent counts as a high-CPU sample. Default: 80.
    pub high_cpu_percent: f32,
    /// Average CPU below this percent counts as "idle enough". Default: 30.
    pub low_cpu_percent: f32,
    /// High-CPU samples in the recent window needed to trigger relief. Default: 3.
    pub high_cpu_samples: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            high_temp_c: 75.0,
            low_battery_percent: 20.0,
            warm_temp_c: 65.0,
            cool_temp_c: 45.0,
            high_cpu_percent: 80.0,
            low_cpu_percent: 30.0,
            high_cpu_samples: 3,
        }
    }
}

/// Periodic mode controller.
pub struct AutoOptimizer {
    cache: Arc<ModelCache>,
    monitor: Arc<SystemMonitor>,
    mode: Arc<Mutex<PerformanceMode>>,
    settings: OptimizerSettings,
    counters: Arc<EngineCounters>,
}

impl AutoOptimizer {
    pub fn new(
        cache: Arc<ModelCache>,
        monitor: Arc<SystemMonitor>,
        mode: Arc<Mutex<PerformanceMode>>,
        settings: OptimizerSettings,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            cache,
            monitor,
            mode,
            settings,
            counters,
        }
    }

    pub fn current_mode(&self) -> PerformanceMode {
        *self.mode.lock()
    }

    /// Ordered threshold rules, evaluated top-down; first match wins.
    ///
    /// Zero temperature readings mean "sensor unavailable" and never push the
    /// mode toward extreme.
    pub fn derive_mode(&self, snapshot: &TelemetrySnapshot) -> PerformanceMode {
        let s = &self.settings;

        if snapshot.temperature_c > s.high_temp_c {
            return PerformanceMode::PowerSaver;
        }

        let on_battery = !snapshot.plugged_in.unwrap_or(true);
        if let Some(battery) = snapshot.battery_percent {
            if on_battery && battery < s.low_battery_percent {
                return PerformanceMode::PowerSaver;
            }
        }

        let high_cpu_count = self.monitor.recent_high_cpu(s.high_cpu_percent);
        let avg_temp = self.monitor.average_temperature().unwrap_or(0.0);
        if high_cpu_count >= s.high_cpu_samples && avg_temp > s.warm_temp_c {
            return PerformanceMode::PowerSaver;
        }

        let avg_cpu = self.monitor.average_cpu().unwrap_or(f32::MAX);
        if avg_temp > 0.0 && avg_temp < s.cool_temp_c && avg_cpu < s.low_cpu_percent {
            return PerformanceMode::Extreme;
        }

        PerformanceMode::Balanced
    }

    /// Switch to `target`, reloading protected entries on a real transition.
    pub async fn apply_mode(&self, target: PerformanceMode) {
        let previous = {
            let mut mode = self.mode.lock();
            let previous = *mode;
            *mode = target;
            previous
        };
        if previous == target {
            return;
        }

        self.counters.mode_changes.fetch_add(1, Ordering::Relaxed);
        info!(from = ?previous, to = ?target, "performance mode changed");
        // Protected entries carry mode-dependent load parameters; rebuild them.
        self.cache.reload_protected().await;
    }

    /// One optimizer pass: sample, derive, apply, relieve memory pressure.
    pub async fn cycle(&self) {
        self.counters.optimizer_cycles.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.monitor.sample().await;
        let target = self.derive_mode(&snapshot);
        self.apply_mode(target).await;
        self.cache.handle_memory_pressure(&snapshot);
    }

    /// Periodic loop. Exits when the shutdown signal flips to `true`.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cycle().await,
                changed = shutdown.changed() => {
                    // A dropped sender also means stop.
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("optimizer loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::cache::CacheConfig;
    use crate::diagnostics::ErrorLog;
    use crate::error::Result;
    use crate::loader::{LoaderRegistry, ModelBuilder, ModelResource};
    use crate::telemetry::TelemetryProbe;

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

    struct NoProbe;
    impl TelemetryProbe for NoProbe {
        fn snapshot(&self) -> Result<TelemetrySnapshot> {
            Ok(TelemetrySnapshot::default())
        }
    }

    struct Fixture {
        optimizer: AutoOptimizer,
        cache: Arc<ModelCache>,
        monitor: Arc<SystemMonitor>,
        builds: Arc<AtomicUsize>,
        counters: Arc<EngineCounters>,
    }

    fn fixture() -> Fixture {
        let counters = Arc::new(EngineCounters::default());
        let errors = Arc::new(ErrorLog::new());
        let mode = Arc::new(Mutex::new(PerformanceMode::Balanced));
        let builds = Arc::new(AtomicUsize::new(0));

        let mut registry = LoaderRegistry::new();
        for name in ["core_llm", "aux"] {
            registry.register(
                name,
                CountingBuilder {
                    builds: Arc::clone(&builds),
                },
            );
        }

        let cache = Arc::new(ModelCache::new(
            CacheConfig::default(),
            Arc::new(registry),
            Arc::clone(&mode),
            Arc::clone(&counters),
            Arc::clone(&errors),
        ));
        let monitor = Arc::new(SystemMonitor::new(
            Arc::new(NoProbe),
            Duration::from_millis(100),
            75.0,
            Arc::clone(&counters),
        ));

        let optimizer = AutoOptimizer::new(
            Arc::clone(&cache),
            Arc::clone(&monitor),
            mode,
            OptimizerSettings::default(),
            Arc::clone(&counters),
        );

        Fixture {
            optimizer,
            cache,
            monitor,
            builds,
            counters,
        }
    }

    #[test]
    fn hot_system_forces_power_saver_regardless_of_battery() {
        let f = fixture();
        let mode = f.optimizer.derive_mode(&TelemetrySnapshot {
            temperature_c: 80.0,
            battery_percent: Some(100.0),
            plugged_in: Some(true),
            ..Default::default()
        });
        assert_eq!(mode, PerformanceMode::PowerSaver);
    }

    #[test]
    fn low_battery_on_battery_power_forces_power_saver() {
        let f = fixture();
        let mode = f.optimizer.derive_mode(&TelemetrySnapshot {
            temperature_c: 40.0,
            battery_percent: Some(10.0),
            plugged_in: Some(false),
            ..Default::default()
        });
        assert_eq!(mode, PerformanceMode::PowerSaver);

        let plugged = f.optimizer.derive_mode(&TelemetrySnapshot {
            temperature_c: 40.0,
            battery_percent: Some(10.0),
            plugged_in: Some(true),
            ..Default::default()
        });
        assert_ne!(plugged, PerformanceMode::PowerSaver);
    }

    #[test]
    fn sustained_high_cpu_while_warm_forces_power_saver() {
        let f = fixture();
        for _ in 0..10 {
            f.monitor.record(TelemetrySnapshot {
                cpu_percent: 95.0,
                temperature_c: 70.0,
                ..Default::default()
            });
        }
        let mode = f.optimizer.derive_mode(&TelemetrySnapshot {
            temperature_c: 70.0,
            ..Default::default()
        });
        assert_eq!(mode, PerformanceMode::PowerSaver);
    }

    #[test]
    fn cool_and_idle_system_goes_extreme() {
        let f = fixture();
        for _ in 0..10 {
            f.monitor.record(TelemetrySnapshot {
                cpu_percent: 10.0,
                temperature_c: 38.0,
                ..Default::default()
            });
        }
        let mode = f.optimizer.derive_mode(&TelemetrySnapshot {
            temperature_c: 38.0,
            ..Default::default()
        });
        assert_eq!(mode, PerformanceMode::Extreme);
    }

    #[test]
    fn unknown_telemetry_defaults_to_balanced() {
        let f = fixture();
        let mode = f.optimizer.derive_mode(&TelemetrySnapshot::default());
        assert_eq!(mode, PerformanceMode::Balanced);
    }

    #[tokio::test]
    async fn mode_transition_reloads_protected_entries_only() {
        let f = fixture();
        f.cache.get_or_load("core_llm", 9).await.unwrap();
        f.cache.get_or_load("aux", 4).await.unwrap();
        assert_eq!(f.builds.load(Ordering::SeqCst), 2);

        f.optimizer.apply_mode(PerformanceMode::PowerSaver).await;

        // Protected entry rebuilt; unprotected untouched.
        assert_eq!(f.builds.load(Ordering::SeqCst), 3);
        assert!(f.cache.contains("core_llm"));
        assert!(f.cache.contains("aux"));
        assert_eq!(f.counters.snapshot().mode_changes, 1);
        assert_eq!(f.optimizer.current_mode(), PerformanceMode::PowerSaver);
    }

    #[tokio::test]
    async fn reapplying_the_same_mode_is_a_no_op() {
        let f = fixture();
        f.cache.get_or_load("core_llm", 9).await.unwrap();
        let before = f.builds.load(Ordering::SeqCst);

        f.optimizer.apply_mode(PerformanceMode::Balanced).await;

        assert_eq!(f.builds.load(Ordering::SeqCst), before);
        assert_eq!(f.counters.snapshot().mode_changes, 0);
    }

    #[tokio::test]
    async fn cycle_runs_memory_pressure_pass() {
        let f = fixture();
        f.cache.get_or_load("core_llm", 4).await.unwrap();
        f.cache.get_or_load("aux", 4).await.unwrap();

        // The NoProbe snapshot is all-zero, so no pressure is reported and
        // nothing is evicted.
        f.optimizer.cycle().await;
        assert_eq!(f.cache.len(), 2);
        assert_eq!(f.counters.snapshot().optimizer_cycles, 1);
    }
}
