//! System telemetry — snapshots, rolling windows, anomaly detection.
//!
//! The `TelemetryProbe` trait is collaborator-supplied: this crate performs no
//! hardware sensing of its own and accepts readings as given, including
//! degraded or partial snapshots. A probe that hangs is cut off by a bounded
//! wait; the monitor then falls back to the last known snapshot so telemetry
//! problems never stall the engine.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::diagnostics::{unix_now, EngineCounters};
use crate::error::{AxonError, Result};

/// Rolling window length for CPU / temperature history.
const WINDOW_CAP: usize = 120;

/// Bounded anomaly log length.
const ANOMALY_CAP: usize = 100;

/// Samples inspected when checking for a CPU spike.
const SPIKE_LOOKBACK: usize = 10;

/// Latest reading must exceed the lookback mean by this factor to count as a spike.
const SPIKE_FACTOR: f32 = 1.5;

/// One point-in-time reading of system resources.
///
/// Any field may be zero (or `None`) when the underlying sensor is
/// unavailable; consumers must treat zeros as "unknown", not as readings.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub available_mem_gb: f32,
    pub temperature_c: f32,
    pub battery_percent: Option<f32>,
    pub plugged_in: Option<bool>,
}

/// Collaborator-supplied source of telemetry readings.
pub trait TelemetryProbe: Send + Sync + 'static {
    /// Take a reading. May block briefly; the monitor bounds the wait.
    fn snapshot(&self) -> Result<TelemetrySnapshot>;
}

/// Kind of detected anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    HighCpu,
    HighTemp,
}

/// A detected anomaly, kept in a bounded log for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub value: f32,
    pub at_unix_secs: f64,
}

#[derive(Default)]
struct Windows {
    cpu: VecDeque<f32>,
    temperature: VecDeque<f32>,
}

/// Samples a `TelemetryProbe`, keeps rolling history, detects anomalies.
///
/// `SystemMonitor` is `Send + Sync`; the optimizer and the diagnostics report
/// read from it concurrently with the sampling loop.
pub struct SystemMonitor {
    probe: Arc<dyn TelemetryProbe>,
    probe_timeout: Duration,
    high_temp_c: f32,
    windows: Mutex<Windows>,
    anomalies: Mutex<VecDeque<Anomaly>>,
    latest: Mutex<Option<TelemetrySnapshot>>,
    counters: Arc<EngineCounters>,
}

impl SystemMonitor {
    pub fn new(
        probe: Arc<dyn TelemetryProbe>,
        probe_timeout: Duration,
        high_temp_c: f32,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            probe,
            probe_timeout,
            high_temp_c,
            windows: Mutex::new(Windows::default()),
            anomalies: Mutex::new(VecDeque::new()),
            latest: Mutex::new(None),
            counters,
        }
    }

    /// Take a snapshot with a bounded wait.
    ///
    /// Probe errors and timeouts are non-fatal: they are counted, logged at
    /// most as a warning, and the last known snapshot (or all-zero defaults)
    /// is returned instead.
    pub async fn sample(&self) -> TelemetrySnapshot {
        let probe = Arc::clone(&self.probe);
        let attempt = tokio::time::timeout(
            self.probe_timeout,
            tokio::task::spawn_blocking(move || probe.snapshot()),
        )
        .await;

        let result: Result<TelemetrySnapshot> = match attempt {
            Ok(Ok(inner)) => inner,
            Ok(Err(join_err)) => Err(AxonError::TelemetryUnavailable(join_err.to_string())),
            Err(_) => Err(AxonError::TelemetryUnavailable("probe timed out".into())),
        };

        match result {
            Ok(snapshot) => {
                self.record(snapshot);
                snapshot
            }
            Err(e) => {
                self.counters
                    .telemetry_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "telemetry degraded — using last known snapshot");
                self.latest()
            }
        }
    }

    /// Last known snapshot; all-zero defaults before the first reading.
    pub fn latest(&self) -> TelemetrySnapshot {
        self.latest.lock().unwrap_or_default()
    }

    /// Number of recent CPU readings above `threshold` percent.
    pub fn recent_high_cpu(&self, threshold: f32) -> usize {
        self.windows
            .lock()
            .cpu
            .iter()
            .rev()
            .take(SPIKE_LOOKBACK)
            .filter(|&&c| c > threshold)
            .count()
    }

    /// Mean of the recent temperature window, if any readings exist.
    pub fn average_temperature(&self) -> Option<f32> {
        let windows = self.windows.lock();
        mean(&windows.temperature)
    }

    /// Mean of the recent CPU window, if any readings exist.
    pub fn average_cpu(&self) -> Option<f32> {
        let windows = self.windows.lock();
        mean(&windows.cpu)
    }

    pub fn anomaly_count(&self) -> usize {
        self.anomalies.lock().len()
    }

    pub fn anomalies_snapshot(&self) -> Vec<Anomaly> {
        self.anomalies.lock().iter().cloned().collect()
    }

    /// Record a snapshot into the rolling windows and run anomaly checks.
    pub fn record(&self, snapshot: TelemetrySnapshot) {
        {
            let mut windows = self.windows.lock();
            push_capped(&mut windows.cpu, snapshot.cpu_percent, WINDOW_CAP);
            push_capped(&mut windows.temperature, snapshot.temperature_c, WINDOW_CAP);

            // CPU spike: latest reading well above the recent mean.
            if windows.cpu.len() > SPIKE_LOOKBACK {
                let recent: Vec<f32> =
                    windows.cpu.iter().rev().take(SPIKE_LOOKBACK).copied().collect();
                if let Some(avg) = mean_slice(&recent) {
                    if snapshot.cpu_percent > avg * SPIKE_FACTOR {
                        drop(windows);
                        self.push_anomaly(AnomalyKind::HighCpu, snapshot.cpu_percent);
                        warn!(cpu = snapshot.cpu_percent, avg, "CPU spike detected");
                        self.check_temperature(&snapshot);
                        *self.latest.lock() = Some(snapshot);
                        return;
                    }
                }
            }
        }

        self.check_temperature(&snapshot);
        *self.latest.lock() = Some(snapshot);
    }

    fn check_temperature(&self, snapshot: &TelemetrySnapshot) {
        if snapshot.temperature_c > self.high_temp_c {
            self.push_anomaly(AnomalyKind::HighTemp, snapshot.temperature_c);
            warn!(
                temperature_c = snapshot.temperature_c,
                threshold = self.high_temp_c,
                "high temperature detected"
            );
        }
    }

    fn push_anomaly(&self, kind: AnomalyKind, value: f32) {
        let mut anomalies = self.anomalies.lock();
        if anomalies.len() >= ANOMALY_CAP {
            anomalies.pop_front();
        }
        anomalies.push_back(Anomaly {
            kind,
            value,
            at_unix_secs: unix_now(),
        });
    }

    /// Continuous sampling loop. Exits when the shutdown signal flips to `true`.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.sample().await;
                    debug!(
                        cpu = snapshot.cpu_percent,
                        mem = snapshot.mem_percent,
                        temp = snapshot.temperature_c,
                        "telemetry sampled"
                    );
                }
                changed = shutdown.changed() => {
                    // A dropped sender also means stop.
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("telemetry loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

fn push_capped(buf: &mut VecDeque<f32>, value: f32, cap: usize) {
    if buf.len() >= cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

fn mean(buf: &VecDeque<f32>) -> Option<f32> {
    if buf.is_empty() {
        return None;
    }
    Some(buf.iter().sum::<f32>() / buf.len() as f32)
}

fn mean_slice(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f32>() / values.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(TelemetrySnapshot);

    impl TelemetryProbe for FixedProbe {
        fn snapshot(&self) -> Result<TelemetrySnapshot> {
            Ok(self.0)
        }
    }

    struct FailingProbe;

    impl TelemetryProbe for FailingProbe {
        fn snapshot(&self) -> Result<TelemetrySnapshot> {
            Err(AxonError::TelemetryUnavailable("sensor offline".into()))
        }
    }

    struct HangingProbe;

    impl TelemetryProbe for HangingProbe {
        fn snapshot(&self) -> Result<TelemetrySnapshot> {
            std::thread::sleep(Duration::from_secs(5));
            Ok(TelemetrySnapshot::default())
        }
    }

    fn monitor(probe: Arc<dyn TelemetryProbe>) -> SystemMonitor {
        SystemMonitor::new(
            probe,
            Duration::from_millis(100),
            75.0,
            Arc::new(EngineCounters::default()),
        )
    }

    #[tokio::test]
    async fn sample_records_latest_snapshot() {
        let m = monitor(Arc::new(FixedProbe(TelemetrySnapshot {
            cpu_percent: 40.0,
            mem_percent: 55.0,
            available_mem_gb: 6.0,
            temperature_c: 50.0,
            battery_percent: Some(80.0),
            plugged_in: Some(true),
        })));

        let snap = m.sample().await;
        assert_eq!(snap.cpu_percent, 40.0);
        assert_eq!(m.latest().mem_percent, 55.0);
        assert_eq!(m.anomaly_count(), 0);
    }

    #[tokio::test]
    async fn probe_failure_degrades_to_last_known() {
        let counters = Arc::new(EngineCounters::default());
        let m = SystemMonitor::new(
            Arc::new(FailingProbe),
            Duration::from_millis(100),
            75.0,
            Arc::clone(&counters),
        );
        m.record(TelemetrySnapshot {
            cpu_percent: 33.0,
            ..Default::default()
        });

        let snap = m.sample().await;
        assert_eq!(snap.cpu_percent, 33.0);
        assert_eq!(counters.snapshot().telemetry_failures, 1);
    }

    #[tokio::test]
    async fn hanging_probe_is_cut_off_by_timeout() {
        let counters = Arc::new(EngineCounters::default());
        let m = SystemMonitor::new(
            Arc::new(HangingProbe),
            Duration::from_millis(50),
            75.0,
            Arc::clone(&counters),
        );

        let snap = m.sample().await;
        assert_eq!(snap.cpu_percent, 0.0);
        assert_eq!(counters.snapshot().telemetry_failures, 1);
    }

    #[test]
    fn high_temperature_is_logged_as_anomaly() {
        let m = monitor(Arc::new(FailingProbe));
        m.record(TelemetrySnapshot {
            temperature_c: 90.0,
            ..Default::default()
        });

        assert_eq!(m.anomaly_count(), 1);
        assert_eq!(m.anomalies_snapshot()[0].kind, AnomalyKind::HighTemp);
    }

    #[test]
    fn cpu_spike_above_recent_mean_is_detected() {
        let m = monitor(Arc::new(FailingProbe));
        for _ in 0..12 {
            m.record(TelemetrySnapshot {
                cpu_percent: 20.0,
                ..Default::default()
            });
        }
        m.record(TelemetrySnapshot {
            cpu_percent: 95.0,
            ..Default::default()
        });

        assert!(m
            .anomalies_snapshot()
            .iter()
            .any(|a| a.kind == AnomalyKind::HighCpu));
    }

    #[test]
    fn steady_cpu_produces_no_spike_anomaly() {
        let m = monitor(Arc::new(FailingProbe));
        for _ in 0..30 {
            m.record(TelemetrySnapshot {
                cpu_percent: 50.0,
                ..Default::default()
            });
        }
        assert_eq!(m.anomaly_count(), 0);
    }
}
