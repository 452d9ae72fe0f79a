//! Observability — counters, bounded error log, health scoring, report export.
//!
//! Everything here is a read-only consumer of the other components: counters
//! are plain atomics bumped on the hot paths, the error log is a bounded
//! deque, and the health report is derived on demand rather than stored.
//! The exported report is plain serde JSON for an external persistence or
//! logging collaborator; no remote client depends on its exact shape.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cache::ResourceMetadata;
use crate::dispatch::TaskRecord;
use crate::loader::PerformanceMode;
use crate::telemetry::{Anomaly, TelemetrySnapshot};

/// Bounded error log length.
const ERROR_LOG_CAP: usize = 500;

/// Seconds since the Unix epoch, as f64 for serde-friendly timestamps.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Shared atomic counters bumped across the engine.
#[derive(Default)]
pub struct EngineCounters {
    pub cache_hits: AtomicUsize,
    pub cache_misses: AtomicUsize,
    pub loads_completed: AtomicUsize,
    pub load_failures: AtomicUsize,
    pub evictions: AtomicUsize,
    pub unloads: AtomicUsize,
    pub dispatch_calls: AtomicUsize,
    pub dispatch_failures: AtomicUsize,
    pub fallback_dispatches: AtomicUsize,
    pub preload_attempts: AtomicUsize,
    pub preload_failures: AtomicUsize,
    pub optimizer_cycles: AtomicUsize,
    pub mode_changes: AtomicUsize,
    pub telemetry_failures: AtomicUsize,
}

impl EngineCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            loads_completed: self.loads_completed.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            unloads: self.unloads.load(Ordering::Relaxed),
            dispatch_calls: self.dispatch_calls.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            fallback_dispatches: self.fallback_dispatches.load(Ordering::Relaxed),
            preload_attempts: self.preload_attempts.load(Ordering::Relaxed),
            preload_failures: self.preload_failures.load(Ordering::Relaxed),
            optimizer_cycles: self.optimizer_cycles.load(Ordering::Relaxed),
            mode_changes: self.mode_changes.load(Ordering::Relaxed),
            telemetry_failures: self.telemetry_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineCounters`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersSnapshot {
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub loads_completed: usize,
    pub load_failures: usize,
    pub evictions: usize,
    pub unloads: usize,
    pub dispatch_calls: usize,
    pub dispatch_failures: usize,
    pub fallback_dispatches: usize,
    pub preload_attempts: usize,
    pub preload_failures: usize,
    pub optimizer_cycles: usize,
    pub mode_changes: usize,
    pub telemetry_failures: usize,
}

/// One recorded error, kept for the diagnostics report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Where the error happened (e.g. `"load:whisper"`, `"dispatch:speech_to_text"`).
    pub context: String,
    pub detail: String,
    pub at_unix_secs: f64,
}

/// Bounded log of recent errors, shared across components.
pub struct ErrorLog {
    entries: Mutex<VecDeque<ErrorRecord>>,
    cap: usize,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::with_capacity(ERROR_LOG_CAP)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            cap: cap.max(1),
        }
    }

    pub fn record(&self, context: impl Into<String>, detail: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.cap {
            entries.pop_front();
        }
        entries.push_back(ErrorRecord {
            context: context.into(),
            detail: detail.into(),
            at_unix_secs: unix_now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Most recent `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ErrorRecord> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Status label derived from the health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Derived 0–100 summary of recent error / anomaly / memory-pressure history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub health_score: u8,
    pub status: HealthStatus,
    pub issue_count: usize,
    pub recommendations: Vec<String>,
}

/// Compute the health report from current observations.
///
/// Starts at 100 with fixed deductions per band; clamped to [0, 100].
pub fn health_report(error_count: usize, anomaly_count: usize, mem_percent: f32) -> HealthReport {
    let mut score: i32 = 100;

    score -= match error_count {
        0 => 0,
        1..=5 => 5,
        6..=10 => 10,
        _ => 15,
    };
    score -= match anomaly_count {
        0 => 0,
        1..=2 => 5,
        3..=5 => 10,
        _ => 20,
    };
    if mem_percent > 90.0 {
        score -= 15;
    }

    let health_score = score.clamp(0, 100) as u8;
    let status = match health_score {
        90..=100 => HealthStatus::Excellent,
        75..=89 => HealthStatus::Good,
        60..=74 => HealthStatus::Fair,
        _ => HealthStatus::Poor,
    };

    HealthReport {
        health_score,
        status,
        issue_count: error_count + anomaly_count,
        recommendations: recommendations(health_score, error_count, mem_percent),
    }
}

fn recommendations(score: u8, error_count: usize, mem_percent: f32) -> Vec<String> {
    let mut out = Vec::new();
    if score < 90 {
        out.push("Consider upgrading hardware for better performance".to_string());
    }
    if mem_percent > 85.0 {
        out.push("Increase system RAM or reduce resident model footprint".to_string());
    }
    if error_count > 5 {
        out.push("Review error log and address recurring failures".to_string());
    }
    if out.is_empty() {
        out.push("System is well optimized; no critical recommendations".to_string());
    }
    out
}

/// Full structured report for an external persistence / logging collaborator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub generated_at_unix_secs: f64,
    pub performance_mode: PerformanceMode,
    /// Metadata of currently resident resources, most recently used first.
    pub cached: Vec<ResourceMetadata>,
    /// Mean latency in seconds keyed by `"task/implementation"`.
    pub performance_averages: std::collections::BTreeMap<String, f64>,
    pub recent_errors: Vec<ErrorRecord>,
    pub recent_anomalies: Vec<Anomaly>,
    pub recent_tasks: Vec<TaskRecord>,
    pub counters: CountersSnapshot,
    pub telemetry: TelemetrySnapshot,
    pub health: HealthReport,
}
