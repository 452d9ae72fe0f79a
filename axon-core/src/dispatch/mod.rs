//! Task dispatch — latency-driven implementation selection with fallback.
//!
//! ## Selection rule
//!
//! Candidates with recorded samples compete on mean latency; lowest wins.
//! When no candidate has samples, all are tied at "unknown". Ties are broken
//! by uniform random choice from a seedable RNG so tests stay deterministic.
//!
//! ## Fallback
//!
//! One retry, explicit and `Result`-driven: attempt the primary, inspect the
//! outcome, attempt a single untried alternate on failure, return a composed
//! `ExecutionFailure` carrying both failure details when the alternate also
//! fails.

pub mod history;

pub use history::PerformanceHistory;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::diagnostics::{unix_now, EngineCounters, ErrorLog};
use crate::error::{AxonError, Result};

/// Bounded task-history log length.
const TASK_LOG_CAP: usize = 256;

/// One interchangeable implementation of a task.
pub trait TaskBackend: Send + Sync + 'static {
    /// Stable implementation name used for latency bookkeeping.
    fn name(&self) -> &str;

    /// Execute the task. May block; the dispatcher bounds the wait.
    fn invoke(&self, payload: &Value, context: &Value) -> Result<Value>;
}

/// Immutable mapping from task type to its ordered candidate implementations.
pub struct TaskRegistry {
    tasks: HashMap<String, Vec<Arc<dyn TaskBackend>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a candidate for `task`. Registration order is the final
    /// tie-break when latency history cannot separate alternates.
    pub fn register<B: TaskBackend>(&mut self, task: impl Into<String>, backend: B) -> &mut Self {
        self.tasks
            .entry(task.into())
            .or_default()
            .push(Arc::new(backend));
        self
    }

    pub fn candidates_for(&self, task: &str) -> Vec<Arc<dyn TaskBackend>> {
        self.tasks.get(task).cloned().unwrap_or_default()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One dispatch call, success or failure, kept for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task: String,
    /// Implementation that produced the final outcome; `None` when no
    /// candidate was registered.
    pub implementation: Option<String>,
    pub ok: bool,
    pub latency_secs: Option<f64>,
    pub at_unix_secs: f64,
}

/// Selects, invokes, and falls back across task implementations.
pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    history: Arc<PerformanceHistory>,
    rng: Mutex<StdRng>,
    task_log: Mutex<VecDeque<TaskRecord>>,
    invoke_timeout: Duration,
    counters: Arc<EngineCounters>,
    errors: Arc<ErrorLog>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        history: Arc<PerformanceHistory>,
        invoke_timeout: Duration,
        counters: Arc<EngineCounters>,
        errors: Arc<ErrorLog>,
    ) -> Self {
        Self::with_seed(
            registry,
            history,
            invoke_timeout,
            counters,
            errors,
            rand::random(),
        )
    }

    /// Deterministic construction for tests: the seed fixes tie-breaking.
    pub fn with_seed(
        registry: Arc<TaskRegistry>,
        history: Arc<PerformanceHistory>,
        invoke_timeout: Duration,
        counters: Arc<EngineCounters>,
        errors: Arc<ErrorLog>,
        seed: u64,
    ) -> Self {
        Self {
            registry,
            history,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            task_log: Mutex::new(VecDeque::new()),
            invoke_timeout,
            counters,
            errors,
        }
    }

    /// Select an implementation for `task`, invoke it, and fall back once.
    ///
    /// # Errors
    /// - `AxonError::UnknownTask` — nothing registered for `task`.
    /// - `AxonError::ExecutionFailure` — the chosen implementation failed and
    ///   either no alternate existed or the alternate failed too. Both
    ///   failure details are carried when a fallback was attempted.
    pub async fn dispatch(&self, task: &str, payload: Value, context: Value) -> Result<Value> {
        self.counters.dispatch_calls.fetch_add(1, Ordering::Relaxed);

        let candidates = self.registry.candidates_for(task);
        if candidates.is_empty() {
            self.counters
                .dispatch_failures
                .fetch_add(1, Ordering::Relaxed);
            self.errors
                .record(format!("dispatch:{task}"), "no implementations registered");
            self.push_record(task, None, false, None);
            return Err(AxonError::UnknownTask { task: task.into() });
        }

        let payload = Arc::new(payload);
        let context = Arc::new(context);

        let primary_idx = self.select_primary(task, &candidates);
        let primary = Arc::clone(&candidates[primary_idx]);
        debug!(task, implementation = primary.name(), "dispatching");

        let primary_failure =
            match self.invoke_timed(&primary, &payload, &context).await {
                Ok((value, latency)) => {
                    self.history.record(task, primary.name(), latency);
                    self.push_record(task, Some(primary.name()), true, Some(latency));
                    return Ok(value);
                }
                Err(detail) => detail,
            };

        warn!(
            task,
            implementation = primary.name(),
            error = %primary_failure,
            "primary implementation failed — trying fallback"
        );
        self.errors.record(
            format!("dispatch:{task}"),
            format!("{} failed: {primary_failure}", primary.name()),
        );

        let Some(alternate) = self.select_alternate(task, &candidates, primary_idx) else {
            self.counters
                .dispatch_failures
                .fetch_add(1, Ordering::Relaxed);
            self.push_record(task, Some(primary.name()), false, None);
            return Err(AxonError::ExecutionFailure {
                task: task.into(),
                attempted: primary.name().into(),
                detail: primary_failure,
                primary_detail: None,
            });
        };

        self.counters
            .fallback_dispatches
            .fetch_add(1, Ordering::Relaxed);
        match self.invoke_timed(&alternate, &payload, &context).await {
            Ok((value, latency)) => {
                self.history.record(task, alternate.name(), latency);
                self.push_record(task, Some(alternate.name()), true, Some(latency));
                info!(
                    task,
                    implementation = alternate.name(),
                    "fallback implementation succeeded"
                );
                Ok(value)
            }
            Err(alternate_failure) => {
                self.counters
                    .dispatch_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.errors.record(
                    format!("dispatch:{task}"),
                    format!("{} failed: {alternate_failure}", alternate.name()),
                );
                self.push_record(task, Some(alternate.name()), false, None);
                Err(AxonError::ExecutionFailure {
                    task: task.into(),
                    attempted: alternate.name().into(),
                    detail: alternate_failure,
                    primary_detail: Some(primary_failure),
                })
            }
        }
    }

    /// Most recent `n` task records, oldest first.
    pub fn recent_tasks(&self, n: usize) -> Vec<TaskRecord> {
        let log = self.task_log.lock();
        let skip = log.len().saturating_sub(n);
        log.iter().skip(skip).cloned().collect()
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    /// Lowest mean latency wins; unknown candidates compete only when no
    /// candidate has samples. Ties break by uniform random choice.
    fn select_primary(&self, task: &str, candidates: &[Arc<dyn TaskBackend>]) -> usize {
        let means: Vec<Option<f64>> = candidates
            .iter()
            .map(|c| self.history.mean(task, c.name()))
            .collect();

        let best = means
            .iter()
            .flatten()
            .fold(None::<f64>, |acc, &m| match acc {
                Some(b) if b <= m => Some(b),
                _ => Some(m),
            });

        let tied: Vec<usize> = match best {
            Some(best) => means
                .iter()
                .enumerate()
                .filter(|(_, m)| **m == Some(best))
                .map(|(i, _)| i)
                .collect(),
            None => (0..candidates.len()).collect(),
        };

        if tied.len() == 1 {
            tied[0]
        } else {
            let pick = self.rng.lock().gen_range(0..tied.len());
            tied[pick]
        }
    }

    /// One untried alternate: lowest historical mean first, unknowns after,
    /// registration order as the final tie-break.
    fn select_alternate(
        &self,
        task: &str,
        candidates: &[Arc<dyn TaskBackend>],
        tried: usize,
    ) -> Option<Arc<dyn TaskBackend>> {
        candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != tried)
            .min_by(|(ia, a), (ib, b)| {
                let ma = self.history.mean(task, a.name());
                let mb = self.history.mean(task, b.name());
                match (ma, mb) {
                    (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => ia.cmp(ib),
                }
            })
            .map(|(_, backend)| Arc::clone(backend))
    }

    async fn invoke_timed(
        &self,
        backend: &Arc<dyn TaskBackend>,
        payload: &Arc<Value>,
        context: &Arc<Value>,
    ) -> std::result::Result<(Value, f64), String> {
        let started = Instant::now();
        let invoke = {
            let backend = Arc::clone(backend);
            let payload = Arc::clone(payload);
            let context = Arc::clone(context);
            tokio::task::spawn_blocking(move || backend.invoke(&payload, &context))
        };

        match tokio::time::timeout(self.invoke_timeout, invoke).await {
            Err(_) => Err("invocation timed out".into()),
            Ok(Err(join_err)) => Err(join_err.to_string()),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Ok(Ok(value))) => Ok((value, started.elapsed().as_secs_f64())),
        }
    }

    fn push_record(
        &self,
        task: &str,
        implementation: Option<&str>,
        ok: bool,
        latency_secs: Option<f64>,
    ) {
        let mut log = self.task_log.lock();
        if log.len() >= TASK_LOG_CAP {
            log.pop_front();
        }
        log.push_back(TaskRecord {
            task: task.to_string(),
            implementation: implementation.map(ToOwned::to_owned),
            ok,
            latency_secs,
            at_unix_secs: unix_now(),
        });
    }
}
