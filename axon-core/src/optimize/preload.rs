//! Predictive preloading of frequently requested resources.
//!
//! The preloader watches the cache's usage counts and warms the most-requested
//! resources that are not currently resident. Preloads are fire-and-forget:
//! they run on spawned tasks at a modest priority and their failures are
//! logged and counted, never surfaced to callers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::ModelCache;
use crate::diagnostics::{EngineCounters, ErrorLog};

/// Warms predicted-next resources in the background.
pub struct PredictivePreloader {
    cache: Arc<ModelCache>,
    top_n: usize,
    priority: u8,
    counters: Arc<EngineCounters>,
    errors: Arc<ErrorLog>,
}

impl PredictivePreloader {
    pub fn new(
        cache: Arc<ModelCache>,
        top_n: usize,
        priority: u8,
        counters: Arc<EngineCounters>,
        errors: Arc<ErrorLog>,
    ) -> Self {
        Self {
            cache,
            top_n,
            priority,
            counters,
            errors,
        }
    }

    /// Kick off loads for the top unresident candidates.
    ///
    /// Returns the names whose loads were started; the loads themselves run
    /// detached and finish on their own schedule.
    pub fn cycle(&self) -> Vec<String> {
        let candidates = self.cache.top_unresident_usage(self.top_n);
        for name in &candidates {
            self.counters.preload_attempts.fetch_add(1, Ordering::Relaxed);
            let cache = Arc::clone(&self.cache);
            let counters = Arc::clone(&self.counters);
            let errors = Arc::clone(&self.errors);
            let priority = self.priority;
            let name = name.clone();
            tokio::spawn(async move {
                match cache.get_or_load(&name, priority).await {
                    Ok(_) => info!(name = %name, "preloaded predicted resource"),
                    Err(e) => {
                        counters.preload_failures.fetch_add(1, Ordering::Relaxed);
                        errors.record(format!("preload:{name}"), e.to_string());
                        warn!(name = %name, error = %e, "predictive preload failed");
                    }
                }
            });
        }
        candidates
    }

    /// Periodic loop. Exits when the shutdown signal flips to `true`.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle();
                }
                changed = shutdown.changed() => {
                    // A dropped sender also means stop.
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("preloader loop stopping");
                        break;
                    }
                }
            }
        }
    }
}
