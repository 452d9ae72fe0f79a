//! Parallel batch loading with bounded concurrency.
//!
//! Each `(name, priority)` pair goes through `ModelCache::get_or_load`
//! independently under a semaphore permit; one failed load never cancels or
//! blocks the others. The result map is returned only once every submitted
//! load has finished.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cache::{ModelCache, ModelHandle};
use crate::error::{AxonError, Result};

/// Orchestrates concurrent loads through the cache.
pub struct BatchLoader {
    cache: Arc<ModelCache>,
    permits: Arc<Semaphore>,
}

impl BatchLoader {
    /// `max_concurrent` bounds simultaneous builds; clamped to at least 1.
    pub fn new(cache: Arc<ModelCache>, max_concurrent: usize) -> Self {
        Self {
            cache,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Load every requested resource, collecting per-name outcomes.
    ///
    /// Duplicate names collapse to one entry (and coalesce onto one build
    /// inside the cache anyway).
    pub async fn load_batch(
        &self,
        requests: &[(String, u8)],
    ) -> HashMap<String, Result<ModelHandle>> {
        let mut tasks = JoinSet::new();
        for (name, priority) in requests {
            let cache = Arc::clone(&self.cache);
            let permits = Arc::clone(&self.permits);
            let name = name.clone();
            let priority = *priority;
            tasks.spawn(async move {
                // Closed only on shutdown; treat as a load failure for this entry.
                let _permit = match permits.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        return (
                            name.clone(),
                            Err(AxonError::LoadFailure {
                                name,
                                detail: "loader shut down".into(),
                            }),
                        )
                    }
                };
                let outcome = cache.get_or_load(&name, priority).await;
                (name, outcome)
            });
        }

        let mut results: HashMap<String, Result<ModelHandle>> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, outcome)) => {
                    if let Err(e) = &outcome {
                        warn!(name = %name, error = %e, "batch load entry failed");
                    }
                    results.insert(name, outcome);
                }
                Err(join_err) => {
                    // A panicked load task loses its name; surface it in the log
                    // rather than silently shrinking the result map.
                    warn!(error = %join_err, "batch load task panicked");
                }
            }
        }

        let failures = results.values().filter(|r| r.is_err()).count();
        info!(
            requested = requests.len(),
            loaded = results.len() - failures,
            failures,
            "batch load complete"
        );
        results
    }
}
