//! Per-(task, implementation) latency history.
//!
//! Samples are appended to a capped deque per key; the oldest sample drops
//! once the cap is reached, so long-running processes track recent behavior
//! rather than lifetime averages.

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::Mutex;

/// Default per-key sample cap.
const SAMPLE_CAP: usize = 64;

/// Records and aggregates latency samples.
pub struct PerformanceHistory {
    samples: Mutex<HashMap<(String, String), VecDeque<f64>>>,
    cap: usize,
}

impl PerformanceHistory {
    pub fn new() -> Self {
        Self::with_sample_cap(SAMPLE_CAP)
    }

    pub fn with_sample_cap(cap: usize) -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
            cap: cap.max(1),
        }
    }

    /// Append one latency sample (seconds) for `implementation` on `task`.
    pub fn record(&self, task: &str, implementation: &str, latency_secs: f64) {
        let mut samples = self.samples.lock();
        let deque = samples
            .entry((task.to_string(), implementation.to_string()))
            .or_default();
        if deque.len() >= self.cap {
            deque.pop_front();
        }
        deque.push_back(latency_secs);
    }

    /// Mean latency, or `None` when no samples exist for the key.
    pub fn mean(&self, task: &str, implementation: &str) -> Option<f64> {
        let samples = self.samples.lock();
        let deque = samples.get(&(task.to_string(), implementation.to_string()))?;
        if deque.is_empty() {
            return None;
        }
        Some(deque.iter().sum::<f64>() / deque.len() as f64)
    }

    pub fn sample_count(&self, task: &str, implementation: &str) -> usize {
        self.samples
            .lock()
            .get(&(task.to_string(), implementation.to_string()))
            .map(|d| d.len())
            .unwrap_or(0)
    }

    /// Mean latency per key, keyed `"task/implementation"`, for diagnostics.
    pub fn averages(&self) -> BTreeMap<String, f64> {
        let samples = self.samples.lock();
        samples
            .iter()
            .filter(|(_, deque)| !deque.is_empty())
            .map(|((task, implementation), deque)| {
                (
                    format!("{task}/{implementation}"),
                    deque.iter().sum::<f64>() / deque.len() as f64,
                )
            })
            .collect()
    }
}

impl Default for PerformanceHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_reflects_recorded_samples() {
        let history = PerformanceHistory::new();
        assert_eq!(history.mean("stt", "whisper"), None);

        history.record("stt", "whisper", 0.6);
        history.record("stt", "whisper", 1.0);
        assert_eq!(history.mean("stt", "whisper"), Some(0.8));
        assert_eq!(history.sample_count("stt", "whisper"), 2);
    }

    #[test]
    fn cap_drops_oldest_samples() {
        let history = PerformanceHistory::with_sample_cap(2);
        history.record("stt", "vosk", 10.0);
        history.record("stt", "vosk", 1.0);
        history.record("stt", "vosk", 1.0);

        assert_eq!(history.sample_count("stt", "vosk"), 2);
        assert_eq!(history.mean("stt", "vosk"), Some(1.0));
    }

    #[test]
    fn averages_export_is_keyed_by_task_and_implementation() {
        let history = PerformanceHistory::new();
        history.record("stt", "whisper", 0.5);
        history.record("gen", "llm", 2.0);

        let averages = history.averages();
        assert_eq!(averages["stt/whisper"], 0.5);
        assert_eq!(averages["gen/llm"], 2.0);
        assert_eq!(averages.len(), 2);
    }
}
