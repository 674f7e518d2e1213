use std::collections::{HashMap, VecDeque};
use std::path::Path;

use crate::error::Result;

const DEFAULT_WINDOW: usize = 10;

/// Rolling per-test duration samples, in milliseconds.
///
/// Only the most recent `window` samples are kept. Estimates use the median,
/// so a single slow or fast run does not skew the shard plan.
#[derive(Debug, Clone)]
pub struct DurationHistory {
    samples: HashMap<String, VecDeque<u64>>,
    window: usize,
}

impl Default for DurationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl DurationHistory {
    pub fn new(window: usize) -> Self {
        Self {
            samples: HashMap::new(),
            window: window.max(1),
        }
    }

    pub fn record(&mut self, test_id: &str, duration_ms: u64) {
        let entry = self.samples.entry(test_id.to_string()).or_default();
        entry.push_back(duration_ms);
        while entry.len() > self.window {
            entry.pop_front();
        }
    }

    pub fn samples(&self, test_id: &str) -> Option<&VecDeque<u64>> {
        self.samples.get(test_id)
    }

    /// Median of the recorded samples. Even-sized windows average the two
    /// middle values.
    pub fn median(&self, test_id: &str) -> Option<u64> {
        let samples = self.samples.get(test_id)?;
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2)
        } else {
            Some(sorted[mid])
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Export as a `test id -> durations` mapping, oldest sample first.
    pub fn export(&self) -> HashMap<String, Vec<u64>> {
        self.samples
            .iter()
            .map(|(id, samples)| (id.clone(), samples.iter().copied().collect()))
            .collect()
    }

    /// Merge an exported mapping. Samples are appended in order, so only the
    /// newest `window` per test survive.
    pub fn import(&mut self, data: HashMap<String, Vec<u64>>) {
        for (test_id, durations) in data {
            for duration in durations {
                self.record(&test_id, duration);
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }

    pub fn from_json(json: &str, window: usize) -> Result<Self> {
        let data: HashMap<String, Vec<u64>> = serde_json::from_str(json)?;
        let mut history = Self::new(window);
        history.import(data);
        Ok(history)
    }

    pub async fn load(path: &Path, window: usize) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json, window)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.to_json()?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_odd_and_even_windows() {
        let mut history = DurationHistory::default();
        for d in [300, 100, 200] {
            history.record("a", d);
        }
        assert_eq!(history.median("a"), Some(200));

        history.record("a", 400);
        assert_eq!(history.median("a"), Some(250));
        assert_eq!(history.median("missing"), None);
    }

    #[test]
    fn median_resists_outliers() {
        let mut history = DurationHistory::default();
        for d in [1000, 1000, 1000, 1000, 90_000] {
            history.record("flaky", d);
        }
        assert_eq!(history.median("flaky"), Some(1000));
    }

    #[test]
    fn window_keeps_latest_samples() {
        let mut history = DurationHistory::new(10);
        for d in 0..15 {
            history.record("a", d);
        }
        let samples: Vec<u64> = history.samples("a").unwrap().iter().copied().collect();
        assert_eq!(samples, (5..15).collect::<Vec<u64>>());
    }

    #[test]
    fn export_import_preserves_order_and_truncates() {
        let mut data = HashMap::new();
        data.insert("a".to_string(), (1..=12).collect::<Vec<u64>>());
        data.insert("b".to_string(), vec![7]);

        let mut history = DurationHistory::new(10);
        history.import(data);

        let exported = history.export();
        assert_eq!(exported["a"], (3..=12).collect::<Vec<u64>>());
        assert_eq!(exported["b"], vec![7]);
    }

    #[test]
    fn json_round_trip() {
        let mut history = DurationHistory::default();
        history.record("login", 1200);
        history.record("login", 1400);

        let json = history.to_json().unwrap();
        let restored = DurationHistory::from_json(&json, 10).unwrap();
        assert_eq!(restored.median("login"), Some(1300));
    }
}
