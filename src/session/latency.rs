use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LatencyStat {
    pub count: u64,
    pub total: Duration,
}

impl LatencyStat {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.total.as_nanos() / u128::from(self.count)) as u64)
        }
    }
}

/// Per-operation call counts and accumulated service time.
#[derive(Debug, Default)]
pub struct LatencyMap {
    stats: DashMap<String, LatencyStat>,
}

impl LatencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, elapsed: Duration) {
        let mut stat = self.stats.entry(name.to_string()).or_default();
        stat.count += 1;
        stat.total += elapsed;
    }

    pub fn counts(&self) -> HashMap<String, u64> {
        self.stats
            .iter()
            .map(|e| (e.key().clone(), e.value().count))
            .collect()
    }

    /// Mean latency per operation.
    pub fn latencies(&self) -> HashMap<String, Duration> {
        self.stats
            .iter()
            .map(|e| (e.key().clone(), e.value().mean()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<LatencyStat> {
        self.stats.get(name).map(|s| *s)
    }

    pub fn clear(&self) {
        self.stats.clear();
    }

    /// Lines of `name count mean`, sorted by name.
    pub fn report(&self) -> String {
        let mut rows: Vec<(String, LatencyStat)> = self
            .stats
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.iter()
            .map(|(name, stat)| format!("{:<12} {:>8} {:>10.3?}", name, stat.count, stat.mean()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_accumulates() {
        let map = LatencyMap::new();
        map.add("LOOKUP", Duration::from_millis(2));
        map.add("LOOKUP", Duration::from_millis(4));
        map.add("READ", Duration::from_millis(1));

        assert_eq!(map.counts()["LOOKUP"], 2);
        assert_eq!(map.latencies()["LOOKUP"], Duration::from_millis(3));
        assert_eq!(map.get("READ").unwrap().count, 1);
        assert!(map.report().contains("LOOKUP"));

        map.clear();
        assert!(map.counts().is_empty());
    }
}
