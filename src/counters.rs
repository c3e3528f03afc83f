//! Named diagnostic counters.
//!
//! Every classified event on the network path (bad magic, duplicate block,
//! unsolicited headers, ...) bumps a counter here instead of spamming the
//! log. Cheap enough to call from the per-connection loops.

use dashmap::DashMap;

#[derive(Default)]
pub struct Counters {
    map: DashMap<String, u64>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self, name: &str) {
        self.bump_by(name, 1);
    }

    pub fn bump_by(&self, name: &str, n: u64) {
        *self.map.entry(name.to_string()).or_insert(0) += n;
    }

    /// Current value; zero for counters never bumped.
    pub fn get(&self, name: &str) -> u64 {
        self.map.get(name).map(|v| *v).unwrap_or(0)
    }

    /// Sorted snapshot for status dumps.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = self
            .map
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        out.sort();
        out
    }
}
