//! Counter keys and signed deltas.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One signed increment for one counter key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub key: String,
    pub count: i64,
}

impl CounterDelta {
    pub fn new(key: impl Into<String>, count: i64) -> Self {
        Self {
            key: key.into(),
            count,
        }
    }
}

/// Counter contributions keyed by dimension key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSet(BTreeMap<String, i64>);

impl CounterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&mut self, key: impl Into<String>) {
        self.add(key, 1);
    }

    pub fn add(&mut self, key: impl Into<String>, count: i64) {
        *self.0.entry(key.into()).or_default() += count;
    }

    pub fn get(&self, key: &str) -> i64 {
        self.0.get(key).copied().unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &i64)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_deltas(self) -> Vec<CounterDelta> {
        self.0
            .into_iter()
            .filter(|(_, count)| *count != 0)
            .map(|(key, count)| CounterDelta { key, count })
            .collect()
    }
}

impl FromIterator<(String, i64)> for CounterSet {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        let mut set = CounterSet::new();
        for (key, count) in iter {
            set.add(key, count);
        }
        set
    }
}

/// Deltas that move counters from `before` to `after`; keys present in both
/// with equal contributions cancel out.
pub fn diff_counters(before: &CounterSet, after: &CounterSet) -> Vec<CounterDelta> {
    let mut net = after.clone();
    for (key, count) in before.iter() {
        net.add(key.clone(), -count);
    }
    net.into_deltas()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_emits_only_changed_keys() {
        let before: CounterSet = [("total".to_string(), 1), ("gender:f".to_string(), 1)]
            .into_iter()
            .collect();
        let after: CounterSet = [("total".to_string(), 1), ("gender:m".to_string(), 1)]
            .into_iter()
            .collect();
        assert_eq!(
            diff_counters(&before, &after),
            vec![CounterDelta::new("gender:f", -1), CounterDelta::new("gender:m", 1)]
        );
        assert!(diff_counters(&after, &after).is_empty());
    }

    #[test]
    fn retiring_everything_negates_every_key() {
        let before: CounterSet = [("total".to_string(), 1)].into_iter().collect();
        assert_eq!(
            diff_counters(&before, &CounterSet::new()),
            vec![CounterDelta::new("total", -1)]
        );
    }
}
