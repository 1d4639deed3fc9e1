use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Latest known fields for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    pub fields: BTreeMap<String, Value>,
    /// Bumped on every update
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl MarketState {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }
}

/// Per-symbol state store. Updates merge into existing fields; the owner of the
/// tracker is its only writer.
#[derive(Debug, Clone, Default)]
pub struct MarketStateTracker {
    states: BTreeMap<String, MarketState>,
}

impl MarketStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `data` into the state of `symbol` and returns the new version.
    pub fn update_state(
        &mut self,
        symbol: &str,
        data: impl IntoIterator<Item = (String, Value)>,
        now: DateTime<Utc>,
    ) -> u64 {
        let state = self
            .states
            .entry(symbol.to_string())
            .or_insert_with(|| MarketState {
                fields: BTreeMap::new(),
                version: 0,
                updated_at: now,
            });
        state.fields.extend(data);
        state.version += 1;
        state.updated_at = now;
        state.version
    }

    pub fn get_state(&self, symbol: &str) -> Option<&MarketState> {
        self.states.get(symbol)
    }

    pub fn version(&self, symbol: &str) -> u64 {
        self.states.get(symbol).map_or(0, |s| s.version)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    pub fn remove(&mut self, symbol: &str) -> Option<MarketState> {
        self.states.remove(symbol)
    }
}
