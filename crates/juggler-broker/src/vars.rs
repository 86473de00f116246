//! Process-wide named counters, exported as JSON by the debug endpoint.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// An ordered map of counter name to value. Both the gateway and the broker
/// record into the same map; per-message-type counters use dynamic names
/// (`MsgsCALL`, `SlowProcessMsgRES`, …).
#[derive(Debug, Default)]
pub struct Vars {
    counters: Mutex<BTreeMap<String, i64>>,
}

impl Vars {
    pub fn new() -> Self {
        Vars::default()
    }

    pub fn add(&self, name: &str, delta: i64) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry(name.to_string()).or_insert(0) += delta;
    }

    pub fn get(&self, name: &str) -> i64 {
        self.counters.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.counters.lock().unwrap().clone()
    }
}
