use log::info;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// structured event emitter plus an in-process counter registry.
///
/// events are single json lines on the `telemetry` log target, one per
/// notable transition; counters are exported through [`Telemetry::snapshot`].
pub struct Telemetry {
    counters: Mutex<HashMap<String, u64>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// emits one structured event; `fields` is merged into the envelope
    pub fn emit(&self, event: &str, fields: Value) {
        let mut envelope = json!({ "event": event });
        if let (Some(envelope_map), Value::Object(extra)) = (envelope.as_object_mut(), fields) {
            for (key, value) in extra {
                envelope_map.insert(key, value);
            }
        }
        info!(target: "telemetry", "{}", envelope);
    }

    pub fn incr(&self, counter: &str) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry(counter.to_string()).or_insert(0) += 1;
    }

    pub fn incr_by(&self, counter: &str, amount: u64) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry(counter.to_string()).or_insert(0) += amount;
    }

    /// current counter values, for scraping
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters.lock().unwrap().clone()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
