//! Housekeeping sink.
//!
//! Instruments report their status as `{instrument: {metric: value}}`
//! entries. Whoever persists or displays them implements
//! [`HousekeepingSink`]; [`Housekeeping`] is the in-memory default.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Receiver for instrument status entries.
pub trait HousekeepingSink: Send {
    fn record(&mut self, instrument: &str, metric: &str, value: Value);
}

/// Ordered in-memory housekeeping table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Housekeeping {
    instruments: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Housekeeping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instrument: &str, metric: &str) -> Option<&Value> {
        self.instruments.get(instrument)?.get(metric)
    }

    pub fn instrument(&self, instrument: &str) -> Option<&BTreeMap<String, Value>> {
        self.instruments.get(instrument)
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// The whole table as a JSON object.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl HousekeepingSink for Housekeeping {
    fn record(&mut self, instrument: &str, metric: &str, value: Value) {
        self.instruments
            .entry(instrument.to_string())
            .or_default()
            .insert(metric.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entries_nest_by_instrument() {
        let mut hk = Housekeeping::new();
        hk.record("Chopper", "Position", json!("C"));
        hk.record("AFFTS", "Channels [#]", json!([8192, 8192]));
        hk.record("Chopper", "Position", json!("H"));

        assert_eq!(hk.get("Chopper", "Position"), Some(&json!("H")));
        assert_eq!(
            hk.to_json(),
            json!({
                "AFFTS": {"Channels [#]": [8192, 8192]},
                "Chopper": {"Position": "H"}
            })
        );
    }
}
