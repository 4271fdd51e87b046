//! Runtime statistics

use serde::{Deserialize, Serialize};

use rbus_utils::Counter;

/// Broker-wide counters. `in_ram_messages` is a gauge tracking bodies held
/// by the in-RAM backlog, the rest are monotonic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub publisheds: Counter,
    pub delivereds: Counter,
    pub in_ram_messages: Counter,
    pub overfloweds: Counter,
    pub expireds: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "publisheds": self.publisheds.to_json(),
            "delivereds": self.delivereds.to_json(),
            "in_ram_messages": self.in_ram_messages.to_json(),
            "overfloweds": self.overfloweds.to_json(),
            "expireds": self.expireds.to_json(),
        })
    }
}
