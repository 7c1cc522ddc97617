use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An append-only audit-log record. `seq` is assigned by the store at
/// insert time and totally orders events within a transaction, since two
/// events in the same millisecond are otherwise indistinguishable:
/// events for a given step are totally ordered by timestamp and by
/// their commit order within a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub seq: i64,
    pub ts: i64,
    pub actor: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
}

impl Event {
    pub fn new(ts: i64, actor: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            seq: 0,
            ts,
            actor: actor.into(),
            event_type: event_type.into(),
            payload,
        }
    }
}
