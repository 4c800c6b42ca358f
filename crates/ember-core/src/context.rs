use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DebugAssertion, DebugEvent, Payload};

/// Per-emit trace state. One is created per traced emit and shared by every
/// hook in that call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugContext {
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub events: Vec<DebugEvent>,
    pub assertions: Vec<DebugAssertion>,
}

impl DebugContext {
    pub fn new(parent_id: Option<String>) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            parent_id,
            start_time: Utc::now(),
            events: Vec::new(),
            assertions: Vec::new(),
        }
    }

    pub fn failed_assertions(&self) -> impl Iterator<Item = &DebugAssertion> {
        self.assertions.iter().filter(|a| !a.passed)
    }
}

/// What a hook handler sees. Borrowed mutably by each hook in turn, so
/// payload edits made by earlier hooks are visible to later ones.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub event: String,
    pub payload: Payload,
    pub session: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub debug: Option<DebugContext>,
}

impl HookContext {
    pub fn new(event: &str, payload: Payload) -> Self {
        Self {
            event: event.to_string(),
            payload,
            session: None,
            timestamp: Utc::now(),
            debug: None,
        }
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.debug.as_ref().map(|d| d.trace_id.as_str())
    }

    /// String payload field, empty when missing or not a string.
    pub fn payload_str(&self, key: &str) -> &str {
        self.payload.get(key).and_then(Value::as_str).unwrap_or("")
    }

    pub fn payload_bool(&self, key: &str) -> bool {
        self.payload.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}
