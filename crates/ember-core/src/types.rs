use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Event name a hook registers under to receive every event.
pub const WILDCARD_EVENT: &str = "*";

/// Mutable payload shared by every hook invoked within one emit.
pub type Payload = Map<String, Value>;

// ── Config ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigType {
    #[default]
    String,
    Int,
    Bool,
    Json,
}

impl ConfigType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "int" => Self::Int,
            "bool" => Self::Bool,
            "json" => Self::Json,
            _ => Self::String,
        }
    }
}

/// One durable config row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub value_type: ConfigType,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl ConfigEntry {
    /// The value rendered according to its declared type; unparsable text
    /// falls back to the raw string.
    pub fn typed_value(&self) -> Value {
        match self.value_type {
            ConfigType::String => json!(self.value),
            ConfigType::Int => self
                .value
                .trim()
                .parse::<i64>()
                .map(|n| json!(n))
                .unwrap_or_else(|_| json!(self.value)),
            ConfigType::Bool => json!(parse_bool(&self.value)),
            ConfigType::Json => {
                serde_json::from_str(&self.value).unwrap_or_else(|_| json!(self.value))
            }
        }
    }
}

/// Lenient bool parsing shared by the store and config layers.
pub fn parse_bool(s: &str) -> bool {
    matches!(s.trim(), "true" | "1")
}

/// Lenient int parsing: anything that is not an integer reads as zero.
pub fn parse_int(s: &str) -> i64 {
    s.trim().parse().unwrap_or(0)
}

// ── Modules & hooks ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    #[serde(rename = "module_id")]
    pub id: String,
    pub name: String,
    #[serde(default = "default_module_version")]
    pub version: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default)]
    pub schema_extension: Option<String>,
}

impl Module {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            version: default_module_version(),
            enabled: true,
            priority: default_priority(),
            config: empty_object(),
            schema_extension: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_schema_extension(mut self, sql: &str) -> Self {
        self.schema_extension = Some(sql.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    /// Empty until registered; the registry generates one when absent.
    #[serde(rename = "hook_id", default)]
    pub id: String,
    pub module_id: String,
    pub event: String,
    pub handler: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "empty_object")]
    pub config: Value,
}

impl Hook {
    pub fn new(module_id: &str, event: &str, handler: &str) -> Self {
        Self {
            id: String::new(),
            module_id: module_id.to_string(),
            event: event.to_string(),
            handler: handler.to_string(),
            priority: default_priority(),
            enabled: true,
            config: empty_object(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.event == WILDCARD_EVENT
    }
}

fn default_module_version() -> String {
    "1.0.0".into()
}

fn default_priority() -> i64 {
    100
}

fn default_true() -> bool {
    true
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

// ── Debug trace records ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "trace" => Self::Trace,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Debug,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEvent {
    pub id: String,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub event: String,
    pub module: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub duration_us: u64,
}

impl DebugEvent {
    pub fn new(trace_id: &str, level: Level, event: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: trace_id.to_string(),
            timestamp: Utc::now(),
            level,
            event: event.to_string(),
            module: String::new(),
            message: String::new(),
            data: Value::Null,
            duration_us: 0,
        }
    }

    pub fn with_module(mut self, module: &str) -> Self {
        self.module = module.to_string();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.duration_us)
    }
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugAssertion {
    pub id: String,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
    pub message: String,
}

impl DebugAssertion {
    pub fn evaluate(trace_id: &str, name: &str, expected: &str, actual: &str) -> Self {
        let passed = expected == actual;
        let message = if passed {
            String::new()
        } else {
            format!("Assertion failed: expected {expected:?}, got {actual:?}")
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: trace_id.to_string(),
            timestamp: Utc::now(),
            name: name.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
            passed,
            message,
        }
    }
}
