use std::collections::HashMap;

use anyhow::Result;

use crate::db::Db;
use crate::types::{parse_bool, ConfigType};

const DEFAULT_SYSTEM_PROMPT: &str = "You are Ember, an AI coding assistant. You help users write, \
     modify, and understand code. When asked to create or modify files, output the complete file \
     content in markdown code blocks with the filename.";

/// Full application configuration.
/// Runtime fields are seeded to and loaded from the DB `config` table;
/// process fields (paths, ports, intervals) come from env/.env only.
#[derive(Debug, Clone)]
pub struct Config {
    // Process
    pub data_dir: String,
    pub db_path: String,
    /// `db_path` was generated for this run rather than configured.
    pub session_db: bool,
    pub poll_interval_ms: u64,
    pub debug_ring_capacity: usize,
    pub debug_enabled: bool,
    pub debug_persist: bool,
    pub debug_module: bool,

    // Admin API
    pub web_bind: String,
    pub web_port: u16,

    // Runtime: reloaded from the store whenever a config row changes
    pub default_provider: String,
    pub auto_commit: bool,
    pub confirm_changes: bool,
    pub stream_output: bool,
    pub max_context_messages: i64,
    pub temperature: String,
    pub system_prompt: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: ".ember".into(),
            db_path: String::new(),
            session_db: false,
            poll_interval_ms: 1000,
            debug_ring_capacity: 1000,
            debug_enabled: false,
            debug_persist: true,
            debug_module: false,
            web_bind: "127.0.0.1".into(),
            web_port: 3232,
            default_provider: "cerebras".into(),
            auto_commit: true,
            confirm_changes: true,
            stream_output: true,
            max_context_messages: 20,
            temperature: "0.7".into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
        }
    }
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_parsed<T: std::str::FromStr>(key: &str, dotenv: &HashMap<String, String>, default: T) -> T {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Per-run database file, e.g. `.ember/session_2026-01-02_15-04-05.db`.
fn session_db_path(data_dir: &str) -> String {
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    format!("{data_dir}/session_{stamp}.db")
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();
        Ok(Self::from_map(&dotenv))
    }

    fn from_map(dotenv: &HashMap<String, String>) -> Self {
        let d = Config::default();
        let data_dir = get_str("DATA_DIR", dotenv, &d.data_dir);
        let configured = get("DB_PATH", dotenv).filter(|p| !p.is_empty());
        let session_db = configured.is_none();
        let db_path = configured.unwrap_or_else(|| session_db_path(&data_dir));

        Config {
            db_path,
            session_db,
            poll_interval_ms: get_parsed("POLL_INTERVAL_MS", dotenv, d.poll_interval_ms).max(10),
            debug_ring_capacity: get_parsed("DEBUG_RING_CAPACITY", dotenv, d.debug_ring_capacity)
                .max(1),
            debug_enabled: get_bool("DEBUG_ENABLED", dotenv, d.debug_enabled),
            debug_persist: get_bool("DEBUG_PERSIST", dotenv, d.debug_persist),
            debug_module: get_bool("DEBUG_MODULE", dotenv, d.debug_module),
            web_bind: get_str("WEB_BIND", dotenv, &d.web_bind),
            web_port: get_parsed("WEB_PORT", dotenv, d.web_port),
            default_provider: get_str("DEFAULT_PROVIDER", dotenv, &d.default_provider),
            auto_commit: get_bool("AUTO_COMMIT", dotenv, d.auto_commit),
            confirm_changes: get_bool("CONFIRM_CHANGES", dotenv, d.confirm_changes),
            stream_output: get_bool("STREAM_OUTPUT", dotenv, d.stream_output),
            max_context_messages: get_parsed(
                "MAX_CONTEXT_MESSAGES",
                dotenv,
                d.max_context_messages,
            ),
            temperature: get_str("TEMPERATURE", dotenv, &d.temperature),
            system_prompt: get_str("SYSTEM_PROMPT", dotenv, &d.system_prompt),
            data_dir,
        }
    }

    /// Write all runtime fields to DB if not already present (first-run seeding).
    /// Existing rows are never overwritten, so re-running is a no-op.
    pub fn seed_db(&self, db: &Db) -> Result<usize> {
        let entries: &[(&str, String, ConfigType, &str)] = &[
            (
                "default_provider",
                self.default_provider.clone(),
                ConfigType::String,
                "Default LLM provider",
            ),
            (
                "auto_commit",
                self.auto_commit.to_string(),
                ConfigType::Bool,
                "Auto-commit changes to git",
            ),
            (
                "confirm_changes",
                self.confirm_changes.to_string(),
                ConfigType::Bool,
                "Ask confirmation before applying changes",
            ),
            (
                "stream_output",
                self.stream_output.to_string(),
                ConfigType::Bool,
                "Stream LLM output token by token",
            ),
            (
                "max_context_messages",
                self.max_context_messages.to_string(),
                ConfigType::Int,
                "Max messages to include in context",
            ),
            (
                "temperature",
                self.temperature.clone(),
                ConfigType::String,
                "LLM temperature",
            ),
            (
                "system_prompt",
                self.system_prompt.clone(),
                ConfigType::String,
                "System prompt for LLM",
            ),
        ];
        let mut written = 0;
        for (key, value, value_type, description) in entries {
            if db.seed_config(key, value, *value_type, description)? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Return a new Config with runtime fields overridden from DB values.
    pub fn load_from_db(&self, db: &Db) -> Self {
        let mut c = self.clone();
        let get = |key: &str| db.get_config(key).ok().flatten();
        let get_str = |key: &str, cur: &str| get(key).unwrap_or_else(|| cur.to_string());
        let get_bool = |key: &str, cur: bool| get(key).map(|v| parse_bool(&v)).unwrap_or(cur);
        c.default_provider = get_str("default_provider", &c.default_provider);
        c.temperature = get_str("temperature", &c.temperature);
        c.system_prompt = get_str("system_prompt", &c.system_prompt);
        c.auto_commit = get_bool("auto_commit", c.auto_commit);
        c.confirm_changes = get_bool("confirm_changes", c.confirm_changes);
        c.stream_output = get_bool("stream_output", c.stream_output);
        if let Some(v) = get("max_context_messages").and_then(|s| s.trim().parse().ok()) {
            c.max_context_messages = v;
        }
        c
    }
}
