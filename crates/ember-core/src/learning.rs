use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde_json::json;

use crate::db::Db;
use crate::registry::ModuleRegistry;
use crate::types::{Hook, Module};

pub const MODULE_ID: &str = "learning";
const HOOK_ID: &str = "learning.pattern_learn";
const MIN_CONFIDENCE: f64 = 0.7;
const DEFAULT_MIN_SUCCESS_COUNT: i64 = 3;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS learned_intents (
    id              TEXT PRIMARY KEY,
    input_pattern   TEXT NOT NULL,
    detected_intent TEXT NOT NULL,
    confidence      REAL NOT NULL DEFAULT 0.5,
    success_count   INTEGER NOT NULL DEFAULT 0,
    failure_count   INTEGER NOT NULL DEFAULT 0,
    last_used_at    INTEGER,
    created_at      INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_learned_intents_pair
    ON learned_intents(input_pattern, detected_intent);
CREATE INDEX IF NOT EXISTS idx_learned_intents_confidence
    ON learned_intents(input_pattern, confidence DESC);

CREATE TABLE IF NOT EXISTS code_patterns (
    id           TEXT PRIMARY KEY,
    language     TEXT NOT NULL,
    pattern_type TEXT NOT NULL,
    trigger_text TEXT NOT NULL,
    suggestion   TEXT NOT NULL,
    usage_count  INTEGER NOT NULL DEFAULT 0,
    created_at   INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS user_preferences (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.5,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
";

/// Learns intents and preferences from user interactions.
///
/// Installed as an ordinary module: its tables arrive through the module's
/// schema extension and its `chat_complete` hook validates observations.
pub struct LearningModule {
    db: Arc<Db>,
    min_success_count: i64,
}

impl LearningModule {
    pub fn module() -> Module {
        Module::new(MODULE_ID, "Pattern Learning")
            .with_priority(50)
            .with_config(json!({ "min_success_count": DEFAULT_MIN_SUCCESS_COUNT, "decay_days": 30 }))
            .with_schema_extension(SCHEMA)
    }

    pub fn hook() -> Hook {
        Hook::new(MODULE_ID, "chat_complete", "pattern_learn")
            .with_id(HOOK_ID)
            .with_priority(100)
    }

    /// Register the module and its hook. Safe to call on every start.
    pub fn install(registry: &ModuleRegistry) -> Result<Self> {
        let module = Self::module();
        registry.register_module(&module)?;
        registry.register_hook(&Self::hook())?;

        let min_success_count = module
            .config
            .get("min_success_count")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_MIN_SUCCESS_COUNT);

        Ok(Self {
            db: Arc::clone(registry.db()),
            min_success_count,
        })
    }

    pub fn min_success_count(&self) -> i64 {
        self.min_success_count
    }

    /// Count a confirmed intent for an input pattern and recompute confidence.
    pub fn record_success(&self, input_pattern: &str, intent: &str) -> Result<()> {
        let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO learned_intents
                 (id, input_pattern, detected_intent, confidence, success_count, last_used_at)
             VALUES (?1, ?2, ?3, 1.0, 1, strftime('%s', 'now'))
             ON CONFLICT(input_pattern, detected_intent) DO UPDATE SET
                 success_count = success_count + 1,
                 confidence = CAST(success_count + 1 AS REAL)
                              / (success_count + 1 + failure_count),
                 last_used_at = strftime('%s', 'now')",
            params![uuid::Uuid::new_v4().to_string(), input_pattern, intent],
        )
        .context("record_success")?;
        Ok(())
    }

    /// Count a rejected intent. Returns false when the pair was never learned.
    pub fn record_failure(&self, input_pattern: &str, intent: &str) -> Result<bool> {
        let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE learned_intents SET
                     failure_count = failure_count + 1,
                     confidence = CAST(success_count AS REAL)
                                  / (success_count + failure_count + 1)
                 WHERE input_pattern = ?1 AND detected_intent = ?2",
                params![input_pattern, intent],
            )
            .context("record_failure")?;
        Ok(n > 0)
    }

    /// Best learned intent for `input`, with its confidence. Only intents
    /// seen often enough and trusted enough are suggested.
    pub fn suggestion(&self, input: &str) -> Result<Option<(String, f64)>> {
        let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT detected_intent, confidence FROM learned_intents
             WHERE input_pattern LIKE '%' || ?1 || '%'
               AND confidence >= ?2
               AND success_count >= ?3
             ORDER BY confidence DESC, success_count DESC
             LIMIT 1",
            params![input, MIN_CONFIDENCE, self.min_success_count],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("suggestion")
    }

    /// Store a preference. Repeating a key reinforces it by 0.1, up to 1.0.
    pub fn learn_preference(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO user_preferences (key, value, confidence)
             VALUES (?1, ?2, 0.6)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 confidence = MIN(1.0, confidence + 0.1),
                 updated_at = strftime('%s', 'now')",
            params![key, value],
        )
        .context("learn_preference")?;
        Ok(())
    }

    pub fn preference(&self, key: &str) -> Result<Option<(String, f64)>> {
        let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT value, confidence FROM user_preferences WHERE key = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("preference")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed() -> (Arc<ModuleRegistry>, LearningModule) {
        let mut db = Db::open_in_memory().unwrap();
        db.migrate().unwrap();
        let registry = Arc::new(ModuleRegistry::new(Arc::new(db)).unwrap());
        let learning = LearningModule::install(&registry).unwrap();
        (registry, learning)
    }

    #[test]
    fn install_is_idempotent() {
        let (registry, _) = installed();
        LearningModule::install(&registry).unwrap();

        assert_eq!(registry.db().list_modules().unwrap().len(), 1);
        assert_eq!(registry.db().list_hooks_for_module(MODULE_ID).unwrap().len(), 1);
        let hooks = registry.hooks_for("chat_complete");
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].handler, "pattern_learn");
        assert_eq!(registry.module(MODULE_ID).unwrap().priority, 50);
    }

    #[test]
    fn suggestion_needs_enough_successes() {
        let (_, learning) = installed();
        assert_eq!(learning.min_success_count(), 3);

        learning.record_success("undo last change", "undo").unwrap();
        learning.record_success("undo last change", "undo").unwrap();
        assert!(learning.suggestion("undo").unwrap().is_none());

        learning.record_success("undo last change", "undo").unwrap();
        let (intent, confidence) = learning.suggestion("undo").unwrap().unwrap();
        assert_eq!(intent, "undo");
        assert!((confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failures_lower_confidence_below_threshold() {
        let (_, learning) = installed();
        for _ in 0..3 {
            learning.record_success("commit it", "commit").unwrap();
        }
        assert!(learning.record_failure("commit it", "commit").unwrap());
        assert!(learning.record_failure("commit it", "commit").unwrap());
        // 3 / 5 = 0.6
        assert!(learning.suggestion("commit").unwrap().is_none());

        assert!(!learning.record_failure("never seen", "x").unwrap());
    }

    #[test]
    fn preference_confidence_is_capped() {
        let (_, learning) = installed();
        learning.learn_preference("style", "terse").unwrap();
        let (_, c) = learning.preference("style").unwrap().unwrap();
        assert!((c - 0.6).abs() < 1e-9);

        for _ in 0..10 {
            learning.learn_preference("style", "verbose").unwrap();
        }
        let (value, c) = learning.preference("style").unwrap().unwrap();
        assert_eq!(value, "verbose");
        assert!((c - 1.0).abs() < 1e-9);
        assert!(learning.preference("missing").unwrap().is_none());
    }
}
