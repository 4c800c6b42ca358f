//! Persistent debug traces and assertions.
//!
//! The in-memory tracer forgets a trace once it scrolls out of the ring.
//! This module keeps one row per traced emit in `debug_traces`, the
//! assertions recorded during it in `debug_assertions`, and a small table of
//! stored test cases, so failures can be collected later and handed to an
//! LLM for review.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::db::Db;
use crate::dispatcher::Emission;
use crate::registry::ModuleRegistry;
use crate::tracer::DebugTracer;
use crate::types::{DebugAssertion, Hook, Level, Module, WILDCARD_EVENT};

pub const MODULE_ID: &str = "debug";
const HOOK_ID: &str = "debug.capture";
const DEFAULT_MAX_LOG_SIZE: i64 = 10_000;
const DEFAULT_FAILURE_LIMIT: i64 = 50;
const PROMPT_FAILURE_LIMIT: i64 = 20;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS debug_traces (
    trace_id    TEXT PRIMARY KEY,
    parent_id   TEXT,
    event       TEXT NOT NULL,
    module      TEXT,
    start_time  INTEGER,
    end_time    INTEGER,
    duration_ms INTEGER,
    status      TEXT NOT NULL DEFAULT 'running',
    data        TEXT NOT NULL DEFAULT '{}',
    error       TEXT,
    created_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_traces_event ON debug_traces(event, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_traces_status ON debug_traces(status, created_at DESC);

CREATE TABLE IF NOT EXISTS debug_assertions (
    id         TEXT PRIMARY KEY,
    trace_id   TEXT REFERENCES debug_traces(trace_id) ON DELETE CASCADE,
    name       TEXT NOT NULL,
    expected   TEXT,
    actual     TEXT,
    passed     INTEGER NOT NULL,
    message    TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS test_cases (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    description     TEXT,
    input           TEXT NOT NULL,
    expected_output TEXT,
    expected_intent TEXT,
    tags            TEXT NOT NULL DEFAULT '[]',
    enabled         INTEGER NOT NULL DEFAULT 1,
    last_run_at     INTEGER,
    last_result     TEXT,
    created_at      INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
";

const PROMPT_PREAMBLE: &str = "Analyze the following debug information and provide:
1. Root cause analysis for any failures
2. Suggested fixes
3. Patterns that could be optimized
";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedAssertion {
    pub name: String,
    pub expected: String,
    pub actual: String,
    pub message: String,
    pub event: String,
    pub module: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub event: String,
    pub module: String,
    pub status: String,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

pub struct DebugModule {
    db: Arc<Db>,
    tracer: Arc<DebugTracer>,
    log_to_db: bool,
    max_log_size: i64,
}

impl DebugModule {
    pub fn module() -> Module {
        Module::new(MODULE_ID, "Debug & Testing")
            .with_priority(1)
            .with_config(json!({
                "trace_all": false,
                "log_to_db": true,
                "max_log_size": DEFAULT_MAX_LOG_SIZE,
            }))
            .with_schema_extension(SCHEMA)
    }

    /// Captures every event into the running trace.
    pub fn hook() -> Hook {
        Hook::new(MODULE_ID, WILDCARD_EVENT, "debug")
            .with_id(HOOK_ID)
            .with_priority(1)
    }

    /// Register the module and its wildcard hook. Safe to call on every
    /// start. Turns tracing on when the module asks to trace everything.
    pub fn install(registry: &ModuleRegistry, tracer: Arc<DebugTracer>) -> Result<Self> {
        let module = Self::module();
        registry.register_module(&module)?;
        registry.register_hook(&Self::hook())?;

        let cfg = &module.config;
        if cfg.get("trace_all").and_then(|v| v.as_bool()).unwrap_or(false) {
            tracer.enable();
        }
        let log_to_db = cfg.get("log_to_db").and_then(|v| v.as_bool()).unwrap_or(true);
        let max_log_size = cfg
            .get("max_log_size")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_MAX_LOG_SIZE)
            .max(1);

        info!("debug module installed (log_to_db={log_to_db}, max_log_size={max_log_size})");
        Ok(Self {
            db: Arc::clone(registry.db()),
            tracer,
            log_to_db,
            max_log_size,
        })
    }

    pub fn max_log_size(&self) -> i64 {
        self.max_log_size
    }

    pub fn with_max_log_size(mut self, n: i64) -> Self {
        self.max_log_size = n.max(1);
        self
    }

    // ── Traces ────────────────────────────────────────────────────────────

    /// Open a trace row in the `running` state and return its id.
    pub fn start_trace(&self, event: &str, module: &str) -> Result<String> {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO debug_traces (trace_id, event, module, start_time, status)
             VALUES (?1, ?2, ?3, ?4, 'running')",
            params![trace_id, event, module, Utc::now().timestamp_millis()],
        )
        .context("start_trace")?;
        Ok(trace_id)
    }

    /// Close a trace as `success`, or `error` with the message.
    pub fn end_trace(&self, trace_id: &str, error: Option<&str>) -> Result<bool> {
        let status = if error.is_some() { "error" } else { "success" };
        let now = Utc::now().timestamp_millis();
        let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE debug_traces
                 SET end_time = ?1, duration_ms = ?1 - start_time, status = ?2, error = ?3
                 WHERE trace_id = ?4",
                params![now, status, error, trace_id],
            )
            .context("end_trace")?;
        Ok(n > 0)
    }

    /// Compare `expected` with `actual` and store the outcome under `trace_id`.
    pub fn add_assertion(
        &self,
        trace_id: &str,
        name: &str,
        expected: &str,
        actual: &str,
    ) -> Result<DebugAssertion> {
        let assertion = DebugAssertion::evaluate(trace_id, name, expected, actual);
        let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        insert_assertion(&conn, &assertion).context("add_assertion")?;
        Ok(assertion)
    }

    /// Persist one traced emit: a finished trace row plus every assertion
    /// its hooks recorded. Untraced emissions are ignored.
    pub fn record_emission(&self, emission: &Emission) -> Result<bool> {
        let Some(trace) = emission.debug.as_ref() else {
            return Ok(false);
        };
        if !self.log_to_db {
            return Ok(false);
        }

        let errors: Vec<&str> = trace
            .events
            .iter()
            .filter(|e| e.level == Level::Error)
            .map(|e| e.message.as_str())
            .collect();
        let (status, error) = if errors.is_empty() {
            ("success", None)
        } else {
            ("error", Some(errors.join("; ")))
        };
        let module = trace
            .events
            .iter()
            .map(|e| e.module.as_str())
            .find(|m| *m != MODULE_ID)
            .unwrap_or(MODULE_ID);
        let start = trace.start_time.timestamp_millis();
        let end = Utc::now().timestamp_millis();
        let data = json!({
            "invoked": emission.invoked,
            "failed": emission.failed,
            "skipped": emission.skipped,
        });

        let mut conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("record_emission")?;
        tx.execute(
            "INSERT INTO debug_traces
                 (trace_id, parent_id, event, module, start_time, end_time, duration_ms,
                  status, data, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(trace_id) DO UPDATE SET
                 end_time = excluded.end_time,
                 duration_ms = excluded.duration_ms,
                 status = excluded.status,
                 data = excluded.data,
                 error = excluded.error",
            params![
                trace.trace_id,
                trace.parent_id,
                emission.event,
                module,
                start,
                end,
                end - start,
                status,
                data.to_string(),
                error,
            ],
        )
        .context("insert trace")?;
        for assertion in &trace.assertions {
            insert_assertion(&tx, assertion).context("insert assertion")?;
        }
        tx.execute(
            "DELETE FROM debug_traces WHERE trace_id NOT IN (
                 SELECT trace_id FROM debug_traces
                 ORDER BY start_time DESC, rowid DESC LIMIT ?1)",
            params![self.max_log_size],
        )
        .context("prune traces")?;
        tx.commit().context("record_emission")?;
        Ok(true)
    }

    pub fn trace(&self, trace_id: &str) -> Result<Option<TraceRecord>> {
        let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT trace_id, parent_id, event, COALESCE(module, ''), status, duration_ms, error
             FROM debug_traces WHERE trace_id = ?1",
            params![trace_id],
            |row| {
                Ok(TraceRecord {
                    trace_id: row.get(0)?,
                    parent_id: row.get(1)?,
                    event: row.get(2)?,
                    module: row.get(3)?,
                    status: row.get(4)?,
                    duration_ms: row.get(5)?,
                    error: row.get(6)?,
                })
            },
        )
        .optional()
        .context("trace")
    }

    pub fn trace_count(&self) -> Result<i64> {
        let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row("SELECT COUNT(*) FROM debug_traces", [], |row| row.get(0))
            .context("trace_count")
    }

    /// Most recent failed assertions, newest first. `limit <= 0` means 50.
    pub fn failed_assertions(&self, limit: i64) -> Result<Vec<FailedAssertion>> {
        let limit = if limit <= 0 { DEFAULT_FAILURE_LIMIT } else { limit };
        let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(
                "SELECT a.name, COALESCE(a.expected, ''), COALESCE(a.actual, ''),
                        COALESCE(a.message, ''), t.event, COALESCE(t.module, '')
                 FROM debug_assertions a
                 JOIN debug_traces t ON a.trace_id = t.trace_id
                 WHERE a.passed = 0
                 ORDER BY a.created_at DESC, a.rowid DESC
                 LIMIT ?1",
            )
            .context("failed_assertions")?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(FailedAssertion {
                    name: row.get(0)?,
                    expected: row.get(1)?,
                    actual: row.get(2)?,
                    message: row.get(3)?,
                    event: row.get(4)?,
                    module: row.get(5)?,
                })
            })
            .context("failed_assertions")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed_assertions")
    }

    /// Prompt asking an LLM for root causes and fixes, built from recent
    /// failed assertions and the current debug log.
    pub fn debug_prompt(&self) -> Result<String> {
        let failures = self.failed_assertions(PROMPT_FAILURE_LIMIT)?;
        let failures =
            serde_json::to_string_pretty(&failures).context("serialize failed assertions")?;
        Ok(format!(
            "{PROMPT_PREAMBLE}\n## Failed Assertions\n{failures}\n\n## Debug Log\n{}\n\n\
             Please provide actionable recommendations.",
            self.tracer.log_json()
        ))
    }

    // ── Stored test cases ─────────────────────────────────────────────────

    pub fn add_test_case(&self, name: &str, input: &str, expected_output: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO test_cases (id, name, input, expected_output) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, input, expected_output],
        )
        .context("add_test_case")?;
        Ok(id)
    }

    /// Run a stored, enabled test case under its own trace. `run` turns the
    /// case's input into actual output; an error from it fails the case.
    /// Returns whether the output matched.
    pub fn run_test_case<F>(&self, id: &str, run: F) -> Result<bool>
    where
        F: FnOnce(&str) -> Result<String>,
    {
        let case: Option<(String, String, String)> = {
            let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
            conn.query_row(
                "SELECT name, input, COALESCE(expected_output, '')
                 FROM test_cases WHERE id = ?1 AND enabled = 1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("run_test_case")?
        };
        let Some((name, input, expected)) = case else {
            anyhow::bail!("test case {id} not found or disabled");
        };

        let trace_id = self.start_trace("test_case", MODULE_ID)?;
        let (actual, error) = match run(&input) {
            Ok(out) => (out, None),
            Err(e) => (String::new(), Some(format!("{e:#}"))),
        };
        let assertion = self.add_assertion(&trace_id, &name, &expected, &actual)?;
        self.end_trace(&trace_id, error.as_deref())?;

        let result = if assertion.passed { "passed" } else { "failed" };
        let conn = self.db.raw_conn().lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE test_cases SET last_run_at = strftime('%s', 'now'), last_result = ?1
             WHERE id = ?2",
            params![result, id],
        )
        .context("run_test_case")?;
        debug!("test case {name}: {result}");
        Ok(assertion.passed)
    }
}

fn insert_assertion(conn: &rusqlite::Connection, a: &DebugAssertion) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO debug_assertions
             (id, trace_id, name, expected, actual, passed, message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![a.id, a.trace_id, a.name, a.expected, a.actual, a.passed, a.message],
    )
}
