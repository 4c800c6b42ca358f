use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::sync::Mutex;

use crate::types::{parse_bool, parse_int, ConfigEntry, ConfigType, DebugEvent, Hook, Level, Module};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

/// Durable store for config rows, modules, hooks and mirrored debug events.
///
/// A single connection behind a mutex; every statement runs in autocommit
/// mode, so readers only ever observe committed rows.
pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_json(s: &str) -> Value {
    serde_json::from_str(s).unwrap_or(Value::Object(Default::default()))
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_config_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConfigEntry> {
    let type_str: String = row.get(2)?;
    Ok(ConfigEntry {
        key: row.get(0)?,
        value: row.get(1)?,
        value_type: ConfigType::parse(&type_str),
        version: row.get(3)?,
        updated_at: from_epoch(row.get(4)?),
    })
}

fn row_to_module(row: &rusqlite::Row<'_>) -> rusqlite::Result<Module> {
    let config_str: String = row.get(5)?;
    Ok(Module {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        priority: row.get(4)?,
        config: parse_json(&config_str),
        schema_extension: row.get(6)?,
    })
}

fn row_to_hook(row: &rusqlite::Row<'_>) -> rusqlite::Result<Hook> {
    let config_str: String = row.get(6)?;
    Ok(Hook {
        id: row.get(0)?,
        module_id: row.get(1)?,
        event: row.get(2)?,
        handler: row.get(3)?,
        priority: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        config: parse_json(&config_str),
    })
}

fn row_to_debug_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<DebugEvent> {
    let ts: String = row.get(2)?;
    let level: String = row.get(3)?;
    let data: String = row.get(7)?;
    let duration_us: i64 = row.get(8)?;
    Ok(DebugEvent {
        id: row.get(0)?,
        trace_id: row.get(1)?,
        timestamp: parse_rfc3339(&ts),
        level: Level::parse(&level),
        event: row.get(4)?,
        module: row.get(5)?,
        message: row.get(6)?,
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
        duration_us: u64::try_from(duration_us).unwrap_or(0),
    })
}

const CONFIG_COLUMNS: &str = "key, value, type, version, updated_at";
const MODULE_COLUMNS: &str =
    "module_id, name, version, enabled, priority, config, schema_extension";
const HOOK_COLUMNS: &str = "hook_id, module_id, event, handler, priority, enabled, config";

/// Whether `e` was caused by a failed SQL constraint (unique, foreign key,
/// not null, check).
pub fn is_constraint_violation(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
        )
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn raw_conn(&self) -> &Mutex<Connection> {
        &self.conn
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; \
             PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )
        .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    /// Run an arbitrary SQL script (module schema extensions).
    pub fn execute_script(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(sql).context("execute_script")?;
        Ok(())
    }

    // ── Config ────────────────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("get_config")?;
        Ok(result)
    }

    pub fn get_config_entry(&self, key: &str) -> Result<Option<ConfigEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {CONFIG_COLUMNS} FROM config WHERE key = ?1"),
                params![key],
                row_to_config_entry,
            )
            .optional()
            .context("get_config_entry")?;
        Ok(result)
    }

    pub fn list_config(&self) -> Result<Vec<ConfigEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFIG_COLUMNS} FROM config ORDER BY key ASC"
        ))?;
        let entries = stmt
            .query_map([], row_to_config_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_config")?;
        Ok(entries)
    }

    /// Upsert a value. An existing row keeps its type; the `config_version_bump`
    /// trigger bumps its version and timestamp.
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .context("set_config")?;
        Ok(())
    }

    pub fn set_config_typed(&self, key: &str, value: &str, value_type: ConfigType) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO config (key, value, type) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, type = excluded.type",
            params![key, value, value_type.as_str()],
        )
        .context("set_config_typed")?;
        Ok(())
    }

    /// Insert a row only if the key is absent. Returns whether a row was written.
    pub fn seed_config(
        &self,
        key: &str,
        value: &str,
        value_type: ConfigType,
        description: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO config (key, value, type, description) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, value, value_type.as_str(), description],
            )
            .context("seed_config")?;
        Ok(n > 0)
    }

    pub fn delete_config(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute("DELETE FROM config WHERE key = ?1", params![key])
            .context("delete_config")?;
        Ok(n > 0)
    }

    /// Missing keys and read failures both read as `false`.
    pub fn get_config_bool(&self, key: &str) -> bool {
        self.get_config(key)
            .ok()
            .flatten()
            .map(|v| parse_bool(&v))
            .unwrap_or(false)
    }

    /// Missing keys, read failures and non-integers all read as `0`.
    pub fn get_config_int(&self, key: &str) -> i64 {
        self.get_config(key)
            .ok()
            .flatten()
            .map(|v| parse_int(&v))
            .unwrap_or(0)
    }

    // ── Revisions ─────────────────────────────────────────────────────────

    /// Monotonic counter bumped by every config insert, update and delete.
    pub fn max_config_version(&self) -> Result<i64> {
        self.revision("config").context("max_config_version")
    }

    /// Monotonic counter bumped by every module or hook row change.
    pub fn module_revision(&self) -> Result<i64> {
        self.revision("modules").context("module_revision")
    }

    fn revision(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let value = conn
            .query_row(
                "SELECT COALESCE(MAX(value), 0) FROM revisions WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .context("revision")?;
        Ok(value)
    }

    // ── Modules ───────────────────────────────────────────────────────────

    pub fn upsert_module(&self, module: &Module) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO modules \
             (module_id, name, version, enabled, priority, config, schema_extension) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(module_id) DO UPDATE SET \
               name = excluded.name, \
               version = excluded.version, \
               enabled = excluded.enabled, \
               priority = excluded.priority, \
               config = excluded.config, \
               schema_extension = excluded.schema_extension, \
               updated_at = strftime('%s', 'now')",
            params![
                module.id,
                module.name,
                module.version,
                module.enabled as i64,
                module.priority,
                module.config.to_string(),
                module.schema_extension,
            ],
        )
        .context("upsert_module")?;
        Ok(())
    }

    pub fn get_module(&self, id: &str) -> Result<Option<Module>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {MODULE_COLUMNS} FROM modules WHERE module_id = ?1"),
                params![id],
                row_to_module,
            )
            .optional()
            .context("get_module")?;
        Ok(result)
    }

    pub fn list_modules(&self) -> Result<Vec<Module>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {MODULE_COLUMNS} FROM modules ORDER BY priority ASC, rowid ASC"
        ))?;
        let modules = stmt
            .query_map([], row_to_module)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_modules")?;
        Ok(modules)
    }

    pub fn list_enabled_modules(&self) -> Result<Vec<Module>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {MODULE_COLUMNS} FROM modules WHERE enabled = 1 \
             ORDER BY priority ASC, rowid ASC"
        ))?;
        let modules = stmt
            .query_map([], row_to_module)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_enabled_modules")?;
        Ok(modules)
    }

    pub fn set_module_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE modules SET enabled = ?1, updated_at = strftime('%s', 'now') \
                 WHERE module_id = ?2",
                params![enabled as i64, id],
            )
            .context("set_module_enabled")?;
        Ok(n > 0)
    }

    /// Deletes the module row; its hooks go with it through the FK cascade.
    pub fn delete_module(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute("DELETE FROM modules WHERE module_id = ?1", params![id])
            .context("delete_module")?;
        Ok(n > 0)
    }

    // ── Hooks ─────────────────────────────────────────────────────────────

    pub fn upsert_hook(&self, hook: &Hook) -> Result<()> {
        anyhow::ensure!(!hook.id.is_empty(), "upsert_hook: hook id must be set");
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO module_hooks \
             (hook_id, module_id, event, handler, priority, enabled, config) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(hook_id) DO UPDATE SET \
               event = excluded.event, \
               handler = excluded.handler, \
               priority = excluded.priority, \
               enabled = excluded.enabled, \
               config = excluded.config",
            params![
                hook.id,
                hook.module_id,
                hook.event,
                hook.handler,
                hook.priority,
                hook.enabled as i64,
                hook.config.to_string(),
            ],
        )
        .with_context(|| format!("upsert_hook {} (module {})", hook.id, hook.module_id))?;
        Ok(())
    }

    /// Enabled hooks of enabled modules in ascending priority; insertion
    /// order breaks ties.
    pub fn list_enabled_hooks(&self) -> Result<Vec<Hook>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT h.hook_id, h.module_id, h.event, h.handler, h.priority, h.enabled, h.config \
             FROM module_hooks h JOIN modules m ON m.module_id = h.module_id \
             WHERE h.enabled = 1 AND m.enabled = 1 \
             ORDER BY h.priority ASC, h.rowid ASC",
        )?;
        let hooks = stmt
            .query_map([], row_to_hook)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_enabled_hooks")?;
        Ok(hooks)
    }

    pub fn list_hooks_for_module(&self, module_id: &str) -> Result<Vec<Hook>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {HOOK_COLUMNS} FROM module_hooks WHERE module_id = ?1 \
             ORDER BY priority ASC, rowid ASC"
        ))?;
        let hooks = stmt
            .query_map(params![module_id], row_to_hook)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_hooks_for_module")?;
        Ok(hooks)
    }

    // ── Debug events ──────────────────────────────────────────────────────

    pub fn insert_debug_event(&self, event: &DebugEvent) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO debug_events \
             (id, trace_id, ts, level, event, module, message, data, duration_us) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.id,
                event.trace_id,
                event.timestamp.to_rfc3339(),
                event.level.as_str(),
                event.event,
                event.module,
                event.message,
                event.data.to_string(),
                i64::try_from(event.duration_us).unwrap_or(i64::MAX),
            ],
        )
        .context("insert_debug_event")?;
        Ok(())
    }

    /// Mirrored events, oldest first, optionally restricted to one trace.
    pub fn list_debug_events(&self, trace_id: Option<&str>, limit: i64) -> Result<Vec<DebugEvent>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, trace_id, ts, level, event, module, message, data, duration_us \
             FROM (SELECT rowid AS rid, * FROM debug_events \
                   WHERE (?1 IS NULL OR trace_id = ?1) \
                   ORDER BY rid DESC LIMIT ?2) \
             ORDER BY rid ASC",
        )?;
        let events = stmt
            .query_map(params![trace_id, limit], row_to_debug_event)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_debug_events")?;
        Ok(events)
    }

    pub fn count_debug_events(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .query_row("SELECT COUNT(*) FROM debug_events", [], |r| r.get(0))
            .context("count_debug_events")?;
        Ok(n)
    }
}
