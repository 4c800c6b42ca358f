//! Builtin hook handlers.
//!
//! Hooks name their handler by string. Names are resolved against a
//! [`HandlerTable`] built once at startup; the set of handler kinds is the
//! closed [`BuiltinHandler`] enum. Unknown names are accepted at registration
//! and skipped at dispatch.

use std::collections::HashMap;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tracing::info;

use crate::context::HookContext;
use crate::types::{DebugAssertion, DebugEvent, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinHandler {
    /// Log the event name and payload.
    Log,
    /// Capture the payload into the call's trace.
    Debug,
    /// Flag the payload for LLM analysis of the trace.
    LlmAnalyze,
    /// Record a named expected/actual assertion into the trace.
    TestAssert,
    /// Flag an `error` in the payload for an LLM fix request.
    AutoFix,
    /// Validate a pattern-learning observation.
    PatternLearn,
}

impl BuiltinHandler {
    pub const ALL: [BuiltinHandler; 6] = [
        Self::Log,
        Self::Debug,
        Self::LlmAnalyze,
        Self::TestAssert,
        Self::AutoFix,
        Self::PatternLearn,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Debug => "debug",
            Self::LlmAnalyze => "llm_analyze",
            Self::TestAssert => "test_assert",
            Self::AutoFix => "auto_fix",
            Self::PatternLearn => "pattern_learn",
        }
    }

    pub fn invoke(&self, ctx: &mut HookContext) -> Result<()> {
        match self {
            Self::Log => handle_log(ctx),
            Self::Debug => handle_debug(ctx),
            Self::LlmAnalyze => handle_llm_analyze(ctx),
            Self::TestAssert => handle_test_assert(ctx),
            Self::AutoFix => handle_auto_fix(ctx),
            Self::PatternLearn => handle_pattern_learn(ctx),
        }
    }
}

/// Name → handler resolution table.
#[derive(Debug, Clone)]
pub struct HandlerTable {
    handlers: HashMap<String, BuiltinHandler>,
}

impl HandlerTable {
    /// Table holding every builtin under its canonical name.
    pub fn builtin() -> Self {
        let handlers = BuiltinHandler::ALL
            .iter()
            .map(|h| (h.name().to_string(), *h))
            .collect();
        Self { handlers }
    }

    pub fn resolve(&self, name: &str) -> Option<BuiltinHandler> {
        self.handlers.get(name).copied()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::builtin()
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

fn handle_log(ctx: &mut HookContext) -> Result<()> {
    let payload = Value::Object(ctx.payload.clone()).to_string();
    info!(
        event = %ctx.event,
        "[{}] {}: {}",
        ctx.timestamp.format("%H:%M:%S"),
        ctx.event,
        payload
    );
    Ok(())
}

fn handle_debug(ctx: &mut HookContext) -> Result<()> {
    let data = Value::Object(ctx.payload.clone());
    let event = ctx.event.clone();
    if let Some(debug) = ctx.debug.as_mut() {
        let captured = DebugEvent::new(&debug.trace_id, Level::Debug, &event).with_data(data);
        debug.events.push(captured);
    }
    Ok(())
}

fn handle_llm_analyze(ctx: &mut HookContext) -> Result<()> {
    let Some(debug) = ctx.debug.as_ref() else {
        return Ok(());
    };
    let snapshot = serde_json::to_value(debug)?;
    ctx.payload
        .insert("_llm_analysis_requested".into(), json!(true));
    ctx.payload.insert("_debug_context".into(), snapshot);
    Ok(())
}

fn handle_test_assert(ctx: &mut HookContext) -> Result<()> {
    let name = ctx.payload_str("assertion_name").to_string();
    let expected = ctx.payload_str("expected").to_string();
    let actual = ctx.payload_str("actual").to_string();
    if let Some(debug) = ctx.debug.as_mut() {
        let assertion = DebugAssertion::evaluate(&debug.trace_id, &name, &expected, &actual);
        debug.assertions.push(assertion);
    }
    Ok(())
}

fn handle_auto_fix(ctx: &mut HookContext) -> Result<()> {
    let Some(error) = ctx.payload.get("error").and_then(Value::as_str).map(str::to_string) else {
        return Ok(());
    };
    ctx.payload.insert("_auto_fix_requested".into(), json!(true));
    ctx.payload.insert("_error_to_fix".into(), json!(error));
    Ok(())
}

fn handle_pattern_learn(ctx: &mut HookContext) -> Result<()> {
    let pattern_type = ctx.payload_str("pattern_type");
    let input = ctx.payload_str("input");
    if pattern_type.is_empty() || input.is_empty() {
        return Ok(());
    }
    if ctx.payload_bool("success") && ctx.payload_str("output").is_empty() {
        bail!("pattern {pattern_type:?} marked successful without an output");
    }
    ctx.payload.insert("_pattern_validated".into(), json!(true));
    Ok(())
}
