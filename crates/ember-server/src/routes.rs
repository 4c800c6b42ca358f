use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use ember_core::db::is_constraint_violation;
use ember_core::registry::SchemaExtensionError;
use ember_core::types::{ConfigType, Hook, Module, Payload};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::AppState;

// ── Error helper ──────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// 422 when the request itself is at fault (a constraint such as an unknown
/// `module_id`, or a schema extension that does not apply), 500 otherwise.
fn registration_error(e: anyhow::Error) -> StatusCode {
    if is_constraint_violation(&e) || e.downcast_ref::<SchemaExtensionError>().is_some() {
        warn!("registration rejected: {e:#}");
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        internal(format!("{e:#}"))
    }
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct PutConfigBody {
    /// Strings are stored as-is, anything else as its JSON text.
    pub value: Value,
    #[serde(rename = "type")]
    pub value_type: Option<ConfigType>,
}

#[derive(Deserialize)]
pub(crate) struct DebugLogQuery {
    pub trace: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct FailuresQuery {
    #[serde(default)]
    pub limit: i64,
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let engine = &state.engine;
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "modules": engine.registry().modules().len(),
        "hooks": engine.registry().hook_count(),
        "debug": engine.tracer().is_enabled(),
        "notifier_running": engine.is_running(),
    }))
}

// Config

pub(crate) async fn list_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let entries = state.engine.db().list_config().map_err(internal)?;
    Ok(Json(json!(entries)))
}

pub(crate) async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let entry = state
        .engine
        .db()
        .get_config_entry(&key)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!(entry)))
}

pub(crate) async fn put_config(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<PutConfigBody>,
) -> Result<Json<Value>, StatusCode> {
    let value = match body.value {
        Value::String(s) => s,
        other => other.to_string(),
    };
    let engine = &state.engine;
    let written = match body.value_type {
        Some(t) => engine.set_typed(&key, &value, t),
        None => engine.set(&key, &value),
    };
    written.map_err(internal)?;

    let entry = engine
        .db()
        .get_config_entry(&key)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!(entry)))
}

// Modules & hooks

pub(crate) async fn list_modules(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let engine = &state.engine;
    let modules = engine.db().list_modules().map_err(internal)?;
    let mut out = Vec::with_capacity(modules.len());
    for m in modules {
        let hooks = engine.db().list_hooks_for_module(&m.id).map_err(internal)?;
        let loaded = engine.registry().module(&m.id).is_some();
        let mut v = serde_json::to_value(&m).map_err(internal)?;
        v["loaded"] = json!(loaded);
        v["hooks"] = json!(hooks);
        out.push(v);
    }
    Ok(Json(json!(out)))
}

pub(crate) async fn register_module(
    State(state): State<Arc<AppState>>,
    Json(module): Json<Module>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    state.engine.register_module(&module).map_err(registration_error)?;
    Ok((StatusCode::CREATED, Json(json!({ "module_id": module.id }))))
}

pub(crate) async fn register_hook(
    State(state): State<Arc<AppState>>,
    Json(hook): Json<Hook>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let id = state.engine.register_hook(&hook).map_err(registration_error)?;
    Ok((StatusCode::CREATED, Json(json!({ "hook_id": id }))))
}

// Dispatch

pub(crate) async fn emit(
    State(state): State<Arc<AppState>>,
    Path(event): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    let payload: Payload = if body.is_empty() {
        Payload::new()
    } else {
        match serde_json::from_slice(&body) {
            Ok(Value::Object(map)) => map,
            _ => return Err(StatusCode::BAD_REQUEST),
        }
    };

    let emission = state.engine.emit(&event, payload);
    Ok(Json(json!({
        "event": emission.event,
        "trace_id": emission.trace_id(),
        "invoked": emission.invoked,
        "failed": emission.failed,
        "skipped": emission.skipped,
        "payload": emission.payload,
    })))
}

// Debug

pub(crate) async fn get_debug_log(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DebugLogQuery>,
) -> Json<Value> {
    let tracer = state.engine.tracer();
    let events = match q.trace.as_deref() {
        Some(trace_id) => tracer.trace(trace_id),
        None => tracer.log(),
    };
    Json(json!(events))
}

pub(crate) async fn clear_debug_log(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.engine.clear_debug_log();
    Json(json!({ "ok": true }))
}

pub(crate) async fn enable_debug(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.engine.enable_debug();
    Json(json!({ "enabled": true }))
}

pub(crate) async fn disable_debug(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.engine.disable_debug();
    Json(json!({ "enabled": false }))
}

pub(crate) async fn get_debug_failures(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FailuresQuery>,
) -> Result<Json<Value>, StatusCode> {
    let module = state.engine.debug_module().ok_or(StatusCode::NOT_FOUND)?;
    let failures = module.failed_assertions(q.limit).map_err(internal)?;
    Ok(Json(json!(failures)))
}

pub(crate) async fn get_debug_prompt(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let module = state.engine.debug_module().ok_or(StatusCode::NOT_FOUND)?;
    let prompt = module.debug_prompt().map_err(internal)?;
    Ok(Json(json!({ "prompt": prompt })))
}

pub(crate) async fn sse_debug_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.engine.tracer().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(ev) => serde_json::to_string(&ev)
            .ok()
            .map(|data| Ok(Event::default().event("debug").data(data))),
        _ => None,
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use ember_core::{config::Config, engine::Engine};
    use std::time::Instant;
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        state_with(Config {
            db_path: ":memory:".into(),
            ..Config::default()
        })
    }

    fn state_with(config: Config) -> Arc<AppState> {
        Arc::new(AppState {
            engine: Arc::new(Engine::open(&config).unwrap()),
            start_time: Instant::now(),
        })
    }

    async fn call(
        state: &Arc<AppState>,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = crate::router(Arc::clone(state))
            .oneshot(req.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let s = state();
        let (status, body) = call(&s, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["modules"], 0);
        assert_eq!(body["debug"], false);
    }

    #[tokio::test]
    async fn test_config_put_bumps_version() {
        let s = state();
        let (status, first) = call(
            &s,
            Method::PUT,
            "/api/config/k",
            Some(json!({ "value": "v1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, second) = call(
            &s,
            Method::PUT,
            "/api/config/k",
            Some(json!({ "value": "v2" })),
        )
        .await;
        assert_eq!(second["value"], "v2");
        assert_eq!(
            second["version"].as_i64().unwrap(),
            first["version"].as_i64().unwrap() + 1
        );

        let (_, got) = call(&s, Method::GET, "/api/config/k", None).await;
        assert_eq!(got["value"], "v2");
    }

    #[tokio::test]
    async fn test_config_put_non_string_values() {
        let s = state();
        let (_, entry) = call(
            &s,
            Method::PUT,
            "/api/config/limit",
            Some(json!({ "value": 7, "type": "int" })),
        )
        .await;
        assert_eq!(entry["value"], "7");
        assert_eq!(entry["type"], "int");
        assert_eq!(s.engine.get_int("limit"), 7);
    }

    #[tokio::test]
    async fn test_missing_config_key_is_404() {
        let s = state();
        let (status, _) = call(&s, Method::GET, "/api/config/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_config_includes_seeded_keys() {
        let s = state();
        let (_, body) = call(&s, Method::GET, "/api/config", None).await;
        let keys: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|e| e["key"].as_str())
            .collect();
        assert!(keys.contains(&"default_provider"));
        assert!(keys.contains(&"system_prompt"));
    }

    #[tokio::test]
    async fn test_register_and_emit_traced() {
        let s = state();
        let (status, _) = call(
            &s,
            Method::POST,
            "/api/modules",
            Some(json!({ "module_id": "m1", "name": "First", "priority": 50 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, hook) = call(
            &s,
            Method::POST,
            "/api/hooks",
            Some(json!({ "module_id": "m1", "event": "x", "handler": "log", "priority": 100 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(!hook["hook_id"].as_str().unwrap().is_empty());

        let (_, enabled) = call(&s, Method::POST, "/api/debug/enable", None).await;
        assert_eq!(enabled["enabled"], true);

        let (status, emitted) = call(
            &s,
            Method::POST,
            "/api/emit/x",
            Some(json!({ "a": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(emitted["invoked"], 1);
        let trace_id = emitted["trace_id"].as_str().unwrap().to_string();

        let (_, log) = call(
            &s,
            Method::GET,
            &format!("/api/debug/log?trace={trace_id}"),
            None,
        )
        .await;
        let log = log.as_array().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0]["event"], "x");
        assert_eq!(log[0]["module"], "m1");

        let (_, modules) = call(&s, Method::GET, "/api/modules", None).await;
        assert_eq!(modules[0]["module_id"], "m1");
        assert_eq!(modules[0]["loaded"], true);
        assert_eq!(modules[0]["hooks"].as_array().unwrap().len(), 1);

        call(&s, Method::DELETE, "/api/debug/log", None).await;
        let (_, log) = call(&s, Method::GET, "/api/debug/log", None).await;
        assert!(log.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hook_for_unknown_module_is_rejected() {
        let s = state();
        let (status, _) = call(
            &s,
            Method::POST,
            "/api/hooks",
            Some(json!({ "module_id": "ghost", "event": "x", "handler": "log" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = call(
            &s,
            Method::POST,
            "/api/modules",
            Some(json!({ "module_id": "ext", "name": "Ext", "schema_extension": "CREATE TABLE (" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_store_failure_during_registration_is_500() {
        let s = state();
        s.engine
            .register_module(&Module::new("m1", "First"))
            .unwrap();
        s.engine.db().execute_script("DROP TABLE module_hooks;").unwrap();

        let (status, _) = call(
            &s,
            Method::POST,
            "/api/hooks",
            Some(json!({ "module_id": "m1", "event": "x", "handler": "log" })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_debug_failures_need_the_debug_module() {
        let s = state();
        let (status, _) = call(&s, Method::GET, "/api/debug/failures", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_failed_assertions_are_served() {
        let s = state_with(Config {
            db_path: ":memory:".into(),
            debug_module: true,
            ..Config::default()
        });
        call(
            &s,
            Method::POST,
            "/api/hooks",
            Some(json!({ "module_id": "debug", "event": "check", "handler": "test_assert" })),
        )
        .await;
        call(&s, Method::POST, "/api/debug/enable", None).await;
        call(
            &s,
            Method::POST,
            "/api/emit/check",
            Some(json!({ "assertion_name": "reply", "expected": "yes", "actual": "no" })),
        )
        .await;

        let (status, failures) =
            call(&s, Method::GET, "/api/debug/failures?limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        let failures = failures.as_array().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0]["name"], "reply");
        assert_eq!(failures[0]["event"], "check");

        let (_, prompt) = call(&s, Method::GET, "/api/debug/prompt", None).await;
        assert!(prompt["prompt"].as_str().unwrap().contains("reply"));
    }

    #[tokio::test]
    async fn test_emit_rejects_non_object_payload() {
        let s = state();
        let (status, _) = call(&s, Method::POST, "/api/emit/x", Some(json!([1, 2]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&s, Method::POST, "/api/emit/x", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["invoked"], 0);
    }
}
