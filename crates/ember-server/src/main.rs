mod routes;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use ember_core::{config::Config, engine::Engine, types::ConfigType, Payload};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub engine: Arc<Engine>,
    pub start_time: Instant,
}

// ── CLI ───────────────────────────────────────────────────────────────────

/// Hot-reloadable configuration and event-hook runtime
#[derive(Parser, Debug)]
#[command(name = "ember")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Store to use instead of DB_PATH / a fresh session file
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine and the admin HTTP API (default)
    Serve,

    /// Read or write config rows
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Emit one event with tracing on and print the result
    Emit {
        event: String,
        /// JSON object payload
        payload: Option<String>,
    },

    /// Print persisted debug events
    DebugLog {
        #[arg(long)]
        trace: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        /// string, int, bool or json
        #[arg(long = "type")]
        value_type: Option<String>,
    },
    List,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ember=info,ember_core=info,tower_http=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
        config.session_db = false;
    }
    let command = cli.command.unwrap_or(Command::Serve);
    if !matches!(command, Command::Serve) {
        existing_store(&config)?;
    }
    if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data dir {}", parent.display()))?;
        }
    }

    let engine = Arc::new(Engine::open(&config)?);

    match command {
        Command::Serve => serve(engine).await,
        Command::Config { action } => run_config(&engine, action),
        Command::Emit { event, payload } => run_emit(&engine, &event, payload.as_deref()),
        Command::DebugLog { trace, limit } => {
            let events = engine.db().list_debug_events(trace.as_deref(), limit)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            Ok(())
        }
    }
}

/// One-shot commands inspect a store that already exists; a fresh session
/// file would always be empty.
fn existing_store(config: &Config) -> Result<()> {
    if config.session_db {
        bail!("no store selected: pass --db <path> or set DB_PATH");
    }
    if config.db_path != ":memory:" && !std::path::Path::new(&config.db_path).exists() {
        bail!("store {} does not exist", config.db_path);
    }
    Ok(())
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .route("/api/health", get(routes::health))
        // Config
        .route("/api/config", get(routes::list_config))
        .route(
            "/api/config/:key",
            get(routes::get_config).put(routes::put_config),
        )
        // Modules & hooks
        .route(
            "/api/modules",
            get(routes::list_modules).post(routes::register_module),
        )
        .route("/api/hooks", post(routes::register_hook))
        // Dispatch
        .route("/api/emit/:event", post(routes::emit))
        // Debug
        .route(
            "/api/debug/log",
            get(routes::get_debug_log).delete(routes::clear_debug_log),
        )
        .route("/api/debug/enable", post(routes::enable_debug))
        .route("/api/debug/disable", post(routes::disable_debug))
        .route("/api/debug/failures", get(routes::get_debug_failures))
        .route("/api/debug/prompt", get(routes::get_debug_prompt))
        .route("/api/debug/stream", get(routes::sse_debug_events))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn serve(engine: Arc<Engine>) -> Result<()> {
    engine.start();

    let config = engine.config();
    let addr = format!("{}:{}", config.web_bind, config.web_port);
    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
        start_time: Instant::now(),
    });

    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    engine.shutdown().await;
    Ok(())
}

fn run_config(engine: &Engine, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Get { key } => match engine.db().get_config_entry(&key)? {
            Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
            None => bail!("config key {key:?} not found"),
        },
        ConfigAction::Set {
            key,
            value,
            value_type,
        } => {
            match value_type {
                Some(t) => engine.set_typed(&key, &value, ConfigType::parse(&t))?,
                None => engine.set(&key, &value)?,
            }
            if let Some(entry) = engine.db().get_config_entry(&key)? {
                println!("{} = {} (v{})", entry.key, entry.value, entry.version);
            }
        }
        ConfigAction::List => {
            for entry in engine.db().list_config()? {
                println!(
                    "{:<24} {:<6} v{:<4} {}",
                    entry.key,
                    entry.value_type.as_str(),
                    entry.version,
                    entry.value
                );
            }
        }
    }
    Ok(())
}

fn run_emit(engine: &Engine, event: &str, payload: Option<&str>) -> Result<()> {
    let payload: Payload = match payload {
        Some(raw) => match serde_json::from_str(raw).context("parse payload")? {
            Value::Object(map) => map,
            _ => bail!("payload must be a JSON object"),
        },
        None => Payload::new(),
    };

    engine.enable_debug();
    let emission = engine.emit(event, payload);
    let events = emission.debug.as_ref().map(|d| d.events.clone()).unwrap_or_default();
    let summary = json!({
        "event": emission.event,
        "trace_id": emission.trace_id(),
        "invoked": emission.invoked,
        "failed": emission.failed,
        "skipped": emission.skipped,
        "payload": emission.payload,
        "events": events,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_commands_need_an_existing_store() {
        let session = Config {
            db_path: ".ember/session_x.db".into(),
            session_db: true,
            ..Config::default()
        };
        let err = existing_store(&session).unwrap_err();
        assert!(err.to_string().contains("--db"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ember.db");
        let mut explicit = Config {
            db_path: path.to_string_lossy().into_owned(),
            ..Config::default()
        };
        assert!(existing_store(&explicit).is_err());

        std::fs::write(&path, b"").unwrap();
        existing_store(&explicit).unwrap();

        explicit.db_path = ":memory:".into();
        existing_store(&explicit).unwrap();
    }
}
