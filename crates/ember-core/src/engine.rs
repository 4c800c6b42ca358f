use std::sync::{Arc, Mutex, OnceLock, RwLock};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::debug_module::DebugModule;
use crate::dispatcher::{Dispatcher, EmitOptions, Emission};
use crate::handlers::HandlerTable;
use crate::notifier::{ChangeEvent, ChangeNotifier};
use crate::registry::ModuleRegistry;
use crate::tracer::DebugTracer;
use crate::types::{ConfigType, DebugEvent, Hook, Module, Payload};

/// The hot-reloadable runtime: store, notifier, registry, dispatcher and
/// tracer wired together.
pub struct Engine {
    config: Arc<RwLock<Config>>,
    db: Arc<Db>,
    tracer: Arc<DebugTracer>,
    registry: Arc<ModuleRegistry>,
    dispatcher: Dispatcher,
    notifier: Arc<ChangeNotifier>,
    debug_module: OnceLock<DebugModule>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Open, migrate and seed the store at `config.db_path`, then build the
    /// runtime on top of it. The notifier is not started until [`start`].
    ///
    /// [`start`]: Engine::start
    pub fn open(config: &Config) -> Result<Self> {
        let db = if config.db_path == ":memory:" {
            Db::open_in_memory()?
        } else {
            Db::open(&config.db_path)?
        };
        Self::with_db(config, db)
    }

    /// Build the runtime over an already-opened store. Migrates and seeds.
    pub fn with_db(config: &Config, mut db: Db) -> Result<Self> {
        db.migrate()?;
        let seeded = config.seed_db(&db).context("seed config")?;
        if seeded > 0 {
            info!("seeded {seeded} default config key(s)");
        }
        let db = Arc::new(db);
        let config = config.load_from_db(&db);

        let mut tracer = DebugTracer::new(config.debug_ring_capacity);
        if config.debug_persist {
            tracer = tracer.with_mirror(Arc::clone(&db));
        }
        let tracer = Arc::new(tracer);
        if config.debug_enabled {
            tracer.enable();
        }

        let registry = Arc::new(ModuleRegistry::new(Arc::clone(&db))?);
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            HandlerTable::builtin(),
            Arc::clone(&tracer),
        );
        let notifier = Arc::new(ChangeNotifier::new(
            Arc::clone(&db),
            std::time::Duration::from_millis(config.poll_interval_ms),
        ));
        registry.watch(&notifier);

        let db_path = config.db_path.clone();
        let install_debug_module = config.debug_module;
        let config = Arc::new(RwLock::new(config));
        {
            let config = Arc::clone(&config);
            let db = Arc::clone(&db);
            notifier.on_change(move |event| {
                if event == ChangeEvent::ConfigChanged {
                    reload_config(&config, &db);
                }
            });
        }

        info!(
            "engine ready: {} module(s), {} hook(s), db {}",
            registry.modules().len(),
            registry.hook_count(),
            db_path
        );

        let engine = Self {
            config,
            db,
            tracer,
            registry,
            dispatcher,
            notifier,
            debug_module: OnceLock::new(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        };
        if install_debug_module {
            engine.install_debug_module()?;
        }
        Ok(engine)
    }

    /// Spawn the change-notifier loop. Must be called inside a tokio runtime;
    /// calling it again while running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }
        *task = Some(self.notifier.spawn(self.cancel.clone()));
        info!(
            "change notifier started (every {}ms)",
            self.notifier.interval().as_millis()
        );
    }

    /// Stop the notifier and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("change notifier task ended abnormally: {e}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    /// Current configuration. Runtime fields track the store.
    pub fn config(&self) -> Config {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Re-read runtime fields from the store now instead of on the next tick.
    pub fn reload_config(&self) {
        reload_config(&self.config, &self.db);
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn tracer(&self) -> &Arc<DebugTracer> {
        &self.tracer
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    // ── Config ────────────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.db.get_config(key)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db.set_config(key, value)?;
        self.reload_config();
        Ok(())
    }

    pub fn set_typed(&self, key: &str, value: &str, value_type: ConfigType) -> Result<()> {
        self.db.set_config_typed(key, value, value_type)?;
        self.reload_config();
        Ok(())
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.db.get_config_bool(key)
    }

    pub fn get_int(&self, key: &str) -> i64 {
        self.db.get_config_int(key)
    }

    pub fn on_change<F>(&self, f: F)
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.notifier.on_change(f);
    }

    pub fn take_reload_signal(&self) -> Option<mpsc::Receiver<()>> {
        self.notifier.take_reload_signal()
    }

    // ── Modules & dispatch ────────────────────────────────────────────────

    pub fn register_module(&self, module: &Module) -> Result<()> {
        self.registry.register_module(module)
    }

    pub fn register_hook(&self, hook: &Hook) -> Result<String> {
        self.registry.register_hook(hook)
    }

    pub fn emit(&self, event: &str, payload: Payload) -> Emission {
        self.emit_with(event, payload, EmitOptions::default())
    }

    /// Dispatch `event`. With the debug module installed, a traced emit is
    /// also persisted; a failed write there is logged and otherwise ignored.
    pub fn emit_with(&self, event: &str, payload: Payload, opts: EmitOptions) -> Emission {
        let emission = self.dispatcher.emit_with(event, payload, opts);
        if let Some(module) = self.debug_module.get() {
            if let Err(e) = module.record_emission(&emission) {
                debug!("persist trace for {event} failed: {e:#}");
            }
        }
        emission
    }

    // ── Debug ─────────────────────────────────────────────────────────────

    /// Register the `debug` module and start persisting traced emits.
    /// Installing twice returns the module already in place.
    pub fn install_debug_module(&self) -> Result<&DebugModule> {
        if let Some(module) = self.debug_module.get() {
            return Ok(module);
        }
        let module = DebugModule::install(&self.registry, Arc::clone(&self.tracer))?;
        Ok(self.debug_module.get_or_init(|| module))
    }

    pub fn debug_module(&self) -> Option<&DebugModule> {
        self.debug_module.get()
    }

    pub fn enable_debug(&self) {
        self.tracer.enable();
        info!("debug tracing enabled");
    }

    pub fn disable_debug(&self) {
        self.tracer.disable();
        info!("debug tracing disabled");
    }

    pub fn debug_log(&self) -> Vec<DebugEvent> {
        self.tracer.log()
    }

    pub fn clear_debug_log(&self) {
        self.tracer.clear();
    }
}

fn reload_config(config: &RwLock<Config>, db: &Db) {
    let next = config
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .load_from_db(db);
    *config.write().unwrap_or_else(|e| e.into_inner()) = next;
    debug!("runtime config reloaded");
}
