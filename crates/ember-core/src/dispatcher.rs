use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::context::{DebugContext, HookContext};
use crate::handlers::HandlerTable;
use crate::registry::ModuleRegistry;
use crate::tracer::DebugTracer;
use crate::types::{DebugEvent, Hook, Level, Payload};

#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub session: Option<String>,
    /// Trace id of the emit that caused this one.
    pub parent_trace: Option<String>,
}

/// Result of one emit. Dispatch never fails as a whole; per-hook failures
/// are only counted here (and traced when tracing is on).
#[derive(Debug, Clone)]
pub struct Emission {
    pub event: String,
    pub payload: Payload,
    pub debug: Option<DebugContext>,
    pub invoked: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Emission {
    fn from_context(ctx: HookContext) -> Self {
        Self {
            event: ctx.event,
            payload: ctx.payload,
            debug: ctx.debug,
            invoked: 0,
            failed: 0,
            skipped: 0,
        }
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.debug.as_ref().map(|d| d.trace_id.as_str())
    }
}

pub struct Dispatcher {
    registry: Arc<ModuleRegistry>,
    handlers: HandlerTable,
    tracer: Arc<DebugTracer>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        handlers: HandlerTable,
        tracer: Arc<DebugTracer>,
    ) -> Self {
        Self {
            registry,
            handlers,
            tracer,
        }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn tracer(&self) -> &Arc<DebugTracer> {
        &self.tracer
    }

    pub fn emit(&self, event: &str, payload: Payload) -> Emission {
        self.emit_with(event, payload, EmitOptions::default())
    }

    /// Run every hook registered for `event` (wildcards included) in
    /// priority order against one shared context.
    ///
    /// Only the lookup holds the registry lock. Unknown handler names are
    /// skipped; a failing or panicking handler is isolated from the rest.
    pub fn emit_with(&self, event: &str, payload: Payload, opts: EmitOptions) -> Emission {
        let hooks = self.registry.hooks_for(event);
        let mut ctx = HookContext::new(event, payload);
        ctx.session = opts.session;
        if hooks.is_empty() {
            return Emission::from_context(ctx);
        }

        if self.tracer.is_enabled() {
            ctx.debug = Some(DebugContext::new(opts.parent_trace));
        }

        let (mut invoked, mut failed, mut skipped) = (0, 0, 0);
        for hook in &hooks {
            let Some(handler) = self.handlers.resolve(&hook.handler) else {
                debug!("hook {} on {event}: unknown handler {:?}, skipped", hook.id, hook.handler);
                skipped += 1;
                continue;
            };

            let start = Instant::now();
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(&mut ctx)))
                .unwrap_or_else(|p| Err(anyhow!("handler panicked: {}", panic_message(&p))));
            let elapsed = start.elapsed();
            invoked += 1;

            match result {
                Ok(()) => {
                    self.record(
                        &mut ctx,
                        hook,
                        Level::Debug,
                        format!("Hook {} executed", hook.handler),
                        elapsed,
                    );
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        "hook {} ({}) on {event} failed: {e:#}",
                        hook.id, hook.handler
                    );
                    self.record(
                        &mut ctx,
                        hook,
                        Level::Error,
                        format!("Hook {} failed: {e:#}", hook.handler),
                        elapsed,
                    );
                }
            }
        }

        Emission {
            invoked,
            failed,
            skipped,
            ..Emission::from_context(ctx)
        }
    }

    /// One event per invocation, into the call's context and the ring.
    fn record(
        &self,
        ctx: &mut HookContext,
        hook: &Hook,
        level: Level,
        message: String,
        elapsed: Duration,
    ) {
        let event_name = ctx.event.clone();
        let Some(debug) = ctx.debug.as_mut() else {
            return;
        };
        let event = DebugEvent::new(&debug.trace_id, level, &event_name)
            .with_module(&hook.module_id)
            .with_message(message)
            .with_data(serde_json::json!({ "hook_id": hook.id, "handler": hook.handler }))
            .with_duration(elapsed);
        debug.events.push(event.clone());
        self.tracer.append(event);
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
