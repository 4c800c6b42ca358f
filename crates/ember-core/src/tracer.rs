use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

use crate::db::Db;
use crate::types::DebugEvent;

pub const DEFAULT_RING_CAPACITY: usize = 1000;

const ANALYSIS_PREAMBLE: &str = "Analyze the following debug log and identify:
1. Any errors or failures
2. Performance issues (slow operations)
3. Patterns that could be optimized
4. Suggested fixes

Debug Log:
";

/// Bounded in-memory trace log with an optional best-effort store mirror.
///
/// The ring has its own lock, independent of the registry's, so recording
/// never serializes with dispatch lookups beyond one append.
pub struct DebugTracer {
    enabled: AtomicBool,
    capacity: usize,
    ring: Mutex<VecDeque<DebugEvent>>,
    mirror: Option<Arc<Db>>,
    tx: broadcast::Sender<DebugEvent>,
}

impl DebugTracer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(256);
        Self {
            enabled: AtomicBool::new(false),
            capacity,
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            mirror: None,
            tx,
        }
    }

    /// Mirror every appended event into `debug_events`.
    pub fn with_mirror(mut self, db: Arc<Db>) -> Self {
        self.mirror = Some(db);
        self
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an event, evicting the oldest when full.
    ///
    /// Does not consult the enabled flag: callers decide at the start of an
    /// emit, and an emit already in flight keeps recording after a disable.
    pub fn append(&self, event: DebugEvent) {
        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            while ring.len() >= self.capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        if let Some(db) = &self.mirror {
            if let Err(e) = db.insert_debug_event(&event) {
                debug!("debug event mirror write failed: {e:#}");
            }
        }

        let _ = self.tx.send(event);
    }

    /// Snapshot of the ring, oldest first. Mutating it does not touch the tracer.
    pub fn log(&self) -> Vec<DebugEvent> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events belonging to one trace, oldest first.
    pub fn trace(&self, trace_id: &str) -> Vec<DebugEvent> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter()
            .filter(|e| e.trace_id == trace_id)
            .cloned()
            .collect()
    }

    /// Empty the ring. Mirrored rows are left alone.
    pub fn clear(&self) {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn log_json(&self) -> String {
        serde_json::to_string_pretty(&self.log()).unwrap_or_else(|_| "[]".into())
    }

    /// Prompt asking an LLM to review the current log.
    pub fn analysis_prompt(&self) -> String {
        format!("{ANALYSIS_PREAMBLE}{}", self.log_json())
    }

    /// Live feed of appended events.
    pub fn subscribe(&self) -> broadcast::Receiver<DebugEvent> {
        self.tx.subscribe()
    }
}

impl Default for DebugTracer {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Level;

    fn event(n: usize) -> DebugEvent {
        DebugEvent::new("trace", Level::Debug, &format!("e{n}"))
    }

    #[test]
    fn ring_evicts_oldest_first() {
        let tracer = DebugTracer::new(3);
        for n in 0..4 {
            tracer.append(event(n));
        }
        let names: Vec<String> = tracer.log().into_iter().map(|e| e.event).collect();
        assert_eq!(names, vec!["e1", "e2", "e3"]);
    }

    #[test]
    fn log_is_a_defensive_copy() {
        let tracer = DebugTracer::new(10);
        tracer.append(event(0));
        let mut copy = tracer.log();
        copy.clear();
        copy.push(event(99));
        assert_eq!(tracer.len(), 1);
        assert_eq!(tracer.log()[0].event, "e0");
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let tracer = DebugTracer::new(0);
        tracer.append(event(0));
        tracer.append(event(1));
        assert_eq!(tracer.capacity(), 1);
        assert_eq!(tracer.log()[0].event, "e1");
    }

    #[test]
    fn analysis_prompt_embeds_log() {
        let tracer = DebugTracer::new(10);
        tracer.append(event(7));
        let prompt = tracer.analysis_prompt();
        assert!(prompt.starts_with("Analyze the following debug log"));
        assert!(prompt.contains("\"event\": \"e7\""));
    }

    #[test]
    fn subscribers_see_appends() {
        let tracer = DebugTracer::new(10);
        let mut rx = tracer.subscribe();
        tracer.append(event(1));
        assert_eq!(rx.try_recv().unwrap().event, "e1");
    }
}
