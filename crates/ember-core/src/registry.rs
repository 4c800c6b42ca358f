use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::db::Db;
use crate::notifier::ChangeNotifier;
use crate::types::{Hook, Module, WILDCARD_EVENT};

/// A module's schema extension failed to apply. The module row itself is
/// already stored, so registering again is safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaExtensionError {
    pub module_id: String,
}

impl fmt::Display for SchemaExtensionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execute schema extension for module {}", self.module_id)
    }
}

/// Derived in-memory view of enabled modules and hooks.
#[derive(Debug, Default)]
struct Snapshot {
    modules: HashMap<String, Module>,
    /// Exact-event hooks, each list in ascending priority.
    hooks: HashMap<String, Vec<Hook>>,
    /// Hooks registered under [`WILDCARD_EVENT`], ascending priority.
    wildcard: Vec<Hook>,
}

/// Loads enabled modules and hooks from the store into an event index.
///
/// The index is rebuilt wholesale on every reload under the exclusive side
/// of one read-write lock; lookups take the shared side.
pub struct ModuleRegistry {
    db: Arc<Db>,
    state: RwLock<Snapshot>,
}

impl ModuleRegistry {
    /// Build the registry and perform the initial load.
    pub fn new(db: Arc<Db>) -> Result<Self> {
        let registry = Self {
            db,
            state: RwLock::new(Snapshot::default()),
        };
        registry.reload()?;
        Ok(registry)
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// Discard the current index and rebuild it from the store.
    ///
    /// Holds the write lock across both queries so lookups never see a
    /// half-built index. On a store error the previous index is kept.
    pub fn reload(&self) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        let modules = self.db.list_enabled_modules().context("reload modules")?;
        let hooks = self.db.list_enabled_hooks().context("reload hooks")?;

        let mut next = Snapshot::default();
        for module in modules {
            next.modules.insert(module.id.clone(), module);
        }
        for hook in hooks {
            if hook.is_wildcard() {
                next.wildcard.push(hook);
            } else {
                next.hooks.entry(hook.event.clone()).or_default().push(hook);
            }
        }

        *state = next;
        Ok(())
    }

    /// Upsert a module, run its schema extension, then reload.
    ///
    /// The row is committed before the extension runs; if the script fails
    /// the error is returned with the row already in place, so calling again
    /// with the same module is safe.
    pub fn register_module(&self, module: &Module) -> Result<()> {
        self.db.upsert_module(module)?;

        if let Some(sql) = module.schema_extension.as_deref().filter(|s| !s.trim().is_empty()) {
            self.db
                .execute_script(sql)
                .with_context(|| SchemaExtensionError {
                    module_id: module.id.clone(),
                })?;
        }

        self.reload()?;
        info!(
            "registered module {} v{} (priority {})",
            module.id, module.version, module.priority
        );
        Ok(())
    }

    /// Upsert a hook (generating an id when absent), then reload.
    /// Returns the hook id.
    pub fn register_hook(&self, hook: &Hook) -> Result<String> {
        let mut hook = hook.clone();
        if hook.id.is_empty() {
            hook.id = uuid::Uuid::new_v4().to_string();
        }
        self.db.upsert_hook(&hook)?;
        self.reload()?;
        info!(
            "registered hook {} on {:?} -> {} for module {}",
            hook.id, hook.event, hook.handler, hook.module_id
        );
        Ok(hook.id)
    }

    pub fn set_module_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let found = self.db.set_module_enabled(id, enabled)?;
        self.reload()?;
        Ok(found)
    }

    /// Delete a module row and, through the cascade, its hooks.
    pub fn delete_module(&self, id: &str) -> Result<bool> {
        let found = self.db.delete_module(id)?;
        self.reload()?;
        Ok(found)
    }

    // ── Lookups ───────────────────────────────────────────────────────────

    pub fn module(&self, id: &str) -> Option<Module> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.modules.get(id).cloned()
    }

    /// Loaded modules in ascending priority.
    pub fn modules(&self) -> Vec<Module> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut modules: Vec<Module> = state.modules.values().cloned().collect();
        modules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        modules
    }

    /// Effective dispatch list for `event`: exact and wildcard hooks merged
    /// by priority. On equal priority exact hooks run first; within each
    /// list the store's order is kept.
    pub fn hooks_for(&self, event: &str) -> Vec<Hook> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let exact = state.hooks.get(event).map(Vec::as_slice).unwrap_or(&[]);
        let wildcard: &[Hook] = if event == WILDCARD_EVENT {
            &[]
        } else {
            &state.wildcard
        };
        merge_by_priority(exact, wildcard)
    }

    pub fn hook_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.hooks.values().map(Vec::len).sum::<usize>() + state.wildcard.len()
    }

    /// Reload whenever the notifier reports a change.
    pub fn watch(self: &Arc<Self>, notifier: &ChangeNotifier) {
        let registry = Arc::clone(self);
        notifier.on_change(move |event| {
            if let Err(e) = registry.reload() {
                warn!("registry reload after {event} failed: {e:#}");
            }
        });
    }
}

fn merge_by_priority(exact: &[Hook], wildcard: &[Hook]) -> Vec<Hook> {
    let mut merged = Vec::with_capacity(exact.len() + wildcard.len());
    let (mut i, mut j) = (0, 0);
    while i < exact.len() && j < wildcard.len() {
        if wildcard[j].priority < exact[i].priority {
            merged.push(wildcard[j].clone());
            j += 1;
        } else {
            merged.push(exact[i].clone());
            i += 1;
        }
    }
    merged.extend_from_slice(&exact[i..]);
    merged.extend_from_slice(&wildcard[j..]);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(id: &str, event: &str, priority: i64) -> Hook {
        Hook::new("m", event, "log").with_id(id).with_priority(priority)
    }

    fn ids(hooks: &[Hook]) -> Vec<&str> {
        hooks.iter().map(|h| h.id.as_str()).collect()
    }

    #[test]
    fn merge_interleaves_by_priority() {
        let exact = vec![hook("e5", "x", 5), hook("e10", "x", 10), hook("e20", "x", 20)];
        let wildcard = vec![hook("w1", "*", 1), hook("w15", "*", 15), hook("w99", "*", 99)];
        let merged = merge_by_priority(&exact, &wildcard);
        assert_eq!(ids(&merged), vec!["w1", "e5", "e10", "w15", "e20", "w99"]);
    }

    #[test]
    fn merge_prefers_exact_on_ties() {
        let exact = vec![hook("e", "x", 10)];
        let wildcard = vec![hook("w", "*", 10)];
        assert_eq!(ids(&merge_by_priority(&exact, &wildcard)), vec!["e", "w"]);
    }

    #[test]
    fn merge_with_empty_sides() {
        let exact = vec![hook("e", "x", 10)];
        assert_eq!(ids(&merge_by_priority(&exact, &[])), vec!["e"]);
        assert_eq!(ids(&merge_by_priority(&[], &exact)), vec!["e"]);
        assert!(merge_by_priority(&[], &[]).is_empty());
    }
}
