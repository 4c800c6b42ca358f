use std::sync::Arc;

use ember_core::db::{is_constraint_violation, Db};
use ember_core::dispatcher::Dispatcher;
use ember_core::handlers::HandlerTable;
use ember_core::registry::{ModuleRegistry, SchemaExtensionError};
use ember_core::tracer::DebugTracer;
use ember_core::types::{Hook, Module, Payload};

fn registry() -> Arc<ModuleRegistry> {
    let mut db = Db::open_in_memory().unwrap();
    db.migrate().unwrap();
    Arc::new(ModuleRegistry::new(Arc::new(db)).unwrap())
}

#[test]
fn test_register_module_twice_is_idempotent() {
    let registry = registry();
    let module = Module::new("m1", "First").with_priority(50);

    registry.register_module(&module).unwrap();
    registry.register_module(&module).unwrap();

    let rows = registry.db().list_modules().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0], module);
    assert_eq!(registry.modules().len(), 1);
    assert_eq!(registry.module("m1").unwrap(), module);
}

#[test]
fn test_register_module_replaces_mutable_fields() {
    let registry = registry();
    registry
        .register_module(&Module::new("m1", "First").with_priority(50))
        .unwrap();
    registry
        .register_module(
            &Module::new("m1", "Renamed")
                .with_priority(5)
                .with_version("2.0.0")
                .with_config(serde_json::json!({ "k": 1 })),
        )
        .unwrap();

    let m = registry.module("m1").unwrap();
    assert_eq!(m.name, "Renamed");
    assert_eq!(m.priority, 5);
    assert_eq!(m.version, "2.0.0");
    assert_eq!(m.config["k"], 1);
}

#[test]
fn test_modules_sorted_by_priority() {
    let registry = registry();
    registry.register_module(&Module::new("late", "Late").with_priority(90)).unwrap();
    registry.register_module(&Module::new("early", "Early").with_priority(1)).unwrap();
    let ids: Vec<String> = registry.modules().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["early", "late"]);
}

#[test]
fn test_schema_extension_failure_is_retriable() {
    let registry = registry();
    let broken = Module::new("ext", "Extension").with_schema_extension("CREATE TABLE (");

    let err = registry.register_module(&broken).unwrap_err();
    assert_eq!(
        err.downcast_ref::<SchemaExtensionError>().map(|e| e.module_id.as_str()),
        Some("ext")
    );
    assert!(!is_constraint_violation(&err));
    // The upsert committed before the script ran.
    assert!(registry.db().get_module("ext").unwrap().is_some());

    let fixed = Module::new("ext", "Extension")
        .with_schema_extension("CREATE TABLE IF NOT EXISTS ext_rows (id INTEGER PRIMARY KEY);");
    registry.register_module(&fixed).unwrap();
    registry.register_module(&fixed).unwrap();

    assert_eq!(registry.db().list_modules().unwrap().len(), 1);
    assert!(registry.module("ext").is_some());
    registry
        .db()
        .execute_script("INSERT INTO ext_rows (id) VALUES (1);")
        .unwrap();
}

#[test]
fn test_register_hook_generates_id() {
    let registry = registry();
    registry.register_module(&Module::new("m1", "First")).unwrap();

    let id = registry.register_hook(&Hook::new("m1", "x", "log")).unwrap();
    assert!(!id.is_empty());
    let hooks = registry.hooks_for("x");
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0].id, id);

    let same = registry
        .register_hook(&Hook::new("m1", "x", "debug").with_id(&id))
        .unwrap();
    assert_eq!(same, id);
    let hooks = registry.hooks_for("x");
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0].handler, "debug");
}

#[test]
fn test_hook_for_unknown_module_is_rejected() {
    let registry = registry();
    let err = registry.register_hook(&Hook::new("ghost", "x", "log")).unwrap_err();
    assert!(is_constraint_violation(&err));
    assert!(registry.hooks_for("x").is_empty());
}

#[test]
fn test_store_failure_is_not_a_constraint_violation() {
    let registry = registry();
    registry.register_module(&Module::new("m1", "First")).unwrap();
    registry.db().execute_script("DROP TABLE module_hooks;").unwrap();

    let err = registry.register_hook(&Hook::new("m1", "x", "log")).unwrap_err();
    assert!(!is_constraint_violation(&err));
    assert!(err.downcast_ref::<SchemaExtensionError>().is_none());
}

#[test]
fn test_unknown_handler_name_is_accepted_at_registration() {
    let registry = registry();
    registry.register_module(&Module::new("m1", "First")).unwrap();
    registry
        .register_hook(&Hook::new("m1", "x", "does_not_exist"))
        .unwrap();
    assert_eq!(registry.hooks_for("x").len(), 1);
}

#[test]
fn test_disabled_module_drops_from_memory_but_keeps_row() {
    let registry = registry();
    registry.register_module(&Module::new("m1", "First")).unwrap();
    registry.register_hook(&Hook::new("m1", "x", "log")).unwrap();

    assert!(registry.set_module_enabled("m1", false).unwrap());
    assert!(registry.module("m1").is_none());
    assert!(registry.hooks_for("x").is_empty());
    assert!(registry.db().get_module("m1").unwrap().is_some());

    assert!(registry.set_module_enabled("m1", true).unwrap());
    assert!(registry.module("m1").is_some());
    assert_eq!(registry.hooks_for("x").len(), 1);

    assert!(!registry.set_module_enabled("ghost", true).unwrap());
}

#[test]
fn test_disabled_hook_is_not_indexed() {
    let registry = registry();
    registry.register_module(&Module::new("m1", "First")).unwrap();
    registry
        .register_hook(&Hook::new("m1", "x", "log").disabled())
        .unwrap();
    assert!(registry.hooks_for("x").is_empty());
    assert_eq!(registry.hook_count(), 0);
}

#[test]
fn test_delete_module_cascades_to_hooks() {
    let registry = registry();
    registry.register_module(&Module::new("m1", "First")).unwrap();
    registry.register_hook(&Hook::new("m1", "x", "log")).unwrap();
    registry.register_hook(&Hook::new("m1", "*", "debug")).unwrap();
    assert_eq!(registry.hook_count(), 2);

    assert!(registry.delete_module("m1").unwrap());
    assert_eq!(registry.hook_count(), 0);
    assert!(registry.db().list_hooks_for_module("m1").unwrap().is_empty());
    assert!(!registry.delete_module("m1").unwrap());
}

#[test]
fn test_reload_picks_up_direct_store_edits() {
    let registry = registry();
    registry.register_module(&Module::new("m1", "First")).unwrap();

    registry
        .db()
        .upsert_hook(&Hook::new("m1", "x", "log").with_id("direct"))
        .unwrap();
    assert!(registry.hooks_for("x").is_empty());

    registry.reload().unwrap();
    assert_eq!(registry.hooks_for("x")[0].id, "direct");
}

#[test]
fn test_wildcard_lookup_does_not_double_count() {
    let registry = registry();
    registry.register_module(&Module::new("m1", "First")).unwrap();
    registry.register_hook(&Hook::new("m1", "*", "log")).unwrap();

    assert_eq!(registry.hooks_for("*").len(), 1);
    assert_eq!(registry.hooks_for("anything").len(), 1);
}

#[test]
fn test_emits_run_alongside_reloads() {
    let registry = registry();
    registry.register_module(&Module::new("m1", "First")).unwrap();
    registry.register_hook(&Hook::new("m1", "x", "log")).unwrap();
    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        HandlerTable::builtin(),
        Arc::new(DebugTracer::new(64)),
    );

    std::thread::scope(|s| {
        s.spawn(|| {
            for n in 0..20 {
                registry
                    .register_hook(&Hook::new("m1", "x", "auto_fix").with_id(&format!("h{n}")))
                    .unwrap();
            }
        });
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..50 {
                    let emission = dispatcher.emit("x", Payload::new());
                    assert!(emission.invoked >= 1);
                    assert_eq!(emission.failed, 0);
                }
            });
        }
    });

    assert_eq!(registry.hooks_for("x").len(), 21);
}
