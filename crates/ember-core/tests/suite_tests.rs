use std::sync::Arc;

use anyhow::bail;
use ember_core::db::Db;
use ember_core::dispatcher::Dispatcher;
use ember_core::handlers::HandlerTable;
use ember_core::registry::ModuleRegistry;
use ember_core::suite::{TestCase, TestSuite};
use ember_core::tracer::DebugTracer;
use ember_core::types::{Hook, Module};

fn dispatcher_with_assert_hook() -> Dispatcher {
    let mut db = Db::open_in_memory().unwrap();
    db.migrate().unwrap();
    let registry = Arc::new(ModuleRegistry::new(Arc::new(db)).unwrap());
    registry
        .register_module(&Module::new("debug", "Debug & Testing").with_priority(1))
        .unwrap();
    registry
        .register_hook(&Hook::new("debug", "test_assert", "test_assert"))
        .unwrap();
    registry
        .register_hook(&Hook::new("debug", "*", "debug").with_priority(1))
        .unwrap();
    Dispatcher::new(registry, HandlerTable::builtin(), Arc::new(DebugTracer::new(100)))
}

#[test]
fn test_suite_reports_pass_and_fail() {
    let dispatcher = dispatcher_with_assert_hook();
    let mut suite = TestSuite::new("intents");
    suite
        .add(TestCase::new("upper", "abc", "ABC").with_runner(|input| Ok(input.to_uppercase())))
        .add(TestCase::new("wrong", "abc", "xyz").with_runner(|input| Ok(input.to_string())))
        .add(TestCase::new("erroring", "abc", "ABC").with_runner(|_| bail!("no backend")));

    let report = suite.run(&dispatcher).unwrap();

    assert_eq!(report.suite, "intents");
    assert_eq!(report.tests.len(), 3);
    assert_eq!(report.passed(), 1);
    assert_eq!(report.failed(), 2);
    assert!(report.tests[0].passed);
    assert_eq!(report.tests[1].assertion.message, r#"Assertion failed: expected "xyz", got "abc""#);
    assert_eq!(report.tests[2].actual, "error: no backend");

    // test_start, test_assert and test_end per case, two hooks on test_assert.
    assert_eq!(report.debug_log.len(), 3 * 4);
    let trace = report.tests[0].trace_id.as_deref().unwrap();
    assert!(report.debug_log.iter().any(|e| e.trace_id == trace));

    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["suite"], "intents");
    assert_eq!(json["tests"][0]["passed"], true);
}

#[test]
fn test_suite_restores_tracing_state() {
    let dispatcher = dispatcher_with_assert_hook();
    let mut suite = TestSuite::new("s");
    suite.add(TestCase::new("empty", "", ""));

    assert!(!dispatcher.tracer().is_enabled());
    let report = suite.run(&dispatcher).unwrap();
    assert!(!dispatcher.tracer().is_enabled());
    assert!(report.tests[0].passed);

    dispatcher.tracer().enable();
    suite.run(&dispatcher).unwrap();
    assert!(dispatcher.tracer().is_enabled());
}

#[test]
fn test_setup_failure_aborts_run() {
    let dispatcher = dispatcher_with_assert_hook();
    let mut suite = TestSuite::new("s");
    suite
        .setup(|| bail!("fixture missing"))
        .add(TestCase::new("never", "", ""));

    let err = suite.run(&dispatcher).unwrap_err();
    assert!(format!("{err:#}").contains("fixture missing"));
    assert!(dispatcher.tracer().is_empty());
    assert!(!dispatcher.tracer().is_enabled());
}

#[test]
fn test_teardown_failure_still_reports() {
    let dispatcher = dispatcher_with_assert_hook();
    let mut suite = TestSuite::new("s");
    suite
        .teardown(|| bail!("cleanup failed"))
        .add(TestCase::new("ok", "", ""));

    let report = suite.run(&dispatcher).unwrap();
    assert_eq!(report.passed(), 1);
}
