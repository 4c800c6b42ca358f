//! Scripted debug runs: each case is emitted through the dispatcher with
//! tracing forced on, and the resulting trace is bundled into a report an
//! LLM (or a human) can review.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::dispatcher::{Dispatcher, Emission};
use crate::types::{DebugAssertion, DebugEvent, Payload};

type Runner = Box<dyn Fn(&str) -> Result<String> + Send + Sync>;
type Callback = Box<dyn Fn() -> Result<()> + Send + Sync>;

pub struct TestCase {
    pub name: String,
    pub input: String,
    pub expected: String,
    runner: Option<Runner>,
}

impl TestCase {
    pub fn new(name: &str, input: &str, expected: &str) -> Self {
        Self {
            name: name.to_string(),
            input: input.to_string(),
            expected: expected.to_string(),
            runner: None,
        }
    }

    /// Produce the case's actual output from its input. Without a runner the
    /// actual output is empty.
    pub fn with_runner<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        self.runner = Some(Box::new(f));
        self
    }

    fn actual(&self) -> String {
        match &self.runner {
            Some(run) => run(&self.input).unwrap_or_else(|e| format!("error: {e:#}")),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub input: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
    pub trace_id: Option<String>,
    pub assertion: DebugAssertion,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub suite: String,
    pub tests: Vec<TestResult>,
    pub debug_log: Vec<DebugEvent>,
    pub timestamp: DateTime<Utc>,
}

impl SuiteReport {
    pub fn passed(&self) -> usize {
        self.tests.iter().filter(|t| t.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.tests.len() - self.passed()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serialize suite report")
    }
}

pub struct TestSuite {
    pub name: String,
    cases: Vec<TestCase>,
    setup: Option<Callback>,
    teardown: Option<Callback>,
}

impl TestSuite {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cases: Vec::new(),
            setup: None,
            teardown: None,
        }
    }

    pub fn add(&mut self, case: TestCase) -> &mut Self {
        self.cases.push(case);
        self
    }

    pub fn setup<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.setup = Some(Box::new(f));
        self
    }

    pub fn teardown<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.teardown = Some(Box::new(f));
        self
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Run every case with tracing on, then put the tracer back the way it was.
    pub fn run(&self, dispatcher: &Dispatcher) -> Result<SuiteReport> {
        let tracer = dispatcher.tracer();
        let was_enabled = tracer.is_enabled();
        tracer.enable();

        let report = self.run_cases(dispatcher);

        if !was_enabled {
            tracer.disable();
        }
        report
    }

    fn run_cases(&self, dispatcher: &Dispatcher) -> Result<SuiteReport> {
        if let Some(setup) = &self.setup {
            setup().with_context(|| format!("suite {}: setup failed", self.name))?;
        }

        let mut tests = Vec::with_capacity(self.cases.len());
        let mut trace_ids = Vec::new();
        for case in &self.cases {
            let start = dispatcher.emit("test_start", payload(json!({ "test_name": case.name })));

            let actual = case.actual();
            let assert = dispatcher.emit(
                "test_assert",
                payload(json!({
                    "assertion_name": case.name,
                    "expected": case.expected,
                    "actual": actual,
                })),
            );

            let end = dispatcher.emit("test_end", payload(json!({ "test_name": case.name })));

            for emission in [&start, &assert, &end] {
                if let Some(id) = emission.trace_id() {
                    trace_ids.push(id.to_string());
                }
            }

            let trace_id = assert.trace_id().map(str::to_string);
            let assertion = recorded_assertion(&assert).unwrap_or_else(|| {
                DebugAssertion::evaluate(
                    trace_id.as_deref().unwrap_or_default(),
                    &case.name,
                    &case.expected,
                    &actual,
                )
            });
            tests.push(TestResult {
                name: case.name.clone(),
                input: case.input.clone(),
                expected: case.expected.clone(),
                passed: assertion.passed,
                actual,
                trace_id,
                assertion,
            });
        }

        if let Some(teardown) = &self.teardown {
            if let Err(e) = teardown() {
                warn!("suite {}: teardown failed: {e:#}", self.name);
            }
        }

        let debug_log = dispatcher
            .tracer()
            .log()
            .into_iter()
            .filter(|e| trace_ids.contains(&e.trace_id))
            .collect();

        let report = SuiteReport {
            suite: self.name.clone(),
            tests,
            debug_log,
            timestamp: Utc::now(),
        };
        info!(
            "suite {}: {} passed, {} failed",
            report.suite,
            report.passed(),
            report.failed()
        );
        Ok(report)
    }
}

/// The assertion a `test_assert` hook stored in the trace, if one ran.
fn recorded_assertion(emission: &Emission) -> Option<DebugAssertion> {
    emission.debug.as_ref()?.assertions.last().cloned()
}

fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}
