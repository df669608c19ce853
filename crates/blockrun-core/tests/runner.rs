use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use blockrun_core::capability::registry::CapabilityRegistry;
use blockrun_core::capability::{ComputationalCapability, InteractiveCapability, InvocationContext, RenderOutput};
use blockrun_core::event::MemoryEventSink;
use blockrun_core::plan::definition::{PlanError, parse_plan_yaml};
use blockrun_core::repository::run_state::{InMemoryRunStateStore, RunStateStore};
use blockrun_core::runner::plan_loader::{MapPlanLoader, PlanLoader};
use blockrun_core::runner::{PlanRunner, RunRequest, RunnerError, RunnerOptions};
use blockrun_types::error::CapabilityError;
use blockrun_types::event::{EventKind, RunEvent};
use blockrun_types::plan::Plan;
use blockrun_types::run_state::RunStatus;
use semver::Version;
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Scripted capabilities
// ---------------------------------------------------------------------------

/// Returns its inputs unchanged.
struct Echo;

impl ComputationalCapability for Echo {
    async fn run(
        &self,
        _ctx: &InvocationContext,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CapabilityError> {
        Ok(inputs.clone())
    }
}

/// Counts invocations and publishes the count as `n`.
struct Counting(Arc<AtomicU32>);

impl ComputationalCapability for Counting {
    async fn run(
        &self,
        _ctx: &InvocationContext,
        _inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CapabilityError> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(obj(json!({ "n": n })))
    }
}

/// Fails the first `fail_times` invocations.
struct Flaky {
    calls: Arc<AtomicU32>,
    fail_times: u32,
}

impl ComputationalCapability for Flaky {
    async fn run(
        &self,
        _ctx: &InvocationContext,
        _inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CapabilityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_times {
            Err(CapabilityError::new("unavailable", format!("attempt {} failed", call + 1)))
        } else {
            Ok(obj(json!({ "ok": true })))
        }
    }
}

/// Sleeps before answering.
struct Sleepy(Duration);

impl ComputationalCapability for Sleepy {
    async fn run(
        &self,
        _ctx: &InvocationContext,
        _inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CapabilityError> {
        tokio::time::sleep(self.0).await;
        Ok(obj(json!({ "late": true })))
    }
}

/// Submitted only when a human submission is present.
struct Form;

impl InteractiveCapability for Form {
    async fn render(
        &self,
        ctx: &InvocationContext,
        inputs: &Map<String, Value>,
    ) -> Result<RenderOutput, CapabilityError> {
        Ok(match &ctx.submission {
            Some(data) => RenderOutput::submitted(data.clone()),
            None => RenderOutput::pending(inputs.clone()),
        })
    }
}

/// Tracks how many invocations are in flight at once.
#[derive(Clone, Default)]
struct Gauge {
    active: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
}

impl Gauge {
    async fn hold(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ComputationalCapability for Gauge {
    async fn run(
        &self,
        _ctx: &InvocationContext,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CapabilityError> {
        self.hold().await;
        Ok(inputs.clone())
    }
}

impl InteractiveCapability for Gauge {
    async fn render(
        &self,
        _ctx: &InvocationContext,
        inputs: &Map<String, Value>,
    ) -> Result<RenderOutput, CapabilityError> {
        self.hold().await;
        Ok(RenderOutput::submitted(inputs.clone()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn obj(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn base_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register_computational("test.echo", Version::new(1, 0, 0), Echo);
    registry.register_interactive("test.form", Version::new(1, 0, 0), Form);
    registry
}

fn runner(registry: CapabilityRegistry) -> (PlanRunner<InMemoryRunStateStore>, Arc<MemoryEventSink>) {
    let sink = Arc::new(MemoryEventSink::new());
    let runner = PlanRunner::new(
        Arc::new(registry),
        Arc::new(InMemoryRunStateStore::new()),
        sink.clone(),
    );
    (runner, sink)
}

fn kinds(events: &[RunEvent]) -> Vec<(&'static str, Option<String>)> {
    events
        .iter()
        .map(|e| (e.type_name(), e.node().map(str::to_string)))
        .collect()
}

fn count(events: &[RunEvent], type_name: &str) -> usize {
    events.iter().filter(|e| e.type_name() == type_name).count()
}

// ---------------------------------------------------------------------------
// Ordering and results
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dependent_pair_runs_in_order() {
    let plan = parse_plan_yaml(
        r#"
id: pair
nodes:
  - id: A
    uses: test.echo
    inputs: { x: 1 }
  - id: B
    uses: test.echo
    inputs: { y: "${A.x}" }
"#,
    )
    .unwrap();
    let (runner, sink) = runner(base_registry());

    let outcome = runner.run(&plan, RunRequest::new().with_run_id("r1")).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(Value::Object(outcome.results), json!({ "x": 1, "y": 1 }));

    let events = sink.events("pair", "r1");
    assert_eq!(
        kinds(&events),
        vec![
            ("start", None),
            ("node_start", Some("A".to_string())),
            ("node_finish", Some("A".to_string())),
            ("node_start", Some("B".to_string())),
            ("node_finish", Some("B".to_string())),
            ("finish", None),
        ]
    );
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=6).collect::<Vec<_>>());

    let state = runner.store().load("pair", "r1").await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert!(state.success_nodes.contains("A") && state.success_nodes.contains("B"));
}

#[tokio::test]
async fn level_runs_interactive_first_then_layout_then_declaration() {
    let plan = parse_plan_yaml(
        r#"
id: ordering
policy: { concurrency: 1 }
layout: [c3, i2, c2]
nodes:
  - { id: c1, uses: test.echo }
  - { id: c2, uses: test.echo }
  - { id: c3, uses: test.echo }
  - { id: i1, uses: test.form }
  - { id: i2, uses: test.form }
"#,
    )
    .unwrap();
    let (runner, sink) = runner(base_registry());
    let runner = runner.with_options(RunnerOptions {
        interactive_wait: false,
        ..RunnerOptions::default()
    });
    runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();

    let started: Vec<String> = sink
        .events("ordering", "r")
        .iter()
        .filter(|e| e.type_name() == "node_start")
        .filter_map(|e| e.node().map(str::to_string))
        .collect();
    assert_eq!(started, vec!["i2", "i1", "c3", "c2", "c1"]);
}

#[tokio::test]
async fn aliases_and_nested_paths_are_published() {
    let plan = parse_plan_yaml(
        r#"
id: aliases
vars:
  person: { name: Ada, langs: [en, fr] }
nodes:
  - id: load
    uses: test.echo
    inputs:
      who: "${vars.person}"
    outputs: { who: profile }
  - id: greet
    uses: test.echo
    inputs:
      text: "hello ${load.profile.name} (${load.profile.langs.1})"
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(base_registry());
    let outcome = runner.run(&plan, RunRequest::new()).await.unwrap();
    assert_eq!(outcome.results["text"], json!("hello Ada (fr)"));
    assert_eq!(outcome.results["profile"]["name"], json!("Ada"));
    assert!(outcome.results.get("who").is_none());
}

#[tokio::test]
async fn request_vars_override_plan_vars() {
    let plan = parse_plan_yaml(
        r#"
id: vars
vars: { region: us }
nodes:
  - id: show
    uses: test.echo
    inputs: { region: "${vars.region}" }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(base_registry());
    let outcome = runner
        .run(&plan, RunRequest::new().with_var("region", json!("eu")))
        .await
        .unwrap();
    assert_eq!(outcome.results["region"], json!("eu"));
}

// ---------------------------------------------------------------------------
// Suspend and resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn suspended_run_resumes_without_recomputing() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = base_registry();
    registry.register_computational("test.count", Version::new(1, 0, 0), Counting(calls.clone()));
    let plan = parse_plan_yaml(
        r#"
id: review
nodes:
  - id: count
    uses: test.count
  - id: form
    uses: test.form
    inputs: { seen: "${count.n}" }
  - id: after
    uses: test.echo
    inputs: { answer: "${form.answer}" }
"#,
    )
    .unwrap();
    let (runner, sink) = runner(registry);

    let first = runner.run(&plan, RunRequest::new().with_run_id("r1")).await.unwrap();
    assert_eq!(first.status, RunStatus::Suspended);
    assert_eq!(first.results["n"], json!(1));
    let pending = first.pending.unwrap();
    assert_eq!(pending.node_id, "form");
    assert_eq!(pending.inputs["seen"], json!(1));
    assert!(first.results.get("answer").is_none());

    let state = runner
        .submit("review", "r1", obj(json!({ "answer": "yes" })))
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Suspended);

    let second = runner.run(&plan, RunRequest::new().with_run_id("r1")).await.unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.results["answer"], json!("yes"));
    assert_eq!(second.results["n"], json!(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "count must be replayed, not re-run");

    let events = sink.events("review", "r1");
    assert!(
        events
            .iter()
            .any(|e| matches!(&e.kind, EventKind::NodeReplayed { node } if node == "count"))
    );
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(matches!(events[0].kind, EventKind::Start { resumed: false }));
    assert!(
        events
            .iter()
            .any(|e| matches!(e.kind, EventKind::Start { resumed: true }))
    );

    let state = runner.store().load("review", "r1").await.unwrap().unwrap();
    assert!(state.pending_ui.is_none());
    assert_eq!(state.ui_outputs["form"]["answer"], json!("yes"));
}

#[tokio::test]
async fn unsubmitted_resume_suspends_again() {
    let plan = parse_plan_yaml(
        r#"
id: wait
nodes:
  - id: form
    uses: test.form
"#,
    )
    .unwrap();
    let (runner, sink) = runner(base_registry());
    runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();
    let again = runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();
    assert_eq!(again.status, RunStatus::Suspended);
    assert_eq!(count(&sink.events("wait", "r"), "suspend"), 2);
}

#[tokio::test]
async fn submit_without_pending_interaction_fails() {
    let (runner, _sink) = runner(base_registry());
    assert!(runner.submit("none", "r", Map::new()).await.is_err());
}

#[tokio::test]
async fn interactive_wait_off_accepts_render_output() {
    let plan = parse_plan_yaml(
        r#"
id: nowait
nodes:
  - id: form
    uses: test.form
    inputs: { draft: true }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(base_registry());
    let runner = runner.with_options(RunnerOptions {
        interactive_wait: false,
        ..RunnerOptions::default()
    });
    let outcome = runner.run(&plan, RunRequest::new()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.results["draft"], json!(true));
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_policy_reinvokes_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = base_registry();
    registry.register_computational(
        "test.flaky",
        Version::new(1, 0, 0),
        Flaky {
            calls: calls.clone(),
            fail_times: 2,
        },
    );
    let plan = parse_plan_yaml(
        r#"
id: retry
policy: { on_error: retry, retries: 2 }
nodes:
  - id: call
    uses: test.flaky
"#,
    )
    .unwrap();
    let (runner, sink) = runner(registry);
    let outcome = runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();
    assert_eq!(outcome.results["ok"], json!(true));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let events = sink.events("retry", "r");
    assert_eq!(count(&events, "node_error"), 2);
    let finish = events
        .iter()
        .find(|e| e.type_name() == "node_finish")
        .unwrap();
    assert!(matches!(finish.kind, EventKind::NodeFinish { attempts: 3, degraded: false, .. }));
}

#[tokio::test]
async fn exhausted_retries_halt_and_persist_failure() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = base_registry();
    registry.register_computational(
        "test.flaky",
        Version::new(1, 0, 0),
        Flaky {
            calls: calls.clone(),
            fail_times: 10,
        },
    );
    let plan = parse_plan_yaml(
        r#"
id: broken
nodes:
  - id: call
    uses: test.flaky
    policy: { on_error: retry, retries: 1 }
  - id: never
    uses: test.echo
    inputs: { v: "${call.ok}" }
"#,
    )
    .unwrap();
    let (runner, sink) = runner(registry);
    let err = runner
        .run(&plan, RunRequest::new().with_run_id("r"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Capability { ref node, .. } if node == "call"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let events = sink.events("broken", "r");
    assert_eq!(events.last().unwrap().type_name(), "failed");
    assert!(!events.iter().any(|e| e.node() == Some("never")));
    let state = runner.store().load("broken", "r").await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Failed);
}

#[tokio::test]
async fn timeout_under_continue_yields_empty_output() {
    let mut registry = base_registry();
    registry.register_computational("test.slow", Version::new(1, 0, 0), Sleepy(Duration::from_secs(5)));
    let plan = parse_plan_yaml(
        r#"
id: slow
nodes:
  - id: slow
    uses: test.slow
    policy: { on_error: continue, timeout_ms: 500 }
  - id: next
    uses: test.echo
    inputs: { late: "${slow.late}" }
    outputs: { late: seen }
"#,
    )
    .unwrap();
    let (runner, sink) = runner(registry);
    let outcome = runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.results.get("late").is_none());
    assert_eq!(outcome.results["seen"], Value::Null);

    let events = sink.events("slow", "r");
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::NodeError { error_code, will_retry: false, .. } if error_code == "timeout"
    )));
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::NodeFinish { node, degraded: true, .. } if node == "slow"
    )));
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

#[tokio::test]
async fn false_guard_skips_and_downstream_sees_null() {
    let plan = parse_plan_yaml(
        r#"
id: guarded
nodes:
  - id: maybe
    uses: test.echo
    when: { expr: "0 == 1" }
    inputs: { value: 42 }
  - id: after
    uses: test.echo
    inputs: { got: "${maybe.value}" }
"#,
    )
    .unwrap();
    let (runner, sink) = runner(base_registry());
    let outcome = runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.results.get("value").is_none());
    assert_eq!(outcome.results["got"], Value::Null);
    assert_eq!(outcome.skipped, vec!["maybe".to_string()]);
    assert_eq!(count(&sink.events("guarded", "r"), "node_skipped"), 1);
}

#[tokio::test]
async fn guard_reads_upstream_outputs() {
    let plan = parse_plan_yaml(
        r#"
id: gate
vars: { limit: 10 }
nodes:
  - id: measure
    uses: test.echo
    inputs: { size: 12, label: big }
  - id: alert
    uses: test.echo
    when: { expr: "${measure.size} > ${vars.limit} and ${measure.label} = 'big'" }
    inputs: { alerted: true }
  - id: quiet
    uses: test.echo
    when: { expr: "not ${measure.size} > ${vars.limit}" }
    inputs: { quiet: true }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(base_registry());
    let outcome = runner.run(&plan, RunRequest::new()).await.unwrap();
    assert_eq!(outcome.results["alerted"], json!(true));
    assert!(outcome.results.get("quiet").is_none());
}

#[tokio::test]
async fn literal_guard_uses_truthiness() {
    let plan = parse_plan_yaml(
        r#"
id: literal
vars: { enabled: "" }
nodes:
  - id: muted
    uses: test.echo
    when: "${vars.enabled}"
    inputs: { muted_ran: true }
  - id: always
    uses: test.echo
    when: true
    inputs: { always_ran: true }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(base_registry());
    let outcome = runner.run(&plan, RunRequest::new()).await.unwrap();
    assert!(outcome.results.get("muted_ran").is_none());
    assert_eq!(outcome.results["always_ran"], json!(true));
}

#[tokio::test]
async fn empty_collection_guards_skip() {
    let plan = parse_plan_yaml(
        r#"
id: empties
vars: { rows: [] }
nodes:
  - id: no_list
    uses: test.echo
    when: []
    inputs: { list_ran: true }
  - id: no_map
    uses: test.echo
    when: {}
    inputs: { map_ran: true }
  - id: no_rows
    uses: test.echo
    when: "${vars.rows}"
    inputs: { rows_ran: true }
  - id: some
    uses: test.echo
    when: [x]
    inputs: { some_ran: true }
"#,
    )
    .unwrap();
    let (runner, sink) = runner(base_registry());
    let outcome = runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();
    assert!(outcome.results.get("list_ran").is_none());
    assert!(outcome.results.get("map_ran").is_none());
    assert!(outcome.results.get("rows_ran").is_none());
    assert_eq!(outcome.results["some_ran"], json!(true));
    assert_eq!(count(&sink.events("empties", "r"), "node_skipped"), 3);
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

#[tokio::test]
async fn foreach_collects_one_entry_per_item_in_order() {
    let plan = parse_plan_yaml(
        r#"
id: fanout
vars:
  items: [3, 1, 4, 1, 5]
nodes:
  - id: each
    control: loop
    foreach:
      source: "${vars.items}"
      as: item
      max_concurrency: 2
    body:
      id: each-body
      nodes:
        - id: square
          uses: test.echo
          inputs: { value: "${vars.item}", index: "${vars.__index}" }
"#,
    )
    .unwrap();
    let (runner, sink) = runner(base_registry());
    let outcome = runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();

    let collect = outcome.results["collect"].as_array().unwrap();
    assert_eq!(collect.len(), 5);
    let values: Vec<&Value> = collect.iter().map(|r| &r["value"]).collect();
    assert_eq!(values, vec![&json!(3), &json!(1), &json!(4), &json!(1), &json!(5)]);
    assert_eq!(collect[4]["index"], json!(4));

    let events = sink.events("fanout", "r");
    assert_eq!(count(&events, "loop_iteration"), 5);
    let child_event = events.iter().find(|e| e.plan == "each-body").unwrap();
    assert_eq!(child_event.run_id, "r");
    assert_eq!(child_event.parent_run_id.as_deref(), Some("r"));

    let state = runner.store().load("fanout", "r").await.unwrap().unwrap();
    assert!(state.success_nodes.contains("each[2]/square"));
}

#[tokio::test]
async fn foreach_children_respect_max_concurrency() {
    let gauge = Gauge::default();
    let mut registry = base_registry();
    registry.register_computational("test.gauge", Version::new(1, 0, 0), gauge.clone());
    let plan = parse_plan_yaml(
        r#"
id: bounded
vars: { items: [1, 2, 3, 4, 5, 6, 7] }
policy: { concurrency: 8 }
nodes:
  - id: each
    control: loop
    foreach: { source: "${vars.items}", item: x, max_concurrency: 2 }
    body:
      id: body
      nodes:
        - id: measure
          uses: test.gauge
          inputs: { x: "${vars.x}" }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(registry);
    let outcome = runner.run(&plan, RunRequest::new()).await.unwrap();
    assert_eq!(outcome.results["collect"].as_array().unwrap().len(), 7);
    assert_eq!(gauge.peak(), 2);
}

#[tokio::test]
async fn interactive_renders_never_overlap() {
    let gauge = Gauge::default();
    let mut registry = base_registry();
    registry.register_interactive("test.gauge_form", Version::new(1, 0, 0), gauge.clone());
    let plan = parse_plan_yaml(
        r#"
id: one-at-a-time
vars: { people: [ada, grace, linus, barbara] }
nodes:
  - id: each
    control: loop
    foreach: { source: "${vars.people}", item: person, max_concurrency: 4 }
    body:
      id: ask
      nodes:
        - id: confirm
          uses: test.gauge_form
          inputs: { person: "${vars.person}" }
  - id: direct
    uses: test.gauge_form
    inputs: { direct: true }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(registry);
    let outcome = runner.run(&plan, RunRequest::new()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.results["collect"].as_array().unwrap().len(), 4);
    assert_eq!(outcome.results["direct"], json!(true));
    assert_eq!(gauge.peak(), 1);
}

#[tokio::test]
async fn foreach_waits_for_upstream_source() {
    let plan = parse_plan_yaml(
        r#"
id: late-source
nodes:
  - id: each
    control: loop
    foreach: { source: "${load.rows}", item: row }
    outputs: { collect: rows_out }
    body:
      id: body
      nodes:
        - id: copy
          uses: test.echo
          inputs: { row: "${vars.row}", origin: "${load.origin}" }
  - id: load
    uses: test.echo
    inputs: { rows: [a, b], origin: disk }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(base_registry());
    let outcome = runner.run(&plan, RunRequest::new()).await.unwrap();
    let rows = outcome.results["rows_out"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1], json!({ "row": "b", "origin": "disk" }));
}

#[tokio::test]
async fn foreach_over_non_array_follows_policy() {
    let plan = parse_plan_yaml(
        r#"
id: bad-source
vars: { items: "nope" }
nodes:
  - id: each
    control: loop
    foreach: { source: "${vars.items}", item: x }
    policy: { on_error: continue }
    body:
      id: body
      nodes:
        - id: copy
          uses: test.echo
"#,
    )
    .unwrap();
    let (runner, sink) = runner(base_registry());
    let outcome = runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.results.get("collect").is_none());
    assert!(sink.events("bad-source", "r").iter().any(|e| matches!(
        &e.kind,
        EventKind::NodeError { error_code, .. } if error_code == "invalid_foreach_source"
    )));
}

#[tokio::test]
async fn while_runs_until_max_iterations() {
    let plan = parse_plan_yaml(
        r#"
id: repeat
nodes:
  - id: again
    control: loop
    while: { condition: "1 = 1", max_iterations: 3 }
    body:
      id: again-body
      nodes:
        - id: tick
          uses: test.echo
          inputs: { i: "${vars.__iteration}" }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(base_registry());
    let outcome = runner.run(&plan, RunRequest::new()).await.unwrap();
    let collect = outcome.results["collect"].as_array().unwrap();
    assert_eq!(collect.len(), 3);
    assert_eq!(collect[2]["i"], json!(2));
}

#[tokio::test]
async fn while_with_false_condition_collects_nothing() {
    let plan = parse_plan_yaml(
        r#"
id: never
vars: { go: false }
nodes:
  - id: loop
    control: loop
    while: { condition: "${vars.go} = true", max_iterations: 5 }
    body:
      id: body
      nodes:
        - id: tick
          uses: test.echo
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(base_registry());
    let outcome = runner.run(&plan, RunRequest::new()).await.unwrap();
    assert_eq!(outcome.results["collect"], json!([]));
}

#[tokio::test]
async fn interactive_node_inside_foreach_resumes_by_scoped_key() {
    let plan = parse_plan_yaml(
        r#"
id: approvals
vars: { people: [ada] }
nodes:
  - id: each
    control: loop
    foreach: { source: "${vars.people}", item: person }
    body:
      id: approve
      nodes:
        - id: ask
          uses: test.form
          inputs: { who: "${vars.person}" }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(base_registry());
    let first = runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();
    assert_eq!(first.status, RunStatus::Suspended);
    assert_eq!(first.pending.unwrap().node_id, "each[0]/ask");

    runner
        .submit("approvals", "r", obj(json!({ "approved": true })))
        .await
        .unwrap();
    let second = runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.results["collect"], json!([{ "approved": true }]));
}

// ---------------------------------------------------------------------------
// Subflows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subflow_projects_child_aliases() {
    let child = parse_plan_yaml(
        r#"
id: shared/greet
vars: { name: nobody }
nodes:
  - id: hello
    uses: test.echo
    inputs: { greeting: "hi ${vars.name}" }
"#,
    )
    .unwrap();
    let plan = parse_plan_yaml(
        r#"
id: parent
nodes:
  - id: who
    uses: test.echo
    inputs: { name: Grace }
  - id: sub
    control: subflow
    call:
      plan: shared/greet
      inputs: { name: "${who.name}" }
    outputs: { greeting: message }
"#,
    )
    .unwrap();
    let (runner, sink) = runner(base_registry());
    let runner = runner.with_plan_loader(Arc::new(MapPlanLoader::new().with_plan(child)));
    let outcome = runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();
    assert_eq!(outcome.results["message"], json!("hi Grace"));

    let state = runner.store().load("parent", "r").await.unwrap().unwrap();
    assert!(state.success_nodes.contains("sub/hello"));
    assert!(sink.events("parent", "r").iter().any(|e| e.plan == "shared/greet"));
}

#[tokio::test]
async fn missing_subflow_plan_halts() {
    let plan = parse_plan_yaml(
        r#"
id: orphan
nodes:
  - id: sub
    control: subflow
    call: { plan: does/not/exist }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(base_registry());
    let err = runner.run(&plan, RunRequest::new()).await.unwrap_err();
    assert!(matches!(err, RunnerError::PlanNotFound { ref plan, .. } if plan == "does/not/exist"));
}

#[tokio::test]
async fn recursive_subflow_stops_at_depth_limit() {
    let plan = parse_plan_yaml(
        r#"
id: recurse
nodes:
  - id: again
    control: subflow
    call: { plan: recurse }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(base_registry());
    let runner = runner
        .with_plan_loader(Arc::new(MapPlanLoader::new().with_plan(plan.clone())))
        .with_options(RunnerOptions {
            max_subflow_depth: 2,
            ..RunnerOptions::default()
        });
    let err = runner.run(&plan, RunRequest::new()).await.unwrap_err();
    assert!(matches!(err, RunnerError::SubflowDepthExceeded { depth: 3, max: 2, .. }));
}

const CYCLIC_CHILD: &str = r#"
id: shared/tangled
nodes:
  - id: a
    uses: test.echo
    inputs: { v: "${b.v}" }
  - id: b
    uses: test.echo
    inputs: { v: "${a.v}" }
"#;

const COUNT_THEN_CALL: &str = r#"
id: caller
nodes:
  - id: first
    uses: test.count
  - id: sub
    control: subflow
    call: { plan: shared/tangled, inputs: { after: "${first.n}" } }
    policy: { on_error: continue }
"#;

#[tokio::test]
async fn cyclic_subflow_target_rejected_before_any_capability_runs() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = base_registry();
    registry.register_computational("test.count", Version::new(1, 0, 0), Counting(calls.clone()));
    let plan = parse_plan_yaml(COUNT_THEN_CALL).unwrap();
    let child = parse_plan_yaml(CYCLIC_CHILD).unwrap();
    let (runner, sink) = runner(registry);
    let runner = runner.with_plan_loader(Arc::new(MapPlanLoader::new().with_plan(child)));

    let err = runner.validate(&plan).unwrap_err();
    assert!(matches!(
        err,
        PlanError::Subflow { ref plan, ref source } if plan == "shared/tangled"
            && matches!(**source, PlanError::CycleDetected(_))
    ));

    let err = runner
        .run(&plan, RunRequest::new().with_run_id("r"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Validation(PlanError::Subflow { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(sink.events("caller", "r").is_empty());
}

#[tokio::test]
async fn nested_subflow_targets_are_validated_through_loop_bodies() {
    let middle = parse_plan_yaml(
        r#"
id: shared/middle
nodes:
  - id: inner
    control: subflow
    call: { plan: shared/tangled }
"#,
    )
    .unwrap();
    let plan = parse_plan_yaml(
        r#"
id: outer
vars: { xs: [1, 2] }
nodes:
  - id: each
    control: loop
    foreach: { source: "${vars.xs}", item: x }
    body:
      id: body
      nodes:
        - id: sub
          control: subflow
          call: { plan: shared/middle }
"#,
    )
    .unwrap();
    let loader = MapPlanLoader::new()
        .with_plan(middle)
        .with_plan(parse_plan_yaml(CYCLIC_CHILD).unwrap());
    let (runner, _sink) = runner(base_registry());
    let runner = runner.with_plan_loader(Arc::new(loader));

    let err = runner.validate(&plan).unwrap_err();
    assert!(matches!(err, PlanError::Subflow { ref plan, .. } if plan == "shared/tangled"));
}

/// Serves a valid target the first time and a cyclic one afterwards.
struct ChangingLoader {
    loads: AtomicU32,
}

impl PlanLoader for ChangingLoader {
    fn load(&self, plan_id: &str) -> Result<Option<Plan>, PlanError> {
        if plan_id != "shared/tangled" {
            return Ok(None);
        }
        if self.loads.fetch_add(1, Ordering::SeqCst) == 0 {
            parse_plan_yaml("id: shared/tangled\nnodes:\n  - { id: a, uses: test.echo }\n").map(Some)
        } else {
            parse_plan_yaml(CYCLIC_CHILD).map(Some)
        }
    }
}

#[tokio::test]
async fn subflow_target_broken_at_run_time_follows_on_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = base_registry();
    registry.register_computational("test.count", Version::new(1, 0, 0), Counting(calls.clone()));
    let plan = parse_plan_yaml(COUNT_THEN_CALL).unwrap();
    let (runner, sink) = runner(registry);
    let runner = runner.with_plan_loader(Arc::new(ChangingLoader {
        loads: AtomicU32::new(0),
    }));

    let outcome = runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let events = sink.events("caller", "r");
    let failure = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::NodeError { node, error_code, .. } if node == "sub" => Some(error_code.clone()),
            _ => None,
        })
        .expect("node_error for sub");
    assert_eq!(failure, "invalid_subflow_plan");
    assert_eq!(events.last().unwrap().type_name(), "finish");
}

// ---------------------------------------------------------------------------
// Validation, diagnostics, dry run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cycles_are_rejected_before_any_event() {
    let plan = parse_plan_yaml(
        r#"
id: cyclic
nodes:
  - id: a
    uses: test.echo
    inputs: { v: "${b.v}" }
  - id: b
    uses: test.echo
    inputs: { v: "${a.v}" }
"#,
    )
    .unwrap();
    let (runner, sink) = runner(base_registry());
    let err = runner
        .run(&plan, RunRequest::new().with_run_id("r"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Validation(PlanError::CycleDetected(_))));
    assert!(sink.events("cyclic", "r").is_empty());
}

#[tokio::test]
async fn unresolvable_node_becomes_diagnostic() {
    let plan = parse_plan_yaml(
        r#"
id: stuck
nodes:
  - id: each
    control: loop
    foreach: { source: "${vars.missing}", item: x }
    body:
      id: body
      nodes:
        - id: copy
          uses: test.echo
  - id: fine
    uses: test.echo
    inputs: { ok: true }
"#,
    )
    .unwrap();
    let (runner, sink) = runner(base_registry());
    let outcome = runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.results["ok"], json!(true));
    assert_eq!(outcome.diagnostics.len(), 1);
    assert_eq!(outcome.diagnostics[0].node, "each");

    let events = sink.events("stuck", "r");
    assert_eq!(count(&events, "diagnostic"), 1);
    assert_eq!(events.last().unwrap().type_name(), "finish");
}

#[tokio::test]
async fn dry_run_invokes_nothing_and_persists_nothing() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = base_registry();
    registry.register_computational("test.count", Version::new(1, 0, 0), Counting(calls.clone()));
    let plan = parse_plan_yaml(
        r#"
id: preview
nodes:
  - id: count
    uses: test.count
  - id: form
    uses: test.form
    inputs: { seen: "${count.n}" }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(registry);
    let outcome = runner.dry_run(&plan, Map::new()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(runner.store().is_empty());
}

#[tokio::test]
async fn event_bus_receives_every_logged_event() {
    let plan = parse_plan_yaml(
        r#"
id: bus
nodes:
  - id: only
    uses: test.echo
"#,
    )
    .unwrap();
    let bus = blockrun_core::event::EventBus::new(64);
    let mut rx = bus.subscribe();
    let (runner, sink) = runner(base_registry());
    let runner = runner.with_event_bus(bus);
    runner.run(&plan, RunRequest::new().with_run_id("r")).await.unwrap();

    let logged = sink.events("bus", "r");
    for expected in &logged {
        let received = rx.recv().await.unwrap();
        assert_eq!(received.seq, expected.seq);
    }
}

#[tokio::test]
async fn loop_node_does_not_hold_back_later_siblings() {
    let mut registry = base_registry();
    registry.register_computational("test.slow", Version::new(1, 0, 0), Sleepy(Duration::from_millis(300)));
    let plan = parse_plan_yaml(
        r#"
id: mixed-level
vars: { items: [1] }
nodes:
  - id: each
    control: loop
    foreach: { source: "${vars.items}", item: x }
    body:
      id: body
      nodes:
        - { id: wait, uses: test.slow }
  - { id: after, uses: test.slow, outputs: { late: after } }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(registry);
    let started = std::time::Instant::now();
    let outcome = runner.run(&plan, RunRequest::new()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(550));
    assert_eq!(outcome.results["after"], json!(true));
    assert_eq!(outcome.results["collect"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn independent_computational_nodes_overlap() {
    let mut registry = base_registry();
    registry.register_computational("test.slow", Version::new(1, 0, 0), Sleepy(Duration::from_millis(300)));
    let plan = parse_plan_yaml(
        r#"
id: parallel
nodes:
  - { id: a, uses: test.slow, outputs: { late: a } }
  - { id: b, uses: test.slow, outputs: { late: b } }
  - { id: c, uses: test.slow, outputs: { late: c } }
"#,
    )
    .unwrap();
    let (runner, _sink) = runner(registry);
    let started = std::time::Instant::now();
    let outcome = runner.run(&plan, RunRequest::new()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(800));
    assert_eq!(outcome.results.len(), 3);
}
