//! End-to-end engine behavior against a scripted coordinator.
//!
//! Covers the executor loop, checkpoint/resume, foreach (sequential and
//! bounded parallel), sub-recipe composition, approval gates,
//! cancellation, and recursion limits.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use rex_core::{Recipe, RexError, RexResult};
use rex_runtime::{Coordinator, RecipeExecutor, RunOutcome, SpawnOutput, SpawnRequest};
use rex_session::{ApprovalStatus, CancellationStatus, SessionStore};
use tempfile::TempDir;

/// Scripted spawner: either replays queued responses or echoes the
/// instruction back. Tracks calls, concurrency, and can raise the
/// process-wide cancellation flag after N spawns.
#[derive(Default)]
struct MockCoordinator {
    responses: parking_lot::Mutex<VecDeque<Result<String, String>>>,
    echo_instruction: bool,
    calls: parking_lot::Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    spawn_delay: Duration,
    cancel_after_calls: AtomicUsize,
    cancel_flag: AtomicBool,
}

impl MockCoordinator {
    fn new() -> Self {
        Self {
            cancel_after_calls: AtomicUsize::new(usize::MAX),
            ..Self::default()
        }
    }

    fn echoing() -> Self {
        Self {
            echo_instruction: true,
            cancel_after_calls: AtomicUsize::new(usize::MAX),
            ..Self::default()
        }
    }

    fn with_responses(responses: &[&str]) -> Self {
        let coordinator = Self::new();
        coordinator.queue(responses);
        coordinator
    }

    fn queue(&self, responses: &[&str]) {
        let mut queue = self.responses.lock();
        for response in responses {
            queue.push_back(Ok(response.to_string()));
        }
    }

    fn queue_error(&self, message: &str) {
        self.responses.lock().push_back(Err(message.to_string()));
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn instructions(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(_, i)| i.clone()).collect()
    }

    fn cancel_after(&self, calls: usize) {
        self.cancel_after_calls.store(calls, Ordering::SeqCst);
    }

    fn reset_cancellation(&self) {
        self.cancel_flag.store(false, Ordering::SeqCst);
        self.cancel_after_calls.store(usize::MAX, Ordering::SeqCst);
    }
}

#[async_trait]
impl Coordinator for MockCoordinator {
    async fn spawn(&self, request: SpawnRequest) -> RexResult<SpawnOutput> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let call_number = {
            let mut calls = self.calls.lock();
            calls.push((request.agent_name.clone(), request.instruction.clone()));
            calls.len()
        };
        if call_number >= self.cancel_after_calls.load(Ordering::SeqCst) {
            self.cancel_flag.store(true, Ordering::SeqCst);
        }

        if self.echo_instruction {
            return Ok(SpawnOutput::text(request.instruction));
        }
        match self.responses.lock().pop_front() {
            Some(Ok(output)) => Ok(SpawnOutput::text(output)),
            Some(Err(message)) => Err(RexError::step(&request.agent_name, message)),
            None => Err(RexError::step(&request.agent_name, "no scripted response")),
        }
    }

    fn cancellation_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }
}

struct Harness {
    _tmp: TempDir,
    coordinator: Arc<MockCoordinator>,
    store: Arc<SessionStore>,
    executor: RecipeExecutor,
    project: PathBuf,
}

fn harness(coordinator: MockCoordinator) -> Harness {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    std::fs::create_dir_all(&project).unwrap();
    let coordinator = Arc::new(coordinator);
    let store = Arc::new(SessionStore::new(tmp.path().join("sessions")));
    let executor = RecipeExecutor::new(coordinator.clone(), store.clone());
    Harness {
        _tmp: tmp,
        coordinator,
        store,
        executor,
        project,
    }
}

fn recipe(yaml: &str) -> Recipe {
    Recipe::from_yaml_str(yaml).unwrap()
}

fn completed(outcome: RunOutcome) -> (String, rex_core::Context) {
    match outcome {
        RunOutcome::Completed {
            session_id,
            context,
        } => (session_id, context),
        other => panic!("expected Completed, got {other:?}"),
    }
}

async fn execute(h: &Harness, recipe: &Recipe) -> RexResult<RunOutcome> {
    h.executor
        .execute(recipe, serde_json::Map::new(), &h.project, None)
        .await
}

fn write_recipe(dir: &Path, name: &str, yaml: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, yaml).unwrap();
    path
}

// ============================================================================
// Flat execution and checkpointing
// ============================================================================

#[tokio::test]
async fn flat_execute_two_agent_steps() {
    let h = harness(MockCoordinator::with_responses(&["a", "b"]));
    let recipe = recipe(
        r#"
name: two-steps
description: d
version: 1.0.0
steps:
  - id: first
    agent: worker
    prompt: "do first"
    output: step1
  - id: second
    agent: worker
    prompt: "do second after {{step1}}"
    output: step2
"#,
    );

    let (_session, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("step1"), Some(&json!("a")));
    assert_eq!(context.get("step2"), Some(&json!("b")));
    assert!(context.get("session").unwrap().get("id").is_some());
    assert_eq!(context.get("recipe").unwrap()["name"], json!("two-steps"));

    // Template substitution fed the second prompt from the first output
    assert_eq!(h.coordinator.instructions()[1], "do second after a");
}

#[tokio::test]
async fn checkpoint_advances_after_each_step() {
    let h = harness(MockCoordinator::with_responses(&["a"]));
    h.coordinator.queue_error("boom");
    let recipe = recipe(
        r#"
name: crashes
description: d
version: 1.0.0
steps:
  - id: first
    agent: worker
    prompt: "p1"
    output: step1
  - id: second
    agent: worker
    prompt: "p2"
    output: step2
"#,
    );

    let err = execute(&h, &recipe).await.unwrap_err();
    assert!(matches!(err, RexError::Step { .. }), "{err}");

    let sessions = h.store.list(&h.project).await.unwrap();
    assert_eq!(sessions.len(), 1);
    let state = h.store.load(&sessions[0].session_id, &h.project).await.unwrap();
    assert_eq!(state.current_step_index, 1);
    assert_eq!(state.completed_steps, vec!["first"]);
    assert_eq!(state.context.get("step1"), Some(&json!("a")));
}

#[tokio::test]
async fn resume_does_not_rerun_completed_steps() {
    let h = harness(MockCoordinator::with_responses(&["a"]));
    h.coordinator.queue_error("boom");
    let recipe = recipe(
        r#"
name: resumable
description: d
version: 1.0.0
steps:
  - id: first
    agent: worker
    prompt: "p1"
    output: step1
  - id: second
    agent: worker
    prompt: "p2"
    output: step2
"#,
    );

    execute(&h, &recipe).await.unwrap_err();
    assert_eq!(h.coordinator.call_count(), 2);
    let session_id = h.store.list(&h.project).await.unwrap()[0].session_id.clone();

    // Only the failed step is dispatched on resume
    h.coordinator.queue(&["b"]);
    let outcome = h
        .executor
        .resume(&recipe, &session_id, &h.project)
        .await
        .unwrap();
    let (_, context) = completed(outcome);
    assert_eq!(h.coordinator.call_count(), 3);
    assert_eq!(context.get("step1"), Some(&json!("a")));
    assert_eq!(context.get("step2"), Some(&json!("b")));
}

#[tokio::test]
async fn condition_false_skips_step() {
    let h = harness(MockCoordinator::with_responses(&["ran"]));
    let recipe = recipe(
        r#"
name: guarded
description: d
version: 1.0.0
context:
  enabled: false
steps:
  - id: maybe
    agent: worker
    prompt: "p"
    condition: "enabled"
    output: maybe_out
  - id: always
    agent: worker
    prompt: "p"
    output: always_out
"#,
    );

    let (session_id, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("maybe_out"), None);
    assert_eq!(context.get("always_out"), Some(&json!("ran")));
    assert_eq!(context.skipped_steps(), vec!["maybe"]);
    assert_eq!(h.coordinator.call_count(), 1);

    let state = h.store.load(&session_id, &h.project).await.unwrap();
    assert!(!state.completed_steps.contains(&"maybe".to_string()));
}

#[tokio::test]
async fn skip_remaining_ends_loop_without_failing() {
    let h = harness(MockCoordinator::with_responses(&["one"]));
    h.coordinator.queue_error("broken");
    let recipe = recipe(
        r#"
name: skipper
description: d
version: 1.0.0
steps:
  - id: s1
    agent: worker
    prompt: "p"
    output: out1
  - id: s2
    agent: worker
    prompt: "p"
    on_error: skip_remaining
    output: out2
  - id: s3
    agent: worker
    prompt: "p"
    output: out3
"#,
    );

    let (session_id, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("out1"), Some(&json!("one")));
    assert_eq!(context.get("out2"), None);
    assert_eq!(context.get("out3"), None);
    assert_eq!(h.coordinator.call_count(), 2);

    let state = h.store.load(&session_id, &h.project).await.unwrap();
    assert_eq!(state.completed_steps, vec!["s1"]);
}

#[tokio::test]
async fn on_error_continue_yields_null_result() {
    let h = harness(MockCoordinator::new());
    h.coordinator.queue_error("broken");
    h.coordinator.queue(&["after"]);
    let recipe = recipe(
        r#"
name: continuer
description: d
version: 1.0.0
steps:
  - id: flaky
    agent: worker
    prompt: "p"
    on_error: continue
    output: flaky_out
  - id: next
    agent: worker
    prompt: "p"
    output: next_out
"#,
    );

    let (_, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("flaky_out"), Some(&json!(null)));
    assert_eq!(context.get("next_out"), Some(&json!("after")));
}

#[tokio::test]
async fn retry_reattempts_up_to_max() {
    let h = harness(MockCoordinator::new());
    h.coordinator.queue_error("transient");
    h.coordinator.queue(&["recovered"]);
    let recipe = recipe(
        r#"
name: retrier
description: d
version: 1.0.0
steps:
  - id: flaky
    agent: worker
    prompt: "p"
    retry:
      max_attempts: 3
      initial_delay: 0
    output: out
"#,
    );

    let (_, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("out"), Some(&json!("recovered")));
    assert_eq!(h.coordinator.call_count(), 2);
}

#[tokio::test]
async fn retry_max_attempts_one_calls_exactly_once() {
    let h = harness(MockCoordinator::new());
    h.coordinator.queue_error("broken");
    let recipe = recipe(
        r#"
name: one-shot
description: d
version: 1.0.0
steps:
  - id: only
    agent: worker
    prompt: "p"
    retry:
      max_attempts: 1
      initial_delay: 0
"#,
    );

    execute(&h, &recipe).await.unwrap_err();
    assert_eq!(h.coordinator.call_count(), 1);
}

#[tokio::test]
async fn parse_json_enables_dotted_access_downstream() {
    let h = harness(MockCoordinator::new());
    h.coordinator
        .queue(&["Here you go:\n```json\n{\"status\": \"ok\", \"count\": 2}\n```"]);
    let h2_response = "status was ok";
    h.coordinator.queue(&[h2_response]);
    let recipe = recipe(
        r#"
name: parser
description: d
version: 1.0.0
steps:
  - id: produce
    agent: worker
    prompt: "p"
    parse_json: true
    output: result
  - id: consume
    agent: worker
    prompt: "saw {{result.status}}"
    output: final_output
"#,
    );

    let (_, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("result"), Some(&json!({"status": "ok", "count": 2})));
    assert_eq!(context.get("final_output"), Some(&json!(h2_response)));
    // The JSON-output contract was appended to the producing prompt only
    let instructions = h.coordinator.instructions();
    assert!(instructions[0].contains("JSON OUTPUT REQUIRED"));
    assert!(instructions[1].contains("saw ok"));
    assert!(!instructions[1].contains("JSON OUTPUT REQUIRED"));
}

// ============================================================================
// Bash steps
// ============================================================================

#[tokio::test]
async fn bash_step_captures_stdout_and_exit_code() {
    let h = harness(MockCoordinator::new());
    let recipe = recipe(
        r#"
name: shelly
description: d
version: 1.0.0
steps:
  - id: run
    type: bash
    command: "printf 'hello'"
    output: stdout
    output_exit_code: code
"#,
    );

    let (_, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("stdout"), Some(&json!("hello")));
    assert_eq!(context.get("code"), Some(&json!("0")));
}

#[tokio::test]
async fn bash_nonzero_exit_fails_under_on_error_fail() {
    let h = harness(MockCoordinator::new());
    let recipe = recipe(
        r#"
name: failing-shell
description: d
version: 1.0.0
steps:
  - id: run
    type: bash
    command: "echo oops >&2; exit 3"
"#,
    );

    let err = execute(&h, &recipe).await.unwrap_err().to_string();
    assert!(err.contains("exit code 3"), "{err}");
    assert!(err.contains("oops"), "{err}");
}

#[tokio::test]
async fn bash_nonzero_exit_with_continue_exposes_exit_code() {
    let h = harness(MockCoordinator::new());
    let recipe = recipe(
        r#"
name: tolerant-shell
description: d
version: 1.0.0
steps:
  - id: run
    type: bash
    command: "exit 7"
    on_error: continue
    output_exit_code: code
"#,
    );

    let (_, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("code"), Some(&json!("7")));
}

#[tokio::test]
async fn bash_uses_bash_features_and_env_overlay() {
    let h = harness(MockCoordinator::new());
    let recipe = recipe(
        r#"
name: bashisms
description: d
version: 1.0.0
context:
  greeting: hi
steps:
  - id: run
    type: bash
    command: "echo {a,b} && printf '%s' \"$GREETING\""
    env:
      GREETING: "{{greeting}}"
    output: out
"#,
    );

    let (_, context) = completed(execute(&h, &recipe).await.unwrap());
    // Brace expansion proves /bin/bash, the tail proves the env overlay
    assert_eq!(context.get("out"), Some(&json!("a b\nhi")));
}

#[tokio::test]
async fn bash_timeout_kills_the_command() {
    let h = harness(MockCoordinator::new());
    let recipe = recipe(
        r#"
name: sleeper
description: d
version: 1.0.0
steps:
  - id: run
    type: bash
    command: "sleep 30"
    timeout: 1
"#,
    );

    let err = execute(&h, &recipe).await.unwrap_err().to_string();
    assert!(err.contains("timed out after 1s"), "{err}");
}

#[tokio::test]
async fn bash_output_falls_back_to_aggressive_json() {
    let h = harness(MockCoordinator::new());
    let recipe = recipe(
        r#"
name: json-shell
description: d
version: 1.0.0
steps:
  - id: run
    type: bash
    command: "echo 'Cloning...'; echo '{\"cloned\": true}'"
    output: result
"#,
    );

    let (_, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("result"), Some(&json!({"cloned": true})));
}

// ============================================================================
// Foreach loops
// ============================================================================

#[tokio::test]
async fn foreach_sequential_collects_in_order() {
    let h = harness(MockCoordinator::with_responses(&["rx", "ry", "rz"]));
    let recipe = recipe(
        r#"
name: looper
description: d
version: 1.0.0
context:
  items: ["x", "y", "z"]
steps:
  - id: work
    agent: worker
    prompt: "do {{item}}"
    foreach: "{{items}}"
    collect: results
"#,
    );

    let (_, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("results"), Some(&json!(["rx", "ry", "rz"])));
    // Loop variable is scoped to the loop
    assert!(!context.contains_key("item"));
    assert_eq!(
        h.coordinator.instructions(),
        vec!["do x", "do y", "do z"]
    );
}

#[tokio::test]
async fn foreach_custom_loop_var_and_last_output() {
    let h = harness(MockCoordinator::with_responses(&["r1", "r2"]));
    let recipe = recipe(
        r#"
name: looper
description: d
version: 1.0.0
context:
  items: [1, 2]
steps:
  - id: work
    agent: worker
    prompt: "n={{n}}"
    foreach: "{{items}}"
    as: n
    output: last
"#,
    );

    let (_, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("last"), Some(&json!("r2")));
    assert!(!context.contains_key("n"));
    assert_eq!(h.coordinator.instructions(), vec!["n=1", "n=2"]);
}

#[tokio::test]
async fn empty_foreach_is_skipped_with_empty_collect() {
    let h = harness(MockCoordinator::new());
    let recipe = recipe(
        r#"
name: looper
description: d
version: 1.0.0
context:
  items: []
steps:
  - id: work
    agent: worker
    prompt: "do {{item}}"
    foreach: "{{items}}"
    collect: results
  - id: check
    type: bash
    command: "printf done"
    condition: "not results"
    output: checked
"#,
    );

    let (_, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("results"), Some(&json!([])));
    assert_eq!(context.skipped_steps(), vec!["work"]);
    // Downstream length check on the empty list worked
    assert_eq!(context.get("checked"), Some(&json!("done")));
    assert_eq!(h.coordinator.call_count(), 0);
}

#[tokio::test]
async fn foreach_over_max_iterations_fails() {
    let h = harness(MockCoordinator::new());
    let recipe = recipe(
        r#"
name: looper
description: d
version: 1.0.0
context:
  items: [1, 2, 3]
steps:
  - id: work
    agent: worker
    prompt: "do {{item}}"
    foreach: "{{items}}"
    max_iterations: 2
"#,
    );

    let err = execute(&h, &recipe).await.unwrap_err().to_string();
    assert!(err.contains("exceeds max_iterations (3 > 2)"), "{err}");
}

#[tokio::test]
async fn foreach_non_list_fails() {
    let h = harness(MockCoordinator::new());
    let recipe = recipe(
        r#"
name: looper
description: d
version: 1.0.0
context:
  items: "not-a-list"
steps:
  - id: work
    agent: worker
    prompt: "do {{item}}"
    foreach: "{{items}}"
"#,
    );

    let err = execute(&h, &recipe).await.unwrap_err().to_string();
    assert!(err.contains("must be a list, got string"), "{err}");
}

#[tokio::test]
async fn foreach_iteration_failure_names_step_and_index() {
    let h = harness(MockCoordinator::with_responses(&["ok"]));
    h.coordinator.queue_error("exploded");
    let recipe = recipe(
        r#"
name: looper
description: d
version: 1.0.0
context:
  items: ["a", "b", "c"]
steps:
  - id: work
    agent: worker
    prompt: "do {{item}}"
    foreach: "{{items}}"
    collect: results
"#,
    );

    let err = execute(&h, &recipe).await.unwrap_err().to_string();
    assert!(err.contains("work"), "{err}");
    assert!(err.contains("iteration 1 failed"), "{err}");
}

#[tokio::test]
async fn parallel_bounded_caps_concurrency_and_preserves_order() {
    let mut mock = MockCoordinator::echoing();
    mock.spawn_delay = Duration::from_millis(20);
    let h = harness(mock);
    let recipe = recipe(
        r#"
name: fanout
description: d
version: 1.0.0
context:
  items: ["a", "b", "c", "d", "e", "f"]
steps:
  - id: work
    agent: worker
    prompt: "do {{item}}"
    foreach: "{{items}}"
    parallel: 2
    collect: results
"#,
    );

    let (_, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(
        context.get("results"),
        Some(&json!(["do a", "do b", "do c", "do d", "do e", "do f"]))
    );
    assert!(
        h.coordinator.peak_in_flight.load(Ordering::SeqCst) <= 2,
        "more than two spawns ran concurrently"
    );
    assert!(!context.contains_key("item"));
}

#[tokio::test]
async fn parallel_unbounded_respects_recipe_rate_limit() {
    let mut mock = MockCoordinator::echoing();
    mock.spawn_delay = Duration::from_millis(20);
    let h = harness(mock);
    let recipe = recipe(
        r#"
name: fanout
description: d
version: 1.0.0
rate_limiting:
  max_concurrent_llm: 2
context:
  items: ["a", "b", "c", "d", "e"]
steps:
  - id: work
    agent: worker
    prompt: "do {{item}}"
    foreach: "{{items}}"
    parallel: true
    collect: results
"#,
    );

    let (_, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("results").unwrap().as_array().unwrap().len(), 5);
    assert!(h.coordinator.peak_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn parallel_iterations_do_not_leak_context_writes() {
    let h = harness(MockCoordinator::echoing());
    let recipe = recipe(
        r#"
name: isolated
description: d
version: 1.0.0
context:
  items: ["1", "2"]
steps:
  - id: work
    type: bash
    command: "printf {{item}}"
    foreach: "{{items}}"
    parallel: true
    output_exit_code: iteration_code
    collect: results
"#,
    );

    let (_, context) = completed(execute(&h, &recipe).await.unwrap());
    assert_eq!(context.get("results"), Some(&json!([1, 2])));
    // Exit-code writes landed in iteration copies, not the parent
    assert!(!context.contains_key("iteration_code"));
}

// ============================================================================
// Sub-recipes
// ============================================================================

#[tokio::test]
async fn sub_recipe_context_is_isolated() {
    let h = harness(MockCoordinator::echoing());
    write_recipe(
        &h.project,
        "child.yaml",
        r#"
name: child
description: d
version: 1.0.0
steps:
  - id: read
    agent: worker
    prompt: "{{explicit}}"
    output: echoed
"#,
    );
    let parent_path = write_recipe(
        &h.project,
        "parent.yaml",
        r#"
name: parent
description: d
version: 1.0.0
context:
  parent_only: "p"
steps:
  - id: compose
    type: recipe
    recipe: "child.yaml"
    context:
      explicit: "{{parent_only}}"
    output: child_result
"#,
    );

    let recipe = Recipe::from_yaml_file(&parent_path).unwrap();
    let outcome = h
        .executor
        .execute(&recipe, serde_json::Map::new(), &h.project, Some(&parent_path))
        .await
        .unwrap();
    let (_, context) = completed(outcome);

    let child_result = context.get("child_result").unwrap();
    assert_eq!(child_result["explicit"], json!("p"));
    assert_eq!(child_result["echoed"], json!("p"));
    // The parent's other keys never reached the child
    assert!(child_result.get("parent_only").is_none());
}

#[tokio::test]
async fn sub_recipe_templates_resolve_in_nested_structures() {
    let h = harness(MockCoordinator::echoing());
    write_recipe(
        &h.project,
        "child.yaml",
        r#"
name: child
description: d
version: 1.0.0
steps:
  - id: read
    agent: worker
    prompt: "{{config.target}} {{config.flags}}"
    output: echoed
"#,
    );
    let parent_path = write_recipe(
        &h.project,
        "parent.yaml",
        r#"
name: parent
description: d
version: 1.0.0
context:
  target: prod
steps:
  - id: compose
    type: recipe
    recipe: "child.yaml"
    context:
      config:
        target: "{{target}}"
        flags: ["-v", "{{target}}"]
    output: child_result
"#,
    );

    let recipe = Recipe::from_yaml_file(&parent_path).unwrap();
    let outcome = h
        .executor
        .execute(&recipe, serde_json::Map::new(), &h.project, Some(&parent_path))
        .await
        .unwrap();
    let (_, context) = completed(outcome);
    let echoed = context.get("child_result").unwrap()["echoed"].clone();
    assert_eq!(echoed, json!("prod [\"-v\",\"prod\"]"));
}

#[tokio::test]
async fn recursion_depth_limit_names_the_stack() {
    let h = harness(MockCoordinator::echoing());
    write_recipe(
        &h.project,
        "a.yaml",
        r#"
name: a
description: d
version: 1.0.0
recursion:
  max_depth: 2
steps:
  - id: call-b
    type: recipe
    recipe: "b.yaml"
"#,
    );
    write_recipe(
        &h.project,
        "b.yaml",
        r#"
name: b
description: d
version: 1.0.0
steps:
  - id: call-a
    type: recipe
    recipe: "a.yaml"
"#,
    );
    let a_path = h.project.join("a.yaml");

    let recipe = Recipe::from_yaml_file(&a_path).unwrap();
    let err = h
        .executor
        .execute(&recipe, serde_json::Map::new(), &h.project, Some(&a_path))
        .await
        .unwrap_err();
    assert!(matches!(err, RexError::Recursion(..)), "{err}");
    let message = err.to_string();
    assert!(message.contains("a -> b -> a"), "{message}");
}

#[tokio::test]
async fn agent_step_budget_is_shared_with_sub_recipes() {
    let h = harness(MockCoordinator::echoing());
    write_recipe(
        &h.project,
        "child.yaml",
        r#"
name: child
description: d
version: 1.0.0
steps:
  - id: one
    agent: worker
    prompt: "x"
  - id: two
    agent: worker
    prompt: "y"
"#,
    );
    let parent_path = write_recipe(
        &h.project,
        "parent.yaml",
        r#"
name: parent
description: d
version: 1.0.0
recursion:
  max_depth: 5
  max_total_steps: 3
steps:
  - id: local
    agent: worker
    prompt: "z"
  - id: compose
    type: recipe
    recipe: "child.yaml"
"#,
    );

    let recipe = Recipe::from_yaml_file(&parent_path).unwrap();
    let err = h
        .executor
        .execute(&recipe, serde_json::Map::new(), &h.project, Some(&parent_path))
        .await
        .unwrap_err();
    assert!(matches!(err, RexError::Recursion(..)), "{err}");
    assert!(err.to_string().contains("exceeds limit 3"), "{}", err);
}

// ============================================================================
// Staged execution and approval gates
// ============================================================================

const STAGED_YAML: &str = r#"
name: staged
description: d
version: 1.0.0
stages:
  - name: stage1
    steps:
      - id: plan
        agent: worker
        prompt: "plan it"
        output: plan
    approval:
      required: true
      prompt: "Proceed past stage1?"
  - name: stage2
    steps:
      - id: ship
        agent: worker
        prompt: "ship it"
        output: shipped
"#;

#[tokio::test]
async fn approval_gate_pauses_with_advanced_state() {
    let h = harness(MockCoordinator::with_responses(&["the plan"]));
    let recipe = recipe(STAGED_YAML);

    let outcome = execute(&h, &recipe).await.unwrap();
    let session_id = match outcome {
        RunOutcome::Paused {
            session_id,
            stage_name,
            prompt,
        } => {
            assert_eq!(stage_name, "stage1");
            assert_eq!(prompt, "Proceed past stage1?");
            session_id
        }
        other => panic!("expected Paused, got {other:?}"),
    };

    // Saved state already points at stage2 step0; the pending marker
    // piggy-backs on it
    let state = h.store.load(&session_id, &h.project).await.unwrap();
    assert_eq!(state.completed_stages, vec!["stage1"]);
    assert_eq!(state.current_stage_index, 1);
    assert_eq!(state.current_step_in_stage, 0);
    assert_eq!(
        state.pending_approval.as_ref().unwrap().stage_name,
        "stage1"
    );
}

#[tokio::test]
async fn approve_then_resume_completes_remaining_stages() {
    let h = harness(MockCoordinator::with_responses(&["the plan"]));
    let recipe = recipe(STAGED_YAML);

    let outcome = execute(&h, &recipe).await.unwrap();
    let session_id = match outcome {
        RunOutcome::Paused { session_id, .. } => session_id,
        other => panic!("expected Paused, got {other:?}"),
    };

    h.store
        .set_stage_approval_status(
            &session_id,
            &h.project,
            "stage1",
            ApprovalStatus::Approved,
            Some("Approved by user"),
        )
        .await
        .unwrap();

    h.coordinator.queue(&["shipped!"]);
    let outcome = h
        .executor
        .resume(&recipe, &session_id, &h.project)
        .await
        .unwrap();
    let (_, context) = completed(outcome);
    assert_eq!(context.get("shipped"), Some(&json!("shipped!")));
    // Stage1's step did not re-run
    assert_eq!(h.coordinator.call_count(), 2);

    let state = h.store.load(&session_id, &h.project).await.unwrap();
    assert_eq!(state.completed_stages, vec!["stage1", "stage2"]);
    assert!(state.pending_approval.is_none());
}

#[tokio::test]
async fn deny_then_resume_fails_with_stage_denied() {
    let h = harness(MockCoordinator::with_responses(&["the plan"]));
    let recipe = recipe(STAGED_YAML);

    let outcome = execute(&h, &recipe).await.unwrap();
    let session_id = match outcome {
        RunOutcome::Paused { session_id, .. } => session_id,
        other => panic!("expected Paused, got {other:?}"),
    };

    h.store
        .set_stage_approval_status(
            &session_id,
            &h.project,
            "stage1",
            ApprovalStatus::Denied,
            Some("no"),
        )
        .await
        .unwrap();

    let err = h
        .executor
        .resume(&recipe, &session_id, &h.project)
        .await
        .unwrap_err();
    match err {
        RexError::ApprovalDenied { stage_name, reason } => {
            assert_eq!(stage_name, "stage1");
            assert_eq!(reason, "no");
        }
        other => panic!("expected ApprovalDenied, got {other}"),
    }

    // Stage1 remains completed; stage2 never ran
    let state = h.store.load(&session_id, &h.project).await.unwrap();
    assert_eq!(state.completed_stages, vec!["stage1"]);
    assert_eq!(h.coordinator.call_count(), 1);
}

#[tokio::test]
async fn resume_while_still_pending_re_pauses() {
    let h = harness(MockCoordinator::with_responses(&["the plan"]));
    let recipe = recipe(STAGED_YAML);

    let outcome = execute(&h, &recipe).await.unwrap();
    let session_id = match outcome {
        RunOutcome::Paused { session_id, .. } => session_id,
        other => panic!("expected Paused, got {other:?}"),
    };

    let outcome = h
        .executor
        .resume(&recipe, &session_id, &h.project)
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Paused { .. }));
    assert_eq!(h.coordinator.call_count(), 1);
}

#[tokio::test]
async fn approval_timeout_with_default_approve_continues() {
    let h = harness(MockCoordinator::with_responses(&["the plan"]));
    let recipe = recipe(
        r#"
name: staged
description: d
version: 1.0.0
stages:
  - name: stage1
    steps:
      - id: plan
        agent: worker
        prompt: "plan it"
    approval:
      required: true
      prompt: "Proceed?"
      timeout: 10
      default: approve
  - name: stage2
    steps:
      - id: ship
        agent: worker
        prompt: "ship it"
        output: shipped
"#,
    );

    let outcome = execute(&h, &recipe).await.unwrap();
    let session_id = match outcome {
        RunOutcome::Paused { session_id, .. } => session_id,
        other => panic!("expected Paused, got {other:?}"),
    };

    // Backdate the request so the deadline has passed
    let mut state = h.store.load(&session_id, &h.project).await.unwrap();
    if let Some(pending) = &mut state.pending_approval {
        pending.requested_at = chrono::Utc::now() - chrono::Duration::seconds(60);
    }
    h.store.save(&session_id, &h.project, &state).await.unwrap();

    h.coordinator.queue(&["done"]);
    let outcome = h
        .executor
        .resume(&recipe, &session_id, &h.project)
        .await
        .unwrap();
    let (_, context) = completed(outcome);
    assert_eq!(context.get("shipped"), Some(&json!("done")));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn graceful_cancel_between_steps() {
    let h = harness(MockCoordinator::with_responses(&["one", "two", "three"]));
    h.coordinator.cancel_after(1);
    let recipe = recipe(
        r#"
name: cancellable
description: d
version: 1.0.0
steps:
  - id: s1
    agent: worker
    prompt: "p"
    output: out1
  - id: s2
    agent: worker
    prompt: "p"
    output: out2
"#,
    );

    let outcome = execute(&h, &recipe).await.unwrap();
    let session_id = match outcome {
        RunOutcome::Cancelled { session_id } => session_id,
        other => panic!("expected Cancelled, got {other:?}"),
    };

    // Step 1 completed; step 2 was never dispatched
    assert_eq!(h.coordinator.call_count(), 1);
    let state = h.store.load(&session_id, &h.project).await.unwrap();
    assert_eq!(state.cancellation_status, CancellationStatus::Cancelled);
    assert_eq!(state.completed_steps, vec!["s1"]);
    assert_eq!(state.cancelled_at_step.as_deref(), Some("s2"));
    assert!(state.cancelled_at.is_some());
}

#[tokio::test]
async fn graceful_cancel_during_foreach_restarts_loop_on_resume() {
    let h = harness(MockCoordinator::with_responses(&["r1", "r2"]));
    h.coordinator.cancel_after(2);
    let recipe = recipe(
        r#"
name: loop-cancel
description: d
version: 1.0.0
context:
  items: ["a", "b", "c", "d", "e"]
steps:
  - id: work
    agent: worker
    prompt: "do {{item}}"
    foreach: "{{items}}"
    collect: results
"#,
    );

    let outcome = execute(&h, &recipe).await.unwrap();
    let session_id = match outcome {
        RunOutcome::Cancelled { session_id } => session_id,
        other => panic!("expected Cancelled, got {other:?}"),
    };

    // Iteration 3 never dispatched; the step as a whole is not complete
    assert_eq!(h.coordinator.call_count(), 2);
    let state = h.store.load(&session_id, &h.project).await.unwrap();
    assert_eq!(state.cancellation_status, CancellationStatus::Cancelled);
    assert!(state.completed_steps.is_empty());

    // Resume restarts the loop from iteration 0
    h.coordinator.reset_cancellation();
    h.coordinator.queue(&["r1", "r2", "r3", "r4", "r5"]);
    let outcome = h
        .executor
        .resume(&recipe, &session_id, &h.project)
        .await
        .unwrap();
    let (_, context) = completed(outcome);
    assert_eq!(
        context.get("results"),
        Some(&json!(["r1", "r2", "r3", "r4", "r5"]))
    );
    assert_eq!(h.coordinator.call_count(), 7);
}

#[tokio::test]
async fn per_session_cancel_request_stops_next_poll() {
    // Cancellation written directly to the store (the outer cancel
    // operation) is honored without any process-wide signal
    let h = harness(MockCoordinator::new());
    let recipe = recipe(
        r#"
name: store-cancel
description: d
version: 1.0.0
steps:
  - id: s1
    type: bash
    command: "printf start"
    output: out1
  - id: s2
    type: bash
    command: "exit 1"
    output: out2
"#,
    );

    // First run checkpoints s1 and fails at s2
    execute(&h, &recipe).await.unwrap_err();
    let session_id = h.store.list(&h.project).await.unwrap()[0].session_id.clone();

    // The outer cancel operation writes the per-session flag; resume
    // stops at the first poll without dispatching s2 again
    h.store
        .request_cancellation(&session_id, &h.project, false)
        .await
        .unwrap();
    let outcome = h
        .executor
        .resume(&recipe, &session_id, &h.project)
        .await
        .unwrap();
    match outcome {
        RunOutcome::Cancelled { .. } => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }

    let state = h.store.load(&session_id, &h.project).await.unwrap();
    assert_eq!(state.cancellation_status, CancellationStatus::Cancelled);
    assert_eq!(state.completed_steps, vec!["s1"]);
}

// ============================================================================
// Metadata and summary
// ============================================================================

#[tokio::test]
async fn reserved_metadata_is_injected() {
    let h = harness(MockCoordinator::echoing());
    let recipe = recipe(
        r#"
name: meta
description: recipe description
version: 2.0.0
steps:
  - id: probe
    agent: worker
    prompt: "{{recipe.name}}/{{recipe.version}} step={{step.id}} session={{session.id}}"
    output: probed
"#,
    );

    let (session_id, context) = completed(execute(&h, &recipe).await.unwrap());
    let probed = context.get("probed").unwrap().as_str().unwrap();
    assert!(probed.starts_with("meta/2.0.0 step=probe"));
    assert!(probed.contains(&format!("session={session_id}")));
}
