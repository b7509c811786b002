//! End-to-end cascade scenarios against scripted model clients

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use cascata::{
    Cascade, CascadeError, CascadeRunner, FnTool, FnValidator, ModelResponse, RunContext, RunOptions, ScriptedClient,
    Verdict, replay_session,
};
use echolog::{EventSink, MemorySink, NodeType};

fn scripted_ctx(responses: Vec<ModelResponse>) -> (RunContext, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let ctx = RunContext::new(Arc::new(ScriptedClient::new(responses)), sink.clone());
    (ctx, sink)
}

fn options(session: &str) -> RunOptions {
    RunOptions {
        session_id: Some(session.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn linear_llm_cascade() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: linear
phases:
  - name: a
    instructions: "Research {{input.topic}}"
    handoffs: [b]
  - name: b
    instructions: "Outline it"
    handoffs: [c]
  - name: c
    instructions: "Write the final text"
"#,
    )
    .unwrap();

    let (ctx, sink) = scripted_ctx(vec![
        ModelResponse::text("research notes").with_usage(100, 20),
        ModelResponse::text("an outline").with_usage(120, 30),
        ModelResponse::text("the final text").with_usage(150, 40),
    ]);

    let result = CascadeRunner::new(ctx)
        .run(&cascade, json!({"topic": "x"}), options("sess-linear"))
        .await
        .unwrap();

    assert_eq!(result.lineage, vec!["a", "b", "c"]);
    assert_eq!(result.output, json!("the final text"));
    assert!(result.error.is_none());

    // Three accepted phase_complete events, in order
    let completes = sink.events_by_type("sess-linear", NodeType::PhaseComplete).await.unwrap();
    let phases: Vec<&str> = completes.iter().filter_map(|e| e.phase_name.as_deref()).collect();
    assert_eq!(phases, vec!["a", "b", "c"]);
    assert!(completes.iter().all(|e| e.content.as_ref().unwrap()["accepted"] == true));

    // cascade_start before everything, cascade_complete at the end
    assert_eq!(sink.events_by_type("sess-linear", NodeType::CascadeStart).await.unwrap().len(), 1);
    assert_eq!(sink.events_by_type("sess-linear", NodeType::CascadeComplete).await.unwrap().len(), 1);
}

#[tokio::test]
async fn parent_before_child_holds_for_all_events() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: ordered
phases:
  - name: only
    instructions: "Say something"
"#,
    )
    .unwrap();

    let (ctx, sink) = scripted_ctx(vec![ModelResponse::text("something")]);
    CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-ordered"))
        .await
        .unwrap();

    let events = sink.events_by_type("sess-ordered", NodeType::CascadeStart).await.unwrap();
    let all = sink.session_events("sess-ordered").await.unwrap();
    assert!(!all.is_empty());
    assert_eq!(all[0].trace_id, events[0].trace_id);

    // Every parent referenced by an event was written earlier
    for (position, event) in all.iter().enumerate() {
        if let Some(parent_id) = &event.parent_id {
            let parent_position = all.iter().position(|e| &e.trace_id == parent_id);
            if let Some(parent_position) = parent_position {
                assert!(parent_position < position, "parent written after child");
            }
        }
    }
}

#[tokio::test]
async fn routing_fork_via_route_to() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: fork
phases:
  - name: classify
    instructions: "Classify the sentiment of {{input.text}} and call route_to"
    handoffs: [positive, negative]
  - name: positive
    instructions: "Celebrate"
  - name: negative
    instructions: "Commiserate"
"#,
    )
    .unwrap();

    let (ctx, sink) = scripted_ctx(vec![
        ModelResponse::tool_call("route_to", json!({"target": "positive"})),
        ModelResponse::text("it is positive indeed"),
    ]);

    let result = CascadeRunner::new(ctx)
        .run(&cascade, json!({"text": "I love it"}), options("sess-fork"))
        .await
        .unwrap();

    assert_eq!(result.lineage, vec!["classify", "positive"]);

    // The routing decision is recorded as a tool_call event
    let calls = sink.events_by_type("sess-fork", NodeType::ToolCall).await.unwrap();
    let route = calls
        .iter()
        .find(|e| e.content.as_ref().unwrap()["tool"] == "route_to")
        .unwrap();
    assert_eq!(route.content.as_ref().unwrap()["target"], "positive");
}

#[tokio::test]
async fn ambiguous_routing_is_fatal() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: ambiguous
phases:
  - name: chooser
    instructions: "Just answer, never route"
    handoffs: [left, right]
  - name: left
    instructions: "l"
  - name: right
    instructions: "r"
"#,
    )
    .unwrap();

    let (ctx, sink) = scripted_ctx(vec![ModelResponse::text("no routing call")]);
    let err = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-ambiguous"))
        .await
        .unwrap_err();

    assert!(matches!(err, CascadeError::Routing(_)));

    // cascade_error carries the kind and the partial state
    let errors = sink.events_by_type("sess-ambiguous", NodeType::CascadeError).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].content.as_ref().unwrap()["kind"], "routing");
}

#[tokio::test]
async fn retry_ward_re_executes_body() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: warded
phases:
  - name: draft
    instructions: "Write at least 100 chars"
    wards:
      post:
        - validator: min_length
          mode: retry
          max_attempts: 2
"#,
    )
    .unwrap();

    let short = "too short";
    let long = "x".repeat(150);
    let (ctx, sink) = scripted_ctx(vec![ModelResponse::text(short), ModelResponse::text(long.clone())]);
    ctx.validators.register(Arc::new(FnValidator::new("min_length", |v: &Value| {
        let len = v.as_str().map(str::len).unwrap_or(0);
        if len >= 100 {
            Verdict::pass()
        } else {
            Verdict::fail(format!("output length {} below minimum 100", len))
        }
    })));

    let result = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-ward"))
        .await
        .unwrap();

    assert_eq!(result.output, json!(long));

    // Two phase_start/phase_complete pairs
    let starts = sink.events_by_type("sess-ward", NodeType::PhaseStart).await.unwrap();
    let completes = sink.events_by_type("sess-ward", NodeType::PhaseComplete).await.unwrap();
    assert_eq!(starts.len(), 2);
    assert_eq!(completes.len(), 2);

    // Ward verdicts: a failure mentioning length, then a pass
    let wards = sink.events_by_type("sess-ward", NodeType::Ward).await.unwrap();
    assert_eq!(wards.len(), 2);
    let first = wards[0].content.as_ref().unwrap();
    assert_eq!(first["valid"], false);
    assert!(first["reason"].as_str().unwrap().contains("length"));
    assert_eq!(wards[1].content.as_ref().unwrap()["valid"], true);
}

#[tokio::test]
async fn soundings_with_pre_validator_and_evaluator() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: sounded
phases:
  - name: generate
    instructions: "Produce a JSON object"
    soundings:
      factor: 4
      max_parallel: 1
      pre_validator: is_json
      evaluator:
        instructions: "pick shortest"
"#,
    )
    .unwrap();

    // Candidates 0 and 2 emit valid JSON; 1 and 3 emit free text.
    // max_parallel 1 keeps scripted response order aligned with seats.
    let (ctx, sink) = scripted_ctx(vec![
        ModelResponse::text("{\"a\": 1}"),
        ModelResponse::text("free text"),
        ModelResponse::text("{}"),
        ModelResponse::text("more free text"),
        ModelResponse::text("{\"winner\": 2, \"rationale\": \"shortest\"}"),
    ]);
    ctx.validators.register(Arc::new(FnValidator::new("is_json", |v: &Value| {
        let text = v.as_str().unwrap_or_default();
        if serde_json::from_str::<Value>(text).is_ok() {
            Verdict::pass()
        } else {
            Verdict::fail("does not parse as JSON")
        }
    })));

    let result = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-sound"))
        .await
        .unwrap();
    assert_eq!(result.output, json!("{}"));

    // Four attempts, all tagged is_winner=false at dispatch
    let attempts = sink.events_by_type("sess-sound", NodeType::SoundingAttempt).await.unwrap();
    assert_eq!(attempts.len(), 4);
    assert!(attempts.iter().all(|a| a.is_winner == Some(false)));
    let indices: Vec<usize> = attempts.iter().filter_map(|a| a.sounding_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    // Pre-validator verdicts: two valid, two invalid
    let wards = sink.events_by_type("sess-sound", NodeType::Ward).await.unwrap();
    let valid: Vec<bool> = wards
        .iter()
        .map(|w| w.content.as_ref().unwrap()["valid"].as_bool().unwrap())
        .collect();
    assert_eq!(valid, vec![true, false, true, false]);

    // Exactly one winner event, referencing index 2
    let winners = sink.events_by_type("sess-sound", NodeType::SoundingWinner).await.unwrap();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].sounding_index, Some(2));
    assert_eq!(winners[0].is_winner, Some(true));

    // Candidate turns ran in branch sessions, not the parent session
    assert!(sink.events_by_type("sess-sound", NodeType::Agent).await.unwrap().is_empty());
    assert!(!sink.events_by_type("sess-sound_sounding0", NodeType::Agent).await.unwrap().is_empty());
}

#[tokio::test]
async fn loop_until_early_exit() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: looped
phases:
  - name: ask
    instructions: "Produce a question"
    rules:
      max_turns: 3
      loop_until: question_check
      silent: true
"#,
    )
    .unwrap();

    let (ctx, sink) = scripted_ctx(vec![ModelResponse::text("Is this a question?")]);
    ctx.validators.register(Arc::new(FnValidator::new("question_check", |v: &Value| {
        if v.as_str().unwrap_or_default().trim_end().ends_with('?') {
            Verdict::pass()
        } else {
            Verdict::fail("output is not a question")
        }
    })));

    let result = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-loop"))
        .await
        .unwrap();
    assert_eq!(result.output, json!("Is this a question?"));

    // Exactly one agent turn and one passing loop_until check
    assert_eq!(sink.events_by_type("sess-loop", NodeType::Agent).await.unwrap().len(), 1);
    let checks = sink.events_by_type("sess-loop", NodeType::LoopUntilCheck).await.unwrap();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].content.as_ref().unwrap()["valid"], true);
    assert_eq!(sink.events_by_type("sess-loop", NodeType::Turn).await.unwrap().len(), 1);
}

#[tokio::test]
async fn loop_until_exhaustion_fails_phase() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: looped
phases:
  - name: ask
    instructions: "Produce a question"
    rules:
      max_turns: 2
      loop_until: question_check
      silent: true
"#,
    )
    .unwrap();

    let (ctx, _sink) = scripted_ctx(vec![
        ModelResponse::text("not a question"),
        ModelResponse::text("still not one"),
    ]);
    ctx.validators.register(Arc::new(FnValidator::new("question_check", |v: &Value| {
        if v.as_str().unwrap_or_default().ends_with('?') {
            Verdict::pass()
        } else {
            Verdict::fail("not a question")
        }
    })));

    let err = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-loop-fail"))
        .await
        .unwrap_err();
    assert!(matches!(err, CascadeError::Validation { .. }));
    assert!(err.to_string().contains("loop_until"));
}

#[tokio::test]
async fn max_turns_zero_boundary() {
    let yaml = r#"
cascade_id: zero
phases:
  - name: silent
    instructions: "Anything"
    rules:
      max_turns: 0
"#;
    let cascade = Cascade::from_yaml(yaml).unwrap();
    let (ctx, _sink) = scripted_ctx(vec![]);

    let result = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-zero"))
        .await
        .unwrap();
    assert_eq!(result.output, json!(""));

    // With loop_until configured the same boundary is a validation error
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: zero
phases:
  - name: silent
    instructions: "Anything"
    rules:
      max_turns: 0
      loop_until: check
      silent: true
"#,
    )
    .unwrap();
    let (ctx, _sink) = scripted_ctx(vec![]);
    ctx.validators
        .register(Arc::new(FnValidator::new("check", |_: &Value| Verdict::pass())));

    let err = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-zero2"))
        .await
        .unwrap_err();
    assert!(matches!(err, CascadeError::Validation { .. }));
}

#[tokio::test]
async fn deterministic_phase_with_status_routing() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: det
phases:
  - name: check
    run: "python:checks.moderate"
    inputs:
      text: "{{input.text}}"
    routing:
      flagged: reject
      clean: publish
  - name: publish
    instructions: "Publish it"
  - name: reject
    instructions: "Reject it"
"#,
    )
    .unwrap();

    let (ctx, sink) = scripted_ctx(vec![ModelResponse::text("rejected politely")]);
    ctx.tools.register(Arc::new(FnTool::new(
        "checks.moderate",
        "Moderation check",
        json!({"type": "object"}),
        |args| {
            let text = args["text"].as_str().unwrap_or_default();
            let status = if text.contains("bad") { "flagged" } else { "clean" };
            Ok(json!({"status": status, "session": args["_session_id"]}))
        },
    )));

    let result = CascadeRunner::new(ctx)
        .run(&cascade, json!({"text": "bad words"}), options("sess-det"))
        .await
        .unwrap();

    assert_eq!(result.lineage, vec!["check", "reject"]);

    // The deterministic call and result are logged
    let calls = sink.events_by_type("sess-det", NodeType::ToolCall).await.unwrap();
    assert_eq!(calls[0].content.as_ref().unwrap()["run"], "python:checks.moderate");
    let results = sink.events_by_type("sess-det", NodeType::ToolResult).await.unwrap();
    assert_eq!(results[0].content.as_ref().unwrap()["status"], "flagged");
}

#[tokio::test]
async fn set_state_flows_between_phases() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: stateful
phases:
  - name: gather
    instructions: "Store what you find"
    handoffs: [use_it]
  - name: use_it
    instructions: "The city is {{state.city}}"
"#,
    )
    .unwrap();

    let (ctx, _sink) = scripted_ctx(vec![
        ModelResponse::tool_call("set_state", json!({"key": "city", "value": "Oslo"})),
        ModelResponse::text("done storing"),
        ModelResponse::text("Oslo it is"),
    ]);

    let result = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-state"))
        .await
        .unwrap();

    // The second phase only produces this output if its instructions
    // rendered the state the first phase stored
    assert_eq!(result.output, json!("Oslo it is"));
}

#[tokio::test]
async fn checkpoint_with_response_and_replay_determinism() {
    let yaml = r#"
cascade_id: approval
signals:
  manager_approval:
    type: human
phases:
  - name: await_approval
    await: manager_approval
    timeout_seconds: 10
    on_timeout: auto_escalate
    on_signal:
      approve: publish
      reject: archive
  - name: publish
    instructions: "Publish"
  - name: archive
    instructions: "Archive"
  - name: auto_escalate
    instructions: "Escalate"
"#;
    let cascade = Cascade::from_yaml(yaml).unwrap();
    let (ctx, sink) = scripted_ctx(vec![ModelResponse::text("published")]);

    // Simulate a human approving shortly after the wait begins
    let signals = ctx.signals.clone();
    let fire_sink = sink.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        signals
            .fire(fire_sink.as_ref(), "sess-approve", "manager_approval", json!("approve"))
            .await
            .unwrap();
    });

    let result = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-approve"))
        .await
        .unwrap();

    assert_eq!(result.lineage, vec!["await_approval", "publish"]);

    assert!(!sink.events_by_type("sess-approve", NodeType::Checkpoint).await.unwrap().is_empty());
    let fired = sink.events_by_type("sess-approve", NodeType::SignalFired).await.unwrap();
    assert_eq!(fired[0].content.as_ref().unwrap()["payload"], "approve");

    // Replaying the session with the logged checkpoint response is
    // deterministic: same lineage, same output, zero model cost
    let replay_target = Arc::new(MemorySink::new());
    let replay_ctx = RunContext::new(Arc::new(ScriptedClient::new(vec![])), replay_target.clone());
    let replayed = replay_session(&cascade, sink.as_ref(), "sess-approve", replay_ctx)
        .await
        .unwrap();

    assert_eq!(replayed.lineage, result.lineage);
    assert_eq!(replayed.output, result.output);

    // Every replay-produced event carries the marker
    let replay_events = replay_target.session_events("sess-approve").await.unwrap();
    assert!(!replay_events.is_empty());
    assert!(replay_events.iter().all(|e| e.metadata["replay_of"] == "sess-approve"));
}

#[tokio::test]
async fn signal_timeout_escalates() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: escalation
signals:
  never:
    type: human
phases:
  - name: wait
    await: never
    timeout_seconds: 0
    on_timeout: fallback
  - name: fallback
    instructions: "Handle the silence"
"#,
    )
    .unwrap();

    let (ctx, sink) = scripted_ctx(vec![ModelResponse::text("handled")]);
    let result = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-esc"))
        .await
        .unwrap();

    assert_eq!(result.lineage, vec!["wait", "fallback"]);
    assert_eq!(sink.events_by_type("sess-esc", NodeType::SignalTimeout).await.unwrap().len(), 1);
}

#[tokio::test]
async fn signal_timeout_abort() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: aborting
signals:
  never:
    type: human
phases:
  - name: wait
    await: never
    timeout_seconds: 0
    on_timeout: abort
"#,
    )
    .unwrap();

    let (ctx, _sink) = scripted_ctx(vec![]);
    let err = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-abort"))
        .await
        .unwrap_err();
    assert!(matches!(err, CascadeError::Signal(_)));
}

#[tokio::test]
async fn replay_linear_cascade_matches_original() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: replayable
phases:
  - name: a
    instructions: "First"
    handoffs: [b]
  - name: b
    instructions: "Second"
"#,
    )
    .unwrap();

    let (ctx, sink) = scripted_ctx(vec![ModelResponse::text("alpha"), ModelResponse::text("omega")]);
    let original = CascadeRunner::new(ctx)
        .run(&cascade, json!({"k": "v"}), options("sess-replay"))
        .await
        .unwrap();

    let target = Arc::new(MemorySink::new());
    let replay_ctx = RunContext::new(Arc::new(ScriptedClient::new(vec![])), target.clone());
    let replayed = replay_session(&cascade, sink.as_ref(), "sess-replay", replay_ctx)
        .await
        .unwrap();

    assert_eq!(replayed.lineage, original.lineage);
    assert_eq!(replayed.output, original.output);

    // Freeze -> replay -> freeze: the replay's node types are a subset of
    // the original's
    let original_types: Vec<NodeType> = sink
        .session_events("sess-replay")
        .await
        .unwrap()
        .iter()
        .map(|e| e.node_type)
        .collect();
    let replay_types: Vec<NodeType> = target
        .session_events("sess-replay")
        .await
        .unwrap()
        .iter()
        .map(|e| e.node_type)
        .collect();
    for node_type in &replay_types {
        assert!(original_types.contains(node_type), "{:?} not in original", node_type);
    }
}

#[tokio::test]
async fn sub_cascade_tool_runs_nested_session() {
    let inner = Cascade::from_yaml(
        r#"
cascade_id: inner
phases:
  - name: summarize
    instructions: "Summarize {{input.text}}"
"#,
    )
    .unwrap();

    let outer = Cascade::from_yaml(
        r#"
cascade_id: outer
phases:
  - name: delegate
    instructions: "Delegate the work"
    tools: [run_inner]
"#,
    )
    .unwrap();

    let (ctx, sink) = scripted_ctx(vec![
        ModelResponse::tool_call("run_inner", json!({"text": "long document"})),
        // Inner cascade's single phase
        ModelResponse::text("a summary"),
        // Outer phase reacts to the tool result
        ModelResponse::text("delegated and done"),
    ]);
    cascata::register_sub_cascade(&ctx, "run_inner", inner);

    let result = CascadeRunner::new(ctx)
        .run(&outer, json!(null), options("sess-outer"))
        .await
        .unwrap();
    assert_eq!(result.output, json!("delegated and done"));

    // The child ran under its own session with a parent pointer
    let all = sink.all_events();
    let child_start = all
        .iter()
        .find(|e| e.node_type == NodeType::CascadeStart && e.cascade_id.as_deref() == Some("inner"))
        .unwrap();
    assert_eq!(child_start.parent_session_id.as_deref(), Some("sess-outer"));
    assert_eq!(child_start.depth, Some(1));
    assert!(child_start.parent_id.is_some());
}

#[tokio::test]
async fn cancellation_returns_partial_state() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: cancellable
signals:
  forever:
    type: human
phases:
  - name: first
    instructions: "Quick work"
    handoffs: [park]
  - name: park
    await: forever
"#,
    )
    .unwrap();

    let (ctx, sink) = scripted_ctx(vec![ModelResponse::text("quick")]);
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let result = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-cancel"))
        .await
        .unwrap();

    assert_eq!(result.error.as_deref(), Some("cancelled"));
    assert_eq!(result.lineage, vec!["first"]);
    assert_eq!(result.output, json!("quick"));
    assert_eq!(sink.events_by_type("sess-cancel", NodeType::CascadeCancelled).await.unwrap().len(), 1);
}

#[tokio::test]
async fn deterministic_failure_routes_to_on_error() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: fallible
phases:
  - name: flaky
    run: "always_fails"
    on_error: cleanup
  - name: cleanup
    instructions: "Clean up after the failure"
"#,
    )
    .unwrap();

    let (ctx, _sink) = scripted_ctx(vec![ModelResponse::text("cleaned up")]);
    ctx.tools.register(Arc::new(FnTool::new(
        "always_fails",
        "Always fails",
        json!({"type": "object"}),
        |_| Err(cascata::ToolError::failed("always_fails", "simulated outage")),
    )));

    let result = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-onerror"))
        .await
        .unwrap();

    assert_eq!(result.lineage, vec!["flaky", "cleanup"]);
    assert_eq!(result.output, json!("cleaned up"));
}

#[tokio::test]
async fn output_schema_retries_then_succeeds() {
    let cascade = Cascade::from_yaml(
        r#"
cascade_id: schema
phases:
  - name: produce
    instructions: "Produce JSON"
    output_schema:
      type: string
      minLength: 5
    rules:
      max_attempts: 2
"#,
    )
    .unwrap();

    let (ctx, sink) = scripted_ctx(vec![ModelResponse::text("no"), ModelResponse::text("long enough")]);
    let result = CascadeRunner::new(ctx)
        .run(&cascade, json!(null), options("sess-schema"))
        .await
        .unwrap();
    assert_eq!(result.output, json!("long enough"));

    let checks = sink.events_by_type("sess-schema", NodeType::OutputSchemaCheck).await.unwrap();
    assert_eq!(checks.len(), 2);
    assert_eq!(checks[0].content.as_ref().unwrap()["valid"], false);
    assert_eq!(checks[1].content.as_ref().unwrap()["valid"], true);
}
