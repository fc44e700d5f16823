//! End-to-end engine scenarios against the scripted mock runner.

use conductor_core::frame::xml_equivalent;
use conductor_core::{
    AgentKind, Engine, EngineConfig, MockResponse, MockRunner, PlanNode, Predicate, StreamEvent,
};
use conductor_store::{ExecutionLog, ExecutionStatus};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn engine_with(runner: MockRunner) -> (Engine, Arc<ExecutionLog>) {
    let log = Arc::new(ExecutionLog::in_memory().await.unwrap());
    let engine = Engine::new(Arc::clone(&log), Arc::new(runner));
    (engine, log)
}

#[tokio::test]
async fn hello_world() {
    let runner = MockRunner::new().script_kind("claude", MockResponse::text("Hello!"));
    let (engine, log) = engine_with(runner).await;

    let plan = PlanNode::agent(AgentKind::Claude, "Say hello.");
    let report = engine.run(&plan, "hello", None).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Succeeded);
    assert_eq!(report.frames, 2);
    assert_eq!(report.invocations, 1);

    let invocations = log.list_invocations(&report.execution_id).await.unwrap();
    assert_eq!(invocations[0].kind, "claude");
    assert_eq!(invocations[0].output.as_deref(), Some("Hello!"));

    let frames = log.list_frames(&report.execution_id).await.unwrap();
    assert!(xml_equivalent(
        &frames.last().unwrap().document,
        r#"<claude status="succeeded">Hello!</claude>"#
    ));
}

#[tokio::test]
async fn sequential_phases_with_state() {
    let runner = MockRunner::new()
        .script_prompt("do A", MockResponse::text("A"))
        .script_prompt("do B", MockResponse::text("B"));
    let (engine, log) = engine_with(runner).await;

    let plan = PlanNode::orchestration(vec![
        PlanNode::phase(
            "a",
            vec![PlanNode::agent(AgentKind::Claude, "do A").on_finished(Arc::new(
                |_result, writer| writer.set("phase", json!("b")),
            ))],
        ),
        PlanNode::phase("b", vec![PlanNode::agent(AgentKind::Claude, "do B")])
            .with_condition(Predicate::state_equals("phase", json!("b"))),
    ]);

    let report = engine.run(&plan, "phases", None).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Succeeded);
    assert_eq!(report.frames, 3);

    // Exactly two invocations, in author order.
    let invocations = log.list_invocations(&report.execution_id).await.unwrap();
    assert_eq!(invocations.len(), 2);
    assert_eq!(invocations[0].output.as_deref(), Some("A"));
    assert_eq!(invocations[1].output.as_deref(), Some("B"));

    let phase = log.state_get(&report.execution_id, "phase").await.unwrap();
    assert_eq!(phase, Some(json!("b")));
}

#[tokio::test]
async fn parallel_group_runs_concurrently() {
    let mut runner = MockRunner::new();
    for prompt in ["one", "two", "three"] {
        runner = runner.script_prompt(
            prompt,
            MockResponse::text(format!("done-{prompt}"))
                .with_delay(Duration::from_millis(50))
                .with_events(vec![
                    StreamEvent::text_delta("…"),
                    StreamEvent::token_usage(1, 2),
                ]),
        );
    }
    let (engine, log) = engine_with(runner).await;

    let plan = PlanNode::orchestration(vec![PlanNode::parallel(vec![
        PlanNode::agent(AgentKind::Claude, "one"),
        PlanNode::agent(AgentKind::Claude, "two"),
        PlanNode::agent(AgentKind::Claude, "three"),
    ])]);

    let start = Instant::now();
    let report = engine.run(&plan, "fanout", None).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(report.status, ExecutionStatus::Succeeded);
    assert_eq!(report.invocations, 3);
    // Three 50ms agents in one parallel group: concurrent, not stacked.
    assert!(elapsed < Duration::from_millis(120), "took {elapsed:?}");

    // Each agent's event sequence is dense from 0.
    for invocation in log.list_invocations(&report.execution_id).await.unwrap() {
        let events = log.list_events(&invocation.id).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..seqs.len() as i64).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn schema_retry_round_trip() {
    let runner = MockRunner::new()
        .script_kind("claude", MockResponse::text(r#"Sure, here: {ok: "yes"}"#))
        .script_kind("claude", MockResponse::text(r#"{"ok": true}"#));
    let (engine, log) = engine_with(runner).await;

    let plan = PlanNode::agent(AgentKind::Claude, "report status")
        .with_prop(
            "schema",
            json!({"type": "object", "properties": {"ok": {"type": "boolean"}}, "required": ["ok"]}),
        )
        .with_prop("schema_retries", json!(1));

    let report = engine.run(&plan, "schema", None).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Succeeded);

    // Two distinct dispatches recorded; the second carries the structured
    // payload.
    let invocations = log.list_invocations(&report.execution_id).await.unwrap();
    assert_eq!(invocations.len(), 2);
    assert_eq!(invocations[0].status.as_str(), "failed");
    let structured: serde_json::Value =
        serde_json::from_str(invocations[1].structured.as_deref().unwrap()).unwrap();
    assert_eq!(structured, json!({"ok": true}));
}

#[tokio::test]
async fn stop_condition_pattern_ends_dispatch_not_execution() {
    let events = vec![
        StreamEvent::text_delta("…step 1…"),
        StreamEvent::text_delta("…step 2…"),
        StreamEvent::text_delta("CRITICAL_ERROR now…"),
        StreamEvent::text_delta("never streamed"),
    ];
    let runner = MockRunner::new()
        .script_prompt("risky work", MockResponse::text("full").with_events(events))
        .script_prompt("cleanup", MockResponse::text("cleaned"));
    let (engine, log) = engine_with(runner).await;

    let plan = PlanNode::orchestration(vec![
        PlanNode::agent(AgentKind::Claude, "risky work")
            .with_prop("output_matches", json!("CRITICAL_ERROR")),
        PlanNode::agent(AgentKind::Claude, "cleanup"),
    ]);

    let report = engine.run(&plan, "stopper", None).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Succeeded);

    let invocations = log.list_invocations(&report.execution_id).await.unwrap();
    assert_eq!(invocations.len(), 2);
    // The supervisor stopped on the match; nothing after it was streamed,
    // and the stop is a normal termination.
    assert_eq!(invocations[0].status.as_str(), "succeeded");
    let stopped_output = invocations[0].output.as_deref().unwrap();
    assert!(stopped_output.contains("CRITICAL_ERROR"));
    assert!(!stopped_output.contains("never streamed"));
    // Execution continued with the next agent.
    assert_eq!(invocations[1].output.as_deref(), Some("cleaned"));
}

#[tokio::test]
async fn frames_are_deterministic_in_mock_mode() {
    let plan = || {
        PlanNode::orchestration(vec![
            PlanNode::phase("build", vec![PlanNode::agent(AgentKind::Claude, "build it")]),
            PlanNode::phase("ship", vec![PlanNode::agent(AgentKind::Amp, "ship it")]),
        ])
    };

    let mut documents: Vec<Vec<String>> = Vec::new();
    for _ in 0..2 {
        let runner = MockRunner::new()
            .script_prompt("build it", MockResponse::text("built"))
            .script_prompt("ship it", MockResponse::text("shipped"));
        let (engine, log) = engine_with(runner).await;
        let report = engine.run(&plan(), "deterministic", None).await.unwrap();
        let frames = log.list_frames(&report.execution_id).await.unwrap();
        documents.push(frames.into_iter().map(|f| f.document).collect());
    }
    assert_eq!(documents[0], documents[1]);
}

#[tokio::test]
async fn subagent_result_lands_in_state_cell() {
    let runner = MockRunner::new()
        .script_prompt("gather facts", MockResponse::text("the facts"))
        .script_prompt("write summary", MockResponse::text("summary done"));
    let (engine, log) = engine_with(runner).await;

    let plan = PlanNode::orchestration(vec![
        PlanNode::subagent("research", PlanNode::agent(AgentKind::Claude, "gather facts")),
        PlanNode::phase("write", vec![PlanNode::agent(AgentKind::Claude, "write summary")])
            .with_condition(Predicate::state_exists("research")),
    ]);

    let report = engine.run(&plan, "subagent", None).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Succeeded);
    assert_eq!(report.invocations, 2);

    let cell = log
        .state_get(&report.execution_id, "research")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cell["status"], json!("succeeded"));
    assert_eq!(cell["output"], json!("the facts"));
}

#[tokio::test]
async fn failed_dispatch_with_handler_continues() {
    let runner = MockRunner::new()
        .script_prompt("flaky", MockResponse::failing("exploded"))
        .script_prompt("recover", MockResponse::text("recovered"));
    let (engine, log) = engine_with(runner).await;

    let plan = PlanNode::orchestration(vec![
        PlanNode::agent(AgentKind::Claude, "flaky").on_error(Arc::new(|error, writer| {
            writer.set("failure", json!(error.to_string()));
        })),
        PlanNode::agent(AgentKind::Claude, "recover")
            .with_condition(Predicate::state_exists("failure")),
    ]);

    let report = engine.run(&plan, "recovery", None).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Succeeded);

    let invocations = log.list_invocations(&report.execution_id).await.unwrap();
    assert_eq!(invocations.len(), 2);
    assert_eq!(invocations[0].status.as_str(), "failed");
    assert_eq!(invocations[1].output.as_deref(), Some("recovered"));
}

#[tokio::test]
async fn unhandled_failure_fails_the_execution() {
    let runner = MockRunner::new().script_kind("claude", MockResponse::failing("exploded"));
    let (engine, _log) = engine_with(runner).await;

    let plan = PlanNode::agent(AgentKind::Claude, "doomed");
    let report = engine.run(&plan, "doomed", None).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn effects_run_through_registered_handlers() {
    let runner = MockRunner::new().script_kind("claude", MockResponse::text("coded"));
    let log = Arc::new(ExecutionLog::in_memory().await.unwrap());

    let committed: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = Arc::clone(&committed);
    let mut effects = conductor_core::EffectRegistry::new();
    effects.register("commit", move |spec, _ctx| {
        let seen = Arc::clone(&seen);
        Box::pin(async move {
            let message = spec.args["message"].as_str().unwrap_or("").to_string();
            seen.lock().unwrap().push(message);
            Ok(json!("deadbeef"))
        })
    });

    let engine = Engine::new(Arc::clone(&log), Arc::new(runner)).with_effects(effects);
    let plan = PlanNode::orchestration(vec![
        PlanNode::agent(AgentKind::Claude, "write code"),
        PlanNode::commit("checkpoint work"),
    ]);

    let report = engine.run(&plan, "commits", None).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Succeeded);
    assert_eq!(*committed.lock().unwrap(), vec!["checkpoint work".to_string()]);

    let frames = log.list_frames(&report.execution_id).await.unwrap();
    assert!(frames.last().unwrap().document.contains(r#"<commit"#));
    assert!(frames.last().unwrap().document.contains(r#"status="succeeded""#));
}

#[tokio::test]
async fn unregistered_effect_fails_the_run() {
    let runner = MockRunner::new();
    let (engine, _log) = engine_with(runner).await;

    let plan = PlanNode::orchestration(vec![PlanNode::commit("nobody home")]);
    let report = engine.run(&plan, "no-handler", None).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Failed);
    assert!(report.error.unwrap().contains("effect.unregistered"));
}

#[tokio::test]
async fn cancellation_seals_cancelled() {
    let runner = MockRunner::new().script_kind(
        "claude",
        MockResponse::text("slow").with_delay(Duration::from_millis(500)),
    );
    let (engine, log) = engine_with(runner).await;
    let cancel = engine.cancel_token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let plan = PlanNode::agent(AgentKind::Claude, "take your time");
    let report = engine.run(&plan, "cancelled", None).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Cancelled);

    let row = log.require_execution(&report.execution_id).await.unwrap();
    assert_eq!(row.status.as_str(), "cancelled");
}

#[tokio::test]
async fn global_stop_condition_ends_the_run() {
    let runner = MockRunner::new().with_default_output("ALL_DONE marker");
    let (engine, _log) = engine_with(runner).await;
    let engine = engine.with_config(EngineConfig {
        global_stop: vec![conductor_core::StopCondition::output_matches("ALL_DONE").unwrap()],
        ..EngineConfig::default()
    });

    // An endless loop of work; only the global stop ends it.
    let plan = PlanNode::orchestration(vec![PlanNode::loop_times(
        50,
        vec![PlanNode::agent(AgentKind::Claude, "grind")],
    )]);

    let report = engine.run(&plan, "global-stop", None).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Succeeded);
    assert_eq!(report.result.unwrap()["stopped_by"], json!("output-matches /ALL_DONE/"));
}

#[tokio::test]
async fn replayed_frames_and_events_match_the_run() {
    let runner = MockRunner::new().script_kind(
        "claude",
        MockResponse::text("traced").with_events(vec![
            StreamEvent::text_delta("tra"),
            StreamEvent::text_delta("ced"),
            StreamEvent::token_usage(3, 5),
        ]),
    );
    let (engine, log) = engine_with(runner).await;

    let plan = PlanNode::agent(AgentKind::Claude, "trace me");
    let report = engine.run(&plan, "replay", None).await.unwrap();

    // Frame indices dense from 0.
    let frames = log.list_frames(&report.execution_id).await.unwrap();
    let indices: Vec<i64> = frames.iter().map(|f| f.frame_index).collect();
    assert_eq!(indices, (0..frames.len() as i64).collect::<Vec<_>>());

    // Event sequences dense from 0, kinds preserved in arrival order.
    let invocations = log.list_invocations(&report.execution_id).await.unwrap();
    let events = log.list_events(&invocations[0].id).await.unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds, vec!["text-delta", "text-delta", "token-usage"]);
    let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2]);

    // Token counters landed on the invocation row.
    assert_eq!(invocations[0].input_tokens, 3);
    assert_eq!(invocations[0].output_tokens, 5);
}
