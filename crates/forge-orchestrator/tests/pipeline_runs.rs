use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use forge_core::{EventBus, VirtualProject};
use forge_orchestrator::prompts::NO_ISSUES_SENTINEL;
use forge_orchestrator::testing::{failure, reply, ScriptedInvoker};
use forge_orchestrator::{
    ChatSession, OrchestratorError, PhaseCount, PipelineConfig, PipelineOrchestrator,
    RateWindows, Scheduler, SchedulerConfig, SubmitOutcome,
};
use forge_providers::ModelInvoker;
use forge_types::{
    ChatMessage, FileOperation, ModelCallRequest, ModelSpec, PhaseStatus, PipelineEvent, Role,
    RunOutcome,
};

const FINAL_RESPONSE: &str = "Added a greeting file.\n\n--- COMMANDS ---\nwrite hello.txt <<<EOF\nhello\nEOF\n--- END COMMANDS ---";

fn config(phases: u32) -> PipelineConfig {
    let model = |role: &str| ModelSpec::new("test", role);
    PipelineConfig {
        phase_count: PhaseCount::new(phases).unwrap(),
        replicas: 3,
        planner: model("planner"),
        consolidator: model("consolidator"),
        drafter: model("drafter"),
        debugger: model("debugger"),
        reviewer: model("reviewer"),
        finalizer: model("finalizer"),
    }
}

fn last_user_text(request: &ModelCallRequest) -> String {
    request
        .turns
        .last()
        .map(|turn| turn.text_content())
        .unwrap_or_default()
}

/// Planner, consolidator and finalizer answer; cycle roles are added per test.
fn base_invoker() -> ScriptedInvoker {
    ScriptedInvoker::new()
        .route("test/planner", |_| reply("1. create hello.txt"))
        .route("test/consolidator", |_| reply("master plan"))
        .route("test/finalizer", |_| reply(FINAL_RESPONSE))
}

fn orchestrator(invoker: Arc<ScriptedInvoker>, phases: u32) -> PipelineOrchestrator {
    PipelineOrchestrator::new(
        invoker as Arc<dyn ModelInvoker>,
        Scheduler::new(RateWindows::new(), SchedulerConfig::default()),
        config(phases),
        EventBus::new(),
    )
}

fn status_of(orchestrator: &PipelineOrchestrator, id: &str) -> Option<PhaseStatus> {
    orchestrator.state().phase(id).map(|p| p.status)
}

#[tokio::test]
async fn three_phase_run_plans_consolidates_and_finalizes() {
    let invoker = Arc::new(base_invoker());
    let orchestrator = orchestrator(invoker.clone(), 3);
    let mut events = orchestrator.subscribe_events();

    let outcome = orchestrator
        .run("say hello", &[], "", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.parsed.summary, "Added a greeting file.");
    assert_eq!(
        outcome.parsed.operations,
        vec![FileOperation::write("hello.txt", "hello")]
    );
    assert_eq!(outcome.context.master_plan, "master plan");
    assert_eq!(outcome.context.final_draft, None);
    assert_eq!(invoker.call_count("test/planner"), 3);
    assert_eq!(invoker.call_count("test/consolidator"), 1);
    assert_eq!(invoker.call_count("test/finalizer"), 1);
    assert!(outcome
        .state
        .phases
        .iter()
        .all(|p| p.status == PhaseStatus::Completed));
    assert_eq!(
        outcome.state.phase("planning").map(|p| p.sub_results.len()),
        Some(3)
    );

    let mut streamed = String::new();
    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        match event {
            PipelineEvent::OutputDelta { phase_id, delta, .. } if phase_id == "final" => {
                streamed.push_str(&delta)
            }
            PipelineEvent::Finished { outcome, .. } => finished = Some(outcome),
            _ => {}
        }
    }
    assert_eq!(streamed, FINAL_RESPONSE);
    assert_eq!(finished, Some(RunOutcome::Completed));
}

#[tokio::test]
async fn clean_debug_pass_skips_the_remaining_cycles() {
    let invoker = Arc::new(
        base_invoker()
            .route("test/drafter", |_| reply("draft v1"))
            .route("test/debugger", |_| reply(NO_ISSUES_SENTINEL)),
    );
    let orchestrator = orchestrator(invoker.clone(), 9);

    let outcome = orchestrator
        .run("say hello", &[], "", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.context.final_draft.as_deref(), Some("draft v1"));
    assert_eq!(outcome.context.final_review, None);
    assert_eq!(invoker.call_count("test/drafter"), 1);
    assert_eq!(invoker.call_count("test/debugger"), 3);
    assert_eq!(invoker.call_count("test/reviewer"), 0);

    assert_eq!(status_of(&orchestrator, "debug-1"), Some(PhaseStatus::Completed));
    for id in ["review-1", "draft-2", "debug-2", "review-2", "draft-3", "debug-3", "review-3"] {
        assert_eq!(status_of(&orchestrator, id), Some(PhaseStatus::Skipped), "{id}");
    }
    assert_eq!(status_of(&orchestrator, "final"), Some(PhaseStatus::Completed));
}

#[tokio::test]
async fn feedback_feeds_review_and_the_next_draft() {
    let debug_calls = Arc::new(AtomicUsize::new(0));
    let counter = debug_calls.clone();
    let invoker = Arc::new(
        base_invoker()
            .route("test/drafter", |request| {
                if last_user_text(request).contains("Review of the previous draft") {
                    reply("draft v2")
                } else {
                    reply("draft v1")
                }
            })
            .route("test/debugger", move |_| {
                // first cycle: one replica finds a bug; second cycle: all clean
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => reply("off-by-one in loop"),
                    1 | 2 => reply(NO_ISSUES_SENTINEL),
                    _ => reply(format!("Looks right.\n\n{NO_ISSUES_SENTINEL}")),
                }
            })
            .route("test/reviewer", |request| {
                let text = last_user_text(request);
                assert!(text.contains("off-by-one in loop"));
                assert!(!text.contains(NO_ISSUES_SENTINEL));
                reply("fix the loop bound")
            }),
    );
    let orchestrator = orchestrator(invoker.clone(), 9);

    let outcome = orchestrator
        .run("say hello", &[], "", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(invoker.call_count("test/drafter"), 2);
    assert_eq!(invoker.call_count("test/reviewer"), 1);
    assert_eq!(debug_calls.load(Ordering::SeqCst), 6);
    assert_eq!(outcome.context.final_draft.as_deref(), Some("draft v2"));
    assert_eq!(outcome.context.final_review, None);
    assert_eq!(status_of(&orchestrator, "review-1"), Some(PhaseStatus::Completed));
    assert_eq!(status_of(&orchestrator, "review-2"), Some(PhaseStatus::Skipped));
    assert_eq!(status_of(&orchestrator, "draft-3"), Some(PhaseStatus::Skipped));
}

#[tokio::test]
async fn mentioning_the_sentinel_is_still_feedback() {
    let invoker = Arc::new(
        base_invoker()
            .route("test/drafter", |_| reply("draft v1"))
            .route("test/debugger", |_| {
                reply(format!("I can't say {NO_ISSUES_SENTINEL}: the loop is off by one."))
            })
            .route("test/reviewer", |_| reply("fix the loop bound")),
    );
    let orchestrator = orchestrator(invoker.clone(), 6);

    let outcome = orchestrator
        .run("say hello", &[], "", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(invoker.call_count("test/reviewer"), 1);
    assert_eq!(status_of(&orchestrator, "review-1"), Some(PhaseStatus::Completed));
    assert_eq!(outcome.context.final_review.as_deref(), Some("fix the loop bound"));
}

#[tokio::test]
async fn final_review_reaches_the_final_prompt() {
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .route("test/planner", |_| reply("plan"))
            .route("test/consolidator", |_| reply("master plan"))
            .route("test/drafter", |_| reply("draft v1"))
            .route("test/debugger", |_| reply("missing error handling"))
            .route("test/reviewer", |_| reply("add error handling"))
            .route("test/finalizer", |request| {
                let text = last_user_text(request);
                assert!(text.contains("draft v1"));
                assert!(text.contains("add error handling"));
                reply("Applied review.")
            }),
    );
    let orchestrator = orchestrator(invoker, 6);

    let outcome = orchestrator
        .run("say hello", &[], "", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.context.final_review.as_deref(), Some("add error handling"));
    assert_eq!(outcome.parsed.summary, "Applied review.");
    assert!(outcome.parsed.operations.is_empty());
}

#[tokio::test]
async fn planning_tolerates_partial_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let invoker = Arc::new(
        base_invoker().route("test/planner", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                failure("connection reset")
            } else {
                reply("the only plan")
            }
        }),
    );
    let orchestrator = orchestrator(invoker, 3);

    let outcome = orchestrator
        .run("say hello", &[], "", &CancellationToken::new())
        .await
        .unwrap();

    let planning = outcome.state.phase("planning").cloned().unwrap();
    assert_eq!(planning.status, PhaseStatus::Completed);
    assert_eq!(
        planning.sub_results.iter().filter(|s| s.error.is_some()).count(),
        2
    );
}

#[tokio::test]
async fn all_planners_failing_marks_the_phase_and_stops() {
    let invoker = Arc::new(base_invoker().route("test/planner", |_| failure("boom")));
    let orchestrator = orchestrator(invoker.clone(), 6);
    let mut events = orchestrator.subscribe_events();

    let err = orchestrator
        .run("say hello", &[], "", &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        OrchestratorError::PhaseFailed { phase, message } => {
            assert_eq!(phase, "planning");
            assert!(message.contains("boom"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(status_of(&orchestrator, "planning"), Some(PhaseStatus::Error));
    assert_eq!(status_of(&orchestrator, "consolidation"), Some(PhaseStatus::Pending));
    assert_eq!(invoker.call_count("test/consolidator"), 0);

    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::Finished { outcome, .. } = event {
            finished = Some(outcome);
        }
    }
    assert!(matches!(finished, Some(RunOutcome::Failed { .. })));
}

#[tokio::test]
async fn retry_final_replays_only_the_final_phase() {
    let final_turns: Arc<Mutex<Vec<Vec<ChatMessage>>>> = Arc::default();
    let seen = final_turns.clone();
    let invoker = Arc::new(base_invoker().route("test/finalizer", move |request| {
        seen.lock().unwrap().push(request.turns.clone());
        reply(FINAL_RESPONSE)
    }));
    let orchestrator = orchestrator(invoker.clone(), 3);
    let cancel = CancellationToken::new();
    let history = vec![
        ChatMessage::user("make a greeting"),
        ChatMessage::assistant("Which file?"),
    ];

    let first = orchestrator.run("say hello", &history, "", &cancel).await.unwrap();
    let context = orchestrator.last_final_context().unwrap();
    assert_eq!(context, first.context);
    assert_eq!(context.history, history);

    let retried = orchestrator.retry_final(context, &cancel).await.unwrap();

    let final_turns = final_turns.lock().unwrap().clone();
    assert_eq!(final_turns.len(), 2);
    assert_eq!(final_turns[0].len(), 3);
    assert_eq!(final_turns[0], final_turns[1]);

    assert_ne!(retried.run_id, first.run_id);
    assert_eq!(retried.parsed, first.parsed);
    assert_eq!(invoker.call_count("test/planner"), 3);
    assert_eq!(invoker.call_count("test/consolidator"), 1);
    assert_eq!(invoker.call_count("test/finalizer"), 2);
    assert!(retried
        .state
        .phases
        .iter()
        .all(|p| p.status == PhaseStatus::Completed));
    assert_eq!(
        retried.state.phase("consolidation").and_then(|p| p.output.as_deref()),
        Some("master plan")
    );
}

#[tokio::test]
async fn retry_after_an_early_exit_keeps_skipped_phases() {
    let invoker = Arc::new(
        base_invoker()
            .route("test/drafter", |_| reply("draft v1"))
            .route("test/debugger", |_| reply(NO_ISSUES_SENTINEL)),
    );
    let orchestrator = orchestrator(invoker.clone(), 9);
    let cancel = CancellationToken::new();

    let first = orchestrator.run("say hello", &[], "", &cancel).await.unwrap();
    let retried = orchestrator.retry_final(first.context, &cancel).await.unwrap();

    assert_eq!(invoker.call_count("test/drafter"), 1);
    assert_eq!(invoker.call_count("test/finalizer"), 2);
    for id in ["review-1", "draft-2", "debug-2", "review-2", "draft-3", "debug-3", "review-3"] {
        assert_eq!(
            retried.state.phase(id).map(|p| p.status),
            Some(PhaseStatus::Skipped),
            "{id}"
        );
    }
    assert_eq!(
        retried.state.phase("draft-1").and_then(|p| p.output.as_deref()),
        Some("draft v1")
    );
    assert_eq!(retried.state.phase("draft-3").and_then(|p| p.output.as_deref()), None);
    assert_eq!(
        retried.state.phase("final").map(|p| p.status),
        Some(PhaseStatus::Completed)
    );
}

#[tokio::test]
async fn session_applies_operations_and_records_a_tool_turn() {
    let invoker = Arc::new(base_invoker());
    let project = Arc::new(VirtualProject::with_files([("README.md", "# demo")]));
    let mut session = ChatSession::new(Arc::new(orchestrator(invoker, 3)), project.clone());

    let outcome = session.submit("say hello", &CancellationToken::new()).await;

    match outcome {
        SubmitOutcome::Completed { summary, results } => {
            assert_eq!(summary, "Added a greeting file.");
            assert_eq!(results.len(), 1);
            assert!(results[0].is_ok());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(project.read("hello.txt").as_deref(), Some("hello"));

    let turns = session.turns();
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[1].text_content(), "Added a greeting file.");
    assert_eq!(turns[2].role, Role::Tool);
    assert!(turns[2].text_content().contains("write hello.txt"));
}

#[tokio::test]
async fn session_shows_errors_and_drops_cancelled_placeholders() {
    let failing = Arc::new(base_invoker().route("test/consolidator", |_| failure("overloaded")));
    let mut session = ChatSession::new(
        Arc::new(orchestrator(failing, 3)),
        Arc::new(VirtualProject::new()),
    );

    let outcome = session.submit("first", &CancellationToken::new()).await;
    assert!(matches!(outcome, SubmitOutcome::Failed { .. }));
    assert_eq!(session.turns().len(), 2);
    assert!(session.turns()[1].text_content().starts_with("Error: "));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = session.submit("second", &cancel).await;
    assert_eq!(outcome, SubmitOutcome::Cancelled);
    assert_eq!(session.turns().len(), 3);
    assert_eq!(session.turns()[2].text_content(), "second");
}

#[tokio::test]
async fn session_retry_without_a_previous_run_fails_cleanly() {
    let mut session = ChatSession::new(
        Arc::new(orchestrator(Arc::new(base_invoker()), 3)),
        Arc::new(VirtualProject::new()),
    );
    let outcome = session.retry_final(&CancellationToken::new()).await;
    assert_eq!(
        outcome,
        SubmitOutcome::Failed {
            message: OrchestratorError::NothingToRetry.to_string()
        }
    );
    assert!(session.turns().is_empty());
}
