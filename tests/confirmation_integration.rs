// ABOUTME: Integration tests for the confirmation flow over the message bus.
// ABOUTME: Coordinator, policy listener, and engine wired together end to end.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use toolgate::bus::{BusMessage, MessageBus, MessageKind};
use toolgate::checker::CheckerRegistry;
use toolgate::confirm::{
    ConfirmationCoordinator, ConfirmationOutcome, ConfirmationState, PolicyListener, UserDecision,
};
use toolgate::policy::{
    Decision, EngineOptions, PolicyEngine, PolicyLoadResult, PolicyRule, ToolCallRequest,
    ToolMatcher,
};

fn engine(rules: Vec<PolicyRule>) -> Arc<PolicyEngine> {
    let load = PolicyLoadResult { rules, ..Default::default() };
    Arc::new(PolicyEngine::new(
        load,
        CheckerRegistry::with_builtins(),
        EngineOptions::default(),
    ))
}

fn rule(tool: &str, decision: Decision) -> PolicyRule {
    PolicyRule::new(ToolMatcher::Exact(tool.into()), decision)
}

/// Full flow: an allow rule resolves the coordinator to Allowed without
/// any human involvement — request out, policy check, response back.
#[tokio::test]
async fn allow_rule_confirms_automatically() {
    let bus = Arc::new(MessageBus::new());
    let _listener = PolicyListener::attach(bus.clone(), engine(vec![rule("read_file", Decision::Allow)]));

    let mut coordinator = ConfirmationCoordinator::new(Some(bus));
    let call = ToolCallRequest::new("read_file", serde_json::json!({ "path": "src/lib.rs" }));
    let outcome = coordinator.confirm(&call, &CancellationToken::new()).await;
    assert_eq!(outcome, ConfirmationOutcome::Allowed);
    assert_eq!(coordinator.state(), ConfirmationState::Allowed);
}

/// Full flow: a deny rule resolves to Denied and the reason survives the
/// round trip.
#[tokio::test]
async fn deny_rule_confirms_denied() {
    let bus = Arc::new(MessageBus::new());
    let _listener = PolicyListener::attach(bus.clone(), engine(vec![rule("bash", Decision::Deny)]));

    let mut coordinator = ConfirmationCoordinator::new(Some(bus));
    let call = ToolCallRequest::new("bash", serde_json::json!({ "command": "ls" }));
    match coordinator.confirm(&call, &CancellationToken::new()).await {
        ConfirmationOutcome::Denied { reason } => assert!(reason.contains("bash")),
        other => panic!("expected Denied, got {other:?}"),
    }
}

/// Full flow for "always allow": the first call needs the user; the
/// user's AllowAlways publishes update-policy, the listener grants a
/// runtime rule, and a second call for the same tool confirms
/// automatically.
#[tokio::test]
async fn allow_always_grants_future_calls() {
    let bus = Arc::new(MessageBus::new());
    let eng = engine(Vec::new());
    let _listener = PolicyListener::attach(bus.clone(), eng.clone());

    let call = ToolCallRequest::new("web_fetch", serde_json::json!({ "url": "http://x" }));
    let mut coordinator = ConfirmationCoordinator::new(Some(bus.clone()));
    let outcome = coordinator.confirm(&call, &CancellationToken::new()).await;
    assert!(matches!(outcome, ConfirmationOutcome::AskUser { .. }));

    // The user answers the prompt with "proceed always".
    let outcome = coordinator.apply_user_decision(&call, UserDecision::AllowAlways);
    assert_eq!(outcome, ConfirmationOutcome::Allowed);

    // A fresh invocation of the same tool now confirms without asking.
    let again = ToolCallRequest::new("web_fetch", serde_json::json!({ "url": "http://y" }));
    let mut coordinator = ConfirmationCoordinator::new(Some(bus));
    let outcome = coordinator.confirm(&again, &CancellationToken::new()).await;
    assert_eq!(outcome, ConfirmationOutcome::Allowed);
}

/// No decision side at all: the pending confirmation times out and
/// resolves to AskUser, never to Denied or Allowed.
#[tokio::test]
async fn unanswered_request_times_out_to_ask_user() {
    let bus = Arc::new(MessageBus::new());
    let mut coordinator =
        ConfirmationCoordinator::new(Some(bus)).with_timeout(Duration::from_millis(50));

    let call = ToolCallRequest::new("bash", serde_json::json!({ "command": "make" }));
    let outcome = coordinator.confirm(&call, &CancellationToken::new()).await;
    assert!(matches!(outcome, ConfirmationOutcome::AskUser { .. }));
    assert_eq!(coordinator.state(), ConfirmationState::AskUser);
}

/// Response, timeout, and cancellation racing in quick succession
/// resolve the pending confirmation exactly once: the response lands
/// first here, and the cancellation that follows changes nothing.
#[tokio::test]
async fn resolution_happens_exactly_once() {
    let bus = Arc::new(MessageBus::new());
    let _listener = PolicyListener::attach(bus.clone(), engine(vec![rule("bash", Decision::Allow)]));

    let cancel = CancellationToken::new();
    let mut coordinator =
        ConfirmationCoordinator::new(Some(bus.clone())).with_timeout(Duration::from_millis(200));

    let call = ToolCallRequest::new("bash", serde_json::json!({ "command": "ls" }));
    let outcome = coordinator.confirm(&call, &cancel).await;
    assert_eq!(outcome, ConfirmationOutcome::Allowed);

    // Late completers are inert: cancelling after resolution neither
    // panics nor rewrites the outcome, and no subscription leaks.
    cancel.cancel();
    assert_eq!(coordinator.state(), ConfirmationState::Allowed);
    assert_eq!(bus.subscriber_count(MessageKind::ConfirmationResponse), 0);
}

/// Cancellation racing an answerless request resolves to Denied with the
/// Expired state, and the pending entry is cleaned up.
#[tokio::test]
async fn cancellation_denies_pending_confirmation() {
    let bus = Arc::new(MessageBus::new());
    let mut coordinator = ConfirmationCoordinator::new(Some(bus.clone()));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let call = ToolCallRequest::new("bash", serde_json::json!({ "command": "ls" }));
    let outcome = coordinator.confirm(&call, &cancel).await;
    assert_eq!(outcome, ConfirmationOutcome::Denied { reason: "cancelled".into() });
    assert_eq!(coordinator.state(), ConfirmationState::Expired);
    assert_eq!(bus.subscriber_count(MessageKind::ConfirmationResponse), 0);
}

/// Two invocations pending at once resolve independently: each response
/// lands on its own correlation id, whatever the order.
#[tokio::test]
async fn concurrent_confirmations_stay_correlated() {
    let bus = Arc::new(MessageBus::new());
    let _listener = PolicyListener::attach(
        bus.clone(),
        engine(vec![
            rule("read_file", Decision::Allow),
            rule("bash", Decision::Deny),
        ]),
    );

    let bus_a = bus.clone();
    let a = tokio::spawn(async move {
        let call = ToolCallRequest::new("read_file", serde_json::json!({ "path": "x" }));
        ConfirmationCoordinator::new(Some(bus_a))
            .confirm(&call, &CancellationToken::new())
            .await
    });
    let bus_b = bus.clone();
    let b = tokio::spawn(async move {
        let call = ToolCallRequest::new("bash", serde_json::json!({ "command": "ls" }));
        ConfirmationCoordinator::new(Some(bus_b))
            .confirm(&call, &CancellationToken::new())
            .await
    });

    assert_eq!(a.await.unwrap(), ConfirmationOutcome::Allowed);
    assert!(matches!(b.await.unwrap(), ConfirmationOutcome::Denied { .. }));
}

/// A checker-gated allow flows through the bus: the listener runs the
/// checker during its policy check and the downgrade arrives as an
/// ask-user response.
#[tokio::test]
async fn checker_downgrade_reaches_coordinator() {
    let mut gated = rule("bash", Decision::Allow);
    gated.checker = Some("safe-command".into());

    let bus = Arc::new(MessageBus::new());
    let _listener = PolicyListener::attach(bus.clone(), engine(vec![gated]));

    let mut coordinator = ConfirmationCoordinator::new(Some(bus));
    let call = ToolCallRequest::new("bash", serde_json::json!({ "command": "rm -rf /tmp/x" }));
    match coordinator.confirm(&call, &CancellationToken::new()).await {
        ConfirmationOutcome::AskUser { reason } => {
            assert!(reason.unwrap().contains("safe list"));
        }
        other => panic!("expected AskUser, got {other:?}"),
    }
}

/// Execution reports flow to observers after a confirmed run.
#[tokio::test]
async fn execution_reports_are_published() {
    let bus = Arc::new(MessageBus::new());
    let outcomes = Arc::new(std::sync::Mutex::new(Vec::new()));

    let sink = outcomes.clone();
    bus.subscribe(MessageKind::ExecutionSuccess, move |msg| {
        if let BusMessage::ExecutionSuccess(report) = msg {
            sink.lock().unwrap().push(("ok", report.tool_name.clone()));
        }
        Ok(())
    });
    let sink = outcomes.clone();
    bus.subscribe(MessageKind::ExecutionFailure, move |msg| {
        if let BusMessage::ExecutionFailure(report) = msg {
            sink.lock().unwrap().push(("err", report.tool_name.clone()));
        }
        Ok(())
    });

    let coordinator = ConfirmationCoordinator::new(Some(bus));
    let call = ToolCallRequest::new("bash", serde_json::json!({ "command": "ls" }));
    coordinator.report_success(&call);
    coordinator.report_failure(&call, "exit status 1");

    let seen = outcomes.lock().unwrap();
    assert_eq!(*seen, vec![("ok", "bash".to_string()), ("err", "bash".to_string())]);
}
