// ABOUTME: Confirmation coordinator — one correlated request/response round trip per tool call.
// ABOUTME: Races response, timeout, and cancellation; exactly one of them resolves the wait.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::{
    BusMessage, ConfirmationRequest, ConfirmationResponse, ExecutionReport, MessageBus,
    MessageKind, PolicyUpdate,
};
use crate::policy::types::{Decision, ToolCallRequest};

/// How long a pending confirmation waits for its response before falling
/// back to asking the user.
pub const DEFAULT_CONFIRMATION_TIMEOUT_MS: u64 = 30_000;

/// Lifecycle of one confirmation round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationState {
    NotRequested,
    PendingDecision,
    Allowed,
    Denied,
    AskUser,
    /// The call was cancelled while the decision was pending.
    Expired,
}

/// What the invocation layer should do with the tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationOutcome {
    /// Run the tool.
    Allowed,
    /// Refuse, returning the reason to the model.
    Denied { reason: String },
    /// Prompt the user interactively before running.
    AskUser { reason: Option<String> },
    /// No bus is configured; the tool keeps its own built-in
    /// confirmation behavior.
    Bypassed,
}

/// The user's answer to an interactive confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDecision {
    /// Allow this one invocation.
    AllowOnce,
    /// Allow and grant a standing runtime rule for this tool signature.
    AllowAlways,
    /// Refuse this invocation.
    Deny,
}

/// Orchestrates the confirmation round trip for a single tool invocation:
/// publish the request, wait for the correlated response, and resolve
/// exactly once against the timeout and the call's cancellation signal.
pub struct ConfirmationCoordinator {
    bus: Option<Arc<MessageBus>>,
    timeout: Duration,
    state: ConfirmationState,
}

impl ConfirmationCoordinator {
    /// Create a coordinator. Passing no bus opts this invocation out of
    /// the policy system entirely.
    pub fn new(bus: Option<Arc<MessageBus>>) -> Self {
        Self {
            bus,
            timeout: Duration::from_millis(DEFAULT_CONFIRMATION_TIMEOUT_MS),
            state: ConfirmationState::NotRequested,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> ConfirmationState {
        self.state
    }

    /// Run the confirmation round trip for this call. Exactly one of
    /// {response, timeout, cancellation} resolves the wait; after the
    /// first fires, the pending slot is emptied and the subscription
    /// removed, so the other two are inert.
    pub async fn confirm(
        &mut self,
        call: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> ConfirmationOutcome {
        let Some(bus) = self.bus.clone() else {
            return ConfirmationOutcome::Bypassed;
        };

        let (tx, rx) = oneshot::channel::<ConfirmationResponse>();
        let pending: Arc<Mutex<Option<oneshot::Sender<ConfirmationResponse>>>> =
            Arc::new(Mutex::new(Some(tx)));

        let correlation_id = call.correlation_id;
        let slot = pending.clone();
        let subscription = bus.subscribe(MessageKind::ConfirmationResponse, move |msg| {
            let BusMessage::ConfirmationResponse(response) = msg else {
                return Ok(());
            };
            // A response for another call, or a late response for one
            // already resolved, has no observable effect.
            if response.correlation_id != correlation_id {
                return Ok(());
            }
            if let Some(tx) = slot.lock().expect("pending confirmation lock poisoned").take() {
                let _ = tx.send(response.clone());
            }
            Ok(())
        });

        self.state = ConfirmationState::PendingDecision;
        bus.publish(&BusMessage::ConfirmationRequest(ConfirmationRequest {
            call: call.clone(),
            cancel: cancel.clone(),
        }));

        let outcome = tokio::select! {
            response = rx => match response {
                Ok(response) => self.resolve_response(response),
                // The sender vanished without answering; treat as deny.
                Err(_) => {
                    self.state = ConfirmationState::Denied;
                    ConfirmationOutcome::Denied { reason: "confirmation channel closed".into() }
                }
            },
            _ = tokio::time::sleep(self.timeout) => {
                // Never silently run an unapproved tool: an unanswered
                // request falls back to asking, not denying.
                debug!(tool = %call.tool_name, "confirmation timed out; asking user");
                self.state = ConfirmationState::AskUser;
                ConfirmationOutcome::AskUser {
                    reason: Some("no confirmation decision arrived in time".into()),
                }
            },
            _ = cancel.cancelled() => {
                self.state = ConfirmationState::Expired;
                ConfirmationOutcome::Denied { reason: "cancelled".into() }
            },
        };

        // Make the losing completers harmless before returning.
        pending
            .lock()
            .expect("pending confirmation lock poisoned")
            .take();
        bus.unsubscribe(subscription);

        outcome
    }

    fn resolve_response(&mut self, response: ConfirmationResponse) -> ConfirmationOutcome {
        if response.requires_user_confirmation {
            self.state = ConfirmationState::AskUser;
            ConfirmationOutcome::AskUser { reason: response.reason }
        } else if response.confirmed {
            self.state = ConfirmationState::Allowed;
            ConfirmationOutcome::Allowed
        } else {
            self.state = ConfirmationState::Denied;
            ConfirmationOutcome::Denied {
                reason: response.reason.unwrap_or_else(|| "denied by policy".into()),
            }
        }
    }

    /// Map the interactive prompt's answer back onto the confirmation.
    /// AllowAlways additionally publishes an update-policy message for
    /// this exact tool signature.
    pub fn apply_user_decision(
        &mut self,
        call: &ToolCallRequest,
        decision: UserDecision,
    ) -> ConfirmationOutcome {
        match decision {
            UserDecision::AllowOnce => {
                self.state = ConfirmationState::Allowed;
                ConfirmationOutcome::Allowed
            }
            UserDecision::AllowAlways => {
                if let Some(bus) = &self.bus {
                    bus.publish(&BusMessage::UpdatePolicy(PolicyUpdate {
                        tool_name: call.tool_name.clone(),
                        command_prefix: call
                            .args
                            .get("command")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        server: call.server.clone(),
                        decision: Decision::Allow,
                    }));
                }
                self.state = ConfirmationState::Allowed;
                ConfirmationOutcome::Allowed
            }
            UserDecision::Deny => {
                self.state = ConfirmationState::Denied;
                ConfirmationOutcome::Denied { reason: "denied by user".into() }
            }
        }
    }

    /// Report that the confirmed tool ran to completion.
    pub fn report_success(&self, call: &ToolCallRequest) {
        if let Some(bus) = &self.bus {
            bus.publish(&BusMessage::ExecutionSuccess(ExecutionReport {
                correlation_id: call.correlation_id,
                tool_name: call.tool_name.clone(),
                detail: None,
            }));
        }
    }

    /// Report that the confirmed tool failed while running.
    pub fn report_failure(&self, call: &ToolCallRequest, error: impl Into<String>) {
        if let Some(bus) = &self.bus {
            bus.publish(&BusMessage::ExecutionFailure(ExecutionReport {
                correlation_id: call.correlation_id,
                tool_name: call.tool_name.clone(),
                detail: Some(error.into()),
            }));
        }
    }
}
