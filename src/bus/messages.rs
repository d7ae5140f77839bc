// ABOUTME: Message envelope types for the bus — confirmation protocol and execution reports.
// ABOUTME: Each variant maps to a MessageKind used for typed subscription.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::policy::types::{Decision, ToolCallRequest};

/// Discriminant used to subscribe to one message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ConfirmationRequest,
    ConfirmationResponse,
    PolicyRejection,
    ExecutionSuccess,
    ExecutionFailure,
    UpdatePolicy,
}

/// A tool invocation asking to be confirmed. The cancellation token is
/// the call's own; a decision-side checker inherits it so cancelling the
/// call kills any verification still running for it.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub call: ToolCallRequest,
    pub cancel: CancellationToken,
}

/// The single expected answer to a confirmation request, correlated by id.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationResponse {
    pub correlation_id: Uuid,
    pub confirmed: bool,
    /// The policy could not decide alone; an interactive prompt must.
    pub requires_user_confirmation: bool,
    pub reason: Option<String>,
}

impl ConfirmationResponse {
    pub fn allowed(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            confirmed: true,
            requires_user_confirmation: false,
            reason: None,
        }
    }

    pub fn denied(correlation_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            correlation_id,
            confirmed: false,
            requires_user_confirmation: false,
            reason: Some(reason.into()),
        }
    }

    pub fn ask_user(correlation_id: Uuid, reason: Option<String>) -> Self {
        Self {
            correlation_id,
            confirmed: false,
            requires_user_confirmation: true,
            reason,
        }
    }
}

/// Published alongside a denying response so observers can surface why a
/// tool call never ran.
#[derive(Debug, Clone)]
pub struct PolicyRejection {
    pub correlation_id: Uuid,
    pub tool_name: String,
    pub reason: String,
}

/// Outcome report for a tool call that was confirmed and executed.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub correlation_id: Uuid,
    pub tool_name: String,
    pub detail: Option<String>,
}

/// Appends one runtime rule for an exact tool signature, published when
/// the user chooses "always allow".
#[derive(Debug, Clone)]
pub struct PolicyUpdate {
    pub tool_name: String,
    pub command_prefix: Option<String>,
    pub server: Option<String>,
    pub decision: Decision,
}

/// The discriminated envelope carried by the bus.
#[derive(Debug, Clone)]
pub enum BusMessage {
    ConfirmationRequest(ConfirmationRequest),
    ConfirmationResponse(ConfirmationResponse),
    PolicyRejection(PolicyRejection),
    ExecutionSuccess(ExecutionReport),
    ExecutionFailure(ExecutionReport),
    UpdatePolicy(PolicyUpdate),
}

impl BusMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ConfirmationRequest(_) => MessageKind::ConfirmationRequest,
            Self::ConfirmationResponse(_) => MessageKind::ConfirmationResponse,
            Self::PolicyRejection(_) => MessageKind::PolicyRejection,
            Self::ExecutionSuccess(_) => MessageKind::ExecutionSuccess,
            Self::ExecutionFailure(_) => MessageKind::ExecutionFailure,
            Self::UpdatePolicy(_) => MessageKind::UpdatePolicy,
        }
    }
}
