// ABOUTME: Decision-side bus listeners — policy-driven responses and runtime grants.
// ABOUTME: Each confirmation request is answered by a spawned policy check task.

use std::sync::Arc;

use tracing::debug;

use crate::bus::{
    BusMessage, ConfirmationResponse, MessageBus, MessageKind, PolicyRejection,
};
use crate::policy::engine::PolicyEngine;
use crate::policy::types::Decision;

/// Wires a policy engine to the bus: answers confirmation requests with
/// the engine's decision and applies update-policy grants. Must be
/// attached from within a Tokio runtime — each request is checked in its
/// own task so a slow checker never stalls the bus.
pub struct PolicyListener {
    bus: Arc<MessageBus>,
    request_subscription: crate::bus::SubscriptionId,
    update_subscription: crate::bus::SubscriptionId,
}

impl PolicyListener {
    pub fn attach(bus: Arc<MessageBus>, engine: Arc<PolicyEngine>) -> Self {
        let handler_bus = bus.clone();
        let handler_engine = engine.clone();
        let request_subscription =
            bus.subscribe(MessageKind::ConfirmationRequest, move |msg| {
                let BusMessage::ConfirmationRequest(request) = msg else {
                    return Ok(());
                };
                let bus = handler_bus.clone();
                let engine = handler_engine.clone();
                let call = request.call.clone();
                let cancel = request.cancel.clone();
                tokio::spawn(async move {
                    let decision = engine.check(&call, &cancel).await;
                    debug!(
                        tool = %call.tool_name,
                        decision = ?decision.decision,
                        "answering confirmation request"
                    );
                    let response = match decision.decision {
                        Decision::Allow => ConfirmationResponse::allowed(call.correlation_id),
                        Decision::AskUser => {
                            ConfirmationResponse::ask_user(call.correlation_id, decision.reason)
                        }
                        Decision::Deny => {
                            let reason = decision.reason.unwrap_or_else(|| {
                                match &decision.matched {
                                    Some(rule) => format!("denied by policy rule {}", rule.matcher),
                                    None => "denied by policy".into(),
                                }
                            });
                            bus.publish(&BusMessage::PolicyRejection(PolicyRejection {
                                correlation_id: call.correlation_id,
                                tool_name: call.tool_name.clone(),
                                reason: reason.clone(),
                            }));
                            ConfirmationResponse::denied(call.correlation_id, reason)
                        }
                    };
                    bus.publish(&BusMessage::ConfirmationResponse(response));
                });
                Ok(())
            });

        let grant_engine = engine.clone();
        let update_subscription = bus.subscribe(MessageKind::UpdatePolicy, move |msg| {
            let BusMessage::UpdatePolicy(update) = msg else {
                return Ok(());
            };
            // Only allow grants are accepted over the bus; narrowing
            // belongs in rule files.
            if update.decision == Decision::Allow {
                grant_engine.grant_always(
                    &update.tool_name,
                    update.command_prefix.as_deref(),
                    update.server.as_deref(),
                );
            }
            Ok(())
        });

        Self { bus, request_subscription, update_subscription }
    }

    /// Stop answering; in-flight check tasks still publish their
    /// responses.
    pub fn detach(&self) {
        self.bus.unsubscribe(self.request_subscription);
        self.bus.unsubscribe(self.update_subscription);
    }
}
