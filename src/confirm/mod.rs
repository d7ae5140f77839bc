// ABOUTME: Confirmation flow for one tool invocation — request, decision, and resolution.
// ABOUTME: The coordinator owns the pending wait; listeners answer on the decision side.

pub mod coordinator;
pub mod listener;

pub use coordinator::*;
pub use listener::*;
