// ABOUTME: Layered tool-call authorization — tiered rule files, priority matching, and checkers.
// ABOUTME: Rule types, command analysis, the rule loader, and the policy engine.

pub mod command;
pub mod engine;
pub mod loader;
pub mod types;

pub use command::*;
pub use engine::*;
pub use loader::*;
pub use types::*;
