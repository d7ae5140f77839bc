// ABOUTME: Safety checker subsystem — registry, context building, and bounded execution.
// ABOUTME: In-process checks run inline; external checkers run as sandboxed subprocesses.

pub mod builtin;
pub mod context;
pub mod registry;
pub mod runner;

pub use builtin::*;
pub use context::*;
pub use registry::*;
pub use runner::*;
