// ABOUTME: In-process safety checkers — safe-command analysis and path containment.
// ABOUTME: Enum-dispatched handlers resolved once when the registry is built.

use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use super::context::CheckerContext;
use crate::policy::command;
use crate::policy::types::SafetyCheckResult;

/// Argument keys treated as filesystem paths by the containment check.
const PATH_KEYS: &[&str] = &["path", "file_path", "directory", "dir"];

/// The in-process checkers shipped with the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinChecker {
    /// Passes when every segment of the command pipeline uses a binary
    /// from the safe list.
    SafeCommand,
    /// Passes when every path-like argument stays inside the workspace
    /// after normalization.
    PathWithinRoot,
}

impl BuiltinChecker {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "safe-command" => Some(Self::SafeCommand),
            "path-within-root" => Some(Self::PathWithinRoot),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SafeCommand => "safe-command",
            Self::PathWithinRoot => "path-within-root",
        }
    }

    pub fn names() -> Vec<&'static str> {
        vec![Self::SafeCommand.name(), Self::PathWithinRoot.name()]
    }

    /// Run the check against a built context.
    pub fn run(&self, context: &CheckerContext) -> SafetyCheckResult {
        match self {
            Self::SafeCommand => check_safe_command(context),
            Self::PathWithinRoot => check_path_within_root(context),
        }
    }
}

fn check_safe_command(context: &CheckerContext) -> SafetyCheckResult {
    let Some(cmd) = context.args.get("command").and_then(Value::as_str) else {
        return SafetyCheckResult::fail("no command argument to inspect");
    };
    if command::all_segments_safe(cmd) {
        SafetyCheckResult::pass()
    } else {
        SafetyCheckResult::fail("command uses a binary outside the safe list")
    }
}

fn check_path_within_root(context: &CheckerContext) -> SafetyCheckResult {
    let root = match normalize(Path::new(&context.workspace_dir)) {
        Some(root) => root,
        None => return SafetyCheckResult::fail("workspace directory does not normalize"),
    };

    let mut checked = 0;
    for key in PATH_KEYS {
        let Some(raw) = context.args.get(key).and_then(Value::as_str) else {
            continue;
        };
        checked += 1;
        let candidate = Path::new(raw);
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            Path::new(&context.workspace_dir).join(candidate)
        };
        match normalize(&absolute) {
            Some(resolved) if resolved.starts_with(&root) => {}
            _ => {
                return SafetyCheckResult::fail(format!("path {raw:?} escapes the workspace"));
            }
        }
    }

    if checked == 0 {
        return SafetyCheckResult::fail("no path argument to inspect");
    }
    SafetyCheckResult::pass()
}

/// Lexically resolve `.` and `..` components. Returns None when `..`
/// climbs above the filesystem root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    Some(resolved)
}
