// ABOUTME: Checker registry — maps checker ids to their resolved execution kind.
// ABOUTME: Builtins register at startup; external checkers are discovered from a directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::builtin::BuiltinChecker;
use crate::policy::types::SafetyCheckerRule;

/// Default time budget for a single safety check.
pub const DEFAULT_CHECKER_TIMEOUT_MS: u64 = 5_000;

/// How a checker executes, resolved once when the registry is built.
#[derive(Debug, Clone)]
pub enum CheckerKind {
    /// Dispatched to an in-process handler.
    Builtin(BuiltinChecker),
    /// Spawned as a subprocess that reads a context document on stdin and
    /// writes one SafetyCheckResult to stdout.
    External { program: PathBuf },
}

/// Registry of known safety checkers keyed by id.
#[derive(Debug, Clone, Default)]
pub struct CheckerRegistry {
    checkers: HashMap<String, SafetyCheckerRule>,
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with every builtin checker under its
    /// canonical name.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for builtin in [BuiltinChecker::SafeCommand, BuiltinChecker::PathWithinRoot] {
            registry.insert(SafetyCheckerRule::new(
                builtin.name(),
                CheckerKind::Builtin(builtin),
            ));
        }
        registry
    }

    /// Insert a checker, replacing any earlier registration of the same id.
    pub fn insert(&mut self, rule: SafetyCheckerRule) {
        self.checkers.insert(rule.id.clone(), rule);
    }

    pub fn get(&self, id: &str) -> Option<&SafetyCheckerRule> {
        self.checkers.get(id)
    }

    pub fn len(&self) -> usize {
        self.checkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }

    /// Discover external checkers in a directory: every executable file
    /// registers under its file stem with default settings. An unreadable
    /// directory is logged and skipped.
    pub fn discover_external(&mut self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "checkers directory unreadable");
                return;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else { continue };
            if !metadata.is_file() || !is_executable(&metadata) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            debug!(id, program = %path.display(), "discovered external checker");
            self.insert(SafetyCheckerRule::new(
                id,
                CheckerKind::External { program: path.clone() },
            ));
        }
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}
