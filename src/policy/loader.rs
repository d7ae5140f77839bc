// ABOUTME: Tiered rule-file loader — parses TOML rule files into compiled rules and checkers.
// ABOUTME: Total: every failure becomes a LoadError entry and loading continues.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::types::{
    ApprovalMode, Decision, LoadError, LoadErrorKind, PolicyLoadResult, PolicyRule, RuleTier,
    SafetyCheckerRule, ToolMatcher,
};
use crate::checker::{BuiltinChecker, CheckerKind, DEFAULT_CHECKER_TIMEOUT_MS};

/// A `command_prefix` value: rule files may write a single string as
/// shorthand for a one-element list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

/// A `[[rules]]` entry as written in a rule file, before validation.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    tool: Option<String>,
    tool_prefix: Option<String>,
    command_prefix: Option<OneOrMany>,
    server: Option<String>,
    decision: Option<Decision>,
    priority: Option<i32>,
    modes: Option<Vec<ApprovalMode>>,
    checker: Option<String>,
}

/// A `[[checkers]]` entry as written in a rule file, before validation.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChecker {
    id: Option<String>,
    builtin: Option<String>,
    program: Option<PathBuf>,
    timeout_ms: Option<u64>,
    context_fields: Option<Vec<String>>,
    on_fail: Option<Decision>,
    params: Option<toml::Value>,
}

/// Load rules and checker declarations from the given tier directories,
/// in order. A missing directory is skipped; any other failure becomes an
/// `errors` entry. Rules whose mode set excludes `active_mode` are
/// dropped. This function never fails.
pub fn load_rules(dirs: &[(PathBuf, RuleTier)], active_mode: ApprovalMode) -> PolicyLoadResult {
    let mut out = PolicyLoadResult::default();

    for (dir, tier) in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                out.errors.push(LoadError {
                    file: dir.clone(),
                    rule_index: None,
                    kind: LoadErrorKind::Unreadable,
                    message: e.to_string(),
                    suggestion: None,
                });
                continue;
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        files.sort();

        for file in files {
            load_file(&file, *tier, active_mode, &mut out);
        }
    }

    debug!(
        rules = out.rules.len(),
        checkers = out.checkers.len(),
        errors = out.errors.len(),
        "loaded policy rules"
    );
    out
}

/// Load one rule file. Entry-level failures are recorded individually so
/// the remaining entries in the file still load.
fn load_file(file: &Path, tier: RuleTier, active_mode: ApprovalMode, out: &mut PolicyLoadResult) {
    let content = match std::fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) => {
            out.errors.push(LoadError {
                file: file.to_path_buf(),
                rule_index: None,
                kind: LoadErrorKind::Unreadable,
                message: e.to_string(),
                suggestion: None,
            });
            return;
        }
    };

    let doc: toml::Value = match content.parse() {
        Ok(doc) => doc,
        Err(e) => {
            out.errors.push(LoadError {
                file: file.to_path_buf(),
                rule_index: None,
                kind: LoadErrorKind::Parse,
                message: e.to_string(),
                suggestion: None,
            });
            return;
        }
    };

    for (index, entry) in toml_entries(&doc, "rules", file, out) {
        match entry.try_into::<RawRule>() {
            Ok(raw) => match compile_rule(raw, tier) {
                Ok(rule) => {
                    if rule.modes.is_empty() || rule.modes.contains(&active_mode) {
                        out.rules.push(rule);
                    }
                }
                Err((kind, message, suggestion)) => out.errors.push(LoadError {
                    file: file.to_path_buf(),
                    rule_index: Some(index),
                    kind,
                    message,
                    suggestion,
                }),
            },
            Err(e) => out.errors.push(LoadError {
                file: file.to_path_buf(),
                rule_index: Some(index),
                kind: LoadErrorKind::Schema,
                message: e.to_string(),
                suggestion: None,
            }),
        }
    }

    for (index, entry) in toml_entries(&doc, "checkers", file, out) {
        match entry.try_into::<RawChecker>() {
            Ok(raw) => match compile_checker(raw) {
                Ok(checker) => out.checkers.push(checker),
                Err((kind, message, suggestion)) => out.errors.push(LoadError {
                    file: file.to_path_buf(),
                    rule_index: Some(index),
                    kind,
                    message,
                    suggestion,
                }),
            },
            Err(e) => out.errors.push(LoadError {
                file: file.to_path_buf(),
                rule_index: Some(index),
                kind: LoadErrorKind::Schema,
                message: e.to_string(),
                suggestion: None,
            }),
        }
    }
}

/// Pull an array-of-tables key out of the document, recording a schema
/// error if the key exists with the wrong shape.
fn toml_entries(
    doc: &toml::Value,
    key: &str,
    file: &Path,
    out: &mut PolicyLoadResult,
) -> Vec<(usize, toml::Value)> {
    match doc.get(key) {
        None => Vec::new(),
        Some(value) => match value.as_array() {
            Some(items) => items.iter().cloned().enumerate().collect(),
            None => {
                out.errors.push(LoadError {
                    file: file.to_path_buf(),
                    rule_index: None,
                    kind: LoadErrorKind::Schema,
                    message: format!("`{key}` must be an array of tables"),
                    suggestion: Some(format!("write entries as [[{key}]]")),
                });
                Vec::new()
            }
        },
    }
}

type CompileError = (LoadErrorKind, String, Option<String>);

/// Validate and compile one raw rule. Pattern matchers compile here, once,
/// so evaluation never touches the glob parser.
fn compile_rule(raw: RawRule, tier: RuleTier) -> Result<PolicyRule, CompileError> {
    let Some(decision) = raw.decision else {
        return Err((
            LoadErrorKind::Validation,
            "decision is required".into(),
            Some("add decision = \"allow\" | \"deny\" | \"ask\"".into()),
        ));
    };

    if raw.tool.is_some() && raw.tool_prefix.is_some() {
        return Err((
            LoadErrorKind::Validation,
            "rule specifies both `tool` and `tool_prefix`".into(),
            Some("keep exactly one tool-name matcher".into()),
        ));
    }

    let command_prefixes = raw
        .command_prefix
        .map(OneOrMany::into_vec)
        .unwrap_or_default();
    if command_prefixes.iter().any(|p| p.trim().is_empty()) {
        return Err((
            LoadErrorKind::Validation,
            "command_prefix entries must not be empty".into(),
            None,
        ));
    }

    let matcher = match (raw.tool, raw.tool_prefix) {
        (Some(tool), None) => {
            if tool.contains(['*', '?', '[']) {
                match glob::Pattern::new(&tool) {
                    Ok(pattern) => ToolMatcher::Pattern(pattern),
                    Err(e) => {
                        return Err((
                            LoadErrorKind::PatternCompile,
                            format!("invalid pattern {tool:?}: {e}"),
                            None,
                        ));
                    }
                }
            } else {
                ToolMatcher::Exact(tool)
            }
        }
        (None, Some(prefix)) => ToolMatcher::Prefix(prefix),
        (None, None) => {
            if command_prefixes.is_empty() {
                return Err((
                    LoadErrorKind::Validation,
                    "rule has no matcher".into(),
                    Some("add `tool`, `tool_prefix`, or `command_prefix`".into()),
                ));
            }
            // A command-prefix-only rule applies to any tool carrying a
            // matching command argument.
            ToolMatcher::Pattern(glob::Pattern::new("*").expect("literal pattern compiles"))
        }
        (Some(_), Some(_)) => unreachable!("rejected above"),
    };

    let mut rule = PolicyRule::new(matcher, decision);
    rule.command_prefixes = command_prefixes;
    rule.server = raw.server;
    rule.priority = raw.priority.unwrap_or(0);
    rule.modes = raw.modes.unwrap_or_default();
    rule.tier = tier;
    rule.checker = raw.checker;
    Ok(rule)
}

/// Validate and compile one raw checker declaration.
fn compile_checker(raw: RawChecker) -> Result<SafetyCheckerRule, CompileError> {
    let Some(id) = raw.id else {
        return Err((LoadErrorKind::Validation, "checker id is required".into(), None));
    };

    let kind = match (raw.builtin, raw.program) {
        (Some(name), None) => match BuiltinChecker::from_name(&name) {
            Some(builtin) => CheckerKind::Builtin(builtin),
            None => {
                return Err((
                    LoadErrorKind::Validation,
                    format!("unknown builtin checker {name:?}"),
                    Some(format!("known builtins: {}", BuiltinChecker::names().join(", "))),
                ));
            }
        },
        (None, Some(program)) => CheckerKind::External { program },
        _ => {
            return Err((
                LoadErrorKind::Validation,
                "checker must name exactly one of `builtin` or `program`".into(),
                None,
            ));
        }
    };

    let on_fail = raw.on_fail.unwrap_or(Decision::AskUser);
    if on_fail == Decision::Allow {
        return Err((
            LoadErrorKind::Validation,
            "on_fail may not be \"allow\"".into(),
            Some("a failed check can only downgrade; use \"ask\" or \"deny\"".into()),
        ));
    }

    let params = match raw.params {
        Some(value) => serde_json::to_value(value).unwrap_or(Value::Null),
        None => Value::Null,
    };

    let mut checker = SafetyCheckerRule::new(id, kind);
    checker.timeout_ms = raw.timeout_ms.unwrap_or(DEFAULT_CHECKER_TIMEOUT_MS);
    checker.context_fields = raw.context_fields.unwrap_or_default();
    checker.on_fail = on_fail;
    checker.params = params;
    Ok(checker)
}
