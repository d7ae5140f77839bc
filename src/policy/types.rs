// ABOUTME: Core types for the authorization policy — decisions, tiers, matchers, and rules.
// ABOUTME: Compiled rules, checker declarations, tool-call requests, and the load result.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::command;
use crate::checker::CheckerKind;

/// What the policy says to do with a proposed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Run the tool without asking.
    Allow,
    /// Refuse the tool call.
    Deny,
    /// Defer to the user before running.
    #[serde(rename = "ask")]
    AskUser,
}

/// Global posture controlling how readily the system asks for confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// Confirm every side-effecting action.
    Suggest,
    /// Auto-approve file edits, confirm everything else.
    AutoEdit,
    /// Auto-approve everything the rules permit.
    FullAuto,
}

/// Precedence rank of a rule's source directory. A higher tier always
/// outranks a lower one, regardless of in-file priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTier {
    Default,
    User,
    Admin,
}

/// How a rule selects tool names.
#[derive(Debug, Clone)]
pub enum ToolMatcher {
    /// The tool name must match exactly.
    Exact(String),
    /// The tool name must start with this prefix.
    Prefix(String),
    /// Glob pattern, compiled once at load time ("*" matches every tool).
    Pattern(Pattern),
}

impl ToolMatcher {
    /// Whether this matcher accepts the given tool name.
    pub fn matches(&self, tool_name: &str) -> bool {
        match self {
            Self::Exact(name) => name == tool_name,
            Self::Prefix(prefix) => tool_name.starts_with(prefix.as_str()),
            Self::Pattern(pattern) => pattern.matches(tool_name),
        }
    }

    /// Specificity rank of the matcher kind: exact > prefix > pattern.
    pub fn specificity(&self) -> u8 {
        match self {
            Self::Exact(_) => 2,
            Self::Prefix(_) => 1,
            Self::Pattern(_) => 0,
        }
    }

    /// Render the matcher for display in decisions and warnings.
    pub fn describe(&self) -> String {
        match self {
            Self::Exact(name) => name.clone(),
            Self::Prefix(prefix) => format!("{prefix}*"),
            Self::Pattern(pattern) => pattern.as_str().to_string(),
        }
    }
}

/// A single compiled authorization rule.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub matcher: ToolMatcher,
    /// Command prefixes tested against the call's `command` argument;
    /// empty means the rule matches on tool name alone.
    pub command_prefixes: Vec<String>,
    /// Restricts the rule to calls routed through one protocol server.
    pub server: Option<String>,
    pub decision: Decision,
    pub priority: i32,
    /// Approval modes the rule applies in; empty means all modes.
    pub modes: Vec<ApprovalMode>,
    pub tier: RuleTier,
    /// Safety checker consulted before an Allow from this rule is honored.
    pub checker: Option<String>,
    /// Set on rules granted at runtime via "always allow".
    pub granted_at: Option<DateTime<Utc>>,
}

impl PolicyRule {
    /// Create a rule with the given matcher and decision; other fields
    /// start at their least-specific values.
    pub fn new(matcher: ToolMatcher, decision: Decision) -> Self {
        Self {
            matcher,
            command_prefixes: Vec::new(),
            server: None,
            decision,
            priority: 0,
            modes: Vec::new(),
            tier: RuleTier::Default,
            checker: None,
            granted_at: None,
        }
    }

    /// Specificity used to break priority ties: a server-scoped rule beats
    /// a global one of the same matcher kind; exact beats prefix beats
    /// pattern.
    pub fn specificity(&self) -> u8 {
        self.matcher.specificity() * 2 + u8::from(self.server.is_some())
    }

    /// Sort key for descending evaluation order.
    pub fn sort_key(&self) -> (RuleTier, i32, u8) {
        (self.tier, self.priority, self.specificity())
    }

    /// Whether this rule accepts the given tool call. Matching is total:
    /// a missing or non-string `command` argument is a non-match for
    /// command-prefixed rules, never an error.
    pub fn matches(&self, call: &ToolCallRequest) -> bool {
        if !self.matcher.matches(&call.tool_name) {
            return false;
        }
        if let Some(server) = &self.server {
            if call.server.as_deref() != Some(server.as_str()) {
                return false;
            }
        }
        if self.command_prefixes.is_empty() {
            return true;
        }
        let Some(cmd) = call.args.get("command").and_then(Value::as_str) else {
            return false;
        };
        self.command_prefixes
            .iter()
            .any(|prefix| command::matches_prefix(cmd, prefix))
    }
}

/// A declared safety checker, resolved to its execution kind at load time.
#[derive(Debug, Clone)]
pub struct SafetyCheckerRule {
    pub id: String,
    pub kind: CheckerKind,
    pub timeout_ms: u64,
    /// Argument fields the checker requires; a call missing one of them
    /// fails the check.
    pub context_fields: Vec<String>,
    /// Decision an Allow is downgraded to when the check fails. Only
    /// AskUser or Deny are accepted — a checker can never widen access.
    pub on_fail: Decision,
    /// Free-form parameters forwarded to the checker in its context.
    pub params: Value,
}

impl SafetyCheckerRule {
    pub fn new(id: impl Into<String>, kind: CheckerKind) -> Self {
        Self {
            id: id.into(),
            kind,
            timeout_ms: crate::checker::DEFAULT_CHECKER_TIMEOUT_MS,
            context_fields: Vec::new(),
            on_fail: Decision::AskUser,
            params: Value::Null,
        }
    }
}

/// A model-originated request to execute a named capability.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub tool_name: String,
    /// Opaque argument map as proposed by the model.
    pub args: Value,
    /// Protocol server the tool is routed through, if any.
    pub server: Option<String>,
    /// Generated once per invocation; links the confirmation request to
    /// its single expected response.
    pub correlation_id: Uuid,
}

impl ToolCallRequest {
    pub fn new(tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
            server: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }
}

/// Summary of the rule that decided a tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedRule {
    pub matcher: String,
    pub tier: RuleTier,
    pub priority: i32,
    pub decision: Decision,
    pub checker: Option<String>,
}

impl From<&PolicyRule> for MatchedRule {
    fn from(rule: &PolicyRule) -> Self {
        Self {
            matcher: rule.matcher.describe(),
            tier: rule.tier,
            priority: rule.priority,
            decision: rule.decision,
            checker: rule.checker.clone(),
        }
    }
}

/// The outcome of evaluating one tool call against the rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub decision: Decision,
    /// The winning rule, or None when the configured default applied.
    pub matched: Option<MatchedRule>,
    /// Checker or override detail attached to the decision.
    pub reason: Option<String>,
}

/// Classification of a single rule-loading failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LoadErrorKind {
    #[error("file unreadable")]
    Unreadable,
    #[error("parse error")]
    Parse,
    #[error("schema violation")]
    Schema,
    #[error("invalid rule")]
    Validation,
    #[error("pattern compilation failed")]
    PatternCompile,
}

/// One non-fatal failure recorded while loading rule files. Intended to be
/// rendered as a startup warning; loading always continues past it.
#[derive(Debug, Clone)]
pub struct LoadError {
    pub file: PathBuf,
    /// Index of the offending entry within the file, if the failure is
    /// scoped to one rule rather than the whole file.
    pub rule_index: Option<usize>,
    pub kind: LoadErrorKind,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file.display())?;
        if let Some(index) = self.rule_index {
            write!(f, " (rule {index})")?;
        }
        write!(f, ": {}: {}", self.kind, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({suggestion})")?;
        }
        Ok(())
    }
}

/// Everything a load pass produced: the valid rules and checkers, plus
/// one error entry per failure. One malformed rule never invalidates the
/// rest of its file or any other file.
#[derive(Debug, Clone, Default)]
pub struct PolicyLoadResult {
    pub rules: Vec<PolicyRule>,
    pub checkers: Vec<SafetyCheckerRule>,
    pub errors: Vec<LoadError>,
}

/// Verdict of a safety checker. Also the wire format an external checker
/// process must emit on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyCheckResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SafetyCheckResult {
    pub fn pass() -> Self {
        Self { passed: true, reason: None }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self { passed: false, reason: Some(reason.into()) }
    }

    pub fn timeout() -> Self {
        Self::fail("timeout")
    }
}
