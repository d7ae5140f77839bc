// ABOUTME: Policy engine — evaluates tool calls against an atomically-swapped rule snapshot.
// ABOUTME: Tier/priority/specificity ordering, checker gating, and runtime grants.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::{
    Decision, MatchedRule, PolicyDecision, PolicyLoadResult, PolicyRule, ToolCallRequest,
    ToolMatcher,
};
use crate::checker::{CheckerRegistry, run_checker};

/// Engine-level configuration supplied by the embedding process.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Decision returned when no rule matches.
    pub default_decision: Decision,
    /// When set, any AskUser result becomes Deny — there is no one to ask.
    pub non_interactive: bool,
    /// Working directory handed to checkers in their context.
    pub workspace_dir: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_decision: Decision::AskUser,
            non_interactive: false,
            workspace_dir: PathBuf::from("."),
        }
    }
}

/// An immutable view of the rules and checkers in force. In-flight
/// evaluations hold their own Arc, so a reload never tears a rule set
/// out from under them.
#[derive(Debug, Default)]
struct RuleSnapshot {
    /// Rules granted at runtime; always evaluated ahead of file rules.
    runtime_rules: Vec<PolicyRule>,
    file_rules: Vec<PolicyRule>,
    registry: CheckerRegistry,
}

impl RuleSnapshot {
    fn sorted(mut runtime_rules: Vec<PolicyRule>, mut file_rules: Vec<PolicyRule>, registry: CheckerRegistry) -> Self {
        // Stable sort: ties keep load order, so first-match stays
        // deterministic for identical keys.
        runtime_rules.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        file_rules.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        Self { runtime_rules, file_rules, registry }
    }

    fn rules(&self) -> impl Iterator<Item = &PolicyRule> {
        self.runtime_rules.iter().chain(self.file_rules.iter())
    }
}

/// Matches proposed tool calls against the current rule snapshot and
/// returns exactly one of Allow, Deny, or AskUser. Never fails.
pub struct PolicyEngine {
    snapshot: RwLock<Arc<RuleSnapshot>>,
    options: EngineOptions,
}

impl PolicyEngine {
    /// Build an engine from a load result and a checker registry. Checker
    /// declarations from rule files are merged into the registry.
    pub fn new(load: PolicyLoadResult, registry: CheckerRegistry, options: EngineOptions) -> Self {
        let snapshot = Self::build_snapshot(Vec::new(), load, registry);
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            options,
        }
    }

    fn build_snapshot(
        runtime_rules: Vec<PolicyRule>,
        load: PolicyLoadResult,
        mut registry: CheckerRegistry,
    ) -> RuleSnapshot {
        for checker in load.checkers {
            registry.insert(checker);
        }
        RuleSnapshot::sorted(runtime_rules, load.rules, registry)
    }

    fn current(&self) -> Arc<RuleSnapshot> {
        self.snapshot
            .read()
            .expect("policy snapshot lock poisoned")
            .clone()
    }

    fn swap(&self, snapshot: RuleSnapshot) {
        *self
            .snapshot
            .write()
            .expect("policy snapshot lock poisoned") = Arc::new(snapshot);
    }

    /// Pure rule matching: the first rule (in tier, priority, specificity
    /// order) that accepts the call decides it; otherwise the configured
    /// default applies with no matched rule. Total and synchronous.
    pub fn evaluate(&self, call: &ToolCallRequest) -> PolicyDecision {
        let snapshot = self.current();
        for rule in snapshot.rules() {
            if rule.matches(call) {
                debug!(
                    tool = %call.tool_name,
                    rule = %rule.matcher.describe(),
                    decision = ?rule.decision,
                    "rule matched"
                );
                return PolicyDecision {
                    decision: rule.decision,
                    matched: Some(MatchedRule::from(rule)),
                    reason: None,
                };
            }
        }
        PolicyDecision {
            decision: self.options.default_decision,
            matched: None,
            reason: None,
        }
    }

    /// Full check: evaluate the rules, consult the matched rule's safety
    /// checker when its Allow is gated, then apply the non-interactive
    /// conversion. Total: every failure path yields a decision.
    pub async fn check(&self, call: &ToolCallRequest, cancel: &CancellationToken) -> PolicyDecision {
        let mut decision = self.evaluate(call);

        if decision.decision == Decision::Allow {
            let checker_id = decision.matched.as_ref().and_then(|m| m.checker.clone());
            if let Some(id) = checker_id {
                let snapshot = self.current();
                let (result, on_fail) = match snapshot.registry.get(&id) {
                    Some(rule) => (
                        run_checker(rule, call, &self.options.workspace_dir, cancel).await,
                        rule.on_fail,
                    ),
                    // A rule naming a checker nobody registered cannot be
                    // verified; treat it as a failed check.
                    None => (
                        super::types::SafetyCheckResult::fail(format!("unknown checker {id:?}")),
                        Decision::AskUser,
                    ),
                };
                if !result.passed {
                    decision.decision = on_fail;
                    decision.reason =
                        Some(result.reason.unwrap_or_else(|| "safety check failed".into()));
                }
            }
        }

        if self.options.non_interactive && decision.decision == Decision::AskUser {
            decision.decision = Decision::Deny;
            if decision.reason.is_none() {
                decision.reason = Some("confirmation unavailable in non-interactive mode".into());
            }
        }

        decision
    }

    /// Insert a runtime rule ahead of every file-loaded rule. Produces a
    /// new snapshot; the live one is never edited.
    pub fn add_rule(&self, rule: PolicyRule) {
        let current = self.current();
        let mut runtime_rules = current.runtime_rules.clone();
        runtime_rules.push(rule);
        self.swap(RuleSnapshot::sorted(
            runtime_rules,
            current.file_rules.clone(),
            current.registry.clone(),
        ));
    }

    /// The runtime "always allow" grant for one tool signature, used when
    /// the user answers a prompt with allow-always.
    pub fn grant_always(&self, tool: &str, command_prefix: Option<&str>, server: Option<&str>) {
        let mut rule = PolicyRule::new(ToolMatcher::Exact(tool.to_string()), Decision::Allow);
        rule.priority = i32::MAX;
        rule.tier = super::types::RuleTier::Admin;
        rule.command_prefixes = command_prefix.map(|p| vec![p.to_string()]).unwrap_or_default();
        rule.server = server.map(str::to_string);
        rule.granted_at = Some(Utc::now());
        debug!(tool, ?command_prefix, "runtime allow granted");
        self.add_rule(rule);
    }

    /// Drop every rule that names this exact tool, runtime and file-loaded
    /// alike. Prefix and pattern rules are untouched.
    pub fn remove_rules_for_tool(&self, tool: &str) {
        let current = self.current();
        let keep = |rule: &PolicyRule| !matches!(&rule.matcher, ToolMatcher::Exact(name) if name == tool);
        let runtime_rules: Vec<_> = current.runtime_rules.iter().filter(|r| keep(r)).cloned().collect();
        let file_rules: Vec<_> = current.file_rules.iter().filter(|r| keep(r)).cloned().collect();
        self.swap(RuleSnapshot::sorted(
            runtime_rules,
            file_rules,
            current.registry.clone(),
        ));
    }

    /// Replace the file-loaded rules and checkers wholesale (startup,
    /// explicit reload, or directory change). Runtime grants survive the
    /// reload.
    pub fn install(&self, load: PolicyLoadResult, registry: CheckerRegistry) {
        let runtime_rules = self.current().runtime_rules.clone();
        self.swap(Self::build_snapshot(runtime_rules, load, registry));
    }
}
