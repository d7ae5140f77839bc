// ABOUTME: Checker context builder — the serialized document handed to safety checkers.
// ABOUTME: Narrows tool args to required fields and attaches policy parameters.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::types::{SafetyCheckerRule, ToolCallRequest};

/// Everything a checker sees about the call it is verifying. External
/// checkers receive this as one JSON document on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerContext {
    pub tool_name: String,
    pub args: Value,
    pub workspace_dir: String,
    /// Policy parameters from the checker's declaration.
    #[serde(default)]
    pub params: Value,
}

/// Build the context for one check. When the checker declares required
/// context fields, the args are narrowed to those fields; a call missing
/// one of them is an error (the runner fails the check closed).
pub fn build_context(
    rule: &SafetyCheckerRule,
    call: &ToolCallRequest,
    workspace_dir: &Path,
) -> Result<CheckerContext, String> {
    let args = if rule.context_fields.is_empty() {
        call.args.clone()
    } else {
        let mut narrowed = serde_json::Map::new();
        for field in &rule.context_fields {
            match call.args.get(field) {
                Some(value) => {
                    narrowed.insert(field.clone(), value.clone());
                }
                None => return Err(format!("missing required context field {field:?}")),
            }
        }
        Value::Object(narrowed)
    };

    Ok(CheckerContext {
        tool_name: call.tool_name.clone(),
        args,
        workspace_dir: workspace_dir.to_string_lossy().into_owned(),
        params: rule.params.clone(),
    })
}
