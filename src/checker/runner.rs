// ABOUTME: Checker execution with hard time limits — inline for builtins, subprocess for external.
// ABOUTME: Every failure mode (timeout, bad output, spawn error, cancellation) is fail-closed.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::context::{CheckerContext, build_context};
use super::registry::CheckerKind;
use crate::policy::types::{SafetyCheckResult, SafetyCheckerRule, ToolCallRequest};

/// Run one safety check for a tool call. The result is always a verdict:
/// any failure to complete the check counts as a failed check.
pub async fn run_checker(
    rule: &SafetyCheckerRule,
    call: &ToolCallRequest,
    workspace_dir: &Path,
    cancel: &CancellationToken,
) -> SafetyCheckResult {
    let context = match build_context(rule, call, workspace_dir) {
        Ok(context) => context,
        Err(reason) => return SafetyCheckResult::fail(reason),
    };

    let timeout = Duration::from_millis(rule.timeout_ms);
    let result = match &rule.kind {
        CheckerKind::Builtin(builtin) => {
            match tokio::time::timeout(timeout, async { builtin.run(&context) }).await {
                Ok(result) => result,
                // The budget elapsed before the handler finished; its
                // eventual result is discarded.
                Err(_) => SafetyCheckResult::timeout(),
            }
        }
        CheckerKind::External { program } => {
            run_external(program, &context, timeout, cancel).await
        }
    };

    if !result.passed {
        warn!(checker = %rule.id, reason = ?result.reason, "safety check failed");
    } else {
        debug!(checker = %rule.id, "safety check passed");
    }
    result
}

/// Spawn an external checker, feed it the context on stdin, and demand
/// exactly one SafetyCheckResult on stdout before exit. Dropping the
/// child future on timeout or cancellation kills the process.
async fn run_external(
    program: &Path,
    context: &CheckerContext,
    timeout: Duration,
    cancel: &CancellationToken,
) -> SafetyCheckResult {
    let payload = match serde_json::to_vec(context) {
        Ok(payload) => payload,
        Err(e) => return SafetyCheckResult::fail(format!("context serialization failed: {e}")),
    };

    let mut child = match Command::new(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return SafetyCheckResult::fail(format!("failed to spawn checker: {e}")),
    };

    if let Some(mut stdin) = child.stdin.take() {
        // A write failure means the child already exited; the output
        // parse below decides the verdict.
        let _ = stdin.write_all(&payload).await;
        let _ = stdin.shutdown().await;
    }

    let wait = child.wait_with_output();
    tokio::pin!(wait);

    let output = tokio::select! {
        result = &mut wait => match result {
            Ok(output) => output,
            Err(e) => return SafetyCheckResult::fail(format!("checker i/o error: {e}")),
        },
        _ = tokio::time::sleep(timeout) => return SafetyCheckResult::timeout(),
        _ = cancel.cancelled() => return SafetyCheckResult::fail("cancelled"),
    };

    if !output.status.success() {
        return SafetyCheckResult::fail(format!("checker exited with {}", output.status));
    }

    match serde_json::from_slice::<SafetyCheckResult>(&output.stdout) {
        Ok(result) => result,
        Err(_) => SafetyCheckResult::fail("malformed checker output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::builtin::BuiltinChecker;

    fn builtin_rule(builtin: BuiltinChecker) -> SafetyCheckerRule {
        SafetyCheckerRule::new(builtin.name(), CheckerKind::Builtin(builtin))
    }

    #[cfg(unix)]
    fn script_checker(dir: &Path, name: &str, body: &str) -> SafetyCheckerRule {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        SafetyCheckerRule::new(name, CheckerKind::External { program: path })
    }

    #[tokio::test]
    async fn builtin_checker_runs_inline() {
        let rule = builtin_rule(BuiltinChecker::SafeCommand);
        let call = ToolCallRequest::new("bash", serde_json::json!({ "command": "cat x | wc -l" }));
        let result = run_checker(&rule, &call, Path::new("/work"), &CancellationToken::new()).await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn missing_context_field_fails_closed() {
        let mut rule = builtin_rule(BuiltinChecker::SafeCommand);
        rule.context_fields = vec!["command".into()];
        let call = ToolCallRequest::new("bash", serde_json::json!({}));
        let result = run_checker(&rule, &call, Path::new("/work"), &CancellationToken::new()).await;
        assert!(!result.passed);
        assert!(result.reason.unwrap().contains("command"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_checker_happy_path() {
        let tmp = tempfile::tempdir().unwrap();
        let rule = script_checker(
            tmp.path(),
            "pass",
            r#"cat > /dev/null; printf '{"passed":true}'"#,
        );
        let call = ToolCallRequest::new("bash", serde_json::json!({ "command": "ls" }));
        let result = run_checker(&rule, &call, Path::new("/work"), &CancellationToken::new()).await;
        assert!(result.passed, "reason: {:?}", result.reason);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_checker_reads_context() {
        let tmp = tempfile::tempdir().unwrap();
        // Fail with the tool name from the context as the reason.
        let rule = script_checker(
            tmp.path(),
            "echo-tool",
            r#"name=$(sed 's/.*"tool_name":"\([^"]*\)".*/\1/'); printf '{"passed":false,"reason":"%s"}' "$name""#,
        );
        let call = ToolCallRequest::new("web_fetch", serde_json::json!({ "url": "http://x" }));
        let result = run_checker(&rule, &call, Path::new("/work"), &CancellationToken::new()).await;
        assert!(!result.passed);
        assert_eq!(result.reason.as_deref(), Some("web_fetch"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_fails_even_with_passing_output() {
        let tmp = tempfile::tempdir().unwrap();
        let rule = script_checker(
            tmp.path(),
            "liar",
            r#"cat > /dev/null; printf '{"passed":true}'; exit 3"#,
        );
        let call = ToolCallRequest::new("bash", serde_json::json!({}));
        let result = run_checker(&rule, &call, Path::new("/work"), &CancellationToken::new()).await;
        assert!(!result.passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn malformed_output_fails_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let rule = script_checker(tmp.path(), "garbled", r#"cat > /dev/null; echo not-json"#);
        let call = ToolCallRequest::new("bash", serde_json::json!({}));
        let result = run_checker(&rule, &call, Path::new("/work"), &CancellationToken::new()).await;
        assert!(!result.passed);
        assert_eq!(result.reason.as_deref(), Some("malformed checker output"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_output_fails_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let rule = script_checker(tmp.path(), "silent", "cat > /dev/null");
        let call = ToolCallRequest::new("bash", serde_json::json!({}));
        let result = run_checker(&rule, &call, Path::new("/work"), &CancellationToken::new()).await;
        assert!(!result.passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_and_fails_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rule = script_checker(tmp.path(), "slow", "sleep 30");
        rule.timeout_ms = 100;
        let call = ToolCallRequest::new("bash", serde_json::json!({}));
        let start = std::time::Instant::now();
        let result = run_checker(&rule, &call, Path::new("/work"), &CancellationToken::new()).await;
        assert!(!result.passed);
        assert_eq!(result.reason.as_deref(), Some("timeout"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_running_checker() {
        let tmp = tempfile::tempdir().unwrap();
        let rule = script_checker(tmp.path(), "waits", "sleep 30");
        let call = ToolCallRequest::new("bash", serde_json::json!({}));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let start = std::time::Instant::now();
        let result = run_checker(&rule, &call, Path::new("/work"), &cancel).await;
        assert!(!result.passed);
        assert_eq!(result.reason.as_deref(), Some("cancelled"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn spawn_failure_fails_closed() {
        let rule = SafetyCheckerRule::new(
            "ghost",
            CheckerKind::External { program: "/no/such/checker".into() },
        );
        let call = ToolCallRequest::new("bash", serde_json::json!({}));
        let result = run_checker(&rule, &call, Path::new("/work"), &CancellationToken::new()).await;
        assert!(!result.passed);
        assert!(result.reason.unwrap().contains("spawn"));
    }
}
