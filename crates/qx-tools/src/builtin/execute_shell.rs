// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use qx_config::ToolsConfig;

use crate::approval::{ApprovalGate, ApprovalRequest, ApprovalStatus};
use crate::permissions::{CommandPermission, CommandPermissions};
use crate::tool::{schema_for, ConsoleSink, Tool, ToolCall, ToolOutput};

/// Byte ceiling for each captured stream returned to the model.
const STREAM_LIMIT_BYTES: usize = 20_000;

/// Lines kept from the head and tail of oversized output.  Errors and
/// summaries cluster at the end of build/test output, so the tail matters
/// at least as much as the head.
const HEAD_LINES: usize = 100;
const TAIL_LINES: usize = 100;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteShellInput {
    /// The shell command to execute (a bash one-liner).
    pub command: String,
}

#[derive(Debug, Serialize)]
struct ExecuteShellOutput {
    command: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Runs a shell command under the per-command permission check: prohibited
/// patterns are denied outright (even under "approve all"), known-safe
/// patterns run immediately, and everything else asks the user.
pub struct ExecuteShellTool {
    gate: Arc<ApprovalGate>,
    console: Arc<dyn ConsoleSink>,
    permissions: CommandPermissions,
    show_stdout: bool,
    show_stderr: bool,
    command_timeout: Duration,
}

impl ExecuteShellTool {
    pub fn new(
        gate: Arc<ApprovalGate>,
        console: Arc<dyn ConsoleSink>,
        tools_cfg: &ToolsConfig,
        show_stdout: bool,
        show_stderr: bool,
    ) -> Self {
        Self {
            gate,
            console,
            permissions: CommandPermissions::from_config(tools_cfg),
            show_stdout,
            show_stderr,
            command_timeout: Duration::from_secs(tools_cfg.tool_timeout_secs),
        }
    }
}

#[async_trait]
impl Tool for ExecuteShellTool {
    fn name(&self) -> &str {
        "execute_shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout, stderr, and the exit code. \
         Commands matching the safe list run immediately; anything else asks \
         the user first; destructive patterns are denied outright. \
         Prefer non-interactive commands; avoid commands that require a TTY. \
         Output is capped per stream; when larger, the first 100 and last 100 \
         lines are preserved with an omission marker in the middle."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<ExecuteShellInput>()
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let input: ExecuteShellInput = match serde_json::from_value(call.args.clone()) {
            Ok(i) => i,
            Err(e) => return ToolOutput::err(&call.id, format!("invalid arguments: {e}")),
        };
        let command = input.command;
        if command.trim().is_empty() {
            return ToolOutput::err(&call.id, "Error: No command provided.");
        }

        match self.permissions.status_for(&command) {
            CommandPermission::Prohibited => {
                return ToolOutput::err(
                    &call.id,
                    "Error: Command execution denied by security policy.",
                );
            }
            CommandPermission::AutoApproved => {}
            CommandPermission::RequiresApproval => {
                let (status, _) = self
                    .gate
                    .request(ApprovalRequest::new(
                        "Execute shell command",
                        "command",
                        &command,
                        "Run this command?",
                    ))
                    .await;
                match status {
                    ApprovalStatus::Approved | ApprovalStatus::SessionApproved => {}
                    ApprovalStatus::Denied => {
                        return ToolOutput::err(
                            &call.id,
                            format!("Error: execution of '{command}' denied by user"),
                        );
                    }
                    ApprovalStatus::Cancelled => {
                        return ToolOutput::err(&call.id, "Error: operation cancelled by user");
                    }
                }
            }
        }

        debug!(command = %command, "executing shell command");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        // Detach the subprocess from the controlling terminal: stdin from
        // /dev/null defeats isatty probes, kill_on_drop reaps the child when
        // the dispatcher timeout drops this future, and setsid prevents the
        // child from reopening /dev/tty behind our back.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let result = tokio::time::timeout(self.command_timeout, cmd.output()).await;

        match result {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

                if self.show_stdout && !stdout.is_empty() {
                    self.console.line(stdout.trim_end_matches('\n'));
                }
                if self.show_stderr && !stderr.is_empty() {
                    self.console.line(stderr.trim_end_matches('\n'));
                }

                let exit_code = output.status.code().unwrap_or(-1);
                let payload = ExecuteShellOutput {
                    command,
                    exit_code,
                    stdout: head_tail_truncate(&stdout),
                    stderr: head_tail_truncate(&stderr),
                };
                // Non-zero exit is information for the model, not a tool
                // failure; the payload carries the exit code either way.
                match serde_json::to_string(&payload) {
                    Ok(json) => ToolOutput::ok(&call.id, json),
                    Err(e) => ToolOutput::err(&call.id, format!("serialization error: {e}")),
                }
            }
            Ok(Err(e)) => ToolOutput::err(&call.id, format!("spawn error: {e}")),
            Err(_) => ToolOutput::err(
                &call.id,
                format!("timeout after {}s", self.command_timeout.as_secs()),
            ),
        }
    }
}

/// Truncate `s` to fit within [`STREAM_LIMIT_BYTES`], keeping the first
/// [`HEAD_LINES`] and last [`TAIL_LINES`] lines with an omission marker.
fn head_tail_truncate(s: &str) -> String {
    if s.len() <= STREAM_LIMIT_BYTES {
        return s.to_string();
    }
    let lines: Vec<&str> = s.lines().collect();
    if lines.len() <= HEAD_LINES + TAIL_LINES {
        // Few but enormous lines; fall back to a byte cut at a char boundary.
        let cut = s
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= STREAM_LIMIT_BYTES)
            .last()
            .unwrap_or(0);
        return format!("{}…[truncated, {} bytes total]", &s[..cut], s.len());
    }
    let omitted = lines.len() - HEAD_LINES - TAIL_LINES;
    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[lines.len() - TAIL_LINES..].join("\n");
    format!("{head}\n…[{omitted} lines omitted]…\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::approval::ScriptedPrompt;
    use crate::tool::NullSink;

    use super::*;

    fn tool_with(answers: &[char]) -> (ExecuteShellTool, Arc<ScriptedPrompt>) {
        let prompter = Arc::new(ScriptedPrompt::new(answers));
        let gate = Arc::new(ApprovalGate::new(prompter.clone(), Arc::new(NullSink)));
        let tool = ExecuteShellTool::new(
            gate,
            Arc::new(NullSink),
            &ToolsConfig::default(),
            false,
            false,
        );
        (tool, prompter)
    }

    fn call_for(command: &str) -> ToolCall {
        ToolCall {
            id: "s1".into(),
            name: "execute_shell".into(),
            args: serde_json::json!({ "command": command }),
            raw_args: String::new(),
        }
    }

    #[tokio::test]
    async fn auto_approved_command_runs_without_prompt() {
        let (tool, prompter) = tool_with(&[]);
        let out = tool.execute(&call_for("pwd")).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("\"exit_code\":0"));
        assert_eq!(prompter.prompt_count(), 0);
    }

    #[tokio::test]
    async fn prohibited_command_denied_without_prompt() {
        let (tool, prompter) = tool_with(&['y']);
        let out = tool.execute(&call_for("rm -rf /etc")).await;
        assert!(out.is_error);
        assert!(out.content.contains("security policy"));
        assert_eq!(prompter.prompt_count(), 0, "permission denial must not prompt");
    }

    #[tokio::test]
    async fn session_approval_does_not_override_prohibited() {
        let prompter = Arc::new(ScriptedPrompt::new(&[]));
        let gate = Arc::new(ApprovalGate::new(prompter, Arc::new(NullSink)));
        gate.set_approve_all(true).await;
        let tool = ExecuteShellTool::new(
            gate,
            Arc::new(NullSink),
            &ToolsConfig::default(),
            false,
            false,
        );
        let out = tool.execute(&call_for("sudo rm -rf /")).await;
        assert!(out.is_error);
        assert!(out.content.contains("security policy"));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let (tool, prompter) = tool_with(&['y']);
        let out = tool.execute(&call_for("   ")).await;
        assert!(out.is_error);
        assert!(out.content.contains("No command provided"));
        assert_eq!(prompter.prompt_count(), 0);
    }

    #[tokio::test]
    async fn unknown_command_asks_and_runs_on_yes() {
        let (tool, prompter) = tool_with(&['y']);
        let out = tool.execute(&call_for("echo approved-run")).await;
        assert!(!out.is_error);
        assert!(out.content.contains("approved-run"));
        assert_eq!(prompter.prompt_count(), 1);
    }

    #[tokio::test]
    async fn unknown_command_denied_on_no() {
        let (tool, _) = tool_with(&['n']);
        let out = tool.execute(&call_for("echo nope")).await;
        assert!(out.is_error);
        assert!(out.content.contains("denied by user"));
    }

    #[tokio::test]
    async fn nonzero_exit_reported_in_payload_not_as_error() {
        let (tool, _) = tool_with(&['y']);
        let out = tool.execute(&call_for("bash -c 'exit 3'")).await;
        assert!(!out.is_error);
        assert!(out.content.contains("\"exit_code\":3"), "{}", out.content);
    }

    #[tokio::test]
    async fn stderr_captured() {
        let (tool, _) = tool_with(&['y']);
        let out = tool.execute(&call_for("echo oops 1>&2")).await;
        assert!(out.content.contains("oops"));
    }

    #[test]
    fn short_output_passes_through_untruncated() {
        assert_eq!(head_tail_truncate("small"), "small");
    }

    #[test]
    fn long_output_keeps_head_and_tail_lines() {
        let lines: Vec<String> = (0..2000).map(|i| format!("line {i} {}", "x".repeat(20))).collect();
        let s = lines.join("\n");
        let t = head_tail_truncate(&s);
        assert!(t.starts_with("line 0 "));
        assert!(t.ends_with(&format!("line 1999 {}", "x".repeat(20))));
        assert!(t.contains("lines omitted"));
        assert!(t.len() < s.len());
    }
}
