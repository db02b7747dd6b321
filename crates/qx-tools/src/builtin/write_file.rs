// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use similar::TextDiff;
use tracing::debug;

use crate::approval::{ApprovalGate, ApprovalRequest, ApprovalStatus};
use crate::tool::{schema_for, Tool, ToolCall, ToolOutput};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteFileInput {
    /// Absolute or relative path of the file to write.  `~` is expanded.
    pub path: String,
    /// Full new content of the file.
    pub content: String,
}

#[derive(Debug, Serialize)]
struct WriteFileOutput {
    path: String,
    bytes_written: usize,
    created: bool,
}

/// Writes (or overwrites) a file.  Every write is gated per path, with a
/// unified diff against the current content shown as the approval preview.
pub struct WriteFileTool {
    gate: Arc<ApprovalGate>,
}

impl WriteFileTool {
    pub fn new(gate: Arc<ApprovalGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, overwriting any existing content. \
         Parent directories are created automatically. \
         The user sees a diff against the current file and must approve the write."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<WriteFileInput>()
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let input: WriteFileInput = match serde_json::from_value(call.args.clone()) {
            Ok(i) => i,
            Err(e) => return ToolOutput::err(&call.id, format!("invalid arguments: {e}")),
        };
        let expanded = shellexpand::tilde(&input.path).into_owned();
        let path = Path::new(&expanded);

        debug!(path = %expanded, bytes = input.content.len(), "write_file tool");

        let existing = tokio::fs::read_to_string(path).await.ok();
        let created = existing.is_none();
        let preview = unified_diff(existing.as_deref().unwrap_or(""), &input.content);

        let (status, _) = self
            .gate
            .request(
                ApprovalRequest::new("Write file", "path", &expanded, "Write to this file?")
                    .with_preview(preview),
            )
            .await;
        match status {
            ApprovalStatus::Approved | ApprovalStatus::SessionApproved => {}
            ApprovalStatus::Denied => {
                return ToolOutput::err(
                    &call.id,
                    format!("Error: write to '{expanded}' denied by user"),
                );
            }
            ApprovalStatus::Cancelled => {
                return ToolOutput::err(&call.id, "Error: operation cancelled by user");
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return ToolOutput::err(
                        &call.id,
                        format!("Error creating directories for '{expanded}': {e}"),
                    );
                }
            }
        }

        match tokio::fs::write(path, &input.content).await {
            Ok(()) => {
                let output = WriteFileOutput {
                    path: expanded,
                    bytes_written: input.content.len(),
                    created,
                };
                match serde_json::to_string(&output) {
                    Ok(json) => ToolOutput::ok(&call.id, json),
                    Err(e) => ToolOutput::err(&call.id, format!("serialization error: {e}")),
                }
            }
            Err(e) => ToolOutput::err(&call.id, format!("Error writing '{expanded}': {e}")),
        }
    }
}

fn unified_diff(old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header("current", "proposed")
        .to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::approval::ScriptedPrompt;
    use crate::tool::NullSink;

    use super::*;

    fn tool_with(answers: &[char]) -> (WriteFileTool, Arc<ScriptedPrompt>) {
        let prompter = Arc::new(ScriptedPrompt::new(answers));
        let gate = Arc::new(ApprovalGate::new(prompter.clone(), Arc::new(NullSink)));
        (WriteFileTool::new(gate), prompter)
    }

    fn call_for(path: &Path, content: &str) -> ToolCall {
        ToolCall {
            id: "w1".into(),
            name: "write_file".into(),
            args: serde_json::json!({ "path": path.to_string_lossy(), "content": content }),
            raw_args: String::new(),
        }
    }

    #[tokio::test]
    async fn approved_write_creates_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep/nested/out.txt");
        let (tool, _) = tool_with(&['y']);
        let out = tool.execute(&call_for(&path, "written")).await;
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "written");
        assert!(out.content.contains("bytes_written"));
    }

    #[tokio::test]
    async fn denied_write_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep.txt");
        std::fs::write(&path, "original").unwrap();

        let (tool, _) = tool_with(&['n']);
        let out = tool.execute(&call_for(&path, "replacement")).await;
        assert!(out.is_error);
        assert!(out.content.contains("denied by user"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original");
    }

    #[tokio::test]
    async fn cancelled_write_reports_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, _) = tool_with(&['c']);
        let out = tool.execute(&call_for(&dir.path().join("x.txt"), "data")).await;
        assert!(out.is_error);
        assert!(out.content.contains("cancelled"));
    }

    #[tokio::test]
    async fn session_approval_skips_prompt_on_second_write() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, prompter) = tool_with(&['a']);
        let first = tool.execute(&call_for(&dir.path().join("a.txt"), "1")).await;
        let second = tool.execute(&call_for(&dir.path().join("b.txt"), "2")).await;
        assert!(!first.is_error);
        assert!(!second.is_error);
        assert_eq!(prompter.prompt_count(), 1);
    }

    #[test]
    fn diff_preview_shows_changed_lines() {
        let diff = unified_diff("line one\nline two\n", "line one\nline 2\n");
        assert!(diff.contains("-line two"));
        assert!(diff.contains("+line 2"));
    }

    #[test]
    fn diff_for_new_file_is_all_additions() {
        let diff = unified_diff("", "fresh\ncontent\n");
        assert!(diff.contains("+fresh"));
        assert!(diff.contains("+content"));
        assert!(!diff.contains("\n-"));
    }
}
