// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::approval::{ApprovalGate, ApprovalRequest, ApprovalStatus};
use crate::tool::{schema_for, Tool, ToolCall, ToolOutput};

/// Character ceiling for returned file content; larger files are head/tail
/// truncated so both the declarations at the top and the recent changes at
/// the bottom survive.
const MAX_CHARS: usize = 50_000;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadFileInput {
    /// Absolute or relative path of the file to read.  `~` is expanded.
    pub path: String,
}

#[derive(Debug, Serialize)]
struct ReadFileOutput {
    path: String,
    content: String,
    truncated: bool,
}

/// Reads a UTF-8 file.  Paths inside the project root are auto-approved;
/// anything outside goes through the approval gate.
pub struct ReadFileTool {
    gate: Arc<ApprovalGate>,
    project_root: PathBuf,
}

impl ReadFileTool {
    pub fn new(gate: Arc<ApprovalGate>, project_root: PathBuf) -> Self {
        Self { gate, project_root }
    }

    fn is_inside_project(&self, path: &Path) -> bool {
        let canonical = match path.canonicalize() {
            Ok(p) => p,
            Err(_) => return false,
        };
        match self.project_root.canonicalize() {
            Ok(root) => canonical.starts_with(root),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file and return its content. \
         Reads inside the current project run without confirmation; \
         reads outside the project ask the user first. \
         Content larger than 50,000 characters is truncated head and tail."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<ReadFileInput>()
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let input: ReadFileInput = match serde_json::from_value(call.args.clone()) {
            Ok(i) => i,
            Err(e) => return ToolOutput::err(&call.id, format!("invalid arguments: {e}")),
        };
        let expanded = shellexpand::tilde(&input.path).into_owned();
        let path = Path::new(&expanded);

        debug!(path = %expanded, "read_file tool");

        if !self.is_inside_project(path) {
            let (status, _) = self
                .gate
                .request(ApprovalRequest::new(
                    "Read file",
                    "path",
                    &expanded,
                    "Allow reading this file?",
                ))
                .await;
            match status {
                ApprovalStatus::Approved | ApprovalStatus::SessionApproved => {}
                ApprovalStatus::Denied => {
                    return ToolOutput::err(
                        &call.id,
                        format!("Error: read of '{expanded}' denied by user"),
                    );
                }
                ApprovalStatus::Cancelled => {
                    return ToolOutput::err(&call.id, "Error: operation cancelled by user");
                }
            }
        }

        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                return ToolOutput::err(&call.id, format!("Error reading '{expanded}': {e}"));
            }
        };

        let truncated = content.len() > MAX_CHARS;
        let content = if truncated {
            head_tail_truncate(&content, MAX_CHARS)
        } else {
            content
        };

        let output = ReadFileOutput { path: expanded, content, truncated };
        match serde_json::to_string(&output) {
            Ok(json) => ToolOutput::ok(&call.id, json),
            Err(e) => ToolOutput::err(&call.id, format!("serialization error: {e}")),
        }
    }
}

/// Keep the first and last halves of `s` within `max` chars, with an
/// omission marker in between.  Splits at char boundaries.
pub(crate) fn head_tail_truncate(s: &str, max: usize) -> String {
    let half = max / 2;
    let head_end = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= half)
        .last()
        .unwrap_or(0);
    let tail_start = s
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= s.len().saturating_sub(half))
        .unwrap_or(s.len());
    format!(
        "{}\n…[{} chars omitted]…\n{}",
        &s[..head_end],
        tail_start.saturating_sub(head_end),
        &s[tail_start..]
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
