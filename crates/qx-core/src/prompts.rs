// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! System-prompt assembly.
//!
//! The template carries four substitution slots filled at turn time:
//! `{user_context}` and `{project_context}` from the environment,
//! `{project_files}` from the environment, and `{ignore_paths}` from the
//! working directory's `.gitignore`.

use std::path::Path;

use tracing::debug;

const DEFAULT_TEMPLATE: &str = "\
You are QX, a terminal assistant for software engineering tasks. You help \
with writing code, running commands, reading and modifying files, and \
answering questions about the user's project.

Use the available tools to take action instead of describing what the user \
should do. When a tool result contains an error, adjust your approach and \
try again or explain the failure. Keep responses concise and formatted as \
Markdown.

User context:
{user_context}

Project context:
{project_context}

Project files:
{project_files}

Paths ignored by the project (do not read or modify these):
{ignore_paths}
";

/// Build the system prompt.  `custom` replaces the default template but
/// still receives the slot substitutions, so custom prompts can reference
/// the same context.
pub fn system_prompt(custom: Option<&str>) -> String {
    let template = custom.unwrap_or(DEFAULT_TEMPLATE);
    render_template(
        template,
        &std::env::var("QX_USER_CONTEXT").unwrap_or_default(),
        &std::env::var("QX_PROJECT_CONTEXT").unwrap_or_default(),
        &std::env::var("QX_PROJECT_FILES").unwrap_or_default(),
        &read_ignore_paths(Path::new(".")),
    )
}

fn render_template(
    template: &str,
    user_context: &str,
    project_context: &str,
    project_files: &str,
    ignore_paths: &str,
) -> String {
    let rendered = template
        .replace("{user_context}", user_context)
        .replace("{project_context}", project_context)
        .replace("{project_files}", project_files)
        .replace("{ignore_paths}", ignore_paths);
    debug!(len = rendered.len(), "system prompt assembled");
    rendered
}

fn read_ignore_paths(dir: &Path) -> String {
    match std::fs::read_to_string(dir.join(".gitignore")) {
        Ok(text) => text,
        Err(_) => "# No .gitignore file found in the current directory.".to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
