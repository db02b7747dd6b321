// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
/// Events emitted by the agent during one user turn.  The enclosing
/// application subscribes to drive its output; the core never touches a
/// terminal directly.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A provider request is in flight and nothing has rendered yet — show
    /// a progress indicator.
    Waiting,
    /// Progress-indicator text (first line of a suppressed reasoning
    /// stream).
    StatusUpdate(String),
    /// A reasoning delta, emitted only when thinking display is enabled.
    ReasoningDelta(String),
    /// A Markdown-safe chunk ready to render.  Concatenating all releases
    /// of a turn reproduces the assistant text exactly.
    MarkdownRelease(String),
    /// The model requested a tool call (validation not yet run).
    ToolCallStarted { call_id: String, name: String },
    /// A tool call finished (success or error) and its result was recorded.
    ToolCallFinished {
        call_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    /// The loop crossed the soft recursion ceiling and nudged the model to
    /// wrap up.
    DepthWarning(u32),
    /// Out-of-band notice (fallback engaged, response interrupted).
    Notice(String),
    /// The turn reached a terminal assistant message.
    TurnComplete,
}
