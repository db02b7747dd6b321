// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use schemars::JsonSchema;
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Validated JSON arguments.  `Null` until the dispatcher has run the
    /// raw text through schema validation.
    pub args: Value,
    /// Raw argument text exactly as the model emitted it; kept for error
    /// reporting when it is not valid JSON.
    pub raw_args: String,
}

impl ToolCall {
    /// A call as assembled from the stream, before validation.
    pub fn raw(id: impl Into<String>, name: impl Into<String>, raw_args: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args: Value::Null,
            raw_args: raw_args.into(),
        }
    }
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    /// Serialized output, or error text when `is_error` is set.  This is the
    /// body of the tool message the model sees.
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: content.into(), is_error: false }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: msg.into(), is_error: true }
    }
}

/// One-way display surface handed to tools and the approval gate.  The
/// enclosing application decides what a "line" looks like; tests record
/// them.
pub trait ConsoleSink: Send + Sync {
    fn line(&self, text: &str);
}

/// Sink that discards everything.
pub struct NullSink;

impl ConsoleSink for NullSink {
    fn line(&self, _text: &str) {}
}

/// Generate the JSON Schema for a tool's input model.
///
/// Input structs are the source of truth; the manifest parameters are always
/// derived from them, never hand-written.
pub fn schema_for<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}

/// Trait every builtin and user-defined tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object, generated via [`schema_for`].
    fn parameters_schema(&self) -> Value;
    /// Execute the tool.  `call.args` has already passed schema validation.
    /// Failures are wrapped in [`ToolOutput::err`], never panics.
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
