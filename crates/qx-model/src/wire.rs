// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Conversion between [`Message`] and the OpenAI-compatible wire format.
//!
//! The store serializes each message once (and caches the result); the
//! provider then receives the final array.  Parallel tool calls are stored
//! internally as one message per call, which is easier to append and to
//! pair with results, but the wire format requires all calls from one
//! assistant turn inside a single message with a `tool_calls` array —
//! [`coalesce_tool_calls`] performs that merge.

use serde_json::{json, Value};

use crate::{Message, MessageContent, Role};

fn role_str(r: Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Serialize one message into its wire object.
///
/// A `ToolCall` message becomes an assistant message with a single-element
/// `tool_calls` array; consecutive ones are merged later by
/// [`coalesce_tool_calls`].
pub fn message_to_wire(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => json!({
            "role": role_str(msg.role),
            "content": t,
        }),
        MessageContent::ToolCall { tool_call_id, function } => json!({
            "role": "assistant",
            "tool_calls": [{
                "id": tool_call_id,
                "type": "function",
                "function": {
                    "name": function.name,
                    "arguments": function.arguments,
                }
            }]
        }),
        MessageContent::ToolResult { tool_call_id, content } => json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "content": content,
        }),
    }
}

/// Merge consecutive assistant messages that carry only `tool_calls` into a
/// single assistant message whose `tool_calls` array preserves call order.
pub fn coalesce_tool_calls(values: Vec<Value>) -> Vec<Value> {
    fn is_bare_tool_calls(v: &Value) -> bool {
        v["role"] == "assistant" && v.get("tool_calls").is_some() && v.get("content").is_none()
    }

    let mut result: Vec<Value> = Vec::with_capacity(values.len());
    for v in values {
        let merged = is_bare_tool_calls(&v)
            && match result.last_mut() {
                Some(prev) if is_bare_tool_calls(prev) => {
                    match (prev["tool_calls"].as_array_mut(), v["tool_calls"].as_array()) {
                        (Some(dst), Some(src)) => {
                            dst.extend(src.iter().cloned());
                            true
                        }
                        _ => false,
                    }
                }
                _ => false,
            };
        if !merged {
            result.push(v);
        }
    }
    result
}

/// Serialize a full message slice: per-message conversion plus coalescing.
pub fn messages_to_wire(messages: &[Message]) -> Vec<Value> {
    coalesce_tool_calls(messages.iter().map(message_to_wire).collect())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
