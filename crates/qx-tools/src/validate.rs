// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Argument validation for tool calls.
//!
//! Two stages: JSON parsing of the raw argument text, then structural
//! validation against the tool's generated parameter schema.  Both failure
//! modes produce a message the model can act on — they are recorded as tool
//! results, never raised.

use serde_json::Value;
use tracing::warn;

/// Parse and validate raw tool-call arguments against `schema`.
///
/// Returns the parsed arguments on success, or the full error text to place
/// in the tool-result message on failure.
pub fn parse_and_validate(tool_name: &str, schema: &Value, raw: &str) -> Result<Value, String> {
    let parsed: Value = if raw.trim().is_empty() {
        // The model may legitimately omit arguments for a tool whose fields
        // are all optional; schema validation decides.
        Value::Object(Default::default())
    } else {
        match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                return Err(format!(
                    "Error: Invalid JSON arguments for tool '{tool_name}'. \
                     Please ensure arguments are valid JSON.\n\
                     Parse error: {e}\n\
                     Raw arguments: {raw}"
                ));
            }
        }
    };

    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            // A broken generated schema is a programming error in the tool,
            // not something the model can fix; let the call through rather
            // than wedging the loop.
            warn!(tool = tool_name, error = %e, "parameter schema failed to compile");
            return Ok(parsed);
        }
    };

    let mut details: Vec<String> = Vec::new();
    for error in validator.iter_errors(&parsed) {
        let path = error.instance_path.to_string();
        let path = if path.is_empty() { "(root)".to_string() } else { path };
        details.push(format!("Field '{path}': {error}"));
    }

    if details.is_empty() {
        return Ok(parsed);
    }

    let mut message = format!(
        "Tool '{tool_name}' validation failed:\n{}",
        details.join("\n")
    );
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        let names: Vec<&str> = required.iter().filter_map(|v| v.as_str()).collect();
        if !names.is_empty() {
            message.push_str(&format!("\n\nRequired fields: {}", names.join(", ")));
        }
    }
    Err(message)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
