// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::tool::{schema_for, Tool, ToolCall, ToolOutput};

const DEFAULT_MAX_CHARS: usize = 50_000;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WebFetchInput {
    /// The URL to fetch (http or https).
    pub url: String,
    /// Maximum characters to return (default 50000).
    pub max_chars: Option<usize>,
}

#[derive(Debug, Serialize)]
struct WebFetchOutput {
    url: String,
    content: String,
    truncated: bool,
}

/// Fetches a URL and converts the response to readable text.  Read-only, so
/// it runs without approval.
pub struct WebFetchTool;

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch content from an http/https URL and convert it to readable text. \
         HTML is converted to plain text, JSON is pretty-printed, and other \
         content is returned as-is, capped at max_chars characters. \
         Read-only: no authentication, no requests with side effects."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<WebFetchInput>()
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let input: WebFetchInput = match serde_json::from_value(call.args.clone()) {
            Ok(i) => i,
            Err(e) => return ToolOutput::err(&call.id, format!("invalid arguments: {e}")),
        };
        let max_chars = input.max_chars.unwrap_or(DEFAULT_MAX_CHARS);

        if !input.url.starts_with("http://") && !input.url.starts_with("https://") {
            return ToolOutput::err(
                &call.id,
                format!("Error: only http/https URLs are supported, got '{}'", input.url),
            );
        }

        debug!(url = %input.url, "web_fetch tool");

        match fetch_url(&input.url, max_chars).await {
            Ok((content, truncated)) => {
                let output = WebFetchOutput { url: input.url, content, truncated };
                match serde_json::to_string(&output) {
                    Ok(json) => ToolOutput::ok(&call.id, json),
                    Err(e) => ToolOutput::err(&call.id, format!("serialization error: {e}")),
                }
            }
            Err(e) => ToolOutput::err(&call.id, format!("Error fetching URL: {e}")),
        }
    }
}

async fn fetch_url(url: &str, max_chars: usize) -> anyhow::Result<(String, bool)> {
    let response = qx_model::http::client()
        .get(url)
        .timeout(std::time::Duration::from_secs(30))
        .send()
        .await?;
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    let body = response.text().await?;

    let content = if content_type.contains("html") {
        html_to_text(&body)
    } else if content_type.contains("json") {
        match serde_json::from_str::<Value>(&body) {
            Ok(v) => serde_json::to_string_pretty(&v).unwrap_or(body),
            Err(_) => body,
        }
    } else {
        body
    };

    if content.len() > max_chars {
        let cut = content
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= max_chars)
            .last()
            .unwrap_or(0);
        Ok((content[..cut].to_string(), true))
    } else {
        Ok((content, false))
    }
}

fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), 100)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
