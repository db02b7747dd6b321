// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible chat-completions driver.
//!
//! Speaks the standard `/chat/completions` wire format in both SSE streaming
//! and plain JSON mode.  Everything QX talks to — OpenRouter, OpenAI, local
//! llama.cpp / Ollama servers — exposes this shape.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    http,
    provider::{ModelProvider, ResponseStream},
    CompletionRequest, ProviderError, ResponseEvent,
};

pub struct OpenAiCompatProvider {
    model: String,
    /// Pre-resolved API key; `None` for local servers.
    api_key: Option<String>,
    /// Full chat completions URL, e.g. `https://openrouter.ai/api/v1/chat/completions`.
    chat_url: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";

impl OpenAiCompatProvider {
    /// `base_url` ends **before** `/chat/completions`; `None` selects the
    /// default gateway.
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<&str>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Self {
        let base = base_url.unwrap_or(DEFAULT_API_BASE).trim_end_matches('/');
        Self {
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            temperature,
            max_tokens,
        }
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": req.messages,
            "stream": req.stream,
        });
        if req.stream {
            body["stream_options"] = json!({ "include_usage": false });
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        if let Some(t) = req.temperature.or(self.temperature) {
            body["temperature"] = json!(t);
        }
        if let Some(m) = req.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = json!(m);
        }
        body
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ProviderError> {
        let body = self.build_body(&req);
        debug!(
            model = %self.model,
            stream = req.stream,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "sending completion request"
        );

        let mut http_req = http::client().post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req.send().await.map_err(classify_reqwest_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if is_context_overflow(&text) {
                return Err(ProviderError::ContextOverflow(text));
            }
            return Err(ProviderError::Http { status: status.as_u16(), body: text });
        }

        if !req.stream {
            let v: Value = resp
                .json()
                .await
                .map_err(|e| ProviderError::Transport(e.to_string()))?;
            let events = parse_complete_response(&v);
            return Ok(Box::pin(futures::stream::iter(events)));
        }

        // SSE events can be split across TCP packets.  Maintain a line buffer
        // across chunks; emit events only for complete lines.
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<ResponseEvent, ProviderError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(classify_reqwest_error(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(e.to_string())
    }
}

/// Error bodies that signal a context-window overflow rather than a generic
/// failure.  OpenAI uses the `context_length_exceeded` code; llama.cpp
/// returns `exceed_context_size_error`; various proxies only keep the prose.
fn is_context_overflow(body: &str) -> bool {
    body.contains("context_length_exceeded")
        || body.contains("exceed_context_size_error")
        || body.contains("maximum context length")
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk — a single SSE event may arrive in several packets.
pub(crate) fn drain_complete_sse_lines(
    buf: &mut String,
) -> Vec<Result<ResponseEvent, ProviderError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Parse a single complete SSE `data:` line.  Returns `None` for empty
/// lines, comments, and unparseable payloads.
fn parse_sse_data_line(line: &str) -> Option<Result<ResponseEvent, ProviderError>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_sse_chunk(&v).map(Ok)
}

fn parse_sse_chunk(v: &Value) -> Option<ResponseEvent> {
    let choice = &v["choices"][0];

    if let Some(reason) = choice["finish_reason"].as_str() {
        return Some(ResponseEvent::Finished { reason: reason.to_string() });
    }

    let delta = &choice["delta"];

    // Tool-call fragment.  Each chunk carries at most one element in
    // practice; the index routes accumulation in the engine.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return Some(ResponseEvent::ToolCall {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
        });
    }

    // Reasoning delta — `reasoning` (OpenRouter) or `reasoning_content`
    // (llama.cpp, DeepSeek).  Prefer the latter when both are present.
    let reasoning = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(r) = reasoning {
        if !r.is_empty() {
            return Some(ResponseEvent::ReasoningDelta(r.to_string()));
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return Some(ResponseEvent::TextDelta(text.to_string()));
    }

    // A chunk with no recognizable payload still counts as an empty delta so
    // the engine's empty-chunk guard can observe it.
    Some(ResponseEvent::TextDelta(String::new()))
}

/// Convert a complete (non-streaming) response body into the same event
/// sequence a stream would have produced.
fn parse_complete_response(v: &Value) -> Vec<Result<ResponseEvent, ProviderError>> {
    let mut events: Vec<Result<ResponseEvent, ProviderError>> = Vec::new();
    let choice = &v["choices"][0];
    let message = &choice["message"];

    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            events.push(Ok(ResponseEvent::TextDelta(text.to_string())));
        }
    }
    if let Some(calls) = message["tool_calls"].as_array() {
        for (i, tc) in calls.iter().enumerate() {
            events.push(Ok(ResponseEvent::ToolCall {
                index: i as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
            }));
        }
    }
    if let Some(reason) = choice["finish_reason"].as_str() {
        events.push(Ok(ResponseEvent::Finished { reason: reason.to_string() }));
    }
    events.push(Ok(ResponseEvent::Done));
    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider::new(
            "test-model".into(),
            None,
            Some("http://localhost:9999/v1"),
            Some(0.0),
            Some(1024),
        )
    }

    #[test]
    fn chat_url_appends_path() {
        let p = make_provider();
        assert_eq!(p.chat_url, "http://localhost:9999/v1/chat/completions");
    }

    #[test]
    fn base_url_trailing_slash_stripped() {
        let p = OpenAiCompatProvider::new("m".into(), None, Some("http://host/v1/"), None, None);
        assert_eq!(p.chat_url, "http://host/v1/chat/completions");
    }

    #[test]
    fn body_includes_tools_and_auto_choice() {
        let p = make_provider();
        let req = CompletionRequest {
            messages: vec![json!({"role":"user","content":"hi"})],
            tools: vec![crate::ToolSchema {
                name: "read_file".into(),
                description: "reads".into(),
                parameters: json!({"type":"object"}),
            }],
            stream: true,
            temperature: None,
            max_tokens: None,
        };
        let body = p.build_body(&req);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "read_file");
        assert_eq!(body["stream"], true);
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 1024);
    }

    #[test]
    fn body_omits_tools_when_none_registered() {
        let p = make_provider();
        let req = CompletionRequest {
            messages: vec![],
            tools: vec![],
            stream: false,
            temperature: None,
            max_tokens: None,
        };
        let body = p.build_body(&req);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn request_temperature_overrides_provider_default() {
        let p = make_provider();
        let req = CompletionRequest { temperature: Some(0.9), ..Default::default() };
        assert_eq!(p.build_body(&req)["temperature"], 0.9);
    }

    // ── parse_sse_chunk ───────────────────────────────────────────────────────

    #[test]
    fn parse_sse_text_delta() {
        let v = json!({ "choices": [{ "delta": { "content": "hello" } }] });
        let ev = parse_sse_chunk(&v).unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "hello"));
    }

    #[test]
    fn parse_sse_empty_delta_is_empty_text() {
        let v = json!({ "choices": [{ "delta": {} }] });
        let ev = parse_sse_chunk(&v).unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t.is_empty()));
    }

    #[test]
    fn parse_sse_tool_call_with_id_and_name() {
        let v = json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "id": "call_abc",
                        "function": { "name": "execute_shell", "arguments": "" }
                    }]
                }
            }]
        });
        let ev = parse_sse_chunk(&v).unwrap();
        assert!(
            matches!(&ev, ResponseEvent::ToolCall { index, id, name, arguments }
                if *index == 0 && id == "call_abc" && name == "execute_shell" && arguments.is_empty()),
            "unexpected event: {ev:?}"
        );
    }

    #[test]
    fn parse_sse_tool_call_nonzero_index() {
        let v = json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 2,
                        "id": "call_xyz",
                        "function": { "name": "read_file", "arguments": "" }
                    }]
                }
            }]
        });
        let ev = parse_sse_chunk(&v).unwrap();
        assert!(matches!(&ev, ResponseEvent::ToolCall { index: 2, id, .. } if id == "call_xyz"));
    }

    #[test]
    fn parse_sse_tool_call_args_fragment() {
        let v = json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "id": "",
                        "function": { "name": "", "arguments": "{\"path\": " }
                    }]
                }
            }]
        });
        let ev = parse_sse_chunk(&v).unwrap();
        assert!(
            matches!(&ev, ResponseEvent::ToolCall { arguments, .. } if arguments == "{\"path\": ")
        );
    }

    #[test]
    fn parse_sse_finish_reason() {
        let v = json!({ "choices": [{ "finish_reason": "stop", "delta": {} }] });
        let ev = parse_sse_chunk(&v).unwrap();
        assert!(matches!(ev, ResponseEvent::Finished { reason } if reason == "stop"));
    }

    #[test]
    fn parse_sse_reasoning_field_produces_reasoning_delta() {
        let v = json!({
            "choices": [{ "delta": { "content": "", "reasoning": "thinking it over" } }]
        });
        let ev = parse_sse_chunk(&v).unwrap();
        assert!(matches!(&ev, ResponseEvent::ReasoningDelta(t) if t == "thinking it over"));
    }

    #[test]
    fn parse_sse_reasoning_content_takes_priority() {
        let v = json!({
            "choices": [{ "delta": { "reasoning_content": "preferred", "reasoning": "fallback" } }]
        });
        let ev = parse_sse_chunk(&v).unwrap();
        assert!(matches!(&ev, ResponseEvent::ReasoningDelta(t) if t == "preferred"));
    }

    #[test]
    fn parse_sse_empty_reasoning_falls_through_to_text() {
        let v = json!({
            "choices": [{ "delta": { "content": "answer", "reasoning": "" } }]
        });
        let ev = parse_sse_chunk(&v).unwrap();
        assert!(matches!(&ev, ResponseEvent::TextDelta(t) if t == "answer"));
    }

    // ── SSE line buffering ────────────────────────────────────────────────────
    //
    // An SSE event split across two TCP packets must not be dropped: the
    // first half has no newline and the second half has no `data: ` prefix,
    // so per-packet parsing loses both.  The persistent buffer reassembles
    // them.

    #[test]
    fn drain_handles_single_complete_line() {
        let line = r#"{"choices":[{"delta":{"content":"hi"}}]}"#;
        let mut buf = format!("data: {line}\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(ResponseEvent::TextDelta(t)) if t == "hi"));
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_retains_incomplete_last_line() {
        let partial = "data: {\"choices\":[{\"delta\":{\"content\":\"hel";
        let mut buf = partial.to_string();
        assert!(drain_complete_sse_lines(&mut buf).is_empty());
        assert_eq!(buf, partial);
    }

    #[test]
    fn event_split_across_two_chunks_is_parsed() {
        let full = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"execute_shell","arguments":""}}]}}]}"#;
        let split = full.len() / 2;

        let mut buf = String::new();
        buf.push_str(&full[..split]);
        assert!(drain_complete_sse_lines(&mut buf).is_empty());
        assert!(!buf.is_empty());

        buf.push_str(&full[split..]);
        buf.push('\n');
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Ok(ResponseEvent::ToolCall { index, id, name, .. }) => {
                assert_eq!(*index, 0);
                assert_eq!(id, "call_1");
                assert_eq!(name, "execute_shell");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn multiple_events_in_one_chunk_all_parsed() {
        let chunk = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
        );
        let mut buf = chunk.to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn done_sentinel_parsed() {
        let mut buf = "data: [DONE]\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(ResponseEvent::Done)));
    }

    #[test]
    fn crlf_line_endings_handled() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\r\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(ResponseEvent::TextDelta(t)) if t == "hi"));
    }

    // ── Non-streaming responses ──────────────────────────────────────────────

    #[test]
    fn complete_response_with_text_only() {
        let v = json!({
            "choices": [{
                "message": { "role": "assistant", "content": "4" },
                "finish_reason": "stop"
            }]
        });
        let events: Vec<_> = parse_complete_response(&v)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert!(matches!(&events[0], ResponseEvent::TextDelta(t) if t == "4"));
        assert!(matches!(&events[1], ResponseEvent::Finished { reason } if reason == "stop"));
        assert!(matches!(events.last(), Some(ResponseEvent::Done)));
    }

    #[test]
    fn complete_response_with_tool_calls() {
        let v = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        { "id": "c1", "function": { "name": "a", "arguments": "{}" } },
                        { "id": "c2", "function": { "name": "b", "arguments": "{}" } }
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let events: Vec<_> = parse_complete_response(&v)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert!(matches!(&events[0], ResponseEvent::ToolCall { index: 0, id, .. } if id == "c1"));
        assert!(matches!(&events[1], ResponseEvent::ToolCall { index: 1, id, .. } if id == "c2"));
    }

    #[test]
    fn context_overflow_bodies_recognized() {
        assert!(is_context_overflow(
            r#"{"error":{"code":"context_length_exceeded"}}"#
        ));
        assert!(is_context_overflow(
            r#"{"error":{"type":"exceed_context_size_error","n_ctx":54272}}"#
        ));
        assert!(!is_context_overflow("rate limited"));
    }
}
