// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::ResponseStream, CompletionRequest, ModelProvider, ProviderError, ResponseEvent,
};

/// One scripted provider call: a full event sequence, an error, or a stream
/// that never produces a chunk (for exercising inactivity timeouts).
#[derive(Debug, Clone)]
pub enum ScriptedCall {
    Respond(Vec<ResponseEvent>),
    Fail(ProviderError),
    Hang,
}

/// A pre-scripted provider.  Each `complete` call pops the next script from
/// the front of the queue, so tests specify exact event sequences —
/// including tool calls and injected failures — without network access.
pub struct ScriptedMockProvider {
    scripts: Mutex<VecDeque<ScriptedCall>>,
    /// The last `CompletionRequest` seen, for request-shape assertions.
    pub last_request: Mutex<Option<CompletionRequest>>,
    /// Total number of `complete` calls observed.
    pub calls: AtomicUsize,
}

impl ScriptedMockProvider {
    pub fn new(scripts: Vec<ScriptedCall>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            last_request: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Provider that replies to every call with the given event sequences in
    /// order.
    pub fn from_events(calls: Vec<Vec<ResponseEvent>>) -> Self {
        Self::new(calls.into_iter().map(ScriptedCall::Respond).collect())
    }

    /// Convenience: a single text reply, streamed as one delta.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::from_events(vec![text_turn(reply)])
    }

    /// Convenience: a single reply streamed as the given chunks.
    pub fn text_chunks(chunks: &[&str]) -> Self {
        let mut events: Vec<ResponseEvent> = chunks
            .iter()
            .map(|c| ResponseEvent::TextDelta(c.to_string()))
            .collect();
        events.push(ResponseEvent::Finished { reason: "stop".into() });
        events.push(ResponseEvent::Done);
        Self::from_events(vec![events])
    }

    /// Convenience: first call emits one tool call, second call replies with
    /// text.  The standard two-turn tool round-trip.
    pub fn tool_then_text(
        id: &str,
        name: &str,
        arguments: &str,
        reply: impl Into<String>,
    ) -> Self {
        Self::from_events(vec![tool_call_turn(&[(id, name, arguments)]), text_turn(reply)])
    }

    pub fn calls_seen(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Events for a plain text turn.
pub fn text_turn(reply: impl Into<String>) -> Vec<ResponseEvent> {
    vec![
        ResponseEvent::TextDelta(reply.into()),
        ResponseEvent::Finished { reason: "stop".into() },
        ResponseEvent::Done,
    ]
}

/// Events for a turn that emits the given `(id, name, arguments)` calls.
pub fn tool_call_turn(calls: &[(&str, &str, &str)]) -> Vec<ResponseEvent> {
    let mut events: Vec<ResponseEvent> = calls
        .iter()
        .enumerate()
        .map(|(i, (id, name, args))| ResponseEvent::ToolCall {
            index: i as u32,
            id: id.to_string(),
            name: name.to_string(),
            arguments: args.to_string(),
        })
        .collect();
    events.push(ResponseEvent::Finished { reason: "tool_calls".into() });
    events.push(ResponseEvent::Done);
    events
}

#[async_trait]
impl ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().expect("mock lock") = Some(req);

        let next = self.scripts.lock().expect("mock lock").pop_front();
        match next {
            Some(ScriptedCall::Respond(events)) => {
                let items: Vec<Result<ResponseEvent, ProviderError>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
            Some(ScriptedCall::Fail(e)) => Err(e),
            Some(ScriptedCall::Hang) => {
                let pending: ResponseStream = Box::pin(stream::pending());
                Ok(pending)
            }
            // Script exhausted: behave like an empty successful turn.
            None => Ok(Box::pin(stream::iter(vec![Ok(ResponseEvent::Done)]))),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn always_text_emits_delta_then_done() {
        let p = ScriptedMockProvider::always_text("hi");
        let mut s = p.complete(CompletionRequest::default()).await.unwrap();
        let first = s.next().await.unwrap().unwrap();
        assert!(matches!(first, ResponseEvent::TextDelta(t) if t == "hi"));
    }

    #[tokio::test]
    async fn scripts_pop_in_order() {
        let p = ScriptedMockProvider::from_events(vec![text_turn("one"), text_turn("two")]);
        let mut s1 = p.complete(CompletionRequest::default()).await.unwrap();
        let ev = s1.next().await.unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "one"));

        let mut s2 = p.complete(CompletionRequest::default()).await.unwrap();
        let ev = s2.next().await.unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "two"));
        assert_eq!(p.calls_seen(), 2);
    }

    #[tokio::test]
    async fn fail_script_returns_error() {
        let p = ScriptedMockProvider::new(vec![ScriptedCall::Fail(ProviderError::Timeout)]);
        let err = match p.complete(CompletionRequest::default()).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, ProviderError::Timeout));
    }

    #[tokio::test]
    async fn last_request_records_what_was_sent() {
        let p = ScriptedMockProvider::always_text("x");
        let req = CompletionRequest { stream: true, ..Default::default() };
        let _ = p.complete(req).await.unwrap();
        let seen = p.last_request.lock().unwrap();
        assert!(seen.as_ref().unwrap().stream);
    }
}
