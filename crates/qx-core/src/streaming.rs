// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming protocol engine.
//!
//! Consumes a provider response stream chunk by chunk: renders text through
//! the Markdown buffer, folds reasoning into the progress indicator (or
//! displays it), and accumulates sparse tool-call fragments keyed by the
//! provider's index.  Guards against provider pathologies — duplicate-chunk
//! floods, trailing empty chunks, and stalled streams — and recovers any
//! content the buffer had not yet released when the stream ended.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use qx_model::{ResponseEvent, ResponseStream};
use qx_tools::ToolCall;

use crate::{events::AgentEvent, markdown::MarkdownStreamBuffer};

/// Consecutive identical (or trailing-empty) chunks tolerated before the
/// stream is declared pathological.
const MAX_DUPLICATE_CHUNKS: u32 = 5;

/// Wall-clock ceiling for one streamed response.
const MAX_STREAM_DURATION: Duration = Duration::from_secs(300);

/// Spinner status lines are clipped to this width.
const STATUS_LINE_MAX: usize = 60;

/// Terminal state of one streamed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Request in flight, no payload yet.
    Spinning,
    StreamingContent,
    StreamingTools,
    StreamingBoth,
    Finished,
    Cancelled,
    TimedOut,
    Errored,
}

/// What one provider call produced.
#[derive(Debug)]
pub struct StreamOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub phase: StreamPhase,
    pub finish_reason: Option<String>,
}

impl StreamOutcome {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.tool_calls.is_empty()
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

pub struct StreamEngine {
    show_thinking: bool,
    max_stream_duration: Duration,
}

impl StreamEngine {
    pub fn new(show_thinking: bool) -> Self {
        Self {
            show_thinking,
            max_stream_duration: MAX_STREAM_DURATION,
        }
    }

    /// Shrink the stream ceiling (tests use millisecond clocks).
    pub fn with_max_duration(mut self, d: Duration) -> Self {
        self.max_stream_duration = d;
        self
    }

    /// Drive the stream to completion, emitting render events as they
    /// become safe.  Cancellation aborts the stream but preserves whatever
    /// already rendered; the partial outcome keeps history consistent.
    pub async fn consume(
        &self,
        mut stream: ResponseStream,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> StreamOutcome {
        let buffer = MarkdownStreamBuffer::new();
        let mut content = String::new();
        let mut rendered_len = 0usize;
        let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
        let mut finish_reason: Option<String> = None;

        let mut content_seen = false;
        let mut tools_seen = false;

        let mut last_chunk_content = String::new();
        let mut duplicate_chunk_count = 0u32;

        let start = Instant::now();

        let end_phase = loop {
            let remaining = match self.max_stream_duration.checked_sub(start.elapsed()) {
                Some(r) => r,
                None => {
                    warn!("stream exceeded wall-clock ceiling, aborting");
                    break StreamPhase::TimedOut;
                }
            };

            let next = tokio::select! {
                biased;
                _ = &mut *cancel => break StreamPhase::Cancelled,
                item = tokio::time::timeout(remaining, stream.next()) => item,
            };

            let item = match next {
                Err(_) => {
                    warn!("stream inactive past ceiling, aborting");
                    break StreamPhase::TimedOut;
                }
                // Stream ended without a finish_reason: treated as a
                // successful (possibly empty) turn.
                Ok(None) => break StreamPhase::Finished,
                Ok(Some(item)) => item,
            };

            let event = match item {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(error = %e, "stream error mid-response");
                    break StreamPhase::Errored;
                }
            };

            match event {
                ResponseEvent::ReasoningDelta(text) => {
                    if !self.guard_duplicates(&text, &mut last_chunk_content, &mut duplicate_chunk_count) {
                        break StreamPhase::Errored;
                    }
                    if text.trim().is_empty() {
                        continue;
                    }
                    if self.show_thinking {
                        let _ = tx.send(AgentEvent::ReasoningDelta(text)).await;
                    } else {
                        let _ = tx.send(AgentEvent::StatusUpdate(status_line(&text))).await;
                    }
                }
                ResponseEvent::TextDelta(text) if !text.is_empty() => {
                    if !self.guard_duplicates(&text, &mut last_chunk_content, &mut duplicate_chunk_count) {
                        break StreamPhase::Errored;
                    }
                    if !content_seen {
                        content_seen = true;
                        debug!(phase = ?streaming_phase(content_seen, tools_seen), "first content delta");
                    }
                    content.push_str(&text);
                    if let Some(release) = buffer.add(&text) {
                        rendered_len += release.len();
                        let _ = tx.send(AgentEvent::MarkdownRelease(release)).await;
                    }
                }
                ResponseEvent::TextDelta(_) => {
                    // Trailing empty deltas after real content often mean the
                    // provider has wedged; bail after a few.
                    if content_seen || rendered_len > 0 {
                        duplicate_chunk_count += 1;
                        if duplicate_chunk_count >= MAX_DUPLICATE_CHUNKS {
                            warn!("too many consecutive empty chunks, aborting stream");
                            break StreamPhase::Errored;
                        }
                    }
                }
                ResponseEvent::ToolCall { index, id, name, arguments } => {
                    if !tools_seen {
                        tools_seen = true;
                        debug!(phase = ?streaming_phase(content_seen, tools_seen), "first tool-call delta");
                    }
                    let slot = pending.entry(index).or_default();
                    if !id.is_empty() {
                        slot.id = id;
                    }
                    if !name.is_empty() {
                        slot.name = name;
                    }
                    slot.arguments.push_str(&arguments);
                }
                ResponseEvent::Finished { reason } => {
                    finish_reason = Some(reason);
                    break StreamPhase::Finished;
                }
                ResponseEvent::Done => break StreamPhase::Finished,
            }
        };

        // Flush the buffer and render the residue.
        let residue = buffer.flush();
        if !residue.is_empty() {
            rendered_len += residue.len();
            let _ = tx.send(AgentEvent::MarkdownRelease(residue)).await;
        }

        // Recover content the release path lost.  Releases are an exact
        // prefix of the accumulated content, so the missing part is the
        // suffix past the rendered length.
        if rendered_len < content.len() {
            let missing = content[rendered_len..].to_string();
            warn!(
                accumulated = content.len(),
                rendered = rendered_len,
                "render shortfall, recovering lost suffix"
            );
            if !missing.trim().is_empty() {
                let _ = tx.send(AgentEvent::MarkdownRelease(missing)).await;
            }
        }

        // Materialize the sparse map in index order, dropping fragments the
        // provider never identified — an entry with neither id nor name
        // cannot be dispatched or recorded.
        let mut tool_calls = Vec::with_capacity(pending.len());
        for (index, slot) in pending {
            if slot.id.is_empty() && slot.name.is_empty() {
                warn!(index, "dropping unidentified tool-call fragment");
                continue;
            }
            tool_calls.push(ToolCall::raw(slot.id, slot.name, slot.arguments));
        }

        debug!(
            content_len = content.len(),
            tool_calls = tool_calls.len(),
            phase = ?end_phase,
            "stream complete"
        );

        StreamOutcome {
            content,
            tool_calls,
            phase: end_phase,
            finish_reason,
        }
    }

    /// Returns false when the duplicate-flood threshold is crossed.
    fn guard_duplicates(
        &self,
        chunk: &str,
        last: &mut String,
        count: &mut u32,
    ) -> bool {
        if !chunk.is_empty() && chunk == last {
            *count += 1;
            if *count >= MAX_DUPLICATE_CHUNKS {
                warn!(count = *count, "duplicate chunk flood, aborting stream");
                return false;
            }
        } else {
            *count = 0;
            *last = chunk.to_string();
        }
        true
    }
}

fn streaming_phase(content_seen: bool, tools_seen: bool) -> StreamPhase {
    match (content_seen, tools_seen) {
        (true, true) => StreamPhase::StreamingBoth,
        (true, false) => StreamPhase::StreamingContent,
        (false, true) => StreamPhase::StreamingTools,
        (false, false) => StreamPhase::Spinning,
    }
}

/// First line of a reasoning chunk, clipped for the progress indicator.
fn status_line(text: &str) -> String {
    let first = text.trim().lines().next().unwrap_or("").to_string();
    if first.len() > STATUS_LINE_MAX {
        let cut = first
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= STATUS_LINE_MAX - 3)
            .last()
            .unwrap_or(0);
        format!("{}...", &first[..cut])
    } else {
        first
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::stream;
    use qx_model::ProviderError;

    use super::*;

    fn stream_of(events: Vec<ResponseEvent>) -> ResponseStream {
        let items: Vec<Result<ResponseEvent, ProviderError>> =
            events.into_iter().map(Ok).collect();
        Box::pin(stream::iter(items))
    }

    async fn consume_collect(
        engine: &StreamEngine,
        s: ResponseStream,
    ) -> (StreamOutcome, Vec<AgentEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let (_keep, mut cancel) = oneshot::channel::<()>();
        let outcome = engine.consume(s, &tx, &mut cancel).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        (outcome, events)
    }

    fn releases(events: &[AgentEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::MarkdownRelease(r) => Some(r.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn text_stream_accumulates_and_finishes() {
        let engine = StreamEngine::new(false);
        let s = stream_of(vec![
            ResponseEvent::TextDelta("Hello ".into()),
            ResponseEvent::TextDelta("world.".into()),
            ResponseEvent::Finished { reason: "stop".into() },
        ]);
        let (outcome, events) = consume_collect(&engine, s).await;
        assert_eq!(outcome.content, "Hello world.");
        assert_eq!(outcome.phase, StreamPhase::Finished);
        assert_eq!(outcome.finish_reason.as_deref(), Some("stop"));
        assert_eq!(releases(&events), "Hello world.", "lossless render");
    }

    #[tokio::test]
    async fn tool_call_fragments_merge_by_index() {
        let engine = StreamEngine::new(false);
        let s = stream_of(vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "c1".into(),
                name: "read_file".into(),
                arguments: "{\"pa".into(),
            },
            ResponseEvent::ToolCall {
                index: 0,
                id: String::new(),
                name: String::new(),
                arguments: "th\":\".\"}".into(),
            },
            ResponseEvent::Finished { reason: "tool_calls".into() },
        ]);
        let (outcome, _) = consume_collect(&engine, s).await;
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].id, "c1");
        assert_eq!(outcome.tool_calls[0].name, "read_file");
        assert_eq!(outcome.tool_calls[0].raw_args, "{\"path\":\".\"}");
    }

    #[tokio::test]
    async fn parallel_tool_calls_ordered_by_index() {
        let engine = StreamEngine::new(false);
        let s = stream_of(vec![
            ResponseEvent::ToolCall {
                index: 1,
                id: "c2".into(),
                name: "fast".into(),
                arguments: "{}".into(),
            },
            ResponseEvent::ToolCall {
                index: 0,
                id: "c1".into(),
                name: "slow".into(),
                arguments: "{}".into(),
            },
            ResponseEvent::Finished { reason: "tool_calls".into() },
        ]);
        let (outcome, _) = consume_collect(&engine, s).await;
        let ids: Vec<&str> = outcome.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"], "index order, not arrival order");
    }

    #[tokio::test]
    async fn unidentified_fragment_is_dropped() {
        let engine = StreamEngine::new(false);
        let s = stream_of(vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: String::new(),
                name: String::new(),
                arguments: "{\"orphan\":true}".into(),
            },
            ResponseEvent::ToolCall {
                index: 1,
                id: "c1".into(),
                name: "real".into(),
                arguments: "{}".into(),
            },
            ResponseEvent::Done,
        ]);
        let (outcome, _) = consume_collect(&engine, s).await;
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].name, "real");
    }

    #[tokio::test]
    async fn duplicate_chunk_flood_aborts() {
        let engine = StreamEngine::new(false);
        let mut events = vec![ResponseEvent::TextDelta("start ".into())];
        for _ in 0..8 {
            events.push(ResponseEvent::TextDelta("loop".into()));
        }
        events.push(ResponseEvent::TextDelta("never reached".into()));
        events.push(ResponseEvent::Finished { reason: "stop".into() });

        let (outcome, _) = consume_collect(&engine, stream_of(events)).await;
        assert_eq!(outcome.phase, StreamPhase::Errored);
        assert!(!outcome.content.contains("never reached"));
        // Partial content is preserved.
        assert!(outcome.content.starts_with("start "));
    }

    #[tokio::test]
    async fn empty_chunk_flood_after_content_aborts() {
        let engine = StreamEngine::new(false);
        let mut events = vec![ResponseEvent::TextDelta("answer".into())];
        for _ in 0..6 {
            events.push(ResponseEvent::TextDelta(String::new()));
        }
        events.push(ResponseEvent::Finished { reason: "stop".into() });
        let (outcome, _) = consume_collect(&engine, stream_of(events)).await;
        assert_eq!(outcome.phase, StreamPhase::Errored);
        assert_eq!(outcome.content, "answer");
    }

    #[tokio::test]
    async fn empty_chunks_before_content_are_harmless() {
        let engine = StreamEngine::new(false);
        let mut events: Vec<ResponseEvent> =
            (0..10).map(|_| ResponseEvent::TextDelta(String::new())).collect();
        events.push(ResponseEvent::TextDelta("late answer".into()));
        events.push(ResponseEvent::Finished { reason: "stop".into() });
        let (outcome, _) = consume_collect(&engine, stream_of(events)).await;
        assert_eq!(outcome.phase, StreamPhase::Finished);
        assert_eq!(outcome.content, "late answer");
    }

    #[tokio::test]
    async fn stalled_stream_times_out() {
        let engine = StreamEngine::new(false).with_max_duration(Duration::from_millis(30));
        let s: ResponseStream = Box::pin(stream::pending());
        let (outcome, _) = consume_collect(&engine, s).await;
        assert_eq!(outcome.phase, StreamPhase::TimedOut);
        assert!(outcome.is_empty());
    }

    #[tokio::test]
    async fn cancel_preserves_rendered_content() {
        let engine = StreamEngine::new(false);
        let (tx, mut rx) = mpsc::channel(64);
        let (cancel_tx, mut cancel) = oneshot::channel::<()>();

        // A stream that emits one delta then hangs forever.
        let head = stream::iter(vec![Ok(ResponseEvent::TextDelta("partial answer".into()))]);
        let s: ResponseStream = Box::pin(head.chain(stream::pending()));

        let _ = cancel_tx.send(());
        let outcome = engine.consume(s, &tx, &mut cancel).await;
        drop(tx);
        let mut got = Vec::new();
        while let Some(ev) = rx.recv().await {
            got.push(ev);
        }

        assert_eq!(outcome.phase, StreamPhase::Cancelled);
        // The flush path still recovers anything buffered before the cancel.
        assert!(outcome.content.is_empty() || releases(&got) == outcome.content);
    }

    #[tokio::test]
    async fn mid_stream_error_preserves_content() {
        let engine = StreamEngine::new(false);
        let items: Vec<Result<ResponseEvent, ProviderError>> = vec![
            Ok(ResponseEvent::TextDelta("kept text. ".into())),
            Err(ProviderError::Transport("connection reset".into())),
        ];
        let s: ResponseStream = Box::pin(stream::iter(items));
        let (tx, _rx) = mpsc::channel(64);
        let (_keep, mut cancel) = oneshot::channel::<()>();
        let outcome = engine.consume(s, &tx, &mut cancel).await;
        assert_eq!(outcome.phase, StreamPhase::Errored);
        assert_eq!(outcome.content, "kept text. ");
    }

    #[tokio::test]
    async fn reasoning_suppressed_becomes_status_update() {
        let engine = StreamEngine::new(false);
        let s = stream_of(vec![
            ResponseEvent::ReasoningDelta("Considering the question carefully\nmore".into()),
            ResponseEvent::TextDelta("42".into()),
            ResponseEvent::Finished { reason: "stop".into() },
        ]);
        let (outcome, events) = consume_collect(&engine, s).await;
        assert_eq!(outcome.content, "42", "reasoning never joins content");
        assert!(events.iter().any(
            |e| matches!(e, AgentEvent::StatusUpdate(s) if s == "Considering the question carefully")
        ));
        assert!(!events.iter().any(|e| matches!(e, AgentEvent::ReasoningDelta(_))));
    }

    #[tokio::test]
    async fn reasoning_shown_when_thinking_enabled() {
        let engine = StreamEngine::new(true);
        let s = stream_of(vec![
            ResponseEvent::ReasoningDelta("step 1".into()),
            ResponseEvent::Finished { reason: "stop".into() },
        ]);
        let (outcome, events) = consume_collect(&engine, s).await;
        assert!(outcome.content.is_empty());
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ReasoningDelta(r) if r == "step 1")));
    }

    #[tokio::test]
    async fn code_block_split_across_chunks_releases_whole() {
        let engine = StreamEngine::new(false);
        let s = stream_of(vec![
            ResponseEvent::TextDelta("```python\n".into()),
            ResponseEvent::TextDelta("print('hi')\n".into()),
            ResponseEvent::TextDelta("```".into()),
            ResponseEvent::TextDelta("\nDone.\n".into()),
            ResponseEvent::Finished { reason: "stop".into() },
        ]);
        let (outcome, events) = consume_collect(&engine, s).await;
        let all = releases(&events);
        assert_eq!(all, outcome.content, "lossless");
        // No release may split the fence.
        for ev in &events {
            if let AgentEvent::MarkdownRelease(r) = ev {
                assert_eq!(r.matches("```").count() % 2, 0, "split fence in {r:?}");
            }
        }
    }

    #[tokio::test]
    async fn stream_ending_without_finish_reason_is_empty_success() {
        let engine = StreamEngine::new(false);
        let (outcome, _) = consume_collect(&engine, stream_of(vec![])).await;
        assert_eq!(outcome.phase, StreamPhase::Finished);
        assert!(outcome.is_empty());
        assert!(outcome.finish_reason.is_none());
    }

    #[test]
    fn status_line_clips_long_first_lines() {
        let long = "x".repeat(200);
        let s = status_line(&long);
        assert!(s.len() <= STATUS_LINE_MAX + 3);
        assert!(s.ends_with("..."));
        assert_eq!(status_line("short\nrest"), "short");
    }
}
