// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The agent run loop: drive one user turn to a terminal assistant message.
//!
//! An explicit loop with a bounded depth counter rather than recursion, so
//! stack depth stays constant and the ceiling check sits next to the
//! re-entry point.  Each iteration: serialize history → provider call →
//! stream → (maybe) dispatch tools → append results → go again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use qx_config::Config;
use qx_model::{CompletionClient, CompletionRequest, Message, ProviderError, ToolSchema};
use qx_tools::{Dispatcher, ToolRegistry};

use crate::{
    events::AgentEvent,
    prompts,
    store::MessageStore,
    streaming::{StreamEngine, StreamOutcome, StreamPhase},
};

/// Depth at which the model is told to wrap up without further tool calls.
pub const SOFT_DEPTH_LIMIT: u32 = 8;

/// Absolute ceiling; reaching it ends the turn with an error message.
pub const HARD_DEPTH_LIMIT: u32 = 50;

/// Ceiling for the non-streaming "try again" fallback request.
const TRY_AGAIN_TIMEOUT: Duration = Duration::from_secs(240);

/// What one user turn produced.  `messages` is the full history after the
/// turn, in store order.
#[derive(Debug)]
pub struct RunResult {
    pub output: String,
    pub messages: Vec<Message>,
}

pub struct Agent {
    session_id: String,
    store: MessageStore,
    registry: Arc<ToolRegistry>,
    dispatcher: Dispatcher,
    client: CompletionClient,
    config: Arc<Config>,
    engine: StreamEngine,
}

impl Agent {
    pub fn new(client: CompletionClient, registry: Arc<ToolRegistry>, config: Arc<Config>) -> Self {
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Duration::from_secs(config.tools.tool_timeout_secs),
        );
        let engine = StreamEngine::new(config.agent.show_thinking);
        let session_id = uuid::Uuid::new_v4().to_string();
        debug!(session = %session_id, model = %client.model_name(), "agent created");
        Self {
            session_id,
            store: MessageStore::new(),
            registry,
            dispatcher,
            client,
            config,
            engine,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Shrink the per-stream wall-clock ceiling (tests run on millisecond
    /// clocks).
    pub fn set_stream_ceiling(&mut self, d: Duration) {
        self.engine = StreamEngine::new(self.config.agent.show_thinking).with_max_duration(d);
    }

    /// Run one user turn.  Without a cancellation channel the turn runs to
    /// completion.
    pub async fn run(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<RunResult> {
        let (_keep_alive, cancel) = oneshot::channel();
        self.run_with_cancel(user_input, tx, cancel).await
    }

    /// Run one user turn with cancellation.  Sending on (or dropping) the
    /// paired sender aborts the turn at the next suspension point; any text
    /// already streamed is committed to the history.
    pub async fn run_with_cancel(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
        mut cancel: oneshot::Receiver<()>,
    ) -> anyhow::Result<RunResult> {
        // Already cancelled on entry: skip without touching history.
        match cancel.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => {}
            _ => return Ok(self.result(String::new())),
        }

        self.store
            .ensure_system(&prompts::system_prompt(self.config.agent.system_prompt.as_deref()));
        self.store.push(Message::user(user_input));

        let mut depth: u32 = 0;
        loop {
            let _ = tx.send(AgentEvent::Waiting).await;
            let req = self.build_request(self.config.model.enable_streaming);

            let completion = self.client.complete(req).await;
            let mut outcome = match completion {
                Ok(stream) => self.engine.consume(stream, &tx, &mut cancel).await,
                Err(ProviderError::Timeout) => {
                    match self.try_again_fallback(&tx, &mut cancel).await {
                        Some(o) => o,
                        None => {
                            return Ok(self.result("Request timed out and retry failed".into()))
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "provider call failed terminally");
                    let message = format!("Error: {e}");
                    let _ = tx.send(AgentEvent::Notice(message.clone())).await;
                    return Ok(self.result(message));
                }
            };

            match outcome.phase {
                StreamPhase::Cancelled => {
                    if !outcome.content.is_empty() {
                        self.store.push(Message::assistant(&outcome.content));
                    }
                    let _ = tx.send(AgentEvent::Notice("Response interrupted".into())).await;
                    return Ok(self.result(outcome.content));
                }
                // Stream stalled before producing anything: the try-again
                // fallback re-asks in non-streaming mode.
                StreamPhase::TimedOut if outcome.is_empty() => {
                    outcome = match self.try_again_fallback(&tx, &mut cancel).await {
                        Some(o) => o,
                        None => {
                            return Ok(self.result("Request timed out and retry failed".into()))
                        }
                    };
                }
                // Transport error before any content: retry once without
                // streaming, then fall back to try-again.
                StreamPhase::Errored if outcome.is_empty() => {
                    outcome = match self.non_streaming_retry(&tx, &mut cancel).await {
                        Some(o) => o,
                        None => match self.try_again_fallback(&tx, &mut cancel).await {
                            Some(o) => o,
                            None => {
                                return Ok(
                                    self.result("Error: streaming and fallback both failed".into())
                                )
                            }
                        },
                    };
                }
                _ => {}
            }

            if self.config.agent.log_received {
                debug!(
                    content = %outcome.content,
                    tool_calls = outcome.tool_calls.len(),
                    "received assistant message"
                );
            }

            if !outcome.content.is_empty() {
                self.store.push(Message::assistant(&outcome.content));
            }

            if outcome.tool_calls.is_empty() {
                let _ = tx.send(AgentEvent::TurnComplete).await;
                return Ok(self.result(outcome.content));
            }

            // Phase 1: record every tool call before any result, so the wire
            // serialization groups them into one assistant message.
            for call in &outcome.tool_calls {
                let _ = tx
                    .send(AgentEvent::ToolCallStarted {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                    })
                    .await;
                self.store
                    .push(Message::tool_call(&call.id, &call.name, &call.raw_args));
            }

            // Phase 2: concurrent execution.  On cancel the pending tasks
            // abort and every call gets a cancellation result, keeping the
            // tool-call group fully resolved.
            let outputs = tokio::select! {
                biased;
                _ = &mut cancel => None,
                outputs = self.dispatcher.dispatch(&outcome.tool_calls) => Some(outputs),
            };
            let outputs = match outputs {
                Some(o) => o,
                None => {
                    for call in &outcome.tool_calls {
                        self.store.push(Message::tool_result(
                            &call.id,
                            "Error: operation cancelled by user",
                        ));
                    }
                    let _ = tx.send(AgentEvent::Notice("Operation cancelled".into())).await;
                    return Ok(self.result(outcome.content));
                }
            };

            // Phase 3: record results in call order.
            for (call, output) in outcome.tool_calls.iter().zip(outputs.iter()) {
                if self.config.agent.log_sent {
                    debug!(
                        call_id = %call.id,
                        tool = %call.name,
                        content = %output.content,
                        "sending tool result to model"
                    );
                }
                let _ = tx
                    .send(AgentEvent::ToolCallFinished {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        output: output.content.clone(),
                        is_error: output.is_error,
                    })
                    .await;
                self.store.push(Message::tool_result(&call.id, &output.content));
            }

            depth += 1;
            if depth >= HARD_DEPTH_LIMIT {
                warn!(depth, "hard recursion ceiling reached, ending turn");
                let _ = tx.send(AgentEvent::TurnComplete).await;
                return Ok(self.result("Error: maximum tool-call depth reached; stopping.".into()));
            }
            if depth >= SOFT_DEPTH_LIMIT {
                let _ = tx.send(AgentEvent::DepthWarning(depth)).await;
                self.store.push(Message::user(
                    "Please provide a final response based on the tool results above. \
                     Do not make any more tool calls.",
                ));
            }
        }
    }

    fn result(&self, output: String) -> RunResult {
        RunResult {
            output,
            messages: self.store.messages().cloned().collect(),
        }
    }

    fn build_request(&mut self, stream: bool) -> CompletionRequest {
        let tools: Vec<ToolSchema> = self
            .registry
            .manifest()
            .into_iter()
            .map(|t| ToolSchema {
                name: t.name,
                description: t.description,
                parameters: t.parameters,
            })
            .collect();
        CompletionRequest {
            messages: self.store.serialize(),
            tools,
            stream,
            temperature: self.config.model.temperature,
            max_tokens: self.config.model.max_tokens,
        }
    }

    /// One plain (non-streaming) retry with the unchanged message history.
    async fn non_streaming_retry(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Option<StreamOutcome> {
        warn!("stream failed before content; retrying without streaming");
        let req = self.build_request(false);
        let timeout = Duration::from_secs(self.config.model.request_timeout_secs);
        match self.client.complete_once(req, timeout).await {
            Ok(stream) => {
                let outcome = self.engine.consume(stream, tx, cancel).await;
                match outcome.phase {
                    StreamPhase::Errored | StreamPhase::TimedOut if outcome.is_empty() => None,
                    _ => Some(outcome),
                }
            }
            Err(e) => {
                warn!(error = %e, "non-streaming retry failed");
                None
            }
        }
    }

    /// The timeout fallback: append a literal "try again" user message and
    /// re-ask in non-streaming mode with a larger ceiling.
    async fn try_again_fallback(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Option<StreamOutcome> {
        warn!("provider timed out after retries; engaging try-again fallback");
        let _ = tx
            .send(AgentEvent::Notice(
                "Request timed out after retries. Asking the model to try again...".into(),
            ))
            .await;
        self.store.push(Message::user("try again"));
        let req = self.build_request(false);
        match self.client.complete_once(req, TRY_AGAIN_TIMEOUT).await {
            Ok(stream) => {
                let outcome = self.engine.consume(stream, tx, cancel).await;
                match outcome.phase {
                    StreamPhase::Errored | StreamPhase::TimedOut if outcome.is_empty() => None,
                    _ => Some(outcome),
                }
            }
            Err(e) => {
                warn!(error = %e, "try-again fallback failed");
                None
            }
        }
    }
}
