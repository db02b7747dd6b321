// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-call dispatch: per-call validation, bounded-parallel execution, and
//! order-preserving result collection.
//!
//! Validation failures never reach a handler — they become error tool
//! results the model can react to on the next turn.  Valid calls all run
//! concurrently; results come back in the original call order regardless of
//! completion order, so the conversation history invariants hold.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::{
    tool::{ToolCall, ToolOutput},
    validate::parse_and_validate,
    ToolRegistry,
};

/// Owns a spawned tool task and aborts it if dropped before being joined,
/// so cancelling a turn mid-dispatch cancels the pending tool tasks instead
/// of leaking them into the background.
struct TaskGuard(Option<JoinHandle<ToolOutput>>);

impl TaskGuard {
    fn new(handle: JoinHandle<ToolOutput>) -> Self {
        Self(Some(handle))
    }

    async fn join(mut self) -> Result<ToolOutput, tokio::task::JoinError> {
        match self.0.take() {
            Some(handle) => handle.await,
            None => unreachable!("task joined twice"),
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(handle) = &self.0 {
            handle.abort();
        }
    }
}

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    /// Per-call execution ceiling; a timed-out call errors without
    /// affecting its siblings.
    tool_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, tool_timeout: Duration) -> Self {
        Self { registry, tool_timeout }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run every call and return one output per call, in call order.
    pub async fn dispatch(&self, calls: &[ToolCall]) -> Vec<ToolOutput> {
        enum Slot {
            Ready(ToolOutput),
            Running(TaskGuard),
        }

        let mut slots: Vec<Slot> = Vec::with_capacity(calls.len());

        for call in calls {
            let tool = match self.registry.resolve(&call.name) {
                Some(t) => t,
                None => {
                    error!(tool = %call.name, "model requested unknown tool");
                    slots.push(Slot::Ready(ToolOutput::err(
                        &call.id,
                        format!("Error: Unknown tool '{}'", call.name),
                    )));
                    continue;
                }
            };

            let args = match parse_and_validate(
                &call.name,
                &tool.parameters_schema(),
                &call.raw_args,
            ) {
                Ok(args) => args,
                Err(msg) => {
                    slots.push(Slot::Ready(ToolOutput::err(&call.id, msg)));
                    continue;
                }
            };

            let validated = ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                args,
                raw_args: call.raw_args.clone(),
            };
            let timeout = self.tool_timeout;
            debug!(tool = %validated.name, call_id = %validated.id, "dispatching tool call");
            slots.push(Slot::Running(TaskGuard::new(tokio::spawn(async move {
                match tokio::time::timeout(timeout, tool.execute(&validated)).await {
                    Ok(output) => output,
                    Err(_) => ToolOutput::err(
                        &validated.id,
                        format!(
                            "Error: Tool execution failed: tool '{}' timed out after {} seconds",
                            validated.name,
                            timeout.as_secs()
                        ),
                    ),
                }
            }))));
        }

        // Join in call order.  Tasks already run concurrently; awaiting them
        // sequentially only sequences the collection.
        let mut outputs = Vec::with_capacity(slots.len());
        for (i, slot) in slots.into_iter().enumerate() {
            match slot {
                Slot::Ready(output) => outputs.push(output),
                Slot::Running(guard) => match guard.join().await {
                    Ok(output) => outputs.push(output),
                    Err(e) => {
                        error!(error = %e, "tool task panicked");
                        outputs.push(ToolOutput::err(
                            &calls[i].id,
                            format!("Error: Tool execution failed: {e}"),
                        ));
                    }
                },
            }
        }
        outputs
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
