// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Human-in-the-loop approval gate.
//!
//! Holds the session-wide "approve all" flag behind a mutex and mediates
//! every gated tool invocation through a single interactive prompt.  The
//! prompt itself is behind the [`ApprovalPrompt`] trait so the enclosing
//! application supplies the terminal interaction and tests script it — the
//! gate is never a process global.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::tool::ConsoleSink;

/// Outcome of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    Approved,
    Denied,
    /// Auto-approved because "approve all" is active for this session.
    SessionApproved,
    Cancelled,
}

/// Everything the prompt needs to render one approval question.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// e.g. "Write file", "Execute shell command"
    pub operation: String,
    /// e.g. "path", "command"
    pub parameter_name: String,
    pub parameter_value: String,
    /// The question, e.g. "Write to this file?"
    pub prompt: String,
    /// Optional preview (a unified diff for writes).
    pub preview: Option<String>,
}

/// Interactive input surface.  `choose` blocks (cooperatively) until the
/// user picks one of `valid`, full word or first letter, case-insensitive;
/// `None` means input was interrupted and maps to Cancelled.
#[async_trait]
pub trait ApprovalPrompt: Send + Sync {
    async fn choose(&self, prompt: &str, valid: &[char]) -> Option<char>;
}

pub struct ApprovalGate {
    approve_all: Mutex<bool>,
    /// At most one approval prompt may be active process-wide.
    prompt_lock: Mutex<()>,
    prompter: Arc<dyn ApprovalPrompt>,
    console: Arc<dyn ConsoleSink>,
}

impl ApprovalGate {
    pub fn new(prompter: Arc<dyn ApprovalPrompt>, console: Arc<dyn ConsoleSink>) -> Self {
        Self {
            approve_all: Mutex::new(false),
            prompt_lock: Mutex::new(()),
            prompter,
            console,
        }
    }

    pub async fn approve_all_active(&self) -> bool {
        *self.approve_all.lock().await
    }

    /// Explicit toggle (hotkey or CLI flag).  The flag is never persisted.
    pub async fn set_approve_all(&self, active: bool) {
        *self.approve_all.lock().await = active;
    }

    /// Ask the user to approve one operation.
    ///
    /// Returns the status plus the chosen key (`None` when the prompt was
    /// interrupted).  Never touches conversation state.
    pub async fn request(&self, req: ApprovalRequest) -> (ApprovalStatus, Option<char>) {
        if *self.approve_all.lock().await {
            return self.session_approve(&req);
        }

        let _active = self.prompt_lock.lock().await;

        // Re-check under the prompt lock: a concurrent call may have chosen
        // "All" while this one was waiting its turn to prompt.
        if *self.approve_all.lock().await {
            return self.session_approve(&req);
        }

        self.console
            .line(&format!("{}: {}", req.operation, req.parameter_value));
        if let Some(preview) = &req.preview {
            self.console.line(preview);
        }

        let prompt = format!("{} (Yes, No, All, Cancel) ", req.prompt);
        let chosen = self.prompter.choose(&prompt, &['y', 'n', 'a', 'c']).await;

        match chosen {
            Some('y') => (ApprovalStatus::Approved, Some('y')),
            Some('n') => (ApprovalStatus::Denied, Some('n')),
            Some('a') => {
                *self.approve_all.lock().await = true;
                self.console.line("'Approve All' activated for this session.");
                (ApprovalStatus::SessionApproved, Some('a'))
            }
            Some('c') => (ApprovalStatus::Cancelled, Some('c')),
            _ => (ApprovalStatus::Cancelled, None),
        }
    }

    fn session_approve(&self, req: &ApprovalRequest) -> (ApprovalStatus, Option<char>) {
        self.console.line(&format!(
            "{} (Auto-approved) {}: '{}'",
            req.operation, req.parameter_name, req.parameter_value
        ));
        (ApprovalStatus::SessionApproved, Some('a'))
    }
}

impl ApprovalRequest {
    pub fn new(
        operation: impl Into<String>,
        parameter_name: impl Into<String>,
        parameter_value: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            parameter_name: parameter_name.into(),
            parameter_value: parameter_value.into(),
            prompt: prompt.into(),
            preview: None,
        }
    }

    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.preview = Some(preview.into());
        self
    }
}

// ─── Test support ─────────────────────────────────────────────────────────────

/// Scripted prompter: pops pre-seeded answers and records every prompt it
/// was shown, so tests can assert on prompt counts and texts.
pub struct ScriptedPrompt {
    answers: std::sync::Mutex<std::collections::VecDeque<char>>,
    pub prompts_seen: std::sync::Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn new(answers: &[char]) -> Self {
        Self {
            answers: std::sync::Mutex::new(answers.iter().copied().collect()),
            prompts_seen: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts_seen.lock().expect("prompt lock").len()
    }
}

#[async_trait]
impl ApprovalPrompt for ScriptedPrompt {
    async fn choose(&self, prompt: &str, _valid: &[char]) -> Option<char> {
        self.prompts_seen
            .lock()
            .expect("prompt lock")
            .push(prompt.to_string());
        self.answers.lock().expect("prompt lock").pop_front()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::tool::NullSink;

    use super::*;

    fn gate(answers: &[char]) -> (ApprovalGate, Arc<ScriptedPrompt>) {
        let prompter = Arc::new(ScriptedPrompt::new(answers));
        let gate = ApprovalGate::new(prompter.clone(), Arc::new(NullSink));
        (gate, prompter)
    }

    fn req() -> ApprovalRequest {
        ApprovalRequest::new("Write file", "path", "/tmp/x", "Write to this file?")
    }

    #[tokio::test]
    async fn yes_approves_once() {
        let (gate, prompter) = gate(&['y']);
        let (status, key) = gate.request(req()).await;
        assert_eq!(status, ApprovalStatus::Approved);
        assert_eq!(key, Some('y'));
        assert_eq!(prompter.prompt_count(), 1);
        assert!(!gate.approve_all_active().await);
    }

    #[tokio::test]
    async fn no_denies() {
        let (gate, _) = gate(&['n']);
        let (status, _) = gate.request(req()).await;
        assert_eq!(status, ApprovalStatus::Denied);
    }

    #[tokio::test]
    async fn cancel_maps_to_cancelled() {
        let (gate, _) = gate(&['c']);
        let (status, _) = gate.request(req()).await;
        assert_eq!(status, ApprovalStatus::Cancelled);
    }

    #[tokio::test]
    async fn interrupted_prompt_is_cancelled() {
        let (gate, _) = gate(&[]);
        let (status, key) = gate.request(req()).await;
        assert_eq!(status, ApprovalStatus::Cancelled);
        assert_eq!(key, None);
    }

    #[tokio::test]
    async fn all_activates_session_approval() {
        let (gate, prompter) = gate(&['a']);
        let (status, key) = gate.request(req()).await;
        assert_eq!(status, ApprovalStatus::SessionApproved);
        assert_eq!(key, Some('a'));
        assert!(gate.approve_all_active().await);

        // Subsequent requests skip the prompt entirely.
        let (status, key) = gate.request(req()).await;
        assert_eq!(status, ApprovalStatus::SessionApproved);
        assert_eq!(key, Some('a'));
        assert_eq!(prompter.prompt_count(), 1, "no second interactive prompt");
    }

    #[tokio::test]
    async fn approve_all_preset_skips_all_prompts() {
        let (gate, prompter) = gate(&['n', 'n', 'n']);
        gate.set_approve_all(true).await;
        for _ in 0..3 {
            let (status, _) = gate.request(req()).await;
            assert_eq!(status, ApprovalStatus::SessionApproved);
        }
        assert_eq!(prompter.prompt_count(), 0);
    }

    #[tokio::test]
    async fn explicit_toggle_clears_the_flag() {
        let (gate, _) = gate(&['a', 'y']);
        let _ = gate.request(req()).await;
        assert!(gate.approve_all_active().await);
        gate.set_approve_all(false).await;
        let (status, _) = gate.request(req()).await;
        assert_eq!(status, ApprovalStatus::Approved, "prompting resumed after toggle");
    }
}
