// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be on unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    120
}

fn default_num_retries() -> u32 {
    3
}

fn default_tool_timeout() -> u64 {
    120
}

fn default_fallback_timeout() -> f64 {
    45.0
}

fn default_fallback_cooldown() -> f64 {
    60.0
}

fn default_retry_delay() -> f64 {
    1.0
}

fn default_max_retry_delay() -> f64 {
    60.0
}

fn default_backoff_factor() -> f64 {
    2.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

impl Config {
    /// Check the invariants that must hold before an agent loop may start.
    ///
    /// A missing model name or unresolvable credentials is a fatal
    /// configuration error: it is reported to the caller here rather than
    /// surfacing as a cryptic HTTP failure mid-turn.  A custom `base_url`
    /// waives the credential requirement (local servers accept no key).
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.model.name.trim().is_empty() {
            anyhow::bail!(
                "no model configured: set QX_MODEL_NAME or model.name in the config file"
            );
        }
        if self.model.base_url.is_none() && self.model.resolve_api_key().is_none() {
            anyhow::bail!(
                "no API key found: set QX_API_KEY, point QX_API_KEY_ENV at a variable \
                 that holds one, or set one of OPENROUTER_API_KEY / OPENAI_API_KEY / \
                 ANTHROPIC_API_KEY"
            );
        }
        Ok(())
    }
}

/// Well-known credential variables probed when no explicit key is configured.
const DEFAULT_KEY_ENV_VARS: &[&str] = &[
    "OPENROUTER_API_KEY",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "AZURE_API_KEY",
    "GOOGLE_API_KEY",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier forwarded to the provider API.  Required; there is
    /// deliberately no default so users make an informed choice about model
    /// selection and cost.
    #[serde(default)]
    pub name: String,
    /// API base URL override (ends before `/chat/completions`).
    pub base_url: Option<String>,
    /// Explicit API key; prefer `api_key_env` in config files to keep secrets
    /// out of version control.
    pub api_key: Option<String>,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Stream responses token-by-token.  Disable for providers whose SSE
    /// implementation is broken.
    #[serde(default = "default_true")]
    pub enable_streaming: bool,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Low-level retries per provider call.
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_url: None,
            api_key: None,
            api_key_env: None,
            temperature: None,
            max_tokens: None,
            enable_streaming: true,
            request_timeout_secs: default_request_timeout(),
            num_retries: default_num_retries(),
        }
    }
}

impl ModelConfig {
    /// Resolve the API key: explicit key, then the configured env var, then
    /// the well-known provider variables in order.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.clone());
        }
        if let Some(env) = &self.api_key_env {
            return std::env::var(env).ok();
        }
        DEFAULT_KEY_ENV_VARS
            .iter()
            .find_map(|v| std::env::var(v).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Full system prompt override.  When unset the built-in template is
    /// used, with its context slots filled from the environment.
    pub system_prompt: Option<String>,
    /// Render the model's reasoning stream instead of folding it into the
    /// progress indicator.
    #[serde(default)]
    pub show_thinking: bool,
    /// Echo tool stdout to the console as commands run.
    #[serde(default = "default_true")]
    pub show_stdout: bool,
    /// Echo tool stderr to the console.  On by default so failures are
    /// visible while a command is still running.
    #[serde(default = "default_true")]
    pub show_stderr: bool,
    /// Debug-log every tool result sent to the model.
    #[serde(default)]
    pub log_sent: bool,
    /// Debug-log every assembled assistant message received from the model.
    #[serde(default)]
    pub log_received: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            show_thinking: false,
            show_stdout: true,
            show_stderr: true,
            log_sent: false,
            log_received: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Per-tool execution timeout in seconds.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Shell commands denied outright (fnmatch-style patterns matched
    /// against the whole command, checked first).  A prohibited match is
    /// binding even while "approve all" is active.
    #[serde(default = "ToolsConfig::default_prohibited")]
    pub prohibited_commands: Vec<String>,
    /// Shell commands that run without asking (fnmatch-style patterns).
    #[serde(default = "ToolsConfig::default_auto_approved")]
    pub auto_approved_commands: Vec<String>,
}

impl ToolsConfig {
    /// Privilege escalation, root/home deletion, and device-level writes.
    fn default_prohibited() -> Vec<String> {
        [
            "sudo",
            "sudo *",
            "rm -rf /",
            "rm -rf /*",
            "rm -rf ~",
            "rm -rf ~/*",
            "mkfs*",
            "dd if=*",
            "shutdown*",
            "reboot*",
            "halt",
            "init 0",
            "> /dev/*",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Read-only inspection commands, plus git as a whole.
    fn default_auto_approved() -> Vec<String> {
        ["git*", "ls", "ls *", "pwd", "whoami", "date", "uname*", "which *"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout(),
            prohibited_commands: Self::default_prohibited(),
            auto_approved_commands: Self::default_auto_approved(),
        }
    }
}

/// Retry, fallback, and circuit-breaker knobs for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Models tried in order when the primary model fails.
    #[serde(default)]
    pub fallback_models: Vec<String>,
    /// Map of model → larger-window model used when a request overflows the
    /// context window.
    #[serde(default)]
    pub context_window_fallbacks: HashMap<String, String>,
    /// Timeout for fallback-model attempts, seconds.
    #[serde(default = "default_fallback_timeout")]
    pub fallback_timeout_secs: f64,
    /// Circuit-breaker cool-down after repeated failures, seconds.
    #[serde(default = "default_fallback_cooldown")]
    pub fallback_cooldown_secs: f64,
    /// Initial delay between retries, seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: f64,
    /// Ceiling on the backoff delay, seconds.
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: f64,
    /// Multiplier applied to the delay after each retry.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            fallback_models: Vec::new(),
            context_window_fallbacks: HashMap::new(),
            fallback_timeout_secs: default_fallback_timeout(),
            fallback_cooldown_secs: default_fallback_cooldown(),
            retry_delay_secs: default_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
