// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use tracing::{debug, warn};

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones; environment variables
/// override everything.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/qx/config.yaml"));
        paths.push(home.join(".config/qx/config.yml"));
    }

    paths.push(PathBuf::from(".qx.yaml"));
    paths.push(PathBuf::from(".qx.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then applying
/// `QX_*` environment variables on top.  `extra` may provide an explicit
/// path (e.g. a `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };

    apply_env(&mut config, &env_snapshot());
    Ok(config)
}

/// Load configuration from the environment alone (no YAML layers).
pub fn load_from_env() -> Config {
    let mut config = Config::default();
    apply_env(&mut config, &env_snapshot());
    config
}

fn env_snapshot() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("QX_"))
        .collect()
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

fn env_bool(env: &HashMap<String, String>, key: &str) -> Option<bool> {
    env.get(key).map(|v| v.trim().eq_ignore_ascii_case("true"))
}

fn env_parse<T: std::str::FromStr>(env: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = env.get(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}

/// Apply `QX_*` variables from `env` onto `config`.  Takes the variables as a
/// map so tests can exercise the overrides without touching process state.
pub(crate) fn apply_env(config: &mut Config, env: &HashMap<String, String>) {
    if let Some(name) = env.get("QX_MODEL_NAME") {
        config.model.name = name.clone();
    }
    if let Some(base) = env.get("QX_API_BASE") {
        config.model.base_url = Some(base.clone());
    }
    if let Some(key) = env.get("QX_API_KEY") {
        config.model.api_key = Some(key.clone());
    }
    if let Some(var) = env.get("QX_API_KEY_ENV") {
        config.model.api_key_env = Some(var.clone());
    }
    if let Some(t) = env_parse(env, "QX_TEMPERATURE") {
        config.model.temperature = Some(t);
    }
    if let Some(m) = env_parse(env, "QX_MAX_TOKENS") {
        config.model.max_tokens = Some(m);
    }
    if let Some(b) = env_bool(env, "QX_ENABLE_STREAMING") {
        config.model.enable_streaming = b;
    }
    if let Some(t) = env_parse(env, "QX_REQUEST_TIMEOUT") {
        config.model.request_timeout_secs = t;
    }
    if let Some(n) = env_parse(env, "QX_NUM_RETRIES") {
        config.model.num_retries = n;
    }

    if let Some(models) = env.get("QX_FALLBACK_MODELS") {
        config.reliability.fallback_models = models
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(raw) = env.get("QX_CONTEXT_WINDOW_FALLBACKS") {
        match serde_json::from_str(raw) {
            Ok(map) => config.reliability.context_window_fallbacks = map,
            Err(e) => warn!(error = %e, "invalid JSON in QX_CONTEXT_WINDOW_FALLBACKS, ignoring"),
        }
    }
    if let Some(t) = env_parse(env, "QX_FALLBACK_TIMEOUT") {
        config.reliability.fallback_timeout_secs = t;
    }
    if let Some(t) = env_parse(env, "QX_FALLBACK_COOLDOWN") {
        config.reliability.fallback_cooldown_secs = t;
    }
    if let Some(t) = env_parse(env, "QX_RETRY_DELAY") {
        config.reliability.retry_delay_secs = t;
    }
    if let Some(t) = env_parse(env, "QX_MAX_RETRY_DELAY") {
        config.reliability.max_retry_delay_secs = t;
    }
    if let Some(f) = env_parse(env, "QX_BACKOFF_FACTOR") {
        config.reliability.backoff_factor = f;
    }

    if let Some(b) = env_bool(env, "QX_SHOW_THINKING") {
        config.agent.show_thinking = b;
    }
    if let Some(b) = env_bool(env, "QX_SHOW_STDOUT") {
        config.agent.show_stdout = b;
    }
    if let Some(b) = env_bool(env, "QX_SHOW_STDERR") {
        config.agent.show_stderr = b;
    }
    if env.contains_key("QX_LOG_SENT") {
        config.agent.log_sent = true;
    }
    if env.contains_key("QX_LOG_RECEIVED") {
        config.agent.log_received = true;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
