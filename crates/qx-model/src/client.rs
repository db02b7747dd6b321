// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Provider-call reliability layer: retries with exponential backoff, a
//! consecutive-failure circuit breaker, ordered fallback models, and
//! context-window rerouting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use qx_config::Config;

use crate::{
    provider::ResponseStream, CompletionRequest, ModelProvider, OpenAiCompatProvider,
    ProviderError,
};

/// Exponential backoff between retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let secs = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Trips open after N consecutive provider failures; while open, calls
/// short-circuit with [`ProviderError::CircuitOpen`] until the cool-down
/// elapses.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Err when the circuit is open.  An expired cool-down closes the
    /// circuit half-open: the next call is allowed through.
    pub fn check(&self) -> Result<(), ProviderError> {
        let mut state = self.state.lock().expect("breaker lock");
        if let Some(until) = state.open_until {
            let now = Instant::now();
            if now < until {
                return Err(ProviderError::CircuitOpen { retry_in: until - now });
            }
            state.open_until = None;
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock");
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock");
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.open_until = Some(Instant::now() + self.cooldown);
            warn!(
                failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs_f64(),
                "circuit breaker opened"
            );
        }
    }
}

/// Consecutive failures that open the circuit.
const BREAKER_THRESHOLD: u32 = 5;

/// Wraps a primary provider with the reliability policy.  This is what the
/// run loop calls; it never talks to a [`ModelProvider`] directly.
pub struct CompletionClient {
    primary: Arc<dyn ModelProvider>,
    fallbacks: Vec<Arc<dyn ModelProvider>>,
    /// Larger-window model per primary model name, consulted on context
    /// overflow.
    context_fallbacks: HashMap<String, Arc<dyn ModelProvider>>,
    retries: u32,
    request_timeout: Duration,
    fallback_timeout: Duration,
    backoff: BackoffPolicy,
    breaker: CircuitBreaker,
}

impl CompletionClient {
    /// Build the full client from configuration, constructing an
    /// OpenAI-compatible provider per configured model name.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        cfg.validate()?;
        let key = cfg.model.resolve_api_key();
        let base = cfg.model.base_url.as_deref();
        let mk = |model: &str| -> Arc<dyn ModelProvider> {
            Arc::new(OpenAiCompatProvider::new(
                model.to_string(),
                key.clone(),
                base,
                cfg.model.temperature,
                cfg.model.max_tokens,
            ))
        };

        let fallbacks = cfg
            .reliability
            .fallback_models
            .iter()
            .map(|m| mk(m))
            .collect();
        let context_fallbacks = cfg
            .reliability
            .context_window_fallbacks
            .iter()
            .map(|(from, to)| (from.clone(), mk(to)))
            .collect();

        Ok(Self {
            primary: mk(&cfg.model.name),
            fallbacks,
            context_fallbacks,
            retries: cfg.model.num_retries,
            request_timeout: Duration::from_secs(cfg.model.request_timeout_secs),
            fallback_timeout: Duration::from_secs_f64(cfg.reliability.fallback_timeout_secs),
            backoff: BackoffPolicy {
                initial: Duration::from_secs_f64(cfg.reliability.retry_delay_secs),
                factor: cfg.reliability.backoff_factor,
                max: Duration::from_secs_f64(cfg.reliability.max_retry_delay_secs),
            },
            breaker: CircuitBreaker::new(
                BREAKER_THRESHOLD,
                Duration::from_secs_f64(cfg.reliability.fallback_cooldown_secs),
            ),
        })
    }

    /// Client over explicit providers; used by tests and embedders.
    pub fn with_providers(
        primary: Arc<dyn ModelProvider>,
        fallbacks: Vec<Arc<dyn ModelProvider>>,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            context_fallbacks: HashMap::new(),
            retries: 3,
            request_timeout: Duration::from_secs(120),
            fallback_timeout: Duration::from_secs(45),
            backoff: BackoffPolicy::default(),
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, Duration::from_secs(60)),
        }
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker = CircuitBreaker::new(threshold, cooldown);
        self
    }

    pub fn context_fallback(
        mut self,
        model: impl Into<String>,
        provider: Arc<dyn ModelProvider>,
    ) -> Self {
        self.context_fallbacks.insert(model.into(), provider);
        self
    }

    pub fn model_name(&self) -> &str {
        self.primary.model_name()
    }

    /// Execute a provider call under the full reliability policy.
    pub async fn complete(
        &self,
        req: CompletionRequest,
    ) -> Result<ResponseStream, ProviderError> {
        self.breaker.check()?;

        let mut last_err = ProviderError::Transport("no provider attempt made".into());

        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
            }
            match self.call_one(&*self.primary, req.clone(), self.request_timeout).await {
                Ok(stream) => {
                    self.breaker.record_success();
                    return Ok(stream);
                }
                Err(ProviderError::ContextOverflow(detail)) => {
                    // Deterministic failure: reroute to the configured
                    // larger-window model instead of retrying.
                    if let Some(larger) = self.context_fallbacks.get(self.primary.model_name()) {
                        warn!(
                            model = self.primary.model_name(),
                            reroute = larger.model_name(),
                            "context window exceeded; rerouting"
                        );
                        match self.call_one(&**larger, req.clone(), self.request_timeout).await {
                            Ok(stream) => {
                                self.breaker.record_success();
                                return Ok(stream);
                            }
                            Err(e) => last_err = e,
                        }
                    } else {
                        last_err = ProviderError::ContextOverflow(detail);
                    }
                    break;
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    warn!(attempt, error = %e, "provider call failed");
                    last_err = e;
                    if !retryable {
                        break;
                    }
                }
            }
        }

        // Primary exhausted: try fallback models in order, one attempt each.
        for fb in &self.fallbacks {
            match self.call_one(&**fb, req.clone(), self.fallback_timeout).await {
                Ok(stream) => {
                    warn!(model = fb.model_name(), "fallback model answered");
                    self.breaker.record_success();
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(model = fb.model_name(), error = %e, "fallback model failed");
                    last_err = e;
                }
            }
        }

        self.breaker.record_failure();
        Err(last_err)
    }

    /// One direct attempt against the primary provider with an explicit
    /// timeout — no retries, no fallback models.  Used by the run loop's
    /// "try again" path, which carries its own larger ceiling.
    pub async fn complete_once(
        &self,
        req: CompletionRequest,
        timeout: Duration,
    ) -> Result<ResponseStream, ProviderError> {
        self.call_one(&*self.primary, req, timeout).await
    }

    async fn call_one(
        &self,
        provider: &dyn ModelProvider,
        req: CompletionRequest,
        timeout: Duration,
    ) -> Result<ResponseStream, ProviderError> {
        match tokio::time::timeout(timeout, provider.complete(req)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
