// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

/// Failures surfaced by provider calls.  The run loop branches on these to
/// pick a recovery path, so they are typed rather than stringly `anyhow`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,

    #[error("circuit breaker open; retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("context window exceeded: {0}")]
    ContextOverflow(String),

    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Whether a retry under backoff can plausibly succeed.
    ///
    /// Client errors (4xx other than 429) and context overflows are
    /// deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::CircuitOpen { .. } | Self::ContextOverflow(_) => false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_transport_are_retryable() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Transport("reset".into()).is_retryable());
    }

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert!(ProviderError::Http { status: 500, body: String::new() }.is_retryable());
        assert!(ProviderError::Http { status: 429, body: String::new() }.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!ProviderError::Http { status: 400, body: String::new() }.is_retryable());
        assert!(!ProviderError::Http { status: 401, body: String::new() }.is_retryable());
    }

    #[test]
    fn overflow_and_open_circuit_are_not_retryable() {
        assert!(!ProviderError::ContextOverflow("n_ctx".into()).is_retryable());
        assert!(!ProviderError::CircuitOpen { retry_in: Duration::from_secs(1) }.is_retryable());
    }
}
