// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Process-wide shared HTTP client.
//!
//! All provider and web-fetch traffic goes through one `reqwest::Client` so
//! connections are pooled and kept alive across calls.  HTTP/2 is negotiated
//! via ALPN when the server supports it.

use std::sync::OnceLock;
use std::time::Duration;

static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// The shared client.  Per-request timeouts are applied by callers; only the
/// connect timeout is fixed here.
pub fn client() -> &'static reqwest::Client {
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .expect("default TLS backend available")
    })
}
