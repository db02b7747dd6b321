// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
pub mod client;
pub mod http;
pub mod mock;
pub mod wire;
mod error;
mod openai_compat;
mod provider;
mod types;

pub use client::{BackoffPolicy, CircuitBreaker, CompletionClient};
pub use error::ProviderError;
pub use mock::{ScriptedCall, ScriptedMockProvider};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{ModelProvider, ResponseStream};
pub use types::*;
