// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
pub mod loader;
pub mod schema;

pub use loader::{load, load_from_env};
pub use schema::{AgentConfig, Config, ModelConfig, ReliabilityConfig, ToolsConfig};
