// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "qx",
    version,
    about = "An interactive terminal AI assistant with tool calling"
)]
pub struct Cli {
    /// Model identifier, overriding QX_MODEL_NAME and the config file.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Explicit config file path (merged over the standard locations).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Disable streaming responses.
    #[arg(long)]
    pub no_stream: bool,

    /// Start the session with "approve all" already active.
    #[arg(long)]
    pub approve_all: bool,
}
