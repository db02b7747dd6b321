// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::io::Write as _;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

use qx_core::{Agent, AgentEvent};
use qx_model::CompletionClient;
use qx_tools::{
    ApprovalGate, ApprovalPrompt, ConsoleSink, ExecuteShellTool, ReadFileTool, ToolRegistry,
    WebFetchTool, WriteFileTool,
};

/// Plain stdout display surface for tools and the approval gate.
struct StdoutSink;

impl ConsoleSink for StdoutSink {
    fn line(&self, text: &str) {
        println!("{text}");
    }
}

/// Interactive y/n/a/c prompt on stdin.  Accepts the first letter or the
/// full word, case-insensitive; re-asks on anything else; EOF cancels.
struct StdinPrompt;

#[async_trait::async_trait]
impl ApprovalPrompt for StdinPrompt {
    async fn choose(&self, prompt: &str, valid: &[char]) -> Option<char> {
        let valid = valid.to_vec();
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || loop {
            print!("{prompt}");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
            let choice = line.trim().to_lowercase();
            if let Some(c) = choice.chars().next() {
                if valid.contains(&c) {
                    return Some(c);
                }
            }
            println!("Invalid input. Enter one of: y(es), n(o), a(ll), c(ancel).");
        })
        .await
        .ok()
        .flatten()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let filter = EnvFilter::try_from_env("QX_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = qx_config::load(args.config.as_deref())?;
    if let Some(model) = args.model {
        config.model.name = model;
    }
    if args.no_stream {
        config.model.enable_streaming = false;
    }
    // Fatal configuration problems (no model, no credentials) surface here,
    // before the first turn.
    config.validate()?;
    let config = Arc::new(config);

    let client = CompletionClient::from_config(&config)?;
    let console: Arc<dyn ConsoleSink> = Arc::new(StdoutSink);
    let gate = Arc::new(ApprovalGate::new(Arc::new(StdinPrompt), console.clone()));
    if args.approve_all {
        gate.set_approve_all(true).await;
    }

    let project_root = std::env::current_dir().context("resolving working directory")?;
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool::new(gate.clone(), project_root));
    registry.register(WriteFileTool::new(gate.clone()));
    registry.register(ExecuteShellTool::new(
        gate.clone(),
        console.clone(),
        &config.tools,
        config.agent.show_stdout,
        config.agent.show_stderr,
    ));
    registry.register(WebFetchTool);

    let mut agent = Agent::new(client, Arc::new(registry), config.clone());

    eprintln!("qx — model {} (Ctrl-C interrupts a turn, /quit exits)", config.model.name);
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim().to_string();
        if input.is_empty() {
            prompt();
            continue;
        }
        match input.as_str() {
            "/quit" | "/exit" => break,
            "/approve-all" => {
                let now = !gate.approve_all_active().await;
                gate.set_approve_all(now).await;
                println!("'Approve All' is now {}.", if now { "on" } else { "off" });
            }
            _ => run_turn(&mut agent, &input).await?,
        }
        prompt();
    }

    Ok(())
}

fn prompt() {
    eprint!("qx> ");
    let _ = std::io::stderr().flush();
}

/// Drive one turn: render agent events as they arrive, cancel on Ctrl-C.
async fn run_turn(agent: &mut Agent, input: &str) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);

    let renderer = tokio::spawn(async move {
        let mut status_shown = false;
        let clear_status = |shown: &mut bool| {
            if *shown {
                eprint!("\r\x1b[2K");
                *shown = false;
            }
        };
        while let Some(ev) = rx.recv().await {
            match ev {
                AgentEvent::Waiting => {
                    eprint!("\r\x1b[2K\x1b[2mProcessing\x1b[0m");
                    status_shown = true;
                }
                AgentEvent::StatusUpdate(s) => {
                    eprint!("\r\x1b[2K\x1b[2m{s}\x1b[0m");
                    status_shown = true;
                }
                AgentEvent::ReasoningDelta(r) => {
                    clear_status(&mut status_shown);
                    eprint!("\x1b[2m{r}\x1b[0m");
                }
                AgentEvent::MarkdownRelease(text) => {
                    clear_status(&mut status_shown);
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                AgentEvent::ToolCallStarted { name, .. } => {
                    clear_status(&mut status_shown);
                    eprintln!("\x1b[2m→ {name}\x1b[0m");
                }
                AgentEvent::ToolCallFinished { name, is_error, .. } => {
                    let mark = if is_error { "✗" } else { "✓" };
                    eprintln!("\x1b[2m{mark} {name}\x1b[0m");
                }
                AgentEvent::DepthWarning(depth) => {
                    eprintln!("\x1b[2m[depth {depth}: asking the model to wrap up]\x1b[0m");
                }
                AgentEvent::Notice(n) => {
                    clear_status(&mut status_shown);
                    eprintln!("{n}");
                }
                AgentEvent::TurnComplete => {}
            }
        }
        clear_status(&mut status_shown);
    });

    let (cancel_tx, cancel_rx) = oneshot::channel();
    let turn = agent.run_with_cancel(input, tx, cancel_rx);
    tokio::pin!(turn);

    let result = tokio::select! {
        r = &mut turn => r?,
        _ = tokio::signal::ctrl_c() => {
            let _ = cancel_tx.send(());
            turn.await?
        }
    };

    let _ = renderer.await;
    if !result.output.is_empty() {
        println!();
    }
    Ok(())
}
