// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use lotus_config::Config;
use lotus_core::{Agent, AgentEvent, AgentState};
use lotus_model::{ProviderHandle, Router};
use lotus_tools::{builtin, builtin::TerminateTool, Dispatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = lotus_config::load(cli.config.as_deref())?;

    if cli.show_config {
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let mut agent = build_agent(&config)?;

    let result = match &cli.prompt {
        Some(prompt) => run_once(&mut agent, prompt).await,
        None => run_repl(&mut agent).await,
    };

    // Tool cleanup and usage flush happen however the session ended.
    agent.cleanup().await;
    if config.usage.enabled {
        match agent.router().save_usage(Path::new(&config.usage.file_path)) {
            Ok(()) => eprintln!("{}", agent.router().usage_summary()),
            Err(e) => warn!(error = %e, "failed to persist usage"),
        }
    }
    result
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_agent(config: &Config) -> anyhow::Result<Agent> {
    let primary =
        ProviderHandle::from_config(&config.provider).context("configuring primary provider")?;
    let backups = config
        .backups
        .iter()
        .map(|b| {
            ProviderHandle::from_config(b)
                .with_context(|| format!("configuring backup provider '{}'", b.name))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let router = Router::new(primary, backups, &config.cache, config.usage.enabled);

    // `terminate` is mandatory; everything else comes from the enabled list.
    let mut dispatcher = Dispatcher::new(&config.tools, config.cache.enabled);
    dispatcher.register(TerminateTool);
    for name in &config.tools.enabled {
        if name == "terminate" {
            continue;
        }
        match builtin::by_name(name) {
            Some(tool) => dispatcher.register_arc(tool),
            None => warn!(tool = %name, "unknown tool in config; skipping"),
        }
    }

    Ok(Agent::new(config, router, dispatcher))
}

async fn run_once(agent: &mut Agent, prompt: &str) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel(256);
    let printer = tokio::spawn(print_events(rx));
    agent.run(Some(prompt), tx).await;
    let _ = printer.await;

    if agent.state() == AgentState::Error {
        anyhow::bail!("agent ended in error state");
    }
    Ok(())
}

async fn run_repl(agent: &mut Agent) -> anyhow::Result<()> {
    println!("lotus ready. Type a request, or 'exit' to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("\n> ");
        let Some(line) = lines.next_line().await? else {
            break; // EOF
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit" | "q") {
            break;
        }

        let (tx, rx) = mpsc::channel(256);
        let printer = tokio::spawn(print_events(rx));
        agent.run(Some(line), tx).await;
        let _ = printer.await;

        if agent.state() == AgentState::Error {
            eprintln!("(the last run ended in an error; see logs)");
        }
        agent.reset();
    }
    Ok(())
}

/// Render agent events: progress to stderr, the final answer to stdout so
/// `lotus -p ... | next-tool` pipes cleanly.
async fn print_events(mut rx: mpsc::Receiver<AgentEvent>) {
    while let Some(ev) = rx.recv().await {
        match ev {
            AgentEvent::Status(s) => eprintln!("· {s}"),
            AgentEvent::Content(c) => eprintln!("{c}"),
            AgentEvent::ToolStarted { name, .. } => eprintln!("→ {name}"),
            AgentEvent::ToolFinished { name, is_error, .. } => {
                eprintln!("← {name}{}", if is_error { " (error)" } else { "" });
            }
            AgentEvent::Final(answer) => println!("{answer}"),
        }
    }
}
