#!/usr/bin/env -S cargo run --bin sandkeep-mcp --

use anyhow::{Context, Result};
use clap::Parser;
use sandkeep_sandbox::SandboxSettings;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod context;
mod mcp;
mod tools;

#[cfg(test)]
mod tests;

use context::ToolContext;

#[derive(Parser)]
#[command(name = "sandkeep-mcp")]
#[command(about = "Sandkeep MCP Server - run untrusted code in allow-listed container sandboxes")]
#[command(version)]
struct Cli {
    #[arg(long, help = "Display available tools")]
    tools: bool,
    #[arg(long, help = "Validate the registry and language table, then exit")]
    check: bool,
    #[arg(long, value_name = "PATH", help = "Registry file (overrides SANDKEEP_REGISTRY_PATH)")]
    registry: Option<PathBuf>,
    #[arg(long, help = "Skip orphaned container cleanup at startup")]
    no_reap: bool,
}

/// Process signals relayed into the async loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlSignal {
    Shutdown,
    ReloadRegistry,
}

#[cfg(unix)]
fn install_signal_relay(tx: mpsc::UnboundedSender<ControlSignal>) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals =
        Signals::new([SIGINT, SIGTERM, SIGHUP]).context("Failed to register signal handlers")?;
    std::thread::spawn(move || {
        for signal in signals.forever() {
            let control = if signal == SIGHUP {
                ControlSignal::ReloadRegistry
            } else {
                ControlSignal::Shutdown
            };
            if tx.send(control).is_err() || control == ControlSignal::Shutdown {
                break;
            }
        }
    });
    Ok(())
}

#[cfg(windows)]
fn install_signal_relay(tx: mpsc::UnboundedSender<ControlSignal>) -> Result<()> {
    ctrlc::set_handler(move || {
        let _ = tx.send(ControlSignal::Shutdown);
    })
    .context("Failed to register Ctrl-C handler")
}

fn init_logging() {
    // stdout carries the protocol, so logs go to stderr
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.tools {
        println!("Available tools:");
        for tool in tools::tool_definitions() {
            println!(
                "- {}: {}",
                tool.name,
                tool.description.unwrap_or_default()
            );
        }
        return Ok(());
    }

    dotenvy::dotenv().ok();
    init_logging();

    let mut settings = SandboxSettings::from_env()?;
    if let Some(path) = cli.registry {
        settings.registry_path = path;
    }
    let context = ToolContext::from_settings(settings)
        .await
        .context("Failed to load sandbox configuration")?;
    let service = context.service().clone();

    if cli.check {
        let registry = service.registry();
        let entries = registry.list().await;
        let source = registry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "inline".to_string());
        println!(
            "Registry OK: {} entries from {} ({})",
            entries.len(),
            source,
            entries
                .iter()
                .map(|e| e.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        println!(
            "Languages OK: {}",
            service.languages().list_supported().join(", ")
        );
        return Ok(());
    }

    if cli.no_reap {
        info!("Orphan cleanup disabled");
    }
    if let Some(report) = service.startup_with(!cli.no_reap).await {
        if !report.found.is_empty() {
            info!(
                found = report.found.len(),
                removed = report.removed,
                "Cleaned up containers from a previous run"
            );
        }
    }

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    install_signal_relay(signal_tx)?;

    info!("Sandkeep MCP server ready on stdio");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let context = context.clone();
                        in_flight.spawn(async move {
                            if let Some(response) = mcp::handle_line(&line, &context).await {
                                // println! holds the stdout lock for the whole line
                                println!("{}", response);
                            }
                        });
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read from stdin: {}", e);
                        break;
                    }
                }
            }
            Some(signal) = signal_rx.recv() => {
                match signal {
                    ControlSignal::ReloadRegistry => {
                        if let Err(e) = service.registry().reload().await {
                            warn!("Registry reload failed: {}", e);
                        }
                    }
                    ControlSignal::Shutdown => {
                        info!("Shutdown signal received");
                        interrupted = true;
                        break;
                    }
                }
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!("Request task failed: {}", e);
                }
            }
        }
    }

    if interrupted {
        in_flight.abort_all();
    }
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            if !e.is_cancelled() {
                error!("Request task failed: {}", e);
            }
        }
    }

    let stopped = service.shutdown().await;
    info!(stopped, "Sandkeep MCP server stopped");
    Ok(())
}
