// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Command};
use freja_config::{McpServerDef, McpTransport};
use freja_core::{ControllerOptions, EnqueueOptions, ProcessDriver, SessionController};
use freja_mcp::ExecutionContext;
use freja_store::SessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let user_dir = match &cli.user_dir {
        Some(dir) => PathBuf::from(shellexpand::tilde(dir).into_owned()),
        None => freja_config::user_dir(),
    };

    match cli.command {
        Command::Serve {
            workspace,
            session,
            prompt,
            mode,
            model,
            agent_cmd,
        } => {
            let workspace = PathBuf::from(shellexpand::tilde(&workspace).into_owned());
            serve(user_dir, workspace, session, prompt, mode, model, agent_cmd).await
        }
        Command::Sessions { workspace, json } => list_sessions(user_dir, workspace, json).await,
        Command::ConfigPath => {
            println!("{}", user_dir.display());
            Ok(())
        }
        Command::Completions { shell } => {
            cli::print_completions(shell);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

// ── Serve ─────────────────────────────────────────────────────────────────────

/// Run the core as a local service: broadcast events go to stdout as JSON
/// lines, stdin lines are enqueued as user messages.
#[allow(clippy::too_many_arguments)]
async fn serve(
    user_dir: PathBuf,
    workspace: PathBuf,
    session: Option<String>,
    prompt: Option<String>,
    mode: cli::ModeArg,
    model: Option<String>,
    agent_cmd: String,
) -> anyhow::Result<()> {
    let controller = SessionController::new(ControllerOptions {
        user_dir,
        driver: Arc::new(ProcessDriver { command: agent_cmd }),
        mcp_presets: builtin_mcp_presets(),
        exec_ctx: ExecutionContext {
            management_port: std::env::var("MYAGENTS_MANAGEMENT_PORT")
                .ok()
                .and_then(|p| p.parse().ok()),
            ..Default::default()
        },
    });
    controller.set_permission_mode(mode.into()).await;
    if let Some(model) = model {
        controller.set_session_model(Some(model)).await;
    }

    // Print every broadcast event as one JSON line.
    let events = controller.subscribe();
    let printer = tokio::spawn(async move {
        use futures::StreamExt;
        let mut stream = tokio_stream::wrappers::BroadcastStream::new(events);
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
                Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event printer lagged");
                }
            }
        }
    });

    controller
        .initialize(&workspace, prompt, session)
        .await
        .context("initializing session")?;

    // stdin → user messages, until EOF or ctrl-c.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let text = line.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if let Err(e) = controller
                    .enqueue_user_message(EnqueueOptions {
                        text,
                        ..Default::default()
                    })
                    .await
                {
                    eprintln!("enqueue failed: {e}");
                }
            }
        }
    }

    controller.interrupt_current_response().await;
    printer.abort();
    Ok(())
}

/// Builtin MCP server presets shipped with the app.  The desktop shell's
/// config file decides which of these are enabled.
fn builtin_mcp_presets() -> Vec<McpServerDef> {
    vec![
        McpServerDef {
            id: "playwright".into(),
            name: Some("Playwright".into()),
            builtin: true,
            transport: McpTransport::Stdio {
                command: "npx".into(),
                args: vec!["@playwright/mcp@latest".into()],
                env: Default::default(),
            },
        },
        McpServerDef {
            id: "context7".into(),
            name: Some("Context7".into()),
            builtin: true,
            transport: McpTransport::Stdio {
                command: "npx".into(),
                args: vec!["@upstash/context7-mcp@latest".into()],
                env: Default::default(),
            },
        },
        McpServerDef {
            id: "chrome-devtools".into(),
            name: Some("Chrome DevTools".into()),
            builtin: true,
            transport: McpTransport::Stdio {
                command: "npx".into(),
                args: vec!["chrome-devtools-mcp@latest".into()],
                env: Default::default(),
            },
        },
    ]
}

// ── Sessions ──────────────────────────────────────────────────────────────────

async fn list_sessions(
    user_dir: PathBuf,
    workspace: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let store = SessionStore::new(&user_dir);
    let sessions = match workspace {
        Some(dir) => {
            let dir = PathBuf::from(shellexpand::tilde(&dir).into_owned());
            store.list_by_workspace(&dir).await
        }
        None => store.list_sessions().await,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for s in sessions {
        let title = if s.title.is_empty() { "(untitled)" } else { s.title.as_str() };
        println!(
            "{}  {}  turns={}  {}",
            s.last_active_at.format("%Y-%m-%d %H:%M"),
            s.id,
            s.stats.turns,
            title
        );
    }
    Ok(())
}
