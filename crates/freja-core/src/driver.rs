// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The seam between the session controller and the agent subprocess.
//!
//! [`AgentDriver`] abstracts "start a subprocess run": the production
//! implementation spawns the agent CLI and bridges its stdio to typed
//! channels; tests substitute a scripted driver.  The controller only ever
//! sees channels, so nothing above this file knows about processes.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use freja_config::{AgentDef, SystemPromptConfig, SystemPromptMode};
use freja_mcp::ExternalServerSpec;
use freja_model::{AgentEvent, AgentInput};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Stderr phrase meaning the subprocess already has on-disk state for the
/// session id we tried to create fresh.  Detection is best-effort; when the
/// subprocess grows a typed error code for this, prefer it.
const ALREADY_IN_USE_NEEDLE: &str = "already in use";

/// Mutually exclusive session start options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHandoff {
    /// Create a session under our id.
    Fresh { id: String },
    /// Resume the subprocess's on-disk state for the id, optionally rolling
    /// back to a rewind anchor first.
    Resume { id: String, at: Option<String> },
}

/// Everything needed to start one subprocess run.
#[derive(Debug, Clone)]
pub struct AgentLaunch {
    pub workspace: PathBuf,
    /// Environment overrides: `Some(value)` sets, `None` removes.
    pub env: Vec<(String, Option<String>)>,
    /// Fully assembled PATH for the child.
    pub path_var: String,
    pub session: SessionHandoff,
    pub model: Option<String>,
    /// Mode string in the subprocess vocabulary.
    pub permission_mode: String,
    /// fullAgency maps to skipping subprocess-side permission checks.
    pub skip_permissions: bool,
    pub mcp_servers: BTreeMap<String, ExternalServerSpec>,
    pub agents: HashMap<String, AgentDef>,
    pub system_prompt: SystemPromptConfig,
}

/// Flags the stderr watcher raises while a run is alive.
#[derive(Debug, Default)]
pub struct StderrSignals {
    already_in_use: AtomicBool,
}

impl StderrSignals {
    pub fn mark_already_in_use(&self) {
        self.already_in_use.store(true, Ordering::Release);
    }

    pub fn already_in_use(&self) -> bool {
        self.already_in_use.load(Ordering::Acquire)
    }
}

/// A live subprocess run as the controller sees it: an event stream in, an
/// input channel out, stderr flags, and a kill switch.
pub struct AgentSession {
    pub events: mpsc::Receiver<AgentEvent>,
    pub input: mpsc::Sender<AgentInput>,
    pub signals: Arc<StderrSignals>,
    /// Sending terminates the subprocess; the event channel closes once it
    /// is gone.
    pub kill: mpsc::Sender<()>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("session id already in use")]
    AlreadyInUse,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait AgentDriver: Send + Sync {
    async fn spawn(&self, launch: &AgentLaunch) -> Result<AgentSession, SpawnError>;
}

// ─── Production driver ────────────────────────────────────────────────────────

/// Spawns the agent CLI and speaks line-delimited JSON over its stdio.
pub struct ProcessDriver {
    /// Binary name or path; resolved through the launch PATH.
    pub command: String,
}

impl Default for ProcessDriver {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
        }
    }
}

#[async_trait]
impl AgentDriver for ProcessDriver {
    async fn spawn(&self, launch: &AgentLaunch) -> Result<AgentSession, SpawnError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(build_args(launch));
        cmd.env("PATH", &launch.path_var);
        for (key, value) in &launch.env {
            match value {
                Some(v) => {
                    cmd.env(key, v);
                }
                None => {
                    cmd.env_remove(key);
                }
            }
        }

        let mut child = cmd
            .current_dir(&launch.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning agent subprocess `{}`", self.command))?;

        let stdout = child.stdout.take().context("agent subprocess has no stdout")?;
        let stderr = child.stderr.take().context("agent subprocess has no stderr")?;
        let mut stdin = child.stdin.take().context("agent subprocess has no stdin")?;

        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(256);
        let (input_tx, mut input_rx) = mpsc::channel::<AgentInput>(64);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let signals = Arc::new(StderrSignals::default());

        // stdout → typed events.  Unparseable lines are protocol noise, not
        // fatal: log and keep consuming.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<AgentEvent>(&line) {
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, line = %line, "unparseable agent event"),
                }
            }
            // event_tx drops here; the consume loop sees the stream end.
        });

        // stderr → log + already-in-use flag.
        {
            let signals = Arc::clone(&signals);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "agent_stderr", "{line}");
                    if line.contains(ALREADY_IN_USE_NEEDLE) {
                        signals.mark_already_in_use();
                    }
                }
            });
        }

        // input channel → stdin, one JSON record per line.
        tokio::spawn(async move {
            while let Some(record) = input_rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&record) else {
                    continue;
                };
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        // Supervisor: reap on natural exit, kill on demand.
        tokio::spawn(async move {
            tokio::select! {
                _ = kill_rx.recv() => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "agent subprocess kill failed");
                    }
                    let _ = child.wait().await;
                }
                status = child.wait() => {
                    debug!(?status, "agent subprocess exited");
                }
            }
        });

        Ok(AgentSession {
            events: event_rx,
            input: input_tx,
            signals,
            kill: kill_tx,
        })
    }
}

/// Assemble the CLI argument list for one launch.
fn build_args(launch: &AgentLaunch) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--output-format".into(),
        "stream-json".into(),
        "--input-format".into(),
        "stream-json".into(),
        "--verbose".into(),
        "--setting-sources".into(),
        "project".into(),
    ];

    match &launch.session {
        SessionHandoff::Fresh { id } => {
            args.push("--session-id".into());
            args.push(id.clone());
        }
        SessionHandoff::Resume { id, at } => {
            args.push("--resume".into());
            args.push(id.clone());
            if let Some(anchor) = at {
                args.push("--resume-session-at".into());
                args.push(anchor.clone());
            }
        }
    }

    if launch.skip_permissions {
        args.push("--dangerously-skip-permissions".into());
    } else {
        args.push("--permission-mode".into());
        args.push(launch.permission_mode.clone());
    }

    if let Some(model) = &launch.model {
        args.push("--model".into());
        args.push(model.clone());
    }

    if !launch.mcp_servers.is_empty() {
        let config = serde_json::json!({ "mcpServers": launch.mcp_servers });
        args.push("--mcp-config".into());
        args.push(config.to_string());
    }

    if !launch.agents.is_empty() {
        if let Ok(json) = serde_json::to_string(&launch.agents) {
            args.push("--agents".into());
            args.push(json);
        }
    }

    match launch.system_prompt.mode {
        SystemPromptMode::Preset => {}
        SystemPromptMode::Replace => {
            if let Some(content) = &launch.system_prompt.content {
                args.push("--system-prompt".into());
                args.push(content.clone());
            }
        }
        SystemPromptMode::Append => {
            if let Some(content) = &launch.system_prompt.content {
                args.push("--append-system-prompt".into());
                args.push(content.clone());
            }
        }
    }

    args
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
