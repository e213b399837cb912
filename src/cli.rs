// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use freja_config::PermissionMode;

#[derive(Parser)]
#[command(
    name = "freja",
    version,
    about = "Agent session core for a desktop AI chat workspace",
    long_about = "Runs the per-workspace agent session core as a local service: \
                  it supervises the agent subprocess, persists transcripts, and \
                  streams session events as JSON lines on stdout."
)]
pub struct Cli {
    /// Verbose logging to stderr (RUST_LOG overrides the filter)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Override the user data directory (default: platform data dir)
    #[arg(long, global = true, env = "FREJA_USER_DIR")]
    pub user_dir: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the session core for a workspace
    Serve {
        /// Workspace directory the agent operates in
        #[arg(short, long)]
        workspace: String,
        /// Adopt an existing session id instead of creating one
        #[arg(long)]
        session: Option<String>,
        /// Send this prompt immediately instead of pre-warming
        #[arg(short, long)]
        prompt: Option<String>,
        /// Tool permission mode
        #[arg(long, value_enum, default_value = "auto")]
        mode: ModeArg,
        /// Model forwarded to the agent subprocess
        #[arg(long)]
        model: Option<String>,
        /// Agent subprocess command
        #[arg(long, env = "FREJA_AGENT_CMD", default_value = "claude")]
        agent_cmd: String,
    },
    /// List stored sessions, most recently active first
    Sessions {
        /// Only sessions of this workspace
        #[arg(short, long)]
        workspace: Option<String>,
        /// Emit the raw metadata records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved user data directory
    ConfigPath,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Auto,
    Plan,
    FullAgency,
    Custom,
}

impl From<ModeArg> for PermissionMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Auto => PermissionMode::Auto,
            ModeArg::Plan => PermissionMode::Plan,
            ModeArg::FullAgency => PermissionMode::FullAgency,
            ModeArg::Custom => PermissionMode::Custom,
        }
    }
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
