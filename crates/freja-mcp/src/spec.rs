// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tools::InProcessServer;

/// Server id of the in-process "end scheduled task" server.  Available only
/// while a cron execution is in flight.
pub const CRON_DONE_SERVER_ID: &str = "freja-cron-done";

/// Server id of the in-process scheduled-task management server.  Available
/// only for IM-originated sessions with a reachable management API.
pub const CRON_TASKS_SERVER_ID: &str = "freja-cron";

/// A resolved external server, ready to be serialized into the subprocess
/// launch options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExternalServerSpec {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// The integrator's output: external child-process specs keyed by server id
/// (ordered, so the computation is deterministic) plus the in-process
/// servers active for this invocation.
#[derive(Debug, Clone, Default)]
pub struct ServerSpecs {
    pub external: BTreeMap<String, ExternalServerSpec>,
    pub in_process: Vec<Arc<InProcessServer>>,
}

impl ServerSpecs {
    pub fn in_process_server(&self, id: &str) -> Option<&Arc<InProcessServer>> {
        self.in_process.iter().find(|s| s.id == id)
    }
}

/// What kind of invocation this core instance is serving.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Id of the scheduled task when running under the cron daemon.
    pub cron_task_id: Option<String>,
    /// Set when the session was opened by an IM bot gateway.
    pub im: Option<ImContext>,
    /// Port of the local management HTTP API, when the host exposes one.
    pub management_port: Option<u16>,
    /// Directory of the bundled JS runtime, used to rewrite `npx`
    /// invocations so builtin servers launch without a Node install.
    pub bundled_runtime_dir: Option<PathBuf>,
}

impl ExecutionContext {
    pub fn is_cron(&self) -> bool {
        self.cron_task_id.is_some()
    }

    pub fn is_im(&self) -> bool {
        self.im.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImContext {
    pub platform: String,
    pub bot_id: String,
    pub chat_id: String,
}

/// Extract the server id from a namespaced MCP tool name
/// (`mcp__<server>__<tool>`).  Returns `None` for non-MCP tools.
pub fn mcp_server_id(tool_name: &str) -> Option<&str> {
    let rest = tool_name.strip_prefix("mcp__")?;
    match rest.split_once("__") {
        Some((server, _)) => Some(server),
        // `mcp__server` with no tool suffix still names the server.
        None if !rest.is_empty() => Some(rest),
        None => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
