// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Permission & policy engine.
//!
//! Every tool the subprocess proposes to run passes through [`PermissionEngine::decide`].
//! The mode tables resolve the common cases without user involvement; what is
//! left becomes a `permission:request` broadcast that waits for the UI (or
//! times out into a deny).  One user decision cascades to every pending
//! request for the same tool, because UIs surface one card at a time and
//! parallel requests would otherwise stall until timeout.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use freja_config::PermissionMode;
use freja_mcp::{mcp_server_id, CRON_DONE_SERVER_ID, CRON_TASKS_SERVER_ID};
use freja_model::{AskUserQuestion, UiEvent};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::EventBroadcaster;
use crate::signal::AbortSignal;

/// How long an interactive request may wait before defaulting to deny.
const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(600);

/// Longest input preview attached to a `permission:request`.
const INPUT_PREVIEW_CHARS: usize = 500;

/// Name of the structured-question tool.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

/// Name of the sub-agent delegation tool.
const TASK_TOOL: &str = "Task";

const READ_TOOLS: &[&str] = &["Read", "Glob", "Grep", "NotebookRead", "TodoRead"];
const EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];
const TODO_TOOLS: &[&str] = &["TodoWrite"];

/// The UI's answer to a `permission:request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionReply {
    Deny,
    AllowOnce,
    AlwaysAllow,
}

/// What the subprocess is told.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow {
        /// Input forwarded to the tool, possibly augmented (ask-user answers).
        updated_input: Option<Value>,
    },
    Deny {
        message: String,
    },
}

impl PermissionDecision {
    fn allow() -> Self {
        Self::Allow {
            updated_input: None,
        }
    }

    fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
        }
    }
}

/// MCP gating derived from the session's server override.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum McpGate {
    /// Override is null → fall through to the config file, allow.
    #[default]
    AllowAll,
    /// Override is an explicit empty list.
    Disabled,
    /// Allow exactly these server ids.
    Enabled(HashSet<String>),
}

struct PendingPermission {
    tool_name: String,
    input_preview: String,
    tx: oneshot::Sender<PermissionReply>,
}

struct PendingQuestion {
    questions: Vec<AskUserQuestion>,
    tx: oneshot::Sender<Option<Vec<String>>>,
}

#[derive(Default)]
struct EngineState {
    mode: PermissionMode,
    has_agents: bool,
    mcp_gate: McpGate,
    cron_active: bool,
    im_active: bool,
    session_allowed: HashSet<String>,
    pending: HashMap<String, PendingPermission>,
    pending_questions: HashMap<String, PendingQuestion>,
}

pub struct PermissionEngine {
    broadcaster: Arc<EventBroadcaster>,
    state: std::sync::Mutex<EngineState>,
}

impl PermissionEngine {
    pub fn new(broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            broadcaster,
            state: std::sync::Mutex::new(EngineState::default()),
        }
    }

    // ── Configuration (driven by the session controller) ─────────────────────

    pub fn set_mode(&self, mode: PermissionMode) {
        self.lock().mode = mode;
    }

    pub fn mode(&self) -> PermissionMode {
        self.lock().mode
    }

    pub fn set_has_agents(&self, has_agents: bool) {
        self.lock().has_agents = has_agents;
    }

    pub fn set_mcp_gate(&self, gate: McpGate) {
        self.lock().mcp_gate = gate;
    }

    pub fn set_contexts(&self, cron_active: bool, im_active: bool) {
        let mut state = self.lock();
        state.cron_active = cron_active;
        state.im_active = im_active;
    }

    /// Forget session grants (reset / switch).
    pub fn clear_session_grants(&self) {
        self.lock().session_allowed.clear();
    }

    // ── The decision algorithm ───────────────────────────────────────────────

    pub async fn decide(
        &self,
        tool_name: &str,
        input: &Value,
        abort: &AbortSignal,
    ) -> PermissionDecision {
        // MCP tools: the in-process scheduled-task servers are gated by
        // invocation context; everything else by the session override.
        if let Some(server) = mcp_server_id(tool_name) {
            let state = self.lock();
            return match server {
                CRON_DONE_SERVER_ID => {
                    if state.cron_active {
                        PermissionDecision::allow()
                    } else {
                        PermissionDecision::deny("no scheduled task is running")
                    }
                }
                CRON_TASKS_SERVER_ID => {
                    if state.im_active {
                        PermissionDecision::allow()
                    } else {
                        PermissionDecision::deny("task management is only available from chat sessions")
                    }
                }
                _ => match &state.mcp_gate {
                    McpGate::AllowAll => PermissionDecision::allow(),
                    McpGate::Disabled => PermissionDecision::deny("MCP disabled"),
                    McpGate::Enabled(ids) => {
                        if ids.contains(server) {
                            PermissionDecision::allow()
                        } else {
                            PermissionDecision::deny(format!("MCP server {server} is not enabled"))
                        }
                    }
                },
            };
        }

        {
            let state = self.lock();

            // Mode auto-allow.
            if matches_any(tool_name, &auto_allow_patterns(state.mode)) {
                return PermissionDecision::allow();
            }
            // Delegation is allowed whenever sub-agents are defined.
            if tool_name == TASK_TOOL && state.has_agents {
                return PermissionDecision::allow();
            }
            // Mode auto-deny.
            if matches_any(tool_name, auto_deny_patterns(state.mode)) {
                return PermissionDecision::deny(format!(
                    "{tool_name} is not allowed in {:?} mode",
                    state.mode
                ));
            }
            // Session grants.
            if state.session_allowed.contains(tool_name) {
                return PermissionDecision::allow();
            }
        }

        // The turn is being torn down — nothing may start now.
        if abort.is_aborted() {
            return PermissionDecision::deny("session is shutting down");
        }

        // The structured-question tool has its own protocol.
        if tool_name == ASK_USER_TOOL {
            return self.ask_user(input, abort).await;
        }

        // Everything else asks the user.
        if !prompts_user(self.lock().mode) {
            // fullAgency auto-allows `*` and plan auto-denies `*` above, so
            // only the prompting modes reach this point.
            return PermissionDecision::allow();
        }
        self.prompt_user(tool_name, input, abort).await
    }

    async fn prompt_user(
        &self,
        tool_name: &str,
        input: &Value,
        abort: &AbortSignal,
    ) -> PermissionDecision {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let preview = truncate_input(input);
        {
            let mut state = self.lock();
            state.pending.insert(
                request_id.clone(),
                PendingPermission {
                    tool_name: tool_name.to_string(),
                    input_preview: preview.clone(),
                    tx,
                },
            );
        }
        self.broadcaster.emit(UiEvent::PermissionRequest {
            request_id: request_id.clone(),
            tool_name: tool_name.to_string(),
            input_preview: preview,
        });
        debug!(tool = tool_name, request_id = %request_id, "permission request pending");

        // Dropping the timeout future on any exit path clears its timer.
        let reply = tokio::select! {
            _ = abort.cancelled() => None,
            outcome = tokio::time::timeout(INTERACTIVE_TIMEOUT, rx) => match outcome {
                Ok(Ok(reply)) => Some(reply),
                // Timed out or the sender vanished.
                _ => None,
            },
        };
        // Remove the entry unless a response path already did.
        self.lock().pending.remove(&request_id);

        match reply {
            Some(PermissionReply::AllowOnce) | Some(PermissionReply::AlwaysAllow) => {
                PermissionDecision::allow()
            }
            Some(PermissionReply::Deny) => PermissionDecision::deny("denied by user"),
            None => {
                warn!(tool = tool_name, "permission request timed out or was cancelled");
                PermissionDecision::deny("permission request timed out")
            }
        }
    }

    /// Resolve one pending permission request.  Returns false for unknown ids.
    ///
    /// An allow cascades: every other pending request for the same tool is
    /// resolved allow-once as well, and `always_allow` grants the tool for
    /// the rest of the session.
    pub fn handle_permission_response(&self, request_id: &str, reply: PermissionReply) -> bool {
        let mut state = self.lock();
        let Some(pending) = state.pending.remove(request_id) else {
            return false;
        };
        if reply == PermissionReply::AlwaysAllow {
            state.session_allowed.insert(pending.tool_name.clone());
        }
        if reply != PermissionReply::Deny {
            let same_tool: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, p)| p.tool_name == pending.tool_name)
                .map(|(id, _)| id.clone())
                .collect();
            for id in same_tool {
                if let Some(p) = state.pending.remove(&id) {
                    debug!(tool = %p.tool_name, request_id = %id, "cascading allow to pending request");
                    let _ = p.tx.send(PermissionReply::AllowOnce);
                }
            }
        }
        let _ = pending.tx.send(reply);
        true
    }

    // ── AskUser protocol ─────────────────────────────────────────────────────

    async fn ask_user(&self, input: &Value, abort: &AbortSignal) -> PermissionDecision {
        let questions = match validate_questions(input) {
            Ok(q) => q,
            Err(reason) => {
                return PermissionDecision::deny(format!("invalid question input: {reason}"))
            }
        };

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            state.pending_questions.insert(
                request_id.clone(),
                PendingQuestion {
                    questions: questions.clone(),
                    tx,
                },
            );
        }
        self.broadcaster.emit(UiEvent::AskUserQuestionRequest {
            request_id: request_id.clone(),
            questions,
        });

        let answers = tokio::select! {
            _ = abort.cancelled() => None,
            outcome = tokio::time::timeout(INTERACTIVE_TIMEOUT, rx) => match outcome {
                Ok(Ok(answers)) => answers,
                _ => None,
            },
        };
        self.lock().pending_questions.remove(&request_id);

        match answers {
            Some(answers) => {
                // Forward the tool input augmented with what the user chose.
                let mut updated = input.clone();
                if let Some(obj) = updated.as_object_mut() {
                    obj.insert(
                        "answers".to_string(),
                        Value::Array(answers.into_iter().map(Value::String).collect()),
                    );
                }
                PermissionDecision::Allow {
                    updated_input: Some(updated),
                }
            }
            None => PermissionDecision::deny("question cancelled"),
        }
    }

    /// Resolve a pending ask-user request.  `answers` is one answer string
    /// per question; `None` cancels.
    pub fn handle_question_response(
        &self,
        request_id: &str,
        answers: Option<Vec<String>>,
    ) -> bool {
        let Some(pending) = self.lock().pending_questions.remove(request_id) else {
            return false;
        };
        let _ = pending.tx.send(answers);
        true
    }

    // ── Replay ───────────────────────────────────────────────────────────────

    /// Re-create the request events a newly subscribed UI needs to show the
    /// current interactive state.
    pub fn pending_interactive_requests(&self) -> Vec<UiEvent> {
        let state = self.lock();
        let mut events: Vec<UiEvent> = state
            .pending
            .iter()
            .map(|(id, p)| UiEvent::PermissionRequest {
                request_id: id.clone(),
                tool_name: p.tool_name.clone(),
                input_preview: p.input_preview.clone(),
            })
            .collect();
        events.extend(
            state
                .pending_questions
                .iter()
                .map(|(id, p)| UiEvent::AskUserQuestionRequest {
                    request_id: id.clone(),
                    questions: p.questions.clone(),
                }),
        );
        events
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().expect("permission state poisoned")
    }
}

// ─── Mode tables ──────────────────────────────────────────────────────────────

fn auto_allow_patterns(mode: PermissionMode) -> Vec<&'static str> {
    match mode {
        PermissionMode::Auto => {
            let mut v: Vec<&str> = READ_TOOLS.to_vec();
            v.extend_from_slice(EDIT_TOOLS);
            v.extend_from_slice(TODO_TOOLS);
            v.push("Skill");
            v
        }
        PermissionMode::Plan => READ_TOOLS.to_vec(),
        PermissionMode::FullAgency => vec!["*"],
        PermissionMode::Custom => {
            let mut v: Vec<&str> = READ_TOOLS.to_vec();
            v.push("Skill");
            v
        }
    }
}

fn auto_deny_patterns(mode: PermissionMode) -> &'static [&'static str] {
    match mode {
        PermissionMode::Plan => &["*"],
        _ => &[],
    }
}

/// Whether the fall-through case prompts (vs allows).
fn prompts_user(mode: PermissionMode) -> bool {
    matches!(mode, PermissionMode::Auto | PermissionMode::Custom)
}

/// Tool-name matching: exact, `*`, or a trailing-`*` prefix glob
/// (`mcp__playwright__*`).
fn matches_any(name: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| match p.strip_suffix('*') {
        Some("") => true,
        Some(prefix) => name.starts_with(prefix),
        None => name == *p,
    })
}

fn truncate_input(input: &Value) -> String {
    let mut s = input.to_string();
    if s.len() > INPUT_PREVIEW_CHARS {
        let mut cut = INPUT_PREVIEW_CHARS;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

/// Check the shape required by the AskUser protocol: at least one question,
/// each with prompt text, a header, at least two options, and an optional
/// multi-select flag.
fn validate_questions(input: &Value) -> Result<Vec<AskUserQuestion>, String> {
    let list = input
        .get("questions")
        .and_then(Value::as_array)
        .ok_or("missing 'questions' array")?;
    if list.is_empty() {
        return Err("'questions' must not be empty".into());
    }
    let mut questions = Vec::with_capacity(list.len());
    for (i, q) in list.iter().enumerate() {
        let question = q
            .get("question")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("question {} missing 'question'", i + 1))?;
        let header = q
            .get("header")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("question {} missing 'header'", i + 1))?;
        let options: Vec<String> = q
            .get("options")
            .and_then(Value::as_array)
            .map(|opts| {
                opts.iter()
                    .filter_map(|o| {
                        o.as_str()
                            .map(str::to_string)
                            .or_else(|| o.get("label").and_then(Value::as_str).map(str::to_string))
                    })
                    .collect()
            })
            .unwrap_or_default();
        if options.len() < 2 {
            return Err(format!("question {} needs at least 2 options", i + 1));
        }
        questions.push(AskUserQuestion {
            question: question.to_string(),
            header: header.to_string(),
            options,
            multi_select: q
                .get("multiSelect")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        });
    }
    Ok(questions)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
