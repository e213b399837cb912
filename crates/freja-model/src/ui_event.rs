// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{StoredMessage, SubAgentCall, SystemInitInfo, TurnUsage};

/// High-level session state broadcast on every transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Error,
}

/// Queue snapshot entry returned by `queue_status()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub id: String,
    pub message_preview: String,
}

/// A structured question inside an `ask-user-question:request`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AskUserQuestion {
    pub question: String,
    pub header: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub multi_select: bool,
}

/// Events fanned out to every subscribed UI client.
///
/// Each variant has a stable `kind` string; payload field names are part of
/// the front-end contract and must not drift.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum UiEvent {
    // ── Session lifecycle ────────────────────────────────────────────────────
    Status {
        state: SessionState,
    },
    SystemInit {
        info: SystemInitInfo,
    },
    SystemStatus {
        status: Option<String>,
    },
    AgentError {
        message: String,
    },
    MessageError {
        message: String,
    },
    MessageComplete {
        usage: TurnUsage,
        tool_count: u32,
        duration_ms: u64,
    },
    MessageStopped,
    /// Initial snapshot after a reset or switch.
    Init {
        session_id: String,
        messages: Vec<StoredMessage>,
    },

    // ── Streaming ────────────────────────────────────────────────────────────
    MessageChunk {
        message_id: u64,
        text: String,
    },
    ThinkingStart {
        message_id: u64,
        index: usize,
    },
    ThinkingChunk {
        message_id: u64,
        index: usize,
        text: String,
    },
    ToolUseStart {
        message_id: u64,
        tool_id: String,
        name: String,
    },
    ToolInputDelta {
        tool_id: String,
        delta: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        parsed_input: Option<Value>,
    },
    ToolResultStart {
        tool_id: String,
        content: String,
        is_error: bool,
    },
    ToolResultDelta {
        tool_id: String,
        delta: String,
    },
    ToolResultComplete {
        tool_id: String,
        content: String,
        is_error: bool,
    },
    ServerToolUseStart {
        message_id: u64,
        tool_id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        input: Option<Value>,
    },
    ContentBlockStop {
        message_id: u64,
        index: usize,
    },

    // ── Sub-agent nesting ────────────────────────────────────────────────────
    SubagentToolUseStart {
        parent_tool_id: String,
        call: SubAgentCall,
    },
    SubagentTextChunk {
        parent_tool_id: String,
        call_id: String,
        text: String,
    },
    SubagentToolResult {
        parent_tool_id: String,
        call_id: String,
        content: String,
        is_error: bool,
    },

    // ── Replay ───────────────────────────────────────────────────────────────
    MessageReplay {
        message: StoredMessage,
    },
    MessageSdkUuid {
        message_id: u64,
        uuid: String,
    },

    // ── Queue ────────────────────────────────────────────────────────────────
    QueueAdded {
        queue_id: String,
        preview: String,
    },
    QueueStarted {
        queue_id: String,
        message: StoredMessage,
    },
    QueueCancelled {
        queue_id: String,
    },

    // ── Interactive ──────────────────────────────────────────────────────────
    #[serde(rename = "permission:request")]
    PermissionRequest {
        request_id: String,
        tool_name: String,
        input_preview: String,
    },
    #[serde(rename = "ask-user-question:request")]
    AskUserQuestionRequest {
        request_id: String,
        questions: Vec<AskUserQuestion>,
    },

    // ── Log ──────────────────────────────────────────────────────────────────
    Log {
        line: String,
    },
    DebugMessage {
        line: String,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
