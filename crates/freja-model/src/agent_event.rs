// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The typed event stream spoken by the agent subprocess.
//!
//! Inbound: one JSON object per stdout line, deserialized into [`AgentEvent`].
//! Outbound: [`AgentInput`] records written one per stdin line.  Unknown
//! fields are ignored on both sides so protocol additions in the subprocess
//! never break the consume loop.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Inbound events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Startup and status notifications.  `subtype` is `"init"` for the
    /// session-ready event and `"status"` for transient state such as
    /// context compaction.
    System {
        subtype: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        model: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tools: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        slash_commands: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        agents: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        skills: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        plugins: Vec<String>,
        /// Status tag for `subtype == "status"`; `None` clears it.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        status: Option<String>,
    },
    /// Incremental content streaming.
    StreamEvent {
        event: StreamPayload,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        parent_tool_use_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        session_id: Option<String>,
    },
    /// Full typed assistant payload emitted at the end of each block batch.
    /// `uuid` is the subprocess-assigned message UUID (the rewind anchor).
    Assistant {
        message: AssistantWireMessage,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        parent_tool_use_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        uuid: Option<String>,
    },
    /// Echo of user-side content: tool results and local-command output.
    /// Also carries the subprocess UUID of the preceding user message.
    User {
        message: UserWireMessage,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        parent_tool_use_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        uuid: Option<String>,
    },
    /// Per-turn aggregate: closes the turn.
    Result {
        subtype: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        usage: Option<WireUsage>,
        #[serde(rename = "modelUsage", skip_serializing_if = "HashMap::is_empty", default)]
        model_usage: HashMap<String, WireUsage>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    /// The subprocess asks the host a question, e.g. whether a tool may run.
    ControlRequest {
        request_id: String,
        request: ControlRequestPayload,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        message: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamPayload {
    ContentBlockStart {
        index: usize,
        content_block: WireBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: WireDelta,
    },
    ContentBlockStop {
        index: usize,
    },
}

/// A content block as it appears on the wire at `content_block_start`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// Provider-executed tool; input arrives complete, sometimes as a JSON
    /// string that needs one more parse.
    ServerToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
    /// Streaming text of a tool result (sub-agent output arrives this way).
    ToolResultDelta { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantWireMessage {
    #[serde(default)]
    pub content: Vec<WireBlock>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserWireMessage {
    #[serde(default)]
    pub content: UserWireContent,
}

/// User-event content: either a plain string (local command echo) or a list
/// of blocks, typically `tool_result`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UserWireContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

impl Default for UserWireContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

/// Wire-format usage object (snake_case field names chosen by the provider).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl WireUsage {
    pub fn into_tokens(self) -> crate::ModelTokens {
        crate::ModelTokens {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_read_tokens: self.cache_read_input_tokens,
            cache_creation_tokens: self.cache_creation_input_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequestPayload {
    /// Permission check before the subprocess runs a tool.
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
}

// ─── Outbound records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentInput {
    User {
        message: UserInputMessage,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        session_id: Option<String>,
    },
    ControlRequest {
        request_id: String,
        request: OutboundControl,
    },
    ControlResponse {
        request_id: String,
        response: PermissionResponsePayload,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserInputMessage {
    pub role: String,
    pub content: Vec<UserInputBlock>,
}

impl UserInputMessage {
    pub fn new(content: Vec<UserInputBlock>) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserInputBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: "base64".to_string(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

/// Imperative capabilities invoked on the subprocess.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum OutboundControl {
    Interrupt,
    SetModel { model: String },
    SetPermissionMode { mode: String },
    /// Roll workspace files back to the state at the given assistant UUID.
    RewindFiles { uuid: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum PermissionResponsePayload {
    Allow {
        /// Tool input, possibly augmented (e.g. with collected user answers).
        #[serde(skip_serializing_if = "Option::is_none", default)]
        updated_input: Option<Value>,
    },
    Deny {
        message: String,
    },
}

// ─── Session init snapshot ────────────────────────────────────────────────────

/// What the UI needs to know after `system-init`: broadcast once, buffered
/// during pre-warm and replayed when the session goes live.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemInitInfo {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub slash_commands: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub agents: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub skills: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub plugins: Vec<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
