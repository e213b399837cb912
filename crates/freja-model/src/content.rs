use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content block types ──────────────────────────────────────────────────────

/// One structured block inside an assistant message.
///
/// Blocks are built incrementally by the stream assembler: text and thinking
/// grow delta by delta, tool input JSON is concatenated until the block stops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking(ThinkingBlock),
    ToolUse(ToolUseBlock),
    /// Same shape as `ToolUse` but the provider delivers the complete input
    /// in one shot instead of streaming it.
    ServerToolUse(ToolUseBlock),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// The tool block payload, for either the streamed or the server variant.
    pub fn as_tool(&self) -> Option<&ToolUseBlock> {
        match self {
            Self::ToolUse(t) | Self::ServerToolUse(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_tool_mut(&mut self) -> Option<&mut ToolUseBlock> {
        match self {
            Self::ToolUse(t) | Self::ServerToolUse(t) => Some(t),
            _ => None,
        }
    }
}

/// A reasoning block.  `duration_ms` is computed when the block stops.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThinkingBlock {
    #[serde(default)]
    pub thinking: String,
    /// Provider stream index — identifies which thinking block a delta
    /// belongs to while several blocks are in flight.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stream_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<u64>,
}

/// A tool invocation block.
///
/// `input_json` is the raw streamed argument buffer; `parsed_input` is the
/// best-effort parse kept current while streaming and replaced by a strict
/// parse when the block stops.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input_json: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parsed_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<ToolResult>,
    #[serde(default)]
    pub is_error: bool,
    /// The user interrupted the turn while this tool was running.
    #[serde(default)]
    pub stopped: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Nested calls made by a sub-agent spawned through this tool.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub sub_calls: Vec<SubAgentCall>,
}

impl ToolUseBlock {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn sub_call_mut(&mut self, id: &str) -> Option<&mut SubAgentCall> {
        self.sub_calls.iter_mut().find(|c| c.id == id)
    }
}

/// The outcome of a tool invocation, as reported by the subprocess.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// A nested tool call executed by a sub-agent (`Task` tool).
///
/// Events for these arrive with a `parent_tool_use_id`; the assembler keeps a
/// child-id → parent-id map for the lifetime of the turn and routes deltas
/// here.  The parent [`ToolUseBlock`] owns its children; the map is a lookup
/// aid, not an ownership edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubAgentCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input_json: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parsed_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<String>,
    #[serde(default)]
    pub loading: bool,
    #[serde(default)]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stream_index: Option<usize>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
