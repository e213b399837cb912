// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Leaf data types shared by every freja crate.
//!
//! Three families live here:
//!
//! - the in-memory / persisted conversation model ([`StoredMessage`],
//!   [`ContentBlock`], [`TurnUsage`], [`SessionStats`]);
//! - the typed event stream spoken by the agent subprocess
//!   ([`AgentEvent`] inbound, [`AgentInput`] outbound);
//! - the broadcast event union consumed by UI subscribers ([`UiEvent`]).
//!
//! No I/O, no async — pure types so both the store and the core can depend
//! on them without cycles.

mod agent_event;
mod content;
mod message;
mod ui_event;

pub use agent_event::{
    AgentEvent, AgentInput, AssistantWireMessage, ControlRequestPayload, ImageSource,
    OutboundControl, PermissionResponsePayload, StreamPayload, SystemInitInfo, UserInputBlock,
    UserInputMessage, UserWireContent, UserWireMessage, WireBlock, WireDelta, WireUsage,
};
pub use content::{ContentBlock, SubAgentCall, ThinkingBlock, ToolResult, ToolUseBlock};
pub use message::{
    stats_for, Attachment, MessageContent, MessageMeta, MessageSource, ModelTokens, Role,
    SessionStats, StoredMessage, StoredRecord, TurnUsage,
};
pub use ui_event::{AskUserQuestion, QueueEntry, SessionState, UiEvent};
