// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The stream assembler: translates the subprocess event stream into
//! mutations of the in-memory message list, outbound UI events, and per-turn
//! accounting.
//!
//! One assembler instance lives per subprocess run.  It is the only code
//! that mutates the message list; routing state (stream index → tool id,
//! child → parent) is scoped to the current turn and cleared when the turn
//! ends.  The consume loop in the controller feeds it one event at a time
//! and acts on the returned [`AssemblerOutcome`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use freja_model::{
    AgentEvent, ContentBlock, ControlRequestPayload, MessageContent, Role, StoredMessage,
    StreamPayload, SubAgentCall, SystemInitInfo, ThinkingBlock, ToolResult, ToolUseBlock,
    TurnUsage, UiEvent, UserWireContent, WireBlock, WireDelta,
};
use freja_store::SessionStore;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::events::EventBroadcaster;
use crate::filters::{is_decorative_text, strips_tool_result, STRIPPED_RESULT_SENTINEL};
use crate::localize::{is_cancellation, localize, ErrorCategory};
use crate::partial_json::parse_partial_json;
use crate::pipeline::MessagePipeline;
use crate::turn::TurnTracker;

/// What the consume loop must act on after an event.
#[derive(Debug)]
pub enum AssemblerOutcome {
    None,
    /// `system-init` arrived.  The controller decides whether to broadcast it
    /// (live session) or buffer it (pre-warm), and flips registration.
    SystemInit(SystemInitInfo),
    /// The turn closed normally.
    TurnComplete,
    /// The turn closed with an error.  `poisons_session` drives auto-reset.
    TurnError { category: ErrorCategory },
    /// The subprocess asks whether a tool may run.
    ControlRequest {
        request_id: String,
        payload: ControlRequestPayload,
    },
}

pub struct StreamAssembler {
    session_id: String,
    messages: Arc<Mutex<Vec<StoredMessage>>>,
    next_message_id: Arc<AtomicU64>,
    store: Arc<SessionStore>,
    broadcaster: Arc<EventBroadcaster>,
    pipeline: Arc<MessagePipeline>,
    tracker: Arc<TurnTracker>,
    /// Shared with the controller: a pre-warm run is promoted to active when
    /// the first user message arrives, without restarting the subprocess.
    pre_warm: Arc<AtomicBool>,

    // ── Turn-scoped routing state ────────────────────────────────────────────
    /// Message id of the assistant message currently being streamed.
    current_assistant: Option<u64>,
    /// Stream index → tool-use id.
    stream_tools: HashMap<usize, String>,
    /// Stream index → tool id whose *result* is streaming at that index.
    result_tools: HashMap<usize, String>,
    /// Child tool id → parent tool id, for the lifetime of the turn.
    child_parent: HashMap<String, String>,
    /// Stream indices carrying plain text blocks.
    text_indices: HashSet<usize>,
    /// Stream indices carrying thinking blocks.
    thinking_indices: HashSet<usize>,
}

impl StreamAssembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        messages: Arc<Mutex<Vec<StoredMessage>>>,
        next_message_id: Arc<AtomicU64>,
        store: Arc<SessionStore>,
        broadcaster: Arc<EventBroadcaster>,
        pipeline: Arc<MessagePipeline>,
        tracker: Arc<TurnTracker>,
        pre_warm: Arc<AtomicBool>,
    ) -> Self {
        Self {
            session_id,
            messages,
            next_message_id,
            store,
            broadcaster,
            pipeline,
            tracker,
            pre_warm,
            current_assistant: None,
            stream_tools: HashMap::new(),
            result_tools: HashMap::new(),
            child_parent: HashMap::new(),
            text_indices: HashSet::new(),
            thinking_indices: HashSet::new(),
        }
    }

    pub async fn handle_event(&mut self, event: AgentEvent) -> AssemblerOutcome {
        match event {
            AgentEvent::System {
                subtype,
                session_id,
                model,
                tools,
                slash_commands,
                agents,
                skills,
                plugins,
                status,
            } => {
                if subtype == "init" {
                    return AssemblerOutcome::SystemInit(SystemInitInfo {
                        session_id: session_id.unwrap_or_default(),
                        model,
                        tools,
                        slash_commands,
                        agents,
                        skills,
                        plugins,
                    });
                }
                if !self.pre_warm.load(Ordering::Acquire) {
                    self.broadcaster.emit(UiEvent::SystemStatus { status });
                }
                AssemblerOutcome::None
            }
            AgentEvent::StreamEvent {
                event,
                parent_tool_use_id,
                ..
            } => {
                self.handle_stream(event, parent_tool_use_id).await;
                AssemblerOutcome::None
            }
            AgentEvent::Assistant { uuid, .. } => {
                if let Some(uuid) = uuid {
                    self.assign_assistant_uuid(uuid).await;
                }
                AssemblerOutcome::None
            }
            AgentEvent::User { message, uuid, .. } => {
                self.handle_user_event(message.content, uuid).await;
                AssemblerOutcome::None
            }
            AgentEvent::Result {
                subtype,
                usage,
                model_usage,
                result,
                is_error,
            } => {
                self.finish_turn_usage(usage, model_usage);
                if is_error || subtype.starts_with("error") {
                    let raw = result.unwrap_or_else(|| format!("turn failed: {subtype}"));
                    self.finish_turn_error(&raw).await
                } else {
                    self.finish_turn_ok().await
                }
            }
            AgentEvent::ControlRequest {
                request_id,
                request,
            } => AssemblerOutcome::ControlRequest {
                request_id,
                payload: request,
            },
            AgentEvent::Error { message } => {
                let raw = message.unwrap_or_else(|| "agent error".to_string());
                self.finish_turn_error(&raw).await
            }
        }
    }

    // ── Streaming block handling ─────────────────────────────────────────────

    async fn handle_stream(&mut self, payload: StreamPayload, parent: Option<String>) {
        match payload {
            StreamPayload::ContentBlockStart {
                index,
                content_block,
            } => self.block_start(index, content_block, parent).await,
            StreamPayload::ContentBlockDelta { index, delta } => {
                self.block_delta(index, delta, parent).await
            }
            StreamPayload::ContentBlockStop { index } => self.block_stop(index).await,
        }
    }

    async fn block_start(&mut self, index: usize, block: WireBlock, parent: Option<String>) {
        match block {
            WireBlock::Text { text } => {
                if parent.is_some() {
                    // Sub-agent text arrives as deltas; the start is a no-op.
                    return;
                }
                self.text_indices.insert(index);
                let mut messages = self.lock_messages().await;
                let id = self.ensure_assistant(&mut messages);
                if !text.is_empty() {
                    self.append_text(&mut messages, id, &text);
                }
            }
            WireBlock::Thinking { thinking } => {
                self.thinking_indices.insert(index);
                let mut messages = self.lock_messages().await;
                let id = self.ensure_assistant(&mut messages);
                if let Some(m) = find_mut(&mut messages, id) {
                    m.blocks_mut().push(ContentBlock::Thinking(ThinkingBlock {
                        thinking,
                        stream_index: Some(index),
                        started_at: Some(Utc::now()),
                        completed: false,
                        duration_ms: None,
                    }));
                }
                drop(messages);
                self.broadcaster
                    .emit(UiEvent::ThinkingStart { message_id: id, index });
            }
            WireBlock::ToolUse { id, name, input } => {
                self.tracker.note_tool_start();
                if let Some(parent_id) = parent {
                    // A nested call made by a sub-agent.
                    self.child_parent.insert(id.clone(), parent_id.clone());
                    let call = SubAgentCall {
                        id: id.clone(),
                        name,
                        input_json: input.to_string(),
                        parsed_input: non_null(input),
                        loading: true,
                        stream_index: Some(index),
                        ..Default::default()
                    };
                    let mut messages = self.lock_messages().await;
                    if let Some(tool) = find_tool_mut(&mut messages, &parent_id) {
                        tool.sub_calls.push(call.clone());
                    }
                    drop(messages);
                    self.broadcaster.emit(UiEvent::SubagentToolUseStart {
                        parent_tool_id: parent_id,
                        call,
                    });
                    return;
                }
                self.stream_tools.insert(index, id.clone());
                let mut messages = self.lock_messages().await;
                let message_id = self.ensure_assistant(&mut messages);
                if let Some(m) = find_mut(&mut messages, message_id) {
                    let mut tool = ToolUseBlock::new(id.clone(), name.clone());
                    if let Some(v) = non_null(input) {
                        tool.input_json = v.to_string();
                        tool.parsed_input = Some(v);
                    }
                    m.blocks_mut().push(ContentBlock::ToolUse(tool));
                }
                drop(messages);
                self.broadcaster.emit(UiEvent::ToolUseStart {
                    message_id,
                    tool_id: id,
                    name,
                });
            }
            WireBlock::ServerToolUse { id, name, input } => {
                self.tracker.note_tool_start();
                self.stream_tools.insert(index, id.clone());
                // Some providers wrap the complete input in a JSON string.
                let input = match input {
                    Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
                    other => other,
                };
                let mut messages = self.lock_messages().await;
                let message_id = self.ensure_assistant(&mut messages);
                if let Some(m) = find_mut(&mut messages, message_id) {
                    let mut tool = ToolUseBlock::new(id.clone(), name.clone());
                    tool.input_json = input.to_string();
                    tool.parsed_input = non_null(input.clone());
                    m.blocks_mut().push(ContentBlock::ServerToolUse(tool));
                }
                drop(messages);
                self.broadcaster.emit(UiEvent::ServerToolUseStart {
                    message_id,
                    tool_id: id,
                    name,
                    input: non_null(input),
                });
            }
            WireBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                self.result_tools.insert(index, tool_use_id.clone());
                let text = wire_result_text(&content);
                self.attach_tool_result(&tool_use_id, text, is_error, false)
                    .await;
            }
        }
    }

    async fn block_delta(&mut self, index: usize, delta: WireDelta, parent: Option<String>) {
        match delta {
            WireDelta::TextDelta { text } => {
                if let Some(parent_id) = parent {
                    self.subagent_text_delta(&parent_id, index, &text).await;
                    return;
                }
                // Cosmetic wrapper chunks from certain gateways are dropped
                // from both broadcast and persisted content.
                if is_decorative_text(&text) {
                    debug!(len = text.len(), "decorative text chunk dropped");
                    return;
                }
                let mut messages = self.lock_messages().await;
                let id = self.ensure_assistant(&mut messages);
                self.append_text(&mut messages, id, &text);
                drop(messages);
                self.broadcaster
                    .emit(UiEvent::MessageChunk { message_id: id, text });
            }
            WireDelta::ThinkingDelta { thinking } => {
                let mut messages = self.lock_messages().await;
                let id = self.ensure_assistant(&mut messages);
                if let Some(block) = find_thinking_mut(&mut messages, id, index) {
                    block.thinking.push_str(&thinking);
                }
                drop(messages);
                self.broadcaster.emit(UiEvent::ThinkingChunk {
                    message_id: id,
                    index,
                    text: thinking,
                });
            }
            WireDelta::InputJsonDelta { partial_json } => {
                let Some(tool_id) = self.stream_tools.get(&index).cloned() else {
                    return;
                };
                let mut messages = self.lock_messages().await;
                let mut parsed = None;
                if let Some(tool) = find_tool_mut(&mut messages, &tool_id) {
                    tool.input_json.push_str(&partial_json);
                    parsed = parse_partial_json(&tool.input_json);
                    if parsed.is_some() {
                        tool.parsed_input = parsed.clone();
                    }
                }
                drop(messages);
                self.broadcaster.emit(UiEvent::ToolInputDelta {
                    tool_id,
                    delta: partial_json,
                    parsed_input: parsed,
                });
            }
            WireDelta::ToolResultDelta { text } => {
                let Some(tool_id) = self.result_tools.get(&index).cloned() else {
                    return;
                };
                let stripped = {
                    let mut messages = self.lock_messages().await;
                    let mut stripped = false;
                    if let Some(tool) = find_tool_mut(&mut messages, &tool_id) {
                        stripped = strips_tool_result(&tool.name);
                        let result = tool.result.get_or_insert_with(ToolResult::default);
                        result.content.push_str(&text);
                    }
                    stripped
                };
                if !stripped {
                    self.broadcaster
                        .emit(UiEvent::ToolResultDelta { tool_id, delta: text });
                }
            }
        }
    }

    async fn block_stop(&mut self, index: usize) {
        let mut messages = self.lock_messages().await;
        let Some(id) = self.current_assistant else {
            return;
        };
        if self.thinking_indices.contains(&index) {
            if let Some(block) = find_thinking_mut(&mut messages, id, index) {
                block.completed = true;
                block.duration_ms = block
                    .started_at
                    .map(|t| (Utc::now() - t).num_milliseconds().max(0) as u64);
            }
        } else if let Some(tool_id) = self.stream_tools.get(&index) {
            // The strict parse replaces the streaming best-effort parse when
            // the full input is valid JSON.
            if let Some(tool) = find_tool_mut(&mut messages, tool_id) {
                if let Ok(v) = serde_json::from_str::<Value>(&tool.input_json) {
                    tool.parsed_input = Some(v);
                }
            }
        } else if let Some(tool_id) = self.result_tools.get(&index).cloned() {
            let (content, is_error, stripped) = match find_tool_mut(&mut messages, &tool_id) {
                Some(tool) => {
                    let stripped = strips_tool_result(&tool.name);
                    let result = tool.result.clone().unwrap_or_default();
                    (result.content, result.is_error, stripped)
                }
                None => (String::new(), false, false),
            };
            drop(messages);
            self.broadcaster.emit(UiEvent::ToolResultComplete {
                tool_id,
                content: if stripped {
                    STRIPPED_RESULT_SENTINEL.to_string()
                } else {
                    content
                },
                is_error,
            });
            self.broadcaster
                .emit(UiEvent::ContentBlockStop { message_id: id, index });
            return;
        }
        drop(messages);
        self.broadcaster
            .emit(UiEvent::ContentBlockStop { message_id: id, index });
    }

    async fn subagent_text_delta(&mut self, parent_id: &str, index: usize, text: &str) {
        let mut call_id = None;
        {
            let mut messages = self.lock_messages().await;
            if let Some(tool) = find_tool_mut(&mut messages, parent_id) {
                // Prefer the child registered at this stream index; fall back
                // to the most recent loading child; create a placeholder when
                // the child is unknown.
                let pos = tool
                    .sub_calls
                    .iter()
                    .position(|c| c.stream_index == Some(index))
                    .or_else(|| tool.sub_calls.iter().rposition(|c| c.loading));
                let call = match pos {
                    Some(p) => &mut tool.sub_calls[p],
                    None => {
                        tool.sub_calls.push(SubAgentCall {
                            id: format!("{parent_id}-stream-{index}"),
                            name: String::new(),
                            loading: true,
                            stream_index: Some(index),
                            ..Default::default()
                        });
                        tool.sub_calls.last_mut().expect("just pushed")
                    }
                };
                let result = call.result.get_or_insert_with(String::new);
                result.push_str(text);
                call_id = Some(call.id.clone());
            }
        }
        if let Some(call_id) = call_id {
            self.broadcaster.emit(UiEvent::SubagentTextChunk {
                parent_tool_id: parent_id.to_string(),
                call_id,
                text: text.to_string(),
            });
        }
    }

    // ── User events (tool results, local command echo) ───────────────────────

    async fn handle_user_event(&mut self, content: UserWireContent, uuid: Option<String>) {
        if let UserWireContent::Blocks(blocks) = content {
            for block in blocks {
                if let WireBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } = block
                {
                    let text = wire_result_text(&content);
                    self.attach_tool_result(&tool_use_id, text, is_error, true)
                        .await;
                }
            }
        }
        if let Some(uuid) = uuid {
            self.assign_user_uuid(uuid).await;
        }
    }

    /// Attach result text to the owning tool block or sub-agent call.
    /// `complete` distinguishes a final result (user event) from a streaming
    /// start (the stream variant keeps accepting deltas).
    async fn attach_tool_result(
        &mut self,
        tool_use_id: &str,
        text: String,
        is_error: bool,
        complete: bool,
    ) {
        // A result for a sub-agent's nested call routes to the parent's list.
        if let Some(parent_id) = self.child_parent.get(tool_use_id).cloned() {
            let mut found = false;
            {
                let mut messages = self.lock_messages().await;
                if let Some(tool) = find_tool_mut(&mut messages, &parent_id) {
                    if let Some(call) = tool.sub_call_mut(tool_use_id) {
                        call.result = Some(text.clone());
                        call.is_error = is_error;
                        call.loading = false;
                        found = true;
                    }
                }
            }
            if found {
                self.broadcaster.emit(UiEvent::SubagentToolResult {
                    parent_tool_id: parent_id,
                    call_id: tool_use_id.to_string(),
                    content: text,
                    is_error,
                });
            }
            return;
        }

        let mut stripped = false;
        {
            let mut messages = self.lock_messages().await;
            if let Some(tool) = find_tool_mut(&mut messages, tool_use_id) {
                stripped = strips_tool_result(&tool.name);
                tool.result = Some(ToolResult {
                    content: text.clone(),
                    is_error,
                });
                tool.is_error = is_error;
            } else {
                warn!(tool = tool_use_id, "result for unknown tool");
                return;
            }
        }
        // Outbound payloads of opaque-binary tools carry the sentinel; the
        // in-memory result above stays intact for the subprocess's context.
        let outbound = if stripped {
            STRIPPED_RESULT_SENTINEL.to_string()
        } else {
            text
        };
        if complete {
            self.broadcaster.emit(UiEvent::ToolResultComplete {
                tool_id: tool_use_id.to_string(),
                content: outbound,
                is_error,
            });
        } else {
            self.broadcaster.emit(UiEvent::ToolResultStart {
                tool_id: tool_use_id.to_string(),
                content: outbound,
                is_error,
            });
        }
    }

    // ── UUID capture ─────────────────────────────────────────────────────────

    /// Last assistant UUID wins: a multi-event turn ends up pointing at the
    /// final assistant payload, which is the correct rewind anchor.
    async fn assign_assistant_uuid(&mut self, uuid: String) {
        let mut messages = self.lock_messages().await;
        if let Some(m) = messages.iter_mut().rev().find(|m| m.role == Role::Assistant) {
            m.agent_uuid = Some(uuid.clone());
            let message_id = m.id;
            drop(messages);
            self.broadcaster
                .emit(UiEvent::MessageSdkUuid { message_id, uuid });
        }
    }

    async fn assign_user_uuid(&mut self, uuid: String) {
        let mut messages = self.lock_messages().await;
        if let Some(m) = messages
            .iter_mut()
            .rev()
            .find(|m| m.role == Role::User && m.agent_uuid.is_none())
        {
            m.agent_uuid = Some(uuid.clone());
            let message_id = m.id;
            drop(messages);
            self.broadcaster
                .emit(UiEvent::MessageSdkUuid { message_id, uuid });
        }
    }

    // ── Turn completion ──────────────────────────────────────────────────────

    fn finish_turn_usage(
        &mut self,
        usage: Option<freja_model::WireUsage>,
        model_usage: HashMap<String, freja_model::WireUsage>,
    ) {
        let turn_usage = if !model_usage.is_empty() {
            TurnUsage::from_model_table(
                model_usage
                    .into_iter()
                    .map(|(model, u)| (model, u.into_tokens()))
                    .collect(),
            )
        } else if let Some(u) = usage {
            TurnUsage {
                totals: u.into_tokens(),
                ..Default::default()
            }
        } else {
            TurnUsage::default()
        };
        self.tracker.set_usage(turn_usage);
    }

    async fn finish_turn_ok(&mut self) -> AssemblerOutcome {
        if !self.tracker.is_active() {
            // The hard-interrupt path already finalized this turn; a late
            // result from the subprocess must not produce a second complete.
            self.clear_turn_state();
            self.pipeline.signal_turn_complete();
            return AssemblerOutcome::TurnComplete;
        }
        let summary = self.tracker.end_turn();
        {
            let mut messages = self.lock_messages().await;
            if let Some(m) = messages.iter_mut().rev().find(|m| m.role == Role::Assistant) {
                m.usage = Some(summary.usage.clone());
                m.tool_count = Some(summary.tool_count);
                m.duration_ms = Some(summary.duration_ms);
            }
        }
        self.persist().await;
        self.clear_turn_state();
        self.broadcaster.emit(UiEvent::MessageComplete {
            usage: summary.usage,
            tool_count: summary.tool_count,
            duration_ms: summary.duration_ms,
        });
        self.pipeline.signal_turn_complete();
        AssemblerOutcome::TurnComplete
    }

    async fn finish_turn_error(&mut self, raw: &str) -> AssemblerOutcome {
        self.close_dangling_thinking().await;
        self.tracker.end_turn();
        self.persist().await;
        self.clear_turn_state();

        if is_cancellation(raw) {
            // Our own teardown — not an assistant-visible error.
            debug!(error = raw, "turn ended by cancellation");
            self.broadcaster.emit(UiEvent::MessageStopped);
            self.pipeline.signal_turn_complete();
            return AssemblerOutcome::TurnError {
                category: ErrorCategory::Unknown,
            };
        }

        let localized = localize(raw);
        self.broadcaster.emit(UiEvent::MessageError {
            message: localized.message.clone(),
        });
        self.pipeline.signal_turn_complete();
        AssemblerOutcome::TurnError {
            category: localized.category,
        }
    }

    /// The interrupt path: close any dangling thinking block, persist, emit
    /// `message-stopped`, release the generator.
    pub async fn finish_turn_stopped(&mut self) {
        self.close_dangling_thinking().await;
        self.tracker.end_turn();
        self.persist().await;
        self.clear_turn_state();
        self.broadcaster.emit(UiEvent::MessageStopped);
        self.pipeline.signal_turn_complete();
    }

    async fn close_dangling_thinking(&mut self) {
        let mut messages = self.lock_messages().await;
        close_dangling_thinking_in(&mut messages);
    }

    /// Persist the in-memory list, applying result stripping to the copy
    /// that reaches disk.
    async fn persist(&self) {
        let sanitized: Vec<StoredMessage> = {
            let messages = self.lock_messages().await;
            sanitize_for_disk(&messages)
        };
        if let Err(e) = self.store.append_messages(&self.session_id, &sanitized).await {
            warn!(session = %self.session_id, error = %e, "transcript persist failed");
        }
    }

    fn clear_turn_state(&mut self) {
        self.current_assistant = None;
        self.stream_tools.clear();
        self.result_tools.clear();
        self.child_parent.clear();
        self.text_indices.clear();
        self.thinking_indices.clear();
    }

    // ── Message-list helpers ─────────────────────────────────────────────────

    /// Owned guard so the borrow of `self` ends at the call site and
    /// `&mut self` helpers stay callable while the list is locked.
    async fn lock_messages(&self) -> tokio::sync::OwnedMutexGuard<Vec<StoredMessage>> {
        Arc::clone(&self.messages).lock_owned().await
    }

    fn ensure_assistant(&mut self, messages: &mut Vec<StoredMessage>) -> u64 {
        if let Some(id) = self.current_assistant {
            return id;
        }
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        messages.push(StoredMessage::assistant(id));
        self.current_assistant = Some(id);
        id
    }

    fn append_text(&self, messages: &mut [StoredMessage], id: u64, text: &str) {
        if let Some(m) = messages.iter_mut().find(|m| m.id == id) {
            let blocks = m.blocks_mut();
            match blocks.last_mut() {
                Some(ContentBlock::Text { text: existing }) => existing.push_str(text),
                _ => blocks.push(ContentBlock::text(text)),
            }
        }
    }
}

fn find_mut(messages: &mut [StoredMessage], id: u64) -> Option<&mut StoredMessage> {
    messages.iter_mut().find(|m| m.id == id)
}

/// Mark every incomplete thinking block in the trailing assistant message
/// complete, stamping its elapsed duration.  Shared by the assembler's error
/// path and the controller's hard-interrupt path.
pub(crate) fn close_dangling_thinking_in(messages: &mut [StoredMessage]) {
    let Some(m) = messages.iter_mut().rev().find(|m| m.role == Role::Assistant) else {
        return;
    };
    if let MessageContent::Blocks(blocks) = &mut m.content {
        for block in blocks {
            if let ContentBlock::Thinking(t) = block {
                if !t.completed {
                    t.completed = true;
                    t.duration_ms = t
                        .started_at
                        .map(|s| (Utc::now() - s).num_milliseconds().max(0) as u64);
                }
            }
        }
    }
}

/// Find a tool block by id anywhere in the list (latest messages first).
fn find_tool_mut<'a>(
    messages: &'a mut [StoredMessage],
    tool_id: &str,
) -> Option<&'a mut ToolUseBlock> {
    for m in messages.iter_mut().rev() {
        if let MessageContent::Blocks(blocks) = &mut m.content {
            for block in blocks.iter_mut() {
                if let Some(tool) = block.as_tool_mut() {
                    if tool.id == tool_id {
                        return Some(tool);
                    }
                }
            }
        }
    }
    None
}

fn find_thinking_mut(
    messages: &mut [StoredMessage],
    id: u64,
    index: usize,
) -> Option<&mut ThinkingBlock> {
    let m = messages.iter_mut().find(|m| m.id == id)?;
    if let MessageContent::Blocks(blocks) = &mut m.content {
        for block in blocks.iter_mut() {
            if let ContentBlock::Thinking(t) = block {
                if t.stream_index == Some(index) {
                    return Some(t);
                }
            }
        }
    }
    None
}

fn non_null(v: Value) -> Option<Value> {
    match v {
        Value::Null => None,
        other => Some(other),
    }
}

/// Plain text of a wire tool-result payload (string or text-block list).
fn wire_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Sanitized copy of a full message list, ready for disk.
pub(crate) fn sanitize_for_disk(messages: &[StoredMessage]) -> Vec<StoredMessage> {
    messages.iter().map(strip_for_persistence).collect()
}

/// Copy for disk with opaque-binary tool results replaced by the sentinel.
fn strip_for_persistence(message: &StoredMessage) -> StoredMessage {
    let mut copy = message.clone();
    if let MessageContent::Blocks(blocks) = &mut copy.content {
        for block in blocks.iter_mut() {
            if let Some(tool) = block.as_tool_mut() {
                if strips_tool_result(&tool.name) {
                    if let Some(result) = &mut tool.result {
                        result.content = STRIPPED_RESULT_SENTINEL.to_string();
                    }
                }
            }
        }
    }
    copy
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
