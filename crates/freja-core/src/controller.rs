// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The session controller: single-workspace supervisor for the agent
//! subprocess.
//!
//! Owns the subprocess lifecycle (pre-warm, resume, abort, rewind, deferred
//! restart), the runtime configuration record, and the imperative interface
//! the desktop shell calls.  Everything stateful hangs off one `Inner` shared
//! with the spawned run task; the run task drives the stream assembler and
//! reports lifecycle-relevant outcomes back through [`AssemblerOutcome`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use freja_config::{
    AgentDef, McpServerDef, PermissionMode, ProviderEnv, SystemPromptConfig,
};
use freja_mcp::{build_server_specs, ExecutionContext};
use freja_model::{
    AgentInput, Attachment, ControlRequestPayload, MessageMeta, OutboundControl,
    PermissionResponsePayload, QueueEntry, SessionState, StoredMessage, SystemInitInfo, UiEvent,
    UserInputBlock, UserInputMessage,
};
use freja_store::SessionStore;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::assembler::{
    close_dangling_thinking_in, sanitize_for_disk, AssemblerOutcome, StreamAssembler,
};
use crate::driver::{AgentDriver, AgentLaunch, AgentSession, SessionHandoff, SpawnError};
use crate::env::{build_path_var, provider_env_vars};
use crate::error::CoreError;
use crate::events::EventBroadcaster;
use crate::permission::{McpGate, PermissionDecision, PermissionEngine, PermissionReply};
use crate::pipeline::{MessagePipeline, QueueItem};
use crate::signal::AbortSignal;
use crate::turn::TurnTracker;

/// Debounce before a scheduled pre-warm actually starts.
const PRE_WARM_DEBOUNCE: Duration = Duration::from_millis(500);

/// Give up pre-warming after this many consecutive failures.
const PRE_WARM_MAX_FAILS: u32 = 3;

/// No subprocess event within this window after a start is a startup failure.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Interrupt grace before the hard cleanup path runs.
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// Session title length derived from the first user message.
const TITLE_CHARS: usize = 40;

/// Construction parameters for [`SessionController`].
pub struct ControllerOptions {
    pub user_dir: PathBuf,
    pub driver: Arc<dyn AgentDriver>,
    /// Builtin MCP server definitions shipped with the app.
    pub mcp_presets: Vec<McpServerDef>,
    pub exec_ctx: ExecutionContext,
}

/// One image attached to a user message.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub mime: String,
    pub base64_data: String,
}

/// Parameters of one enqueue call.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub text: String,
    pub images: Vec<ImagePayload>,
    pub permission_mode: Option<PermissionMode>,
    pub model: Option<String>,
    /// Requested provider environment; absent means the official endpoint.
    pub provider_env: Option<ProviderEnv>,
    pub meta: Option<MessageMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueResult {
    pub queued: bool,
    pub queue_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewindOutcome {
    pub content: String,
    pub attachments: Vec<Attachment>,
}

struct RunHandle {
    generation: u64,
    abort: Arc<AbortSignal>,
    input: mpsc::Sender<AgentInput>,
    kill: mpsc::Sender<()>,
    done: watch::Receiver<bool>,
    pre_warm: Arc<AtomicBool>,
}

impl RunHandle {
    fn is_alive(&self) -> bool {
        !*self.done.borrow()
    }
}

struct CtrlState {
    session_id: String,
    workspace: PathBuf,
    model: Option<String>,
    provider: ProviderEnv,
    mcp_override: Option<Vec<McpServerDef>>,
    agents: HashMap<String, AgentDef>,
    system_prompt: SystemPromptConfig,
    /// True iff the subprocess has accepted (or will resume) this session id
    /// since this process started.
    session_registered: bool,
    /// Rewind anchor consumed by the next resume.
    pending_resume_at: Option<String>,
    /// MCP/agents changed mid-turn; restart when the turn's result arrives.
    pending_config_restart: bool,
    session_state: SessionState,
    processing: bool,
    metadata_persisted: bool,
    system_init: Option<SystemInitInfo>,
    /// `system-init` captured during pre-warm, replayed on promotion.
    buffered_init: Option<SystemInitInfo>,
    pre_warm_fails: u32,
    pre_warm_timer: Option<JoinHandle<()>>,
    run: Option<RunHandle>,
    next_generation: u64,
}

impl CtrlState {
    fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            workspace: PathBuf::new(),
            model: None,
            provider: ProviderEnv::default(),
            mcp_override: None,
            agents: HashMap::new(),
            system_prompt: SystemPromptConfig::default(),
            session_registered: false,
            pending_resume_at: None,
            pending_config_restart: false,
            session_state: SessionState::Idle,
            processing: false,
            metadata_persisted: false,
            system_init: None,
            buffered_init: None,
            pre_warm_fails: 0,
            pre_warm_timer: None,
            run: None,
            next_generation: 0,
        }
    }
}

struct Inner {
    user_dir: PathBuf,
    store: Arc<SessionStore>,
    broadcaster: Arc<EventBroadcaster>,
    pipeline: Arc<MessagePipeline>,
    permissions: Arc<PermissionEngine>,
    tracker: Arc<TurnTracker>,
    driver: Arc<dyn AgentDriver>,
    mcp_presets: Vec<McpServerDef>,
    exec_ctx: ExecutionContext,
    messages: Arc<Mutex<Vec<StoredMessage>>>,
    next_message_id: Arc<AtomicU64>,
    state: Mutex<CtrlState>,
    /// Serializes rewinds; enqueues await it before reading any state.
    rewind_gate: Mutex<()>,
}

pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(options: ControllerOptions) -> Self {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let permissions = Arc::new(PermissionEngine::new(Arc::clone(&broadcaster)));
        let exec_ctx = options.exec_ctx;
        permissions.set_contexts(exec_ctx.is_cron(), exec_ctx.is_im());
        Self {
            inner: Arc::new(Inner {
                store: Arc::new(SessionStore::new(&options.user_dir)),
                user_dir: options.user_dir,
                broadcaster,
                pipeline: Arc::new(MessagePipeline::new()),
                permissions,
                tracker: Arc::new(TurnTracker::new()),
                driver: options.driver,
                mcp_presets: options.mcp_presets,
                exec_ctx,
                messages: Arc::new(Mutex::new(Vec::new())),
                next_message_id: Arc::new(AtomicU64::new(1)),
                state: Mutex::new(CtrlState::new()),
                rewind_gate: Mutex::new(()),
            }),
        }
    }

    // ── Subscriptions and getters ────────────────────────────────────────────

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<UiEvent> {
        self.inner.broadcaster.subscribe()
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    pub async fn get_messages(&self) -> Vec<StoredMessage> {
        self.inner.messages.lock().await.clone()
    }

    pub async fn get_session_id(&self) -> String {
        self.inner.state.lock().await.session_id.clone()
    }

    pub async fn get_system_init_info(&self) -> Option<SystemInitInfo> {
        self.inner.state.lock().await.system_init.clone()
    }

    pub async fn get_agent_state(&self) -> SessionState {
        self.inner.state.lock().await.session_state
    }

    pub fn get_log_lines(&self) -> Vec<String> {
        self.inner.broadcaster.log_lines()
    }

    pub fn get_pending_interactive_requests(&self) -> Vec<UiEvent> {
        self.inner.permissions.pending_interactive_requests()
    }

    pub async fn get_mcp_servers(&self) -> Option<Vec<McpServerDef>> {
        self.inner.state.lock().await.mcp_override.clone()
    }

    pub async fn get_agents(&self) -> HashMap<String, AgentDef> {
        self.inner.state.lock().await.agents.clone()
    }

    pub fn get_queue_status(&self) -> Vec<QueueEntry> {
        self.inner.pipeline.snapshot()
    }

    // ── Initialization ───────────────────────────────────────────────────────

    /// Adopt (or create) a session for a workspace.  With an initial prompt
    /// the first turn starts immediately; otherwise a pre-warm is scheduled
    /// so the first user message finds a live subprocess.
    pub async fn initialize(
        &self,
        workspace: &Path,
        initial_prompt: Option<String>,
        session_id: Option<String>,
    ) -> Result<(), CoreError> {
        let id = match session_id {
            Some(id) => {
                freja_store::validate_session_id(&id)?;
                id
            }
            None => Uuid::new_v4().to_string(),
        };
        let known = self.inner.store.metadata(&id).await;
        let transcript = self.inner.store.load_transcript(&id).await?;
        let next_id = transcript.iter().map(|m| m.id).max().unwrap_or(0) + 1;

        {
            let mut state = self.inner.state.lock().await;
            state.session_id = id.clone();
            state.workspace = workspace.to_path_buf();
            // A recorded subprocess-session-id means the subprocess has state
            // on disk for this id; the next start resumes instead of creating.
            state.session_registered = known
                .as_ref()
                .is_some_and(|m| m.agent_session_id.is_some());
            state.metadata_persisted = known.is_some();
        }
        {
            let mut messages = self.inner.messages.lock().await;
            *messages = transcript;
        }
        self.inner.next_message_id.store(next_id, Ordering::SeqCst);

        match initial_prompt {
            Some(prompt) => {
                self.enqueue_user_message(EnqueueOptions {
                    text: prompt,
                    ..Default::default()
                })
                .await
                .map(|_| ())
            }
            None => {
                Inner::schedule_pre_warm(&self.inner).await;
                Ok(())
            }
        }
    }

    // ── Enqueue ──────────────────────────────────────────────────────────────

    pub async fn enqueue_user_message(
        &self,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult, CoreError> {
        let inner = &self.inner;
        // Await any in-progress rewind before touching state.
        drop(inner.rewind_gate.lock().await);

        // Nothing to send.
        if options.text.is_empty() && options.images.is_empty() {
            return Ok(EnqueueResult {
                queued: false,
                queue_id: None,
            });
        }

        // Provider-switch detection runs before the busy snapshot: an
        // aborted subprocess empties the queue.
        let requested = options.provider_env.clone().unwrap_or_default();
        self.apply_provider_switch(requested).await;

        let busy = inner.tracker.is_active() || !inner.pipeline.is_empty();

        // Model/permission changes apply to the live subprocess only when
        // it is idle; a busy session inherits the current configuration.
        if !busy {
            self.apply_turn_config(options.permission_mode, options.model.clone())
                .await;
        }

        let (session_id, need_start) = {
            let state = inner.state.lock().await;
            (
                state.session_id.clone(),
                !state.run.as_ref().is_some_and(|r| r.is_alive()),
            )
        };

        // First message of this session: persist metadata with a derived
        // title.
        self.persist_metadata_if_first(&session_id, &options.text)
            .await;

        // A pre-warmed subprocess becomes the active session now.
        self.promote_pre_warm().await;

        // Attachments (images land before text in the payload).
        let mut input_blocks: Vec<UserInputBlock> = Vec::new();
        let mut attachments: Vec<Attachment> = Vec::new();
        for image in &options.images {
            let attachment_id = Uuid::new_v4().to_string();
            let saved = inner
                .store
                .save_attachment(&session_id, &attachment_id, &image.mime, &image.base64_data)
                .await?;
            attachments.push(saved);
            input_blocks.push(UserInputBlock::Image {
                source: freja_model::ImageSource::base64(
                    image.mime.clone(),
                    image.base64_data.clone(),
                ),
            });
        }
        if !options.text.is_empty() {
            input_blocks.push(UserInputBlock::Text {
                text: options.text.clone(),
            });
        }

        let message_id = inner.next_message_id.fetch_add(1, Ordering::SeqCst);
        let mut message = StoredMessage::user(message_id, options.text.clone());
        message.attachments = attachments;
        message.meta = options.meta.clone();

        let queue_id = Uuid::new_v4().to_string();
        let item = QueueItem {
            id: queue_id.clone(),
            message: message.clone(),
            input_blocks,
            original_text: options.text.clone(),
            was_queued: busy,
            resolver: None,
        };
        let preview = item.preview();

        // Queue the message, or render it immediately when nothing is running.
        if busy {
            inner.pipeline.push(item)?;
            inner.broadcaster.emit(UiEvent::QueueAdded {
                queue_id: queue_id.clone(),
                preview,
            });
        } else {
            // Not busy: this message opens a turn.  The turn accounting
            // must be reset before the generator can possibly yield the item.
            inner.tracker.begin_turn();
            {
                let mut messages = inner.messages.lock().await;
                messages.push(message.clone());
                let snapshot = sanitize_for_disk(&messages);
                drop(messages);
                if let Err(e) = inner.store.append_messages(&session_id, &snapshot).await {
                    warn!(error = %e, "user message persist failed");
                }
            }
            inner.pipeline.push(item)?;
            inner.broadcaster.emit(UiEvent::MessageReplay { message });
            Inner::set_session_state(inner, SessionState::Running).await;
            if need_start {
                Inner::start_streaming_session(inner, false).await;
            }
        }

        // Wake the generator.
        inner.pipeline.wake();
        Ok(EnqueueResult {
            queued: busy,
            queue_id: busy.then_some(queue_id),
        })
    }

    /// Provider-switch rule table.  Switching from a third-party base URL to
    /// the vanilla official endpoint requires a fresh session (thinking-block
    /// signatures are incompatible); every other change resumes.
    async fn apply_provider_switch(&self, requested: ProviderEnv) {
        let inner = &self.inner;
        let (changed, to_official, had_run) = {
            let state = inner.state.lock().await;
            let changed = state.provider != requested;
            let to_official = !state.provider.is_official() && requested.is_official();
            (changed, to_official, state.run.is_some())
        };
        if !changed {
            return;
        }
        if had_run {
            Inner::abort_current(inner).await;
            inner.pipeline.drain();
            inner.pipeline.reopen();
        }
        let mut state = inner.state.lock().await;
        state.provider = requested;
        // An init buffered by an aborted pre-warm describes the old provider.
        state.buffered_init = None;
        if to_official && had_run {
            // Fresh session: the old context cannot be replayed against the
            // official endpoint.
            state.session_id = Uuid::new_v4().to_string();
            state.session_registered = false;
            state.pending_resume_at = None;
            state.metadata_persisted = false;
            state.system_init = None;
            state.buffered_init = None;
            let session_id = state.session_id.clone();
            drop(state);
            inner.messages.lock().await.clear();
            inner.next_message_id.store(1, Ordering::SeqCst);
            inner.broadcaster.emit(UiEvent::Init {
                session_id,
                messages: Vec::new(),
            });
        }
    }

    async fn apply_turn_config(&self, mode: Option<PermissionMode>, model: Option<String>) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if let Some(mode) = mode {
            if inner.permissions.mode() != mode {
                inner.permissions.set_mode(mode);
                if let Some(run) = state.run.as_ref().filter(|r| r.is_alive()) {
                    send_control(run, OutboundControl::SetPermissionMode {
                        mode: mode.subprocess_name().to_string(),
                    });
                }
            }
        }
        if let Some(model) = model {
            if state.model.as_deref() != Some(model.as_str()) {
                state.model = Some(model.clone());
                if let Some(run) = state.run.as_ref().filter(|r| r.is_alive()) {
                    send_control(run, OutboundControl::SetModel { model });
                }
            }
        }
    }

    async fn persist_metadata_if_first(&self, session_id: &str, text: &str) {
        let inner = &self.inner;
        let workspace = {
            let mut state = inner.state.lock().await;
            if state.metadata_persisted {
                return;
            }
            state.metadata_persisted = true;
            state.workspace.clone()
        };
        let title: String = if text.is_empty() {
            "image message".to_string()
        } else {
            text.chars().take(TITLE_CHARS).collect()
        };
        if let Err(e) = inner
            .store
            .create_session_with_id(session_id, &workspace)
            .await
        {
            warn!(error = %e, "session metadata create failed");
            return;
        }
        inner
            .store
            .update_metadata(session_id, move |meta| meta.title = title)
            .await;
    }

    /// Flip an alive pre-warm run into the active session; also cancels the
    /// debounce timer of a not-yet-started pre-warm.
    async fn promote_pre_warm(&self) {
        Inner::promote_pre_warm(&self.inner).await;
    }

    // ── Interrupt ────────────────────────────────────────────────────────────

    /// Interrupt the in-flight response.  The subprocess gets
    /// [`INTERRUPT_GRACE`] to wind the turn down itself; then the hard path
    /// finalizes locally.  Either way `message-stopped` is emitted and the
    /// streaming state is cleaned up.
    pub async fn interrupt_current_response(&self) {
        let inner = &self.inner;
        let run_input = {
            let state = inner.state.lock().await;
            state
                .run
                .as_ref()
                .filter(|r| r.is_alive())
                .map(|r| r.input.clone())
        };
        if !inner.tracker.is_active() {
            return;
        }
        inner.tracker.request_stop();

        if let Some(input) = run_input {
            let _ = input
                .send(AgentInput::ControlRequest {
                    request_id: Uuid::new_v4().to_string(),
                    request: OutboundControl::Interrupt,
                })
                .await;
            let mut active = inner.tracker.subscribe_active();
            let _ = tokio::time::timeout(INTERRUPT_GRACE, async {
                while *active.borrow() {
                    if active.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }

        if inner.tracker.is_active() {
            // Hard path: the subprocess did not react in time.
            let session_id = inner.state.lock().await.session_id.clone();
            let snapshot = {
                let mut messages = inner.messages.lock().await;
                close_dangling_thinking_in(&mut messages);
                sanitize_for_disk(&messages)
            };
            if let Err(e) = inner.store.append_messages(&session_id, &snapshot).await {
                warn!(error = %e, "interrupt persist failed");
            }
            inner.tracker.end_turn();
            inner.broadcaster.emit(UiEvent::MessageStopped);
            inner.pipeline.signal_turn_complete();
        }
        Inner::set_session_state(inner, SessionState::Idle).await;
    }

    // ── Queue operations ─────────────────────────────────────────────────────

    pub fn cancel_queue_item(&self, id: &str) -> Option<String> {
        let item = self.inner.pipeline.cancel(id)?;
        self.inner.broadcaster.emit(UiEvent::QueueCancelled {
            queue_id: id.to_string(),
        });
        Some(item.original_text)
    }

    /// Move a queued item to the front and interrupt the current response so
    /// the generator yields it next.
    pub async fn force_execute_queue_item(&self, id: &str) -> bool {
        if !self.inner.pipeline.promote(id) {
            return false;
        }
        self.interrupt_current_response().await;
        true
    }

    // ── Session switching / reset / rewind ───────────────────────────────────

    pub async fn switch_to_session(&self, target_id: &str) -> Result<(), CoreError> {
        freja_store::validate_session_id(target_id)?;
        let inner = &self.inner;
        {
            let state = inner.state.lock().await;
            if state.session_id == target_id {
                return Ok(());
            }
        }
        let meta = inner
            .store
            .metadata(target_id)
            .await
            .ok_or_else(|| CoreError::UnknownSession(target_id.to_string()))?;

        Inner::abort_current(inner).await;
        self.persist_current_to_old().await;
        inner.pipeline.drain();
        inner.pipeline.reopen();
        inner.permissions.clear_session_grants();

        let transcript = inner.store.load_transcript(target_id).await?;
        let next_id = transcript.iter().map(|m| m.id).max().unwrap_or(0) + 1;
        {
            let mut state = inner.state.lock().await;
            state.session_id = target_id.to_string();
            state.workspace = meta.workspace.clone();
            state.session_registered = meta.agent_session_id.is_some();
            state.pending_resume_at = None;
            state.pending_config_restart = false;
            state.metadata_persisted = true;
            state.system_init = None;
            state.buffered_init = None;
            state.pre_warm_fails = 0;
        }
        {
            let mut messages = inner.messages.lock().await;
            *messages = transcript.clone();
        }
        inner.next_message_id.store(next_id, Ordering::SeqCst);
        inner.broadcaster.emit(UiEvent::Init {
            session_id: target_id.to_string(),
            messages: transcript,
        });
        Inner::schedule_pre_warm(inner).await;
        Ok(())
    }

    pub async fn reset_session(&self) {
        let inner = &self.inner;
        Inner::abort_current(inner).await;
        self.persist_current_to_old().await;
        inner.pipeline.drain();
        inner.pipeline.reopen();
        inner.permissions.clear_session_grants();

        let fresh_id = Uuid::new_v4().to_string();
        {
            let mut state = inner.state.lock().await;
            state.session_id = fresh_id.clone();
            state.session_registered = false;
            state.pending_resume_at = None;
            state.pending_config_restart = false;
            state.metadata_persisted = false;
            state.system_init = None;
            state.buffered_init = None;
            state.pre_warm_fails = 0;
        }
        inner.messages.lock().await.clear();
        inner.next_message_id.store(1, Ordering::SeqCst);
        inner.broadcaster.emit(UiEvent::Init {
            session_id: fresh_id,
            messages: Vec::new(),
        });
        Inner::schedule_pre_warm(inner).await;
    }

    /// Truncate the conversation back to (and including) a prior user
    /// message.  The nearest preceding assistant's subprocess UUID becomes
    /// the resume anchor for the next start; the removed message's content is
    /// returned so the UI can restore it into the input box.
    pub async fn rewind_session(&self, user_message_id: u64) -> Result<RewindOutcome, CoreError> {
        let inner = &self.inner;
        // Serialized: enqueues await this gate before reading state.
        let _gate = inner.rewind_gate.lock().await;

        let (index, removed, anchor) = {
            let messages = inner.messages.lock().await;
            let index = messages
                .iter()
                .position(|m| m.id == user_message_id)
                .ok_or(CoreError::MessageNotFound(user_message_id))?;
            if messages[index].role != freja_model::Role::User {
                return Err(CoreError::NotAUserMessage(user_message_id));
            }
            let anchor = messages[..index]
                .iter()
                .rev()
                .find(|m| m.role == freja_model::Role::Assistant)
                .and_then(|m| m.agent_uuid.clone());
            (index, messages[index].clone(), anchor)
        };

        // Ask the live subprocess to roll workspace files back to the anchor.
        // Best-effort: a failure must not block the rewind itself.
        {
            let state = inner.state.lock().await;
            if let (Some(run), Some(anchor)) = (
                state.run.as_ref().filter(|r| r.is_alive()),
                anchor.as_ref(),
            ) {
                send_control(run, OutboundControl::RewindFiles {
                    uuid: anchor.clone(),
                });
            }
        }

        Inner::abort_current(inner).await;
        inner.pipeline.reopen();

        let session_id = {
            let mut state = inner.state.lock().await;
            state.pending_resume_at = anchor;
            state.session_id.clone()
        };
        let truncated = {
            let mut messages = inner.messages.lock().await;
            messages.truncate(index);
            sanitize_for_disk(&messages)
        };
        if let Err(e) = inner.store.rewrite_transcript(&session_id, &truncated).await {
            warn!(error = %e, "rewind persist failed");
        }
        inner.broadcaster.emit(UiEvent::Init {
            session_id,
            messages: truncated,
        });
        Inner::schedule_pre_warm(inner).await;

        Ok(RewindOutcome {
            content: removed.plain_text(),
            attachments: removed.attachments,
        })
    }

    async fn persist_current_to_old(&self) {
        let inner = &self.inner;
        let session_id = inner.state.lock().await.session_id.clone();
        let persisted = inner.state.lock().await.metadata_persisted;
        if !persisted {
            return;
        }
        let snapshot = {
            let messages = inner.messages.lock().await;
            sanitize_for_disk(&messages)
        };
        if let Err(e) = inner.store.append_messages(&session_id, &snapshot).await {
            warn!(error = %e, "persist to old session failed");
        }
    }

    // ── Runtime configuration ────────────────────────────────────────────────

    /// Replace the MCP server override.  Identical input is a no-op; a real
    /// change restarts the subprocess — deferred to end of turn when one is
    /// in flight.
    pub async fn set_mcp_servers(&self, servers: Option<Vec<McpServerDef>>) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().await;
            if state.mcp_override == servers {
                return;
            }
            state.mcp_override = servers.clone();
            state.pre_warm_fails = 0;
        }
        inner.permissions.set_mcp_gate(gate_for(&servers));
        self.restart_for_config_change().await;
    }

    pub async fn set_agents(&self, agents: HashMap<String, AgentDef>) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().await;
            if state.agents == agents {
                return;
            }
            state.agents = agents.clone();
            state.pre_warm_fails = 0;
        }
        inner.permissions.set_has_agents(!agents.is_empty());
        self.restart_for_config_change().await;
    }

    pub async fn set_system_prompt_config(&self, config: SystemPromptConfig) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().await;
            if state.system_prompt == config {
                return;
            }
            state.system_prompt = config;
            state.pre_warm_fails = 0;
        }
        // Takes effect on the next start; an idle subprocess is recycled now.
        self.restart_for_config_change().await;
    }

    pub async fn set_session_model(&self, model: Option<String>) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.model == model {
            return;
        }
        state.model = model.clone();
        if let (Some(run), Some(model)) =
            (state.run.as_ref().filter(|r| r.is_alive()), model)
        {
            send_control(run, OutboundControl::SetModel { model });
        }
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) {
        let inner = &self.inner;
        if inner.permissions.mode() == mode {
            return;
        }
        inner.permissions.set_mode(mode);
        let state = inner.state.lock().await;
        if let Some(run) = state.run.as_ref().filter(|r| r.is_alive()) {
            send_control(run, OutboundControl::SetPermissionMode {
                mode: mode.subprocess_name().to_string(),
            });
        }
    }

    async fn restart_for_config_change(&self) {
        let inner = &self.inner;
        let mid_turn = inner.tracker.is_active();
        let has_run = {
            let mut state = inner.state.lock().await;
            if mid_turn && state.run.as_ref().is_some_and(|r| r.is_alive()) {
                // Restarting now would kill the in-flight response; do it
                // when the turn's result arrives.
                state.pending_config_restart = true;
                return;
            }
            state.run.is_some()
        };
        if has_run {
            Inner::abort_current(inner).await;
            inner.pipeline.reopen();
        }
        Inner::schedule_pre_warm(inner).await;
    }

    // ── Interactive responses ────────────────────────────────────────────────

    pub fn handle_permission_response(&self, request_id: &str, reply: PermissionReply) -> bool {
        self.inner
            .permissions
            .handle_permission_response(request_id, reply)
    }

    pub fn handle_ask_user_question_response(
        &self,
        request_id: &str,
        answers: Option<Vec<String>>,
    ) -> bool {
        self.inner
            .permissions
            .handle_question_response(request_id, answers)
    }
}

// ─── Run lifecycle (Inner) ────────────────────────────────────────────────────

impl Inner {
    /// Flip an alive pre-warm run into the active session: replay its
    /// buffered `system-init`, register the session, cancel the debounce
    /// timer of any not-yet-started pre-warm.  Called from the enqueue path
    /// and again by the feeder right before a user message is delivered, so
    /// a pre-warm that started concurrently with an enqueue is still
    /// promoted.
    async fn promote_pre_warm(inner: &Arc<Inner>) {
        let mut state = inner.state.lock().await;
        if let Some(timer) = state.pre_warm_timer.take() {
            timer.abort();
        }
        let Some(run) = state.run.as_ref().filter(|r| r.is_alive()) else {
            return;
        };
        if !run.pre_warm.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("pre-warm promoted to active session");
        if let Some(info) = state.buffered_init.take() {
            Inner::register_session(inner, &mut state, info).await;
        }
    }

    async fn set_session_state(inner: &Arc<Inner>, state_value: SessionState) {
        let mut state = inner.state.lock().await;
        if state.session_state == state_value {
            return;
        }
        state.session_state = state_value;
        drop(state);
        inner.broadcaster.emit(UiEvent::Status { state: state_value });
    }

    /// Debounced pre-warm: collapse bursts of config changes into one start.
    fn schedule_pre_warm<'a>(
        inner: &'a Arc<Inner>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut state = inner.state.lock().await;
            if state.pre_warm_fails >= PRE_WARM_MAX_FAILS {
                debug!("pre-warm disabled after repeated failures");
                return;
            }
            if let Some(timer) = state.pre_warm_timer.take() {
                timer.abort();
            }
            let inner_task = Arc::clone(inner);
            state.pre_warm_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(PRE_WARM_DEBOUNCE).await;
                Inner::start_streaming_session(&inner_task, true).await;
            }));
        })
    }

    /// The start algorithm.  Builds the environment and launch options,
    /// spawns the subprocess (with the already-in-use fallback), and hands
    /// the event stream to the run task.
    async fn start_streaming_session(inner: &Arc<Inner>, pre_warm: bool) {
        // Reentrancy gate: one run at a time.
        let snapshot = {
            let mut state = inner.state.lock().await;
            if state.processing || state.run.as_ref().is_some_and(|r| r.is_alive()) {
                return;
            }
            state.processing = true;
            state.run = None;
            LaunchSnapshot {
                session_id: state.session_id.clone(),
                workspace: state.workspace.clone(),
                provider: state.provider.clone(),
                model: state.model.clone(),
                registered: state.session_registered,
                resume_at: state.pending_resume_at.clone(),
                mcp_override: state.mcp_override.clone(),
                agents: state.agents.clone(),
                system_prompt: state.system_prompt.clone(),
            }
        };

        let config = freja_config::load(&inner.user_dir);
        let specs = build_server_specs(
            &inner.mcp_presets,
            snapshot.mcp_override.as_deref(),
            &config,
            &inner.exec_ctx,
        );
        inner
            .permissions
            .set_mcp_gate(gate_for(&snapshot.mcp_override));
        inner.permissions.set_has_agents(!snapshot.agents.is_empty());
        for server in &specs.in_process {
            debug!(server = %server.id, tools = ?server.tool_names(), "in-process tool server active");
        }

        let mode = inner.permissions.mode();
        let mut launch = AgentLaunch {
            workspace: snapshot.workspace.clone(),
            env: provider_env_vars(&snapshot.provider),
            path_var: build_path_var(inner.exec_ctx.bundled_runtime_dir.as_deref()),
            session: if snapshot.registered {
                SessionHandoff::Resume {
                    id: snapshot.session_id.clone(),
                    at: snapshot.resume_at.clone(),
                }
            } else {
                SessionHandoff::Fresh {
                    id: snapshot.session_id.clone(),
                }
            },
            model: snapshot.model.clone(),
            permission_mode: mode.subprocess_name().to_string(),
            skip_permissions: mode.skips_permission_checks(),
            mcp_servers: specs.external.clone(),
            agents: snapshot.agents.clone(),
            system_prompt: snapshot.system_prompt.clone(),
        };

        let session = match inner.driver.spawn(&launch).await {
            Ok(session) => session,
            Err(SpawnError::AlreadyInUse)
                if matches!(launch.session, SessionHandoff::Fresh { .. }) =>
            {
                // The subprocess already has state for this id: resume it.
                debug!(session = %snapshot.session_id, "fresh start rejected; resuming");
                inner.state.lock().await.session_registered = true;
                launch.session = SessionHandoff::Resume {
                    id: snapshot.session_id.clone(),
                    at: snapshot.resume_at.clone(),
                };
                match inner.driver.spawn(&launch).await {
                    Ok(session) => session,
                    Err(e) => {
                        Inner::fail_start(inner, pre_warm, &e.to_string()).await;
                        return;
                    }
                }
            }
            Err(e) => {
                Inner::fail_start(inner, pre_warm, &e.to_string()).await;
                return;
            }
        };

        let abort = Arc::new(AbortSignal::default());
        let pre_warm_flag = Arc::new(AtomicBool::new(pre_warm));
        let (done_tx, done_rx) = watch::channel(false);
        let generation = {
            let mut state = inner.state.lock().await;
            let generation = state.next_generation;
            state.next_generation += 1;
            state.run = Some(RunHandle {
                generation,
                abort: Arc::clone(&abort),
                input: session.input.clone(),
                kill: session.kill.clone(),
                done: done_rx,
                pre_warm: Arc::clone(&pre_warm_flag),
            });
            generation
        };

        inner.pipeline.reopen();
        // Feeder: the generator loop writing yielded messages to stdin.  It
        // watches the run's abort signal so a stale feeder from a previous
        // run can never race a reopened pipeline.
        tokio::spawn(Inner::feed_messages(
            Arc::clone(inner),
            session.input.clone(),
            Arc::clone(&abort),
        ));
        tokio::spawn(Inner::run_session(
            Arc::clone(inner),
            session,
            abort,
            pre_warm_flag,
            done_tx,
            generation,
            snapshot.session_id,
        ));
    }

    async fn fail_start(inner: &Arc<Inner>, pre_warm: bool, error: &str) {
        warn!(error, "agent subprocess start failed");
        {
            let mut state = inner.state.lock().await;
            state.processing = false;
            if pre_warm {
                state.pre_warm_fails += 1;
            }
        }
        if pre_warm {
            Inner::schedule_pre_warm(inner).await;
        } else {
            inner.broadcaster.emit(UiEvent::AgentError {
                message: crate::localize::localize(error).message,
            });
            Inner::set_session_state(inner, SessionState::Error).await;
        }
    }

    /// The generator: one user message per turn, strictly ordered by the
    /// turn-complete signal.
    async fn feed_messages(
        inner: Arc<Inner>,
        input: mpsc::Sender<AgentInput>,
        abort: Arc<AbortSignal>,
    ) {
        loop {
            let Some(mut item) = inner.pipeline.wait_for_message().await else {
                return;
            };
            if abort.is_aborted() {
                // This feeder belongs to a run being torn down; hand the item
                // back so the next run's feeder yields it.
                inner.pipeline.requeue_front(item);
                return;
            }
            if item.was_queued {
                // A deferred message renders exactly when execution starts.
                inner.tracker.begin_turn();
                let session_id = inner.state.lock().await.session_id.clone();
                {
                    let mut messages = inner.messages.lock().await;
                    messages.push(item.message.clone());
                    let snapshot = sanitize_for_disk(&messages);
                    drop(messages);
                    if let Err(e) = inner.store.append_messages(&session_id, &snapshot).await {
                        warn!(error = %e, "queued message persist failed");
                    }
                }
                inner.broadcaster.emit(UiEvent::QueueStarted {
                    queue_id: item.id.clone(),
                    message: item.message.clone(),
                });
                Inner::set_session_state(&inner, SessionState::Running).await;
            }
            item.resolve(crate::pipeline::QueueOutcome::Started);
            // Delivering a user message makes this run the active session.
            Inner::promote_pre_warm(&inner).await;

            let record = AgentInput::User {
                message: UserInputMessage::new(item.input_blocks.clone()),
                session_id: None,
            };
            if input.send(record).await.is_err() {
                return;
            }
            if !inner.pipeline.wait_turn_complete().await || abort.is_aborted() {
                return;
            }
        }
    }

    /// The consume loop plus startup watchdog and idempotent cleanup.
    #[allow(clippy::too_many_arguments)]
    async fn run_session(
        inner: Arc<Inner>,
        session: AgentSession,
        abort: Arc<AbortSignal>,
        pre_warm_flag: Arc<AtomicBool>,
        done_tx: watch::Sender<bool>,
        generation: u64,
        session_id: String,
    ) {
        let AgentSession {
            mut events,
            input,
            signals,
            kill,
        } = session;

        let mut assembler = StreamAssembler::new(
            session_id.clone(),
            Arc::clone(&inner.messages),
            Arc::clone(&inner.next_message_id),
            Arc::clone(&inner.store),
            Arc::clone(&inner.broadcaster),
            Arc::clone(&inner.pipeline),
            Arc::clone(&inner.tracker),
            Arc::clone(&pre_warm_flag),
        );

        // Startup watchdog: no event within the window means a wedged start.
        let got_first = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let got_first = Arc::clone(&got_first);
            let abort = Arc::clone(&abort);
            let kill = kill.clone();
            let broadcaster = Arc::clone(&inner.broadcaster);
            let pre_warm_flag = Arc::clone(&pre_warm_flag);
            tokio::spawn(async move {
                tokio::time::sleep(STARTUP_TIMEOUT).await;
                if !got_first.load(Ordering::Acquire) {
                    warn!("agent subprocess startup timeout");
                    if !pre_warm_flag.load(Ordering::Acquire) {
                        broadcaster.emit(UiEvent::AgentError {
                            message: "The agent process did not start in time.".to_string(),
                        });
                    }
                    abort.abort();
                    let _ = kill.try_send(());
                }
            })
        };

        let mut got_init = false;
        loop {
            let event = tokio::select! {
                _ = abort.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            got_first.store(true, Ordering::Release);

            match assembler.handle_event(event).await {
                AssemblerOutcome::None => {}
                AssemblerOutcome::SystemInit(info) => {
                    got_init = true;
                    let mut state = inner.state.lock().await;
                    state.pre_warm_fails = 0;
                    if pre_warm_flag.load(Ordering::Acquire) {
                        // Buffered for replay on promotion; registration is
                        // not flipped by a pre-warm start.
                        state.buffered_init = Some(info);
                    } else {
                        Inner::register_session(&inner, &mut state, info).await;
                    }
                }
                AssemblerOutcome::ControlRequest {
                    request_id,
                    payload,
                } => {
                    Inner::dispatch_control_request(&inner, &input, &abort, request_id, payload);
                }
                AssemblerOutcome::TurnComplete => {
                    Inner::after_turn(&inner, &abort).await;
                }
                AssemblerOutcome::TurnError { category } => {
                    Inner::after_turn(&inner, &abort).await;
                    if category.poisons_session() {
                        // The polluted context would fail every later turn.
                        let inner = Arc::clone(&inner);
                        tokio::spawn(async move {
                            SessionController {
                                inner,
                            }
                            .reset_session()
                            .await;
                        });
                        break;
                    }
                }
            }
        }

        // Finally: idempotent cleanup on every exit path.  `was_aborted`
        // distinguishes intentional teardown from unexpected exits before the
        // signal is raised for the stale-feeder guard.
        let was_aborted = abort.is_aborted();
        watchdog.abort();
        abort.abort();
        inner.pipeline.close();
        let _ = kill.try_send(());

        let pre_warm_ended = pre_warm_flag.load(Ordering::Acquire);
        let mut reschedule = false;
        {
            let mut state = inner.state.lock().await;
            if state
                .run
                .as_ref()
                .is_some_and(|r| r.generation == generation)
            {
                state.run = None;
            }
            state.processing = false;

            // Stderr "already in use" recovery: the next start resumes.
            if signals.already_in_use() && !state.session_registered {
                debug!("session already in use; switching to resume");
                state.session_registered = true;
            }

            if pre_warm_ended && !got_init && !was_aborted {
                state.pre_warm_fails += 1;
                reschedule = state.pre_warm_fails < PRE_WARM_MAX_FAILS;
            } else if !pre_warm_ended && !was_aborted && state.session_registered {
                // Unexpected exit of a live session: recover with a pre-warm.
                reschedule = true;
            }
        }
        if !pre_warm_ended {
            Inner::set_session_state(&inner, SessionState::Idle).await;
        }
        if reschedule {
            Inner::schedule_pre_warm(&inner).await;
        }
        // The termination promise resolves last: whoever awaited the abort
        // observes fully cleaned-up state.
        let _ = done_tx.send(true);
        debug!(generation, "agent run finished");
    }

    async fn register_session(inner: &Arc<Inner>, state: &mut CtrlState, info: SystemInitInfo) {
        state.session_registered = true;
        state.pending_resume_at = None;
        state.system_init = Some(info.clone());
        let our_id = state.session_id.clone();
        let agent_id = info.session_id.clone();
        let unified = agent_id == our_id;
        inner
            .store
            .update_metadata(&our_id, move |meta| {
                meta.agent_session_id = Some(agent_id);
                meta.unified = unified;
            })
            .await;
        inner.broadcaster.emit(UiEvent::SystemInit { info });
    }

    fn dispatch_control_request(
        inner: &Arc<Inner>,
        input: &mpsc::Sender<AgentInput>,
        abort: &Arc<AbortSignal>,
        request_id: String,
        payload: ControlRequestPayload,
    ) {
        let ControlRequestPayload::CanUseTool { tool_name, input: tool_input } = payload;
        let permissions = Arc::clone(&inner.permissions);
        let input = input.clone();
        let abort = Arc::clone(abort);
        // Permission waits may take minutes; they must not block the stream.
        tokio::spawn(async move {
            let decision = permissions.decide(&tool_name, &tool_input, &abort).await;
            let response = match decision {
                PermissionDecision::Allow { updated_input } => {
                    PermissionResponsePayload::Allow { updated_input }
                }
                PermissionDecision::Deny { message } => {
                    PermissionResponsePayload::Deny { message }
                }
            };
            let _ = input
                .send(AgentInput::ControlResponse {
                    request_id,
                    response,
                })
                .await;
        });
    }

    /// Hooks that run when a turn's result (or error) lands.
    async fn after_turn(inner: &Arc<Inner>, abort: &Arc<AbortSignal>) {
        let restart = {
            let mut state = inner.state.lock().await;
            std::mem::take(&mut state.pending_config_restart)
        };
        if restart {
            debug!("applying deferred config restart");
            inner
                .broadcaster
                .debug_message("configuration changed mid-turn; restarting agent");
            abort.abort();
            Inner::schedule_pre_warm(inner).await;
            return;
        }
        if inner.pipeline.is_empty() {
            Inner::set_session_state(inner, SessionState::Idle).await;
        }
    }

    /// Tear the current run down and wait until it is fully gone.  No event
    /// from the old subprocess can land after this returns.
    async fn abort_current(inner: &Arc<Inner>) {
        let run = { inner.state.lock().await.run.take() };
        let Some(run) = run else { return };
        run.abort.abort();
        inner.pipeline.close();
        inner.pipeline.signal_turn_complete();
        let _ = run.input.try_send(AgentInput::ControlRequest {
            request_id: Uuid::new_v4().to_string(),
            request: OutboundControl::Interrupt,
        });
        let _ = run.kill.try_send(());
        let mut done = run.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }
}

struct LaunchSnapshot {
    session_id: String,
    workspace: PathBuf,
    provider: ProviderEnv,
    model: Option<String>,
    registered: bool,
    resume_at: Option<String>,
    mcp_override: Option<Vec<McpServerDef>>,
    agents: HashMap<String, AgentDef>,
    system_prompt: SystemPromptConfig,
}

fn gate_for(servers: &Option<Vec<McpServerDef>>) -> McpGate {
    match servers {
        None => McpGate::AllowAll,
        Some(list) if list.is_empty() => McpGate::Disabled,
        Some(list) => McpGate::Enabled(list.iter().map(|s| s.id.clone()).collect()),
    }
}

fn send_control(run: &RunHandle, control: OutboundControl) {
    let _ = run.input.try_send(AgentInput::ControlRequest {
        request_id: Uuid::new_v4().to_string(),
        request: control,
    });
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{text_turn, ScriptedDriver, ScriptedRun};
    use crate::pipeline::QUEUE_CAP;
    use freja_model::{AgentEvent, Role, StreamPayload, WireDelta};
    use tokio::sync::broadcast;

    struct Fixture {
        controller: SessionController,
        driver: Arc<ScriptedDriver>,
        events: broadcast::Receiver<UiEvent>,
        _dir: tempfile::TempDir,
    }

    fn fixture(runs: Vec<ScriptedRun>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(ScriptedDriver::new(runs));
        let controller = SessionController::new(ControllerOptions {
            user_dir: dir.path().to_path_buf(),
            driver: Arc::clone(&driver) as Arc<dyn AgentDriver>,
            mcp_presets: vec![],
            exec_ctx: ExecutionContext::default(),
        });
        let events = controller.subscribe();
        Fixture {
            controller,
            driver,
            events,
            _dir: dir,
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<UiEvent>) -> UiEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<UiEvent>,
        mut pred: impl FnMut(&UiEvent) -> bool,
    ) -> UiEvent {
        loop {
            let event = next_event(rx).await;
            if pred(&event) {
                return event;
            }
        }
    }

    fn enqueue_text(text: &str) -> EnqueueOptions {
        EnqueueOptions {
            text: text.to_string(),
            ..Default::default()
        }
    }

    /// A turn that streams one chunk but never produces a result, keeping the
    /// session busy for queue tests.
    fn stuck_turn() -> Vec<AgentEvent> {
        vec![AgentEvent::StreamEvent {
            event: StreamPayload::ContentBlockDelta {
                index: 0,
                delta: WireDelta::TextDelta {
                    text: "working…".into(),
                },
            },
            parent_tool_use_id: None,
            session_id: None,
        }]
    }

    // ── Basic turn flow ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn first_message_runs_a_full_turn() {
        let mut f = fixture(vec![
            ScriptedRun::with_init("agent-1").then_turn(text_turn("the answer", Some("uuid-1")))
        ]);
        f.controller
            .initialize(Path::new("/ws"), None, Some("sess-1".into()))
            .await
            .unwrap();
        let result = f
            .controller
            .enqueue_user_message(enqueue_text("question"))
            .await
            .unwrap();
        assert!(!result.queued);

        wait_for(&mut f.events, |e| {
            matches!(e, UiEvent::MessageReplay { message } if message.plain_text() == "question")
        })
        .await;
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;

        let messages = f.controller.get_messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].plain_text(), "the answer");
        assert!(messages[1].usage.is_some());
        assert_eq!(messages[1].agent_uuid.as_deref(), Some("uuid-1"));

        // Metadata carries the derived title and the subprocess session id.
        let meta = f.controller.store().metadata("sess-1").await.unwrap();
        assert_eq!(meta.title, "question");
        assert_eq!(meta.agent_session_id.as_deref(), Some("agent-1"));

        // Transcript on disk matches the in-memory list.
        let stored = f.controller.store().load_transcript("sess-1").await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    // ── Scenario: queued-message render timing ────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn queued_message_renders_only_when_yielded() {
        let mut f = fixture(vec![ScriptedRun::with_init("agent-1")
            .then_turn(text_turn("answer A", Some("uuid-A")))
            .then_turn(text_turn("answer B", Some("uuid-B")))]);
        f.controller
            .initialize(Path::new("/ws"), None, Some("sess-1".into()))
            .await
            .unwrap();

        let a = f
            .controller
            .enqueue_user_message(enqueue_text("A"))
            .await
            .unwrap();
        assert!(!a.queued);
        let b = f
            .controller
            .enqueue_user_message(enqueue_text("B"))
            .await
            .unwrap();
        assert!(b.queued);
        let b_id = b.queue_id.unwrap();

        // Ordering: replay(A) … queue-added(B) … complete(A) …
        // queue-started(B) … complete(B).
        wait_for(&mut f.events, |e| {
            matches!(e, UiEvent::MessageReplay { message } if message.plain_text() == "A")
        })
        .await;
        wait_for(
            &mut f.events,
            |e| matches!(e, UiEvent::QueueAdded { queue_id, .. } if *queue_id == b_id),
        )
        .await;
        let mut saw_complete_a = false;
        let started = wait_for(&mut f.events, |e| {
            if matches!(e, UiEvent::MessageComplete { .. }) && !saw_complete_a {
                saw_complete_a = true;
                false
            } else {
                matches!(e, UiEvent::QueueStarted { .. })
            }
        })
        .await;
        match started {
            UiEvent::QueueStarted { queue_id, message } => {
                assert_eq!(queue_id, b_id);
                assert_eq!(message.plain_text(), "B");
            }
            other => panic!("expected queue-started, got {other:?}"),
        }
        assert!(saw_complete_a, "B must start only after A completed");
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;

        let stored = f.controller.store().load_transcript("sess-1").await.unwrap();
        let texts: Vec<String> = stored.iter().map(|m| m.plain_text()).collect();
        assert_eq!(texts, vec!["A", "answer A", "B", "answer B"]);
    }

    // ── Scenario: queue cap and cancel ────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn eleventh_busy_enqueue_is_rejected() {
        let mut f = fixture(vec![ScriptedRun::with_init("agent-1").then_turn(stuck_turn())]);
        f.controller
            .initialize(Path::new("/ws"), None, Some("sess-1".into()))
            .await
            .unwrap();
        f.controller
            .enqueue_user_message(enqueue_text("first"))
            .await
            .unwrap();
        // Wait until the turn is streaming so the queue is drained of the
        // immediate item.
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageChunk { .. })).await;

        for i in 0..QUEUE_CAP {
            let r = f
                .controller
                .enqueue_user_message(enqueue_text(&format!("queued {i}")))
                .await
                .unwrap();
            assert!(r.queued);
        }
        assert!(matches!(
            f.controller
                .enqueue_user_message(enqueue_text("one too many"))
                .await,
            Err(CoreError::QueueFull)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_queue_item_returns_original_text() {
        let mut f = fixture(vec![ScriptedRun::with_init("agent-1").then_turn(stuck_turn())]);
        f.controller
            .initialize(Path::new("/ws"), None, Some("sess-1".into()))
            .await
            .unwrap();
        f.controller
            .enqueue_user_message(enqueue_text("first"))
            .await
            .unwrap();
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageChunk { .. })).await;

        let queued = f
            .controller
            .enqueue_user_message(enqueue_text("cancel me"))
            .await
            .unwrap();
        let id = queued.queue_id.unwrap();
        assert_eq!(
            f.controller.cancel_queue_item(&id).as_deref(),
            Some("cancel me")
        );
        assert!(f.controller.get_queue_status().is_empty());
        wait_for(
            &mut f.events,
            |e| matches!(e, UiEvent::QueueCancelled { queue_id } if *queue_id == id),
        )
        .await;
        // A second cancel finds nothing.
        assert!(f.controller.cancel_queue_item(&id).is_none());
    }

    // ── Scenario: provider switch third-party → official ──────────────────────

    #[tokio::test(start_paused = true)]
    async fn third_party_to_official_switch_starts_fresh() {
        let mut f = fixture(vec![
            ScriptedRun::with_init("agent-1").then_turn(text_turn("from third", Some("u1"))),
            ScriptedRun::with_init("agent-2").then_turn(text_turn("from official", Some("u2"))),
        ]);
        f.controller
            .initialize(Path::new("/ws"), None, Some("sess-1".into()))
            .await
            .unwrap();
        f.controller
            .enqueue_user_message(EnqueueOptions {
                text: "hello".into(),
                provider_env: Some(ProviderEnv {
                    base_url: Some("https://third.example".into()),
                    credential: Some("tok".into()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;
        let old_id = f.controller.get_session_id().await;
        assert_eq!(old_id, "sess-1");

        // No provider env on the next message means the official endpoint.
        f.controller
            .enqueue_user_message(enqueue_text("and now official"))
            .await
            .unwrap();

        // A fresh session id was adopted and the history cleared before the
        // new first message landed.
        let new_id = f.controller.get_session_id().await;
        assert_ne!(new_id, old_id);
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;

        let messages = f.controller.get_messages().await;
        assert_eq!(messages.len(), 2, "old history must not carry over");
        assert_eq!(messages[0].plain_text(), "and now official");

        // The switch launched the new session fresh, with the base URL
        // cleared in its environment.
        let launches = f.driver.launches.lock().unwrap();
        let last = launches.last().unwrap();
        match &last.session {
            SessionHandoff::Fresh { id } => assert_eq!(*id, new_id),
            other => panic!("expected fresh session, got {other:?}"),
        }
        let base = last
            .env
            .iter()
            .find(|(k, _)| k == "ANTHROPIC_BASE_URL")
            .unwrap();
        assert_eq!(base.1, None);
    }

    #[tokio::test(start_paused = true)]
    async fn same_provider_enqueue_is_not_a_switch() {
        let mut f = fixture(vec![ScriptedRun::with_init("agent-1")
            .then_turn(text_turn("one", None))
            .then_turn(text_turn("two", None))]);
        f.controller
            .initialize(Path::new("/ws"), None, Some("sess-1".into()))
            .await
            .unwrap();
        f.controller
            .enqueue_user_message(enqueue_text("first"))
            .await
            .unwrap();
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;
        f.controller
            .enqueue_user_message(enqueue_text("second"))
            .await
            .unwrap();
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;
        assert_eq!(f.driver.launch_count(), 1, "no restart for same provider");
        assert_eq!(f.controller.get_session_id().await, "sess-1");
    }

    // ── Scenario: rewind ──────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn rewind_truncates_and_sets_resume_anchor() {
        let mut f = fixture(vec![
            ScriptedRun::with_init("agent-1")
                .then_turn(text_turn("a1", Some("uuid-X")))
                .then_turn(text_turn("a2", Some("uuid-Y"))),
        ]);
        f.controller
            .initialize(Path::new("/ws"), None, Some("sess-1".into()))
            .await
            .unwrap();
        f.controller
            .enqueue_user_message(enqueue_text("u1"))
            .await
            .unwrap();
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;
        f.controller
            .enqueue_user_message(enqueue_text("u2"))
            .await
            .unwrap();
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;

        let messages = f.controller.get_messages().await;
        assert_eq!(messages.len(), 4);
        let u2_id = messages[2].id;

        let outcome = f.controller.rewind_session(u2_id).await.unwrap();
        assert_eq!(outcome.content, "u2");

        let after = f.controller.get_messages().await;
        assert_eq!(after.len(), 2);
        assert!(after.iter().all(|m| m.id != u2_id));

        // The truncated transcript was rewritten on disk.
        let stored = f.controller.store().load_transcript("sess-1").await.unwrap();
        assert_eq!(stored.len(), 2);

        // The next start resumes at the nearest preceding assistant's UUID.
        tokio::time::sleep(Duration::from_secs(2)).await;
        let launches = f.driver.launches.lock().unwrap();
        match &launches.last().unwrap().session {
            SessionHandoff::Resume { id, at } => {
                assert_eq!(id, "sess-1");
                assert_eq!(at.as_deref(), Some("uuid-X"));
            }
            other => panic!("expected resume with anchor, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rewind_rejects_non_user_messages() {
        let mut f = fixture(vec![
            ScriptedRun::with_init("agent-1").then_turn(text_turn("a1", Some("uuid-X")))
        ]);
        f.controller
            .initialize(Path::new("/ws"), None, Some("sess-1".into()))
            .await
            .unwrap();
        f.controller
            .enqueue_user_message(enqueue_text("u1"))
            .await
            .unwrap();
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;
        let assistant_id = f.controller.get_messages().await[1].id;
        assert!(matches!(
            f.controller.rewind_session(assistant_id).await,
            Err(CoreError::NotAUserMessage(_))
        ));
        assert!(matches!(
            f.controller.rewind_session(999).await,
            Err(CoreError::MessageNotFound(999))
        ));
    }

    // ── Scenario: pre-warm already-in-use recovery ────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn pre_warm_recovers_from_already_in_use_stderr() {
        let mut f = fixture(vec![
            ScriptedRun {
                stderr_already_in_use: true,
                ..Default::default()
            },
            ScriptedRun::with_init("agent-1"),
        ]);
        // Metadata exists but no subprocess session id is recorded, so the
        // first attempt creates fresh.
        f.controller
            .store()
            .create_session_with_id("sess-S", Path::new("/ws"))
            .await
            .unwrap();
        f.controller
            .initialize(Path::new("/ws"), None, Some("sess-S".into()))
            .await
            .unwrap();

        // Let the first pre-warm fail and the recovery pre-warm run.
        tokio::time::sleep(Duration::from_secs(5)).await;

        let launches = f.driver.launches.lock().unwrap();
        assert!(launches.len() >= 2, "expected a retry, got {}", launches.len());
        assert!(matches!(
            &launches[0].session,
            SessionHandoff::Fresh { id } if id == "sess-S"
        ));
        assert!(matches!(
            &launches[1].session,
            SessionHandoff::Resume { id, .. } if id == "sess-S"
        ));
        drop(launches);

        // No user-visible error was broadcast along the way.
        while let Ok(event) = f.events.try_recv() {
            assert!(
                !matches!(event, UiEvent::AgentError { .. } | UiEvent::MessageError { .. }),
                "pre-warm recovery must stay silent, got {event:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn synchronous_already_in_use_falls_back_to_resume() {
        let f = fixture(vec![
            ScriptedRun {
                fail_already_in_use: true,
                ..Default::default()
            },
            ScriptedRun::with_init("agent-1").then_turn(text_turn("hi", None)),
        ]);
        let mut events = f.controller.subscribe();
        f.controller
            .initialize(Path::new("/ws"), Some("hello".into()), Some("sess-S".into()))
            .await
            .unwrap();
        wait_for(&mut events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;

        let launches = f.driver.launches.lock().unwrap();
        assert_eq!(launches.len(), 2);
        assert!(matches!(&launches[0].session, SessionHandoff::Fresh { .. }));
        assert!(matches!(&launches[1].session, SessionHandoff::Resume { .. }));
    }

    // ── Config changes ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn set_mcp_servers_is_idempotent() {
        let f = fixture(vec![ScriptedRun::with_init("agent-1"), ScriptedRun::with_init("agent-1")]);
        f.controller
            .initialize(Path::new("/ws"), None, Some("sess-1".into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let after_init = f.driver.launch_count();

        let servers = Some(vec![McpServerDef {
            id: "playwright".into(),
            name: None,
            builtin: true,
            transport: freja_config::McpTransport::Stdio {
                command: "npx".into(),
                args: vec![],
                env: HashMap::new(),
            },
        }]);
        f.controller.set_mcp_servers(servers.clone()).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let after_change = f.driver.launch_count();
        assert!(after_change > after_init, "a real change restarts");

        // Same value again: no restart.
        f.controller.set_mcp_servers(servers.clone()).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.driver.launch_count(), after_change);
        assert_eq!(f.controller.get_mcp_servers().await, servers);
    }

    #[tokio::test(start_paused = true)]
    async fn mcp_change_mid_turn_defers_restart() {
        let mut f = fixture(vec![ScriptedRun::with_init("agent-1")
            .then_turn(text_turn("slow answer", None))]);
        f.controller
            .initialize(Path::new("/ws"), None, Some("sess-1".into()))
            .await
            .unwrap();
        f.controller
            .enqueue_user_message(enqueue_text("go"))
            .await
            .unwrap();
        // Change MCP servers while the turn may be in flight; whether the
        // restart happened immediately (turn already over) or deferred, the
        // subprocess must end up restarted exactly once for the change.
        f.controller
            .set_mcp_servers(Some(vec![]))
            .await;
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.driver.launch_count() >= 2);
        assert_eq!(f.controller.get_mcp_servers().await, Some(vec![]));
    }

    // ── Reset and switch ──────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn reset_adopts_fresh_id_and_clears_messages() {
        let mut f = fixture(vec![
            ScriptedRun::with_init("agent-1").then_turn(text_turn("hi", None)),
            ScriptedRun::with_init("agent-2"),
        ]);
        f.controller
            .initialize(Path::new("/ws"), None, Some("sess-1".into()))
            .await
            .unwrap();
        f.controller
            .enqueue_user_message(enqueue_text("x"))
            .await
            .unwrap();
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;

        f.controller.reset_session().await;
        let new_id = f.controller.get_session_id().await;
        assert_ne!(new_id, "sess-1");
        assert!(f.controller.get_messages().await.is_empty());
        wait_for(
            &mut f.events,
            |e| matches!(e, UiEvent::Init { messages, .. } if messages.is_empty()),
        )
        .await;
        // The old transcript is still on disk.
        let old = f.controller.store().load_transcript("sess-1").await.unwrap();
        assert_eq!(old.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_persists_old_session_and_loads_target() {
        let mut f = fixture(vec![
            ScriptedRun::with_init("agent-1").then_turn(text_turn("hi", None)),
            ScriptedRun::with_init("agent-2"),
        ]);
        // Pre-create the target session with one message on disk.
        let store = Arc::clone(f.controller.store());
        store
            .create_session_with_id("sess-target", Path::new("/other"))
            .await
            .unwrap();
        store
            .append_messages("sess-target", &[StoredMessage::user(1, "old hello")])
            .await
            .unwrap();

        f.controller
            .initialize(Path::new("/ws"), None, Some("sess-1".into()))
            .await
            .unwrap();
        f.controller
            .enqueue_user_message(enqueue_text("x"))
            .await
            .unwrap();
        wait_for(&mut f.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;

        f.controller.switch_to_session("sess-target").await.unwrap();
        assert_eq!(f.controller.get_session_id().await, "sess-target");
        let messages = f.controller.get_messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].plain_text(), "old hello");

        // Switching to the current session is a no-op.
        f.controller.switch_to_session("sess-target").await.unwrap();
        // Unknown targets are typed errors.
        assert!(matches!(
            f.controller.switch_to_session("sess-nope").await,
            Err(CoreError::UnknownSession(_))
        ));
    }
}

