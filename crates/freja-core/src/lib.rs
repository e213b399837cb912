// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent session core: subprocess supervision, message pipeline, stream
//! assembly, permission policy, and the broadcast event surface the desktop
//! shell subscribes to.
//!
//! Entry point is [`SessionController`]; everything else is wiring it owns.
//! The [`mock`] module provides a scripted subprocess driver so integration
//! tests can exercise the full stack deterministically.

mod assembler;
mod controller;
mod driver;
mod env;
mod error;
mod events;
mod filters;
mod localize;
pub mod mock;
mod partial_json;
mod permission;
mod pipeline;
mod signal;
mod turn;

pub use assembler::{AssemblerOutcome, StreamAssembler};
pub use controller::{
    ControllerOptions, EnqueueOptions, EnqueueResult, ImagePayload, RewindOutcome,
    SessionController,
};
pub use driver::{
    AgentDriver, AgentLaunch, AgentSession, ProcessDriver, SessionHandoff, SpawnError,
    StderrSignals,
};
pub use env::{build_path_var, provider_env_vars};
pub use error::CoreError;
pub use events::EventBroadcaster;
pub use filters::{is_decorative_text, strips_tool_result, STRIPPED_RESULT_SENTINEL};
pub use localize::{is_cancellation, localize, ErrorCategory, LocalizedError};
pub use partial_json::parse_partial_json;
pub use permission::{
    McpGate, PermissionDecision, PermissionEngine, PermissionReply, ASK_USER_TOOL,
};
pub use pipeline::{MessagePipeline, QueueItem, QueueOutcome, QUEUE_CAP};
pub use signal::AbortSignal;
pub use turn::{TurnSummary, TurnTracker};
