// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Configuration types for the agent session core.
//!
//! The desktop shell owns `<user-dir>/config.json`; this crate only consumes
//! it.  Runtime session configuration (permission mode, provider environment,
//! system prompt) also lives here so the leaf crates can share the types.

mod loader;
mod schema;

pub use loader::{load, user_dir};
pub use schema::{
    AgentDef, Config, CredentialStrategy, McpServerDef, McpTransport, PermissionMode,
    ProviderEnv, ProxyProtocol, ProxySettings, SystemPromptConfig, SystemPromptMode,
};
