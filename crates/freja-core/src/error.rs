// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use freja_store::StoreError;

/// Typed rejections returned by the imperative interface.  Everything that
/// can go wrong inside a turn surfaces as a broadcast event instead — inbound
/// operations either return one of these or succeed; they never hang.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("queue full")]
    QueueFull,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("message not found: {0}")]
    MessageNotFound(u64),
    #[error("not a user message: {0}")]
    NotAUserMessage(u64),
    #[error("a rewind is already in progress")]
    RewindInProgress,
    #[error("ask-user input is invalid: {0}")]
    InvalidQuestionSchema(String),
}
