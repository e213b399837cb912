// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Catalog of known subprocess/provider error shapes.
//!
//! Raw errors arrive as free text (stderr lines, result payloads, API error
//! bodies).  Matching is substring-based and deliberately table-driven so new
//! provider phrasings are a one-line change.  The same mapping feeds both the
//! broadcast `message-error` events and the IM bot stream callbacks.

/// Classified failure, used to pick recovery behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Image content in history the provider cannot process.  Poisons the
    /// session: every later turn would fail, so the session is auto-reset
    /// after the transcript is persisted.
    UnsupportedImage,
    InvalidModel,
    AbnormalExit,
    Auth,
    RateLimit,
    Quota,
    Overload,
    /// The provider dropped this request in favour of a newer one.
    Replaced,
    Unknown,
}

impl ErrorCategory {
    /// True when the session must be reset after persisting, because the
    /// polluted context would fail every subsequent turn.
    pub fn poisons_session(self) -> bool {
        matches!(self, Self::UnsupportedImage)
    }
}

#[derive(Debug, Clone)]
pub struct LocalizedError {
    pub category: ErrorCategory,
    pub message: String,
}

struct CatalogEntry {
    needles: &'static [&'static str],
    category: ErrorCategory,
    message: &'static str,
}

const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        needles: &["Could not process image", "unsupported image", "invalid base64 image"],
        category: ErrorCategory::UnsupportedImage,
        message: "The current provider cannot read an image in this conversation. \
                  The session will be reset to keep the assistant usable.",
    },
    CatalogEntry {
        needles: &["not_found_error", "model not found", "is not a valid model"],
        category: ErrorCategory::InvalidModel,
        message: "The selected model is not available on this provider. \
                  Pick another model and try again.",
    },
    CatalogEntry {
        needles: &["authentication_error", "invalid x-api-key", "401 Unauthorized"],
        category: ErrorCategory::Auth,
        message: "The provider rejected the credential. Check the API key or token \
                  in the provider settings.",
    },
    CatalogEntry {
        needles: &["rate_limit_error", "429"],
        category: ErrorCategory::RateLimit,
        message: "The provider is rate limiting requests. Wait a moment and retry.",
    },
    CatalogEntry {
        needles: &["insufficient_quota", "credit balance is too low", "quota exceeded"],
        category: ErrorCategory::Quota,
        message: "The provider account has run out of credit.",
    },
    CatalogEntry {
        needles: &["overloaded_error", "529"],
        category: ErrorCategory::Overload,
        message: "The provider is overloaded right now. Retry shortly.",
    },
    CatalogEntry {
        needles: &["request was superseded", "replaced by a newer request"],
        category: ErrorCategory::Replaced,
        message: "This response was replaced by a newer request.",
    },
    CatalogEntry {
        needles: &["exited with code", "process exited unexpectedly"],
        category: ErrorCategory::AbnormalExit,
        message: "The agent process exited unexpectedly. It will be restarted \
                  on the next message.",
    },
];

/// Substrings that mean "we cancelled this ourselves" — never persisted as an
/// assistant-visible error.
const CANCELLATION_NEEDLES: &[&str] = &["SIGTERM", "SIGKILL", "SIGINT", "AbortError", "aborted"];

/// Map a raw error string onto the catalog.  Unknown errors pass through
/// verbatim so nothing is hidden from the user.
pub fn localize(raw: &str) -> LocalizedError {
    for entry in CATALOG {
        if entry.needles.iter().any(|n| raw.contains(n)) {
            return LocalizedError {
                category: entry.category,
                message: entry.message.to_string(),
            };
        }
    }
    LocalizedError {
        category: ErrorCategory::Unknown,
        message: raw.to_string(),
    }
}

pub fn is_cancellation(raw: &str) -> bool {
    CANCELLATION_NEEDLES.iter().any(|n| raw.contains(n))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
