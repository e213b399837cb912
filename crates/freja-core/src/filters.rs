// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Outbound content filters.
//!
//! Two independent concerns:
//!
//! - the decorative-text filter drops cosmetic markdown some gateway APIs
//!   wrap around server tool calls (observed in the wild; table-driven since
//!   the marker set drifts with provider versions);
//! - tool-result stripping replaces opaque binary payloads with a sentinel in
//!   everything leaving the core, while the in-memory copy stays intact so
//!   the subprocess keeps its context.

/// Length window outside which the decorative filter never fires.
const DECORATIVE_MIN_LEN: usize = 50;
const DECORATIVE_MAX_LEN: usize = 5000;

/// Each rule requires *all* of its markers — a single marker is not evidence
/// enough and would eat legitimate output.
struct DecorativeRule {
    markers: &'static [&'static str],
}

const DECORATIVE_RULES: &[DecorativeRule] = &[
    // Z.ai wraps server tool invocations in a markdown card.
    DecorativeRule {
        markers: &["Z.ai Built-in Tool:", "**Input:**", "```json"],
    },
    // GLM gateway variant of the same card.
    DecorativeRule {
        markers: &["Built-in Tool Call", "**Arguments**", "```json"],
    },
];

/// Tool-name prefixes whose results are opaque binary blobs (screenshots,
/// page archives).  Their payloads never leave the core.
const STRIPPED_TOOL_PREFIXES: &[&str] = &["mcp__playwright__", "mcp__chrome-devtools__"];

/// Replacement payload for stripped results.
pub const STRIPPED_RESULT_SENTINEL: &str = "[binary tool output omitted]";

/// True when a streamed text chunk is provider decoration rather than
/// assistant content.  Filtered chunks are neither broadcast nor persisted.
pub fn is_decorative_text(chunk: &str) -> bool {
    let len = chunk.len();
    if !(DECORATIVE_MIN_LEN..=DECORATIVE_MAX_LEN).contains(&len) {
        return false;
    }
    DECORATIVE_RULES
        .iter()
        .any(|rule| rule.markers.iter().all(|m| chunk.contains(m)))
}

/// True when results of this tool must be replaced by the sentinel in
/// outbound events and persisted records.
pub fn strips_tool_result(tool_name: &str) -> bool {
    STRIPPED_TOOL_PREFIXES
        .iter()
        .any(|p| tool_name.starts_with(p))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
