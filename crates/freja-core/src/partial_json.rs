// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Best-effort parsing of streaming tool-input JSON.
//!
//! Tool arguments arrive as `input_json_delta` fragments; the UI wants to
//! render fields as they stream, long before the JSON is complete.  This
//! parser completes whatever is missing — an unterminated string, unclosed
//! braces, a dangling key — and returns the best-guess object.  The strict
//! parse replaces the guess when the block stops.

use serde_json::Value;

/// Parse a possibly-truncated JSON document.
///
/// Returns `None` only when the input is empty or damaged beyond completion
/// (e.g. it never was JSON).
pub fn parse_partial_json(input: &str) -> Option<Value> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Fast path: the document may already be complete.
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    let completed = complete_json(trimmed)?;
    serde_json::from_str(&completed).ok()
}

/// Walk the input tracking string/escape state and the open-container stack,
/// then append whatever closers are needed.
///
/// A string opened right after `{` or `,` inside an object is a key; if the
/// input ends before its `:` arrives, `: null` is appended so the key
/// survives the parse.
fn complete_json(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    // Last structural character seen outside strings.
    let mut last_structural: Option<char> = None;
    // The string being (or just) parsed sits in object-key position.
    let mut string_is_key = false;
    // A key string closed but its `:` never arrived.
    let mut dangling_key = false;

    for c in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else {
                match c {
                    '\\' => escaped = true,
                    '"' => {
                        in_string = false;
                        if string_is_key {
                            dangling_key = true;
                        }
                    }
                    _ => {}
                }
            }
            out.push(c);
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                string_is_key =
                    stack.last() == Some(&'}') && matches!(last_structural, Some('{' | ','));
                last_structural = Some('"');
            }
            '{' => {
                stack.push('}');
                last_structural = Some('{');
            }
            '[' => {
                stack.push(']');
                last_structural = Some('[');
            }
            '}' | ']' => {
                // Mismatched closer: not completable.
                if stack.pop() != Some(c) {
                    return None;
                }
                last_structural = Some(c);
            }
            ':' => {
                dangling_key = false;
                last_structural = Some(':');
            }
            c if c.is_whitespace() => {}
            other => {
                last_structural = Some(other);
            }
        }
        out.push(c);
    }

    if escaped {
        // A lone trailing backslash would corrupt the closing quote.
        out.pop();
    }
    if in_string {
        out.push('"');
        if string_is_key {
            dangling_key = true;
        }
    }

    while out.ends_with(char::is_whitespace) {
        out.pop();
    }
    // Attach the closers to a complete value: `{"a": 1,` → `{"a": 1`,
    // `{"a":` → `{"a": null`, `{"a"` → `{"a": null`.
    if dangling_key {
        out.push_str(": null");
    } else if out.ends_with(',') {
        out.pop();
    } else if out.ends_with(':') {
        out.push_str(" null");
    }

    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    Some(out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
