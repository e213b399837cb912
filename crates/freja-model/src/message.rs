// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::ContentBlock;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Message payload: plain text for user input, structured blocks for
/// assistant responses (and for multimodal user messages).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated plain text of this content (tool blocks are skipped).
    pub fn plain_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Where a user message came from.  Desktop is the default; the IM variants
/// are stamped by the bot gateways through the enqueue metadata.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    #[default]
    Desktop,
    TelegramPrivate,
    TelegramGroup,
    FeishuPrivate,
    FeishuGroup,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMeta {
    #[serde(default)]
    pub source: MessageSource,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sender_name: Option<String>,
}

/// An image (or other blob) saved alongside a user message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub id: String,
    /// Path relative to the attachments root, e.g. `<session>/<id>.png`.
    pub path: String,
    pub mime: String,
}

/// One message in a session, in memory and (via [`StoredRecord`]) on disk.
///
/// `id` is monotonic per session.  `agent_uuid` is the subprocess-assigned
/// UUID used as the rewind anchor; on a multi-event turn the last one wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: u64,
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_uuid: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta: Option<MessageMeta>,
    /// Set only on the final assistant message of a turn.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<TurnUsage>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<u64>,
}

impl StoredMessage {
    pub fn user(id: u64, text: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::User,
            content: MessageContent::Text(text.into()),
            timestamp: Utc::now(),
            agent_uuid: None,
            attachments: Vec::new(),
            meta: None,
            usage: None,
            tool_count: None,
            duration_ms: None,
        }
    }

    /// A fresh assistant message with an empty block list, ready for the
    /// stream assembler to fill.
    pub fn assistant(id: u64) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: MessageContent::Blocks(Vec::new()),
            timestamp: Utc::now(),
            agent_uuid: None,
            attachments: Vec::new(),
            meta: None,
            usage: None,
            tool_count: None,
            duration_ms: None,
        }
    }

    pub fn blocks(&self) -> Option<&Vec<ContentBlock>> {
        match &self.content {
            MessageContent::Blocks(b) => Some(b),
            _ => None,
        }
    }

    pub fn blocks_mut(&mut self) -> &mut Vec<ContentBlock> {
        if let MessageContent::Text(t) = &self.content {
            // Promote plain text to a block list so streamed blocks can follow.
            let existing = if t.is_empty() {
                Vec::new()
            } else {
                vec![ContentBlock::text(t.clone())]
            };
            self.content = MessageContent::Blocks(existing);
        }
        match &mut self.content {
            MessageContent::Blocks(b) => b,
            MessageContent::Text(_) => unreachable!("promoted above"),
        }
    }

    pub fn plain_text(&self) -> String {
        self.content.plain_text()
    }
}

// ─── On-disk record ───────────────────────────────────────────────────────────

/// The JSONL line format.  Structured content is stored as a serialized JSON
/// string so each transcript line stays a flat, single-line record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: u64,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub structured: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_uuid: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta: Option<MessageMeta>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<TurnUsage>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<u64>,
}

impl StoredMessage {
    pub fn to_record(&self) -> StoredRecord {
        let (content, structured) = match &self.content {
            MessageContent::Text(t) => (t.clone(), false),
            MessageContent::Blocks(b) => {
                (serde_json::to_string(b).unwrap_or_default(), true)
            }
        };
        StoredRecord {
            id: self.id,
            role: self.role,
            content,
            structured,
            timestamp: self.timestamp,
            agent_uuid: self.agent_uuid.clone(),
            attachments: self.attachments.clone(),
            meta: self.meta.clone(),
            usage: self.usage.clone(),
            tool_count: self.tool_count,
            duration_ms: self.duration_ms,
        }
    }

    /// Rebuild the in-memory form.  A structured record whose content string
    /// no longer parses degrades to plain text rather than being dropped.
    pub fn from_record(r: StoredRecord) -> Self {
        let content = if r.structured {
            match serde_json::from_str::<Vec<ContentBlock>>(&r.content) {
                Ok(blocks) => MessageContent::Blocks(blocks),
                Err(_) => MessageContent::Text(r.content),
            }
        } else {
            MessageContent::Text(r.content)
        };
        Self {
            id: r.id,
            role: r.role,
            content,
            timestamp: r.timestamp,
            agent_uuid: r.agent_uuid,
            attachments: r.attachments,
            meta: r.meta,
            usage: r.usage,
            tool_count: r.tool_count,
            duration_ms: r.duration_ms,
        }
    }
}

// ─── Usage accounting ─────────────────────────────────────────────────────────

/// Token counts for one model within a turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelTokens {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
}

impl ModelTokens {
    pub fn add(&mut self, other: &ModelTokens) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
    }
}

/// Aggregate usage for one assistant turn.
///
/// When the subprocess reports a per-model table, `by_model` holds it and
/// `primary_model` is the model with the largest input+output total;
/// otherwise only the flat totals are populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TurnUsage {
    #[serde(flatten)]
    pub totals: ModelTokens,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub by_model: HashMap<String, ModelTokens>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub primary_model: Option<String>,
}

impl TurnUsage {
    pub fn is_empty(&self) -> bool {
        let t = &self.totals;
        t.input_tokens == 0
            && t.output_tokens == 0
            && t.cache_read_tokens == 0
            && t.cache_creation_tokens == 0
    }

    /// Fold a per-model table into totals and pick the primary model.
    pub fn from_model_table(table: HashMap<String, ModelTokens>) -> Self {
        let mut totals = ModelTokens::default();
        let mut primary: Option<(&String, u64)> = None;
        for (model, tokens) in &table {
            totals.add(tokens);
            let weight = tokens.input_tokens + tokens.output_tokens;
            if primary.map(|(_, w)| weight > w).unwrap_or(true) {
                primary = Some((model, weight));
            }
        }
        let primary_model = primary.map(|(m, _)| m.clone());
        Self {
            totals,
            by_model: table,
            primary_model,
        }
    }
}

// ─── Session statistics ───────────────────────────────────────────────────────

/// Cumulative counters carried on a session's metadata record.
///
/// Merged incrementally: [`stats_for`] is computed over only the newly
/// appended message tail, never over the full transcript.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStats {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub turns: u64,
    #[serde(default)]
    pub tool_calls: u64,
    #[serde(default)]
    pub duration_ms: u64,
}

impl SessionStats {
    pub fn merge(&mut self, other: &SessionStats) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.turns += other.turns;
        self.tool_calls += other.tool_calls;
        self.duration_ms += other.duration_ms;
    }
}

/// Stats over a message slice.  Only final assistant messages (the ones
/// carrying usage) contribute.
pub fn stats_for(messages: &[StoredMessage]) -> SessionStats {
    let mut stats = SessionStats::default();
    for m in messages {
        if let Some(usage) = &m.usage {
            stats.input_tokens += usage.totals.input_tokens;
            stats.output_tokens += usage.totals.output_tokens;
            stats.cache_read_tokens += usage.totals.cache_read_tokens;
            stats.cache_creation_tokens += usage.totals.cache_creation_tokens;
            stats.turns += 1;
        }
        stats.tool_calls += u64::from(m.tool_count.unwrap_or(0));
        stats.duration_ms += m.duration_ms.unwrap_or(0);
    }
    stats
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ContentBlock, ToolUseBlock};

    #[test]
    fn text_message_round_trips_through_record() {
        let m = StoredMessage::user(3, "hello");
        let back = StoredMessage::from_record(m.to_record());
        assert_eq!(m, back);
    }

    #[test]
    fn structured_message_round_trips_through_record() {
        let mut m = StoredMessage::assistant(4);
        m.blocks_mut().push(ContentBlock::text("hi"));
        m.blocks_mut()
            .push(ContentBlock::ToolUse(ToolUseBlock::new("t1", "Bash")));
        let rec = m.to_record();
        assert!(rec.structured);
        let back = StoredMessage::from_record(rec);
        assert_eq!(m, back);
    }

    #[test]
    fn corrupt_structured_content_degrades_to_text() {
        let rec = StoredRecord {
            id: 1,
            role: Role::Assistant,
            content: "not json".into(),
            structured: true,
            timestamp: Utc::now(),
            agent_uuid: None,
            attachments: Vec::new(),
            meta: None,
            usage: None,
            tool_count: None,
            duration_ms: None,
        };
        let m = StoredMessage::from_record(rec);
        assert_eq!(m.content, MessageContent::Text("not json".into()));
    }

    #[test]
    fn blocks_mut_promotes_plain_text() {
        let mut m = StoredMessage::user(1, "hello");
        m.blocks_mut().push(ContentBlock::text(" world"));
        assert_eq!(m.plain_text(), "hello world");
    }

    #[test]
    fn from_model_table_picks_heaviest_model() {
        let mut table = HashMap::new();
        table.insert(
            "small".to_string(),
            ModelTokens {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            },
        );
        table.insert(
            "big".to_string(),
            ModelTokens {
                input_tokens: 100,
                output_tokens: 50,
                ..Default::default()
            },
        );
        let usage = TurnUsage::from_model_table(table);
        assert_eq!(usage.primary_model.as_deref(), Some("big"));
        assert_eq!(usage.totals.input_tokens, 110);
        assert_eq!(usage.totals.output_tokens, 55);
    }

    #[test]
    fn stats_count_only_usage_bearing_messages() {
        let mut a1 = StoredMessage::assistant(2);
        a1.usage = Some(TurnUsage {
            totals: ModelTokens {
                input_tokens: 7,
                output_tokens: 3,
                ..Default::default()
            },
            ..Default::default()
        });
        a1.tool_count = Some(2);
        a1.duration_ms = Some(1500);
        let msgs = vec![StoredMessage::user(1, "q"), a1];
        let stats = stats_for(&msgs);
        assert_eq!(stats.turns, 1);
        assert_eq!(stats.input_tokens, 7);
        assert_eq!(stats.tool_calls, 2);
        assert_eq!(stats.duration_ms, 1500);
    }

    #[test]
    fn stats_merge_accumulates() {
        let mut a = SessionStats {
            turns: 1,
            input_tokens: 10,
            ..Default::default()
        };
        a.merge(&SessionStats {
            turns: 2,
            input_tokens: 5,
            ..Default::default()
        });
        assert_eq!(a.turns, 3);
        assert_eq!(a.input_tokens, 15);
    }
}
