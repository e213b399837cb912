// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use freja_model::SessionStats;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One session's metadata record in `sessions.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub workspace: PathBuf,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Session id the subprocess uses on disk; set after the first
    /// `system-init` of a normal start.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_session_id: Option<String>,
    /// True iff the subprocess honored the id we chose (our id and its id
    /// are the same session on disk).
    #[serde(default)]
    pub unified: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source: Option<String>,
    #[serde(default)]
    pub stats: SessionStats,
    /// Transcript path relative to the user dir.
    pub transcript: String,
}

impl SessionMeta {
    pub fn new(id: String, workspace: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            transcript: format!("sessions/{id}.jsonl"),
            id,
            workspace,
            title: String::new(),
            created_at: now,
            last_active_at: now,
            agent_session_id: None,
            unified: false,
            source: None,
            stats: SessionStats::default(),
        }
    }
}

/// Read the metadata index.  A missing or unparseable file yields an empty
/// list — the index is rebuildable state, never worth failing a caller over.
pub(crate) fn read_index(path: &Path) -> Vec<SessionMeta> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str(&text) {
        Ok(list) => list,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "session index unparseable; starting empty");
            Vec::new()
        }
    }
}

/// Write the metadata index pretty-printed.  Errors are logged, not thrown.
pub(crate) fn write_index(path: &Path, sessions: &[SessionMeta]) {
    let text = match serde_json::to_string_pretty(sessions) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "session index serialization failed");
            return;
        }
    };
    if let Err(e) = std::fs::write(path, text) {
        warn!(path = %path.display(), error = %e, "session index write failed");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let meta = SessionMeta::new("abc-123".into(), PathBuf::from("/ws"));
        write_index(&path, std::slice::from_ref(&meta));
        let back = read_index(&path);
        assert_eq!(back, vec![meta]);
    }

    #[test]
    fn missing_index_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_index(&dir.path().join("sessions.json")).is_empty());
    }

    #[test]
    fn corrupt_index_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "[{ broken").unwrap();
        assert!(read_index(&path).is_empty());
    }

    #[test]
    fn new_meta_points_at_transcript() {
        let meta = SessionMeta::new("s1".into(), PathBuf::from("/ws"));
        assert_eq!(meta.transcript, "sessions/s1.jsonl");
    }
}
