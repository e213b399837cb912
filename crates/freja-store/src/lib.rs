// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Durable session storage: append-only JSONL transcripts, a JSON metadata
//! index shared with the desktop shell, and attachment blobs.
//!
//! Layout under the user dir:
//!
//!   `sessions.json`                     metadata index (pretty-printed)
//!   `sessions/<id>.jsonl`               one message record per line
//!   `attachments/<session>/<id>.<ext>`  raw bytes
//!   `sessions.lock`                     cross-process lock directory
//!
//! The index is cross-process (the shell reads and edits it); every index
//! write goes through the directory lock.  Transcripts have a single owner
//! (one workspace, one core instance) and are appended without locking.

mod lock;
mod meta;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use freja_model::{stats_for, Attachment, StoredMessage, StoredRecord};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub use lock::DirLock;
pub use meta::SessionMeta;

/// Errors surfaced to callers.  Everything else (index write failures,
/// transcript write failures) is logged and swallowed — losing one write must
/// not take down a live turn.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),
    #[error("attachment payload is not valid base64")]
    AttachmentDecode(#[from] base64::DecodeError),
    #[error("attachment not found: {0}")]
    AttachmentMissing(String),
}

pub struct SessionStore {
    root: PathBuf,
    /// Cached transcript line counts, keyed by session id.  Lets
    /// [`append_messages`](SessionStore::append_messages) write only the new
    /// tail without re-reading the file on every turn.
    line_counts: Mutex<HashMap<String, usize>>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            line_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join("sessions.lock")
    }

    fn transcript_path(&self, id: &str) -> PathBuf {
        self.root.join("sessions").join(format!("{id}.jsonl"))
    }

    fn attachments_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("attachments").join(session_id)
    }

    // ── Metadata index ────────────────────────────────────────────────────────

    /// All sessions, most recently active first.
    pub async fn list_sessions(&self) -> Vec<SessionMeta> {
        let mut sessions = meta::read_index(&self.index_path());
        sessions.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        sessions
    }

    pub async fn list_by_workspace(&self, workspace: &Path) -> Vec<SessionMeta> {
        let mut sessions = self.list_sessions().await;
        sessions.retain(|s| s.workspace == workspace);
        sessions
    }

    pub async fn metadata(&self, id: &str) -> Option<SessionMeta> {
        meta::read_index(&self.index_path())
            .into_iter()
            .find(|s| s.id == id)
    }

    /// Create a session record with a fresh UUID and persist it immediately.
    pub async fn create_session(&self, workspace: &Path) -> SessionMeta {
        // A v4 UUID always passes id validation.
        self.create_session_with_id(&Uuid::new_v4().to_string(), workspace)
            .await
            .expect("generated session id is valid")
    }

    /// Create a session record under a caller-chosen id.
    pub async fn create_session_with_id(
        &self,
        id: &str,
        workspace: &Path,
    ) -> Result<SessionMeta, StoreError> {
        validate_session_id(id)?;
        self.ensure_dirs().await;
        let record = SessionMeta::new(id.to_string(), workspace.to_path_buf());
        let created = record.clone();
        self.with_index(move |sessions| {
            if !sessions.iter().any(|s| s.id == record.id) {
                sessions.push(record);
            }
        })
        .await;
        Ok(created)
    }

    /// Read-modify-write one metadata record under the cross-process lock.
    ///
    /// The whole sequence — acquire, read, patch, write, release — happens
    /// inside the lock so concurrent writers can never interleave a torn
    /// update.  A missing record is created first (sessions may be persisted
    /// lazily on the first user message).
    pub async fn update_metadata(&self, id: &str, patch: impl FnOnce(&mut SessionMeta) + Send) {
        self.ensure_dirs().await;
        let id = id.to_string();
        self.with_index(move |sessions| {
            let entry = match sessions.iter_mut().find(|s| s.id == id) {
                Some(e) => e,
                None => {
                    sessions.push(SessionMeta::new(id.clone(), PathBuf::new()));
                    sessions.last_mut().expect("just pushed")
                }
            };
            patch(entry);
        })
        .await;
    }

    /// Remove the index entry, transcript, and attachments for a session.
    pub async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        validate_session_id(id)?;
        let id_owned = id.to_string();
        self.with_index(move |sessions| sessions.retain(|s| s.id != id_owned))
            .await;
        let _ = tokio::fs::remove_file(self.transcript_path(id)).await;
        let _ = tokio::fs::remove_dir_all(self.attachments_dir(id)).await;
        self.line_counts.lock().await.remove(id);
        Ok(())
    }

    async fn with_index(&self, edit: impl FnOnce(&mut Vec<SessionMeta>) + Send) {
        let _guard = DirLock::acquire(&self.lock_path()).await;
        let path = self.index_path();
        let mut sessions = meta::read_index(&path);
        edit(&mut sessions);
        meta::write_index(&path, &sessions);
    }

    // ── Transcripts ───────────────────────────────────────────────────────────

    /// Load the full transcript, skipping unparseable lines with a warning.
    ///
    /// Also primes the line-count cache so a following append only writes the
    /// tail.  A missing file is an empty transcript.
    pub async fn load_transcript(&self, id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        validate_session_id(id)?;
        let path = self.transcript_path(id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(_) => {
                self.line_counts.lock().await.insert(id.to_string(), 0);
                return Ok(Vec::new());
            }
        };

        let mut messages = Vec::new();
        let mut line_count = 0usize;
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            line_count += 1;
            match serde_json::from_str::<StoredRecord>(line) {
                Ok(record) => messages.push(StoredMessage::from_record(record)),
                Err(e) => {
                    warn!(session = %id, line = n + 1, error = %e, "skipping corrupt transcript line");
                }
            }
        }
        self.line_counts.lock().await.insert(id.to_string(), line_count);
        debug!(session = %id, messages = messages.len(), "transcript loaded");
        Ok(messages)
    }

    /// Persist the in-memory message list incrementally.
    ///
    /// `all` is the complete list; only the suffix beyond the cached on-disk
    /// line count is appended, in one write.  Usage stats computed over that
    /// suffix are merged into the metadata record under the lock — the full
    /// transcript is never re-scanned.
    pub async fn append_messages(&self, id: &str, all: &[StoredMessage]) -> Result<(), StoreError> {
        validate_session_id(id)?;
        let existing = self.disk_line_count(id).await;
        if all.len() <= existing {
            return Ok(());
        }
        let tail = &all[existing..];

        let mut buf = String::new();
        for message in tail {
            match serde_json::to_string(&message.to_record()) {
                Ok(line) => {
                    buf.push_str(&line);
                    buf.push('\n');
                }
                Err(e) => warn!(session = %id, error = %e, "message serialization failed; dropped"),
            }
        }

        self.ensure_dirs().await;
        let path = self.transcript_path(id);
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                if let Err(e) = file.write_all(buf.as_bytes()).await {
                    warn!(session = %id, error = %e, "transcript append failed");
                    return Ok(());
                }
            }
            Err(e) => {
                warn!(session = %id, error = %e, "transcript open failed");
                return Ok(());
            }
        }
        self.line_counts.lock().await.insert(id.to_string(), all.len());

        let delta = stats_for(tail);
        self.update_metadata(id, |meta| {
            meta.stats.merge(&delta);
            meta.last_active_at = Utc::now();
        })
        .await;
        Ok(())
    }

    /// Truncate the transcript to exactly `all` (used by rewind) and resync
    /// the line-count cache.  Stats are not rewound; they are cumulative.
    pub async fn rewrite_transcript(
        &self,
        id: &str,
        all: &[StoredMessage],
    ) -> Result<(), StoreError> {
        validate_session_id(id)?;
        self.ensure_dirs().await;
        let mut buf = String::new();
        for message in all {
            if let Ok(line) = serde_json::to_string(&message.to_record()) {
                buf.push_str(&line);
                buf.push('\n');
            }
        }
        if let Err(e) = tokio::fs::write(self.transcript_path(id), buf).await {
            warn!(session = %id, error = %e, "transcript rewrite failed");
        }
        self.line_counts.lock().await.insert(id.to_string(), all.len());
        self.update_metadata(id, |meta| meta.last_active_at = Utc::now())
            .await;
        Ok(())
    }

    async fn disk_line_count(&self, id: &str) -> usize {
        if let Some(count) = self.line_counts.lock().await.get(id).copied() {
            return count;
        }
        let count = match tokio::fs::read_to_string(self.transcript_path(id)).await {
            Ok(text) => text.lines().filter(|l| !l.trim().is_empty()).count(),
            Err(_) => 0,
        };
        self.line_counts.lock().await.insert(id.to_string(), count);
        count
    }

    // ── Attachments ───────────────────────────────────────────────────────────

    /// Decode and store one attachment, returning its relative path record.
    pub async fn save_attachment(
        &self,
        session_id: &str,
        attachment_id: &str,
        mime: &str,
        base64_data: &str,
    ) -> Result<Attachment, StoreError> {
        use base64::Engine;
        validate_session_id(session_id)?;
        let bytes = base64::engine::general_purpose::STANDARD.decode(base64_data)?;

        let dir = self.attachments_dir(session_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(session = %session_id, error = %e, "attachment dir create failed");
        }
        let file_name = format!("{attachment_id}.{}", ext_for_mime(mime));
        if let Err(e) = tokio::fs::write(dir.join(&file_name), &bytes).await {
            warn!(session = %session_id, error = %e, "attachment write failed");
        }
        Ok(Attachment {
            id: attachment_id.to_string(),
            path: format!("{session_id}/{file_name}"),
            mime: mime.to_string(),
        })
    }

    /// Read an attachment back as a `data:` URL (byte-equal round trip).
    pub async fn attachment_data_url(&self, attachment: &Attachment) -> Result<String, StoreError> {
        use base64::Engine;
        let path = self.root.join("attachments").join(&attachment.path);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| StoreError::AttachmentMissing(attachment.path.clone()))?;
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(format!("data:{};base64,{b64}", attachment.mime))
    }

    async fn ensure_dirs(&self) {
        for dir in [self.root.clone(), self.root.join("sessions")] {
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                warn!(path = %dir.display(), error = %e, "store dir create failed");
            }
        }
    }
}

/// Session ids land in file paths; anything outside `[A-Za-z0-9-]{1,99}`
/// is rejected loudly before it can touch the filesystem.
pub fn validate_session_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id.len() < 100
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId(id.to_string()))
    }
}

fn ext_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use freja_model::{ModelTokens, TurnUsage};

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        (dir, store)
    }

    fn assistant_with_usage(id: u64, input: u64) -> StoredMessage {
        let mut m = StoredMessage::assistant(id);
        m.usage = Some(TurnUsage {
            totals: ModelTokens {
                input_tokens: input,
                output_tokens: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        m
    }

    // ── Session ids ───────────────────────────────────────────────────────────

    #[test]
    fn session_id_boundaries() {
        assert!(validate_session_id("abc-123-DEF").is_ok());
        assert!(validate_session_id(&"a".repeat(99)).is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id(&"a".repeat(100)).is_err());
        assert!(validate_session_id("../evil").is_err());
        assert!(validate_session_id("has space").is_err());
    }

    // ── Metadata index ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_then_list_orders_by_last_active() {
        let (_d, store) = store();
        let a = store.create_session(Path::new("/ws")).await;
        let b = store.create_session(Path::new("/ws")).await;
        // Touch `a` so it becomes the most recent.
        store
            .update_metadata(&a.id, |m| m.last_active_at = Utc::now() + chrono::Duration::seconds(5))
            .await;
        let list = store.list_sessions().await;
        assert_eq!(list[0].id, a.id);
        assert_eq!(list[1].id, b.id);
    }

    #[tokio::test]
    async fn list_by_workspace_filters() {
        let (_d, store) = store();
        let a = store.create_session(Path::new("/ws-a")).await;
        let _b = store.create_session(Path::new("/ws-b")).await;
        let list = store.list_by_workspace(Path::new("/ws-a")).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, a.id);
    }

    #[tokio::test]
    async fn update_metadata_patches_under_lock() {
        let (_d, store) = store();
        let meta = store.create_session(Path::new("/ws")).await;
        store
            .update_metadata(&meta.id, |m| m.title = "hello".into())
            .await;
        assert_eq!(store.metadata(&meta.id).await.unwrap().title, "hello");
        // The lock directory must not linger after the write.
        assert!(!store.lock_path().exists());
    }

    #[tokio::test]
    async fn delete_session_removes_everything() {
        let (_d, store) = store();
        let meta = store.create_session(Path::new("/ws")).await;
        store
            .append_messages(&meta.id, &[StoredMessage::user(1, "hi")])
            .await
            .unwrap();
        store.delete_session(&meta.id).await.unwrap();
        assert!(store.metadata(&meta.id).await.is_none());
        assert!(!store.transcript_path(&meta.id).exists());
    }

    // ── Transcripts ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn append_writes_only_the_tail() {
        let (_d, store) = store();
        let meta = store.create_session(Path::new("/ws")).await;
        let l1 = vec![StoredMessage::user(1, "a"), assistant_with_usage(2, 10)];
        store.append_messages(&meta.id, &l1).await.unwrap();

        let mut l2 = l1.clone();
        l2.push(StoredMessage::user(3, "b"));
        l2.push(assistant_with_usage(4, 20));
        store.append_messages(&meta.id, &l2).await.unwrap();

        let text = std::fs::read_to_string(store.transcript_path(&meta.id)).unwrap();
        assert_eq!(text.lines().count(), 4);
        let loaded = store.load_transcript(&meta.id).await.unwrap();
        assert_eq!(loaded, l2);
    }

    #[tokio::test]
    async fn append_merges_stats_incrementally() {
        let (_d, store) = store();
        let meta = store.create_session(Path::new("/ws")).await;
        let l1 = vec![StoredMessage::user(1, "a"), assistant_with_usage(2, 10)];
        store.append_messages(&meta.id, &l1).await.unwrap();
        let mut l2 = l1.clone();
        l2.push(StoredMessage::user(3, "b"));
        l2.push(assistant_with_usage(4, 20));
        store.append_messages(&meta.id, &l2).await.unwrap();

        let stats = store.metadata(&meta.id).await.unwrap().stats;
        assert_eq!(stats.turns, 2);
        assert_eq!(stats.input_tokens, 30);
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped_on_load() {
        let (_d, store) = store();
        let meta = store.create_session(Path::new("/ws")).await;
        store
            .append_messages(&meta.id, &[StoredMessage::user(1, "ok")])
            .await
            .unwrap();
        // Inject a corrupt line by hand.
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(store.transcript_path(&meta.id))
                .unwrap();
            writeln!(f, "{{ definitely not a record").unwrap();
        }
        // Fresh store: no warm cache, so the load re-counts lines from disk.
        let store2 = SessionStore::new(store.root());
        let loaded = store2.load_transcript(&meta.id).await.unwrap();
        assert_eq!(loaded.len(), 1);

        // The corrupt line still occupies a slot in the line count, so an
        // append of a 2-message list adds nothing (2 <= 2 lines on disk).
        store2
            .append_messages(&meta.id, &[StoredMessage::user(1, "ok"), StoredMessage::user(2, "x")])
            .await
            .unwrap();
        let text = std::fs::read_to_string(store2.transcript_path(&meta.id)).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[tokio::test]
    async fn rewrite_transcript_truncates() {
        let (_d, store) = store();
        let meta = store.create_session(Path::new("/ws")).await;
        let full = vec![
            StoredMessage::user(1, "a"),
            assistant_with_usage(2, 1),
            StoredMessage::user(3, "b"),
        ];
        store.append_messages(&meta.id, &full).await.unwrap();
        store.rewrite_transcript(&meta.id, &full[..1]).await.unwrap();
        let loaded = store.load_transcript(&meta.id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        // The cache tracks the rewrite: a follow-up append starts after line 1.
        store.append_messages(&meta.id, &full[..2]).await.unwrap();
        assert_eq!(store.load_transcript(&meta.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_id_fails_loudly() {
        let (_d, store) = store();
        assert!(matches!(
            store.load_transcript("../oops").await,
            Err(StoreError::InvalidSessionId(_))
        ));
        assert!(matches!(
            store.append_messages("bad id", &[]).await,
            Err(StoreError::InvalidSessionId(_))
        ));
    }

    // ── Attachments ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn attachment_round_trips_byte_equal() {
        use base64::Engine;
        let (_d, store) = store();
        let meta = store.create_session(Path::new("/ws")).await;
        let payload = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3, 255]);
        let att = store
            .save_attachment(&meta.id, "att-1", "image/png", &payload)
            .await
            .unwrap();
        assert_eq!(att.path, format!("{}/att-1.png", meta.id));
        let url = store.attachment_data_url(&att).await.unwrap();
        assert_eq!(url, format!("data:image/png;base64,{payload}"));
    }

    #[tokio::test]
    async fn attachment_bad_base64_is_an_error() {
        let (_d, store) = store();
        let meta = store.create_session(Path::new("/ws")).await;
        assert!(store
            .save_attachment(&meta.id, "att-1", "image/png", "!!not-base64!!")
            .await
            .is_err());
    }
}
