// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The user-message queue and the event-driven generator feeding the
//! subprocess stdin.
//!
//! The generator is a persistent-yield loop: wait for a queue item, hand it
//! to the feeder task, wait for the turn-complete signal, repeat.  Both waits
//! are rendezvous (notify-based, no polling); a closed pipeline resolves them
//! with the shutdown sentinel (`None` / `false`) so the feeder exits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use freja_model::{QueueEntry, StoredMessage, UserInputBlock};
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::error::CoreError;

/// Backend queue cap: the 11th enqueue while busy is rejected.
pub const QUEUE_CAP: usize = 10;

/// How a queued item left the queue, reported through its resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Started,
    Cancelled,
}

/// One pending user message.
#[derive(Debug)]
pub struct QueueItem {
    pub id: String,
    /// The rendered message appended to the session at yield (or enqueue)
    /// time.
    pub message: StoredMessage,
    /// Multimodal payload written to the subprocess stdin (images before
    /// text).
    pub input_blocks: Vec<UserInputBlock>,
    /// Original plain text, returned on cancel so the UI can restore it.
    pub original_text: String,
    /// True iff the caller was deferred because a turn was in progress.
    pub was_queued: bool,
    pub resolver: Option<oneshot::Sender<QueueOutcome>>,
}

impl QueueItem {
    pub fn resolve(&mut self, outcome: QueueOutcome) {
        if let Some(tx) = self.resolver.take() {
            let _ = tx.send(outcome);
        }
    }

    pub fn preview(&self) -> String {
        let text = if self.original_text.is_empty() {
            "image message"
        } else {
            &self.original_text
        };
        text.chars().take(80).collect()
    }
}

pub struct MessagePipeline {
    queue: std::sync::Mutex<VecDeque<QueueItem>>,
    message_ready: Notify,
    turn_done: Notify,
    turn_done_flag: AtomicBool,
    closed: AtomicBool,
}

impl Default for MessagePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagePipeline {
    pub fn new() -> Self {
        Self {
            queue: std::sync::Mutex::new(VecDeque::new()),
            message_ready: Notify::new(),
            turn_done: Notify::new(),
            turn_done_flag: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    // ── Queue management ─────────────────────────────────────────────────────

    pub fn push(&self, item: QueueItem) -> Result<(), CoreError> {
        let mut queue = self.lock_queue();
        if queue.len() >= QUEUE_CAP {
            return Err(CoreError::QueueFull);
        }
        queue.push_back(item);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_queue().is_empty()
    }

    /// Remove a queued item.  The caller emits `queue-cancelled` and returns
    /// the original text to the UI.
    pub fn cancel(&self, id: &str) -> Option<QueueItem> {
        let mut queue = self.lock_queue();
        let pos = queue.iter().position(|i| i.id == id)?;
        let mut item = queue.remove(pos)?;
        item.resolve(QueueOutcome::Cancelled);
        Some(item)
    }

    /// Put an already-popped item back at the front (teardown race: the item
    /// belongs to the next run).  Bypasses the cap — the item was counted
    /// when it was first pushed.
    pub fn requeue_front(&self, item: QueueItem) {
        self.lock_queue().push_front(item);
    }

    /// Move an item to the queue front so it is yielded next.
    pub fn promote(&self, id: &str) -> bool {
        let mut queue = self.lock_queue();
        let Some(pos) = queue.iter().position(|i| i.id == id) else {
            return false;
        };
        if pos > 0 {
            if let Some(item) = queue.remove(pos) {
                queue.push_front(item);
            }
        }
        true
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.lock_queue()
            .iter()
            .map(|i| QueueEntry {
                id: i.id.clone(),
                message_preview: i.preview(),
            })
            .collect()
    }

    /// Empty the queue, resolving every item as cancelled.
    pub fn drain(&self) -> Vec<QueueItem> {
        let mut queue = self.lock_queue();
        let mut items: Vec<QueueItem> = queue.drain(..).collect();
        for item in &mut items {
            item.resolve(QueueOutcome::Cancelled);
        }
        items
    }

    // ── Generator rendezvous ─────────────────────────────────────────────────

    /// Wake the generator after a push.
    pub fn wake(&self) {
        self.message_ready.notify_waiters();
    }

    /// Suspend until a queue item is available.  `None` signals shutdown.
    pub async fn wait_for_message(&self) -> Option<QueueItem> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(item) = self.lock_queue().pop_front() {
                return Some(item);
            }
            // Register before the re-check so a wake between the pop and the
            // await is never lost.
            let notified = self.message_ready.notified();
            if self.is_closed() || !self.is_empty() {
                continue;
            }
            notified.await;
        }
    }

    /// Called by the stream assembler when a `result` closes the turn, and by
    /// the abort path to release the generator.
    pub fn signal_turn_complete(&self) {
        self.turn_done_flag.store(true, Ordering::Release);
        self.turn_done.notify_waiters();
    }

    /// Suspend until the current turn completes.  `false` signals shutdown.
    pub async fn wait_turn_complete(&self) -> bool {
        loop {
            if self.is_closed() {
                return false;
            }
            if self.turn_done_flag.swap(false, Ordering::AcqRel) {
                return true;
            }
            let notified = self.turn_done.notified();
            if self.is_closed() || self.turn_done_flag.load(Ordering::Acquire) {
                continue;
            }
            notified.await;
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Release both waiters with the shutdown sentinel.  The queue itself is
    /// left intact — queued messages survive a subprocess restart.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.message_ready.notify_waiters();
        self.turn_done.notify_waiters();
        debug!("pipeline closed");
    }

    /// Reopen for the next subprocess run.
    pub fn reopen(&self) {
        self.turn_done_flag.store(false, Ordering::Release);
        self.closed.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<QueueItem>> {
        self.queue.lock().expect("queue poisoned")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
