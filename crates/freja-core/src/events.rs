// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use freja_model::UiEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// How many events a slow subscriber may lag before it starts losing them.
const CHANNEL_CAPACITY: usize = 256;

/// Log lines retained for `log_lines()`.
const LOG_BUFFER_LINES: usize = 500;

/// Fan-out of [`UiEvent`]s to any number of subscribers.
///
/// Built on a broadcast channel: emitting never blocks, subscribers that fall
/// behind drop the oldest events (the UI recovers through the replay
/// endpoints).  `log` and `debug-message` events are additionally captured in
/// a bounded ring buffer so late subscribers can fetch recent history.
pub struct EventBroadcaster {
    tx: broadcast::Sender<UiEvent>,
    log_buffer: Mutex<VecDeque<String>>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            log_buffer: Mutex::new(VecDeque::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn emit(&self, event: UiEvent) {
        if let UiEvent::Log { line } | UiEvent::DebugMessage { line } = &event {
            let mut buffer = self.log_buffer.lock().expect("log buffer poisoned");
            if buffer.len() >= LOG_BUFFER_LINES {
                buffer.pop_front();
            }
            buffer.push_back(line.clone());
        }
        // No subscribers is normal during pre-warm and headless runs.
        if self.tx.send(event).is_err() {
            debug!("ui event dropped: no subscribers");
        }
    }

    pub fn log(&self, line: impl Into<String>) {
        self.emit(UiEvent::Log { line: line.into() });
    }

    pub fn debug_message(&self, line: impl Into<String>) {
        self.emit(UiEvent::DebugMessage { line: line.into() });
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.log_buffer
            .lock()
            .expect("log buffer poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
