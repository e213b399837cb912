// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Instant;

use freja_model::TurnUsage;
use tokio::sync::watch;

/// Accounting for the assistant turn currently in flight.
///
/// Shared between the enqueue path (which resets it when a turn starts
/// immediately), the message pipeline (reset at yield time for queued items),
/// and the stream assembler (usage, tool counts, completion).  The `active`
/// watch channel is the "is a turn running" signal the interrupt path races
/// against.
pub struct TurnTracker {
    inner: std::sync::Mutex<TurnInner>,
    active_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct TurnInner {
    started_at: Option<Instant>,
    usage: TurnUsage,
    tool_count: u32,
    stop_requested: bool,
}

/// What the final assistant message of a turn carries.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnSummary {
    pub usage: TurnUsage,
    pub tool_count: u32,
    pub duration_ms: u64,
}

impl Default for TurnTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnTracker {
    pub fn new() -> Self {
        let (active_tx, _) = watch::channel(false);
        Self {
            inner: std::sync::Mutex::new(TurnInner::default()),
            active_tx,
        }
    }

    /// Reset per-turn accounting and stamp the turn start.
    pub fn begin_turn(&self) {
        let mut inner = self.lock();
        inner.started_at = Some(Instant::now());
        inner.usage = TurnUsage::default();
        inner.tool_count = 0;
        inner.stop_requested = false;
        let _ = self.active_tx.send(true);
    }

    pub fn is_active(&self) -> bool {
        *self.active_tx.borrow()
    }

    /// A receiver the interrupt path can await for the turn-inactive edge.
    pub fn subscribe_active(&self) -> watch::Receiver<bool> {
        self.active_tx.subscribe()
    }

    pub fn note_tool_start(&self) {
        self.lock().tool_count += 1;
    }

    pub fn set_usage(&self, usage: TurnUsage) {
        self.lock().usage = usage;
    }

    pub fn request_stop(&self) {
        self.lock().stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.lock().stop_requested
    }

    /// Close out the turn and return what the assistant message carries.
    pub fn end_turn(&self) -> TurnSummary {
        let mut inner = self.lock();
        let duration_ms = inner
            .started_at
            .take()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let summary = TurnSummary {
            usage: std::mem::take(&mut inner.usage),
            tool_count: std::mem::take(&mut inner.tool_count),
            duration_ms,
        };
        inner.stop_requested = false;
        let _ = self.active_tx.send(false);
        summary
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TurnInner> {
        self.inner.lock().expect("turn tracker poisoned")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
