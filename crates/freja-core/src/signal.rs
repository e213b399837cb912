// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Cooperative cancellation flag shared between the session controller, the
/// consume loop, and every pending permission wait.
///
/// Once set it never clears — each subprocess run gets its own signal.
#[derive(Debug, Default)]
pub struct AbortSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolves when (or as soon as) the signal is aborted.
    pub async fn cancelled(&self) {
        // Register interest before re-checking the flag so an abort between
        // the check and the await cannot be missed.
        loop {
            if self.is_aborted() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
