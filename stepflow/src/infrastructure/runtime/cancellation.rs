// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Run Cancellation
//!
//! Cooperative cancellation for pipeline runs. Every run carries a token;
//! cancellation propagates through suspension points: pending backoff delays
//! abort, in-flight user calls can observe the signal, and buffered items
//! upstream of the cut point are discarded without dead-lettering
//! (cancellation is not a failure).
//!
//! The token is an atomic flag plus a `Notify` so that any number of waiters
//! can suspend on `cancelled()` without polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use stepflow_domain::CancellationSignal;

/// Clone-able cancellation token for a single run.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation. Idempotent; all current and future waiters wake.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Waits until the token is cancelled.
    pub async fn cancelled(&self) {
        // Check-then-wait loop: notify_waiters does not store a permit, so
        // the flag must be rechecked after registering.
        while !self.is_cancelled() {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl CancellationSignal for CancellationToken {
    fn cancel(&self) {
        CancellationToken::cancel(self);
    }

    fn is_cancelled(&self) -> bool {
        CancellationToken::is_cancelled(self)
    }

    fn cancelled(&self) -> BoxFuture<'static, ()> {
        let token = self.clone();
        Box::pin(async move { token.cancelled().await })
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
