// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative shutdown signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A cloneable shutdown token shared by the claim loop and the workers.
///
/// All clones share state; signalling one makes every clone observe
/// `is_shutdown() == true`. The claim loop finishes its in-flight claim
/// before honoring the signal.
#[derive(Clone)]
pub struct ShutdownToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    signalled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// A token that has not been signalled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                signalled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal shutdown. Idempotent.
    pub fn signal(&self) {
        self.inner.signalled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// `true` once [`signal`](Self::signal) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.signalled.load(Ordering::SeqCst)
    }

    /// Completes when the token is signalled; immediately if it already
    /// was.
    pub async fn signalled(&self) {
        if self.is_shutdown() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_shutdown() {
                return;
            }
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShutdownToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownToken")
            .field("signalled", &self.is_shutdown())
            .finish()
    }
}
