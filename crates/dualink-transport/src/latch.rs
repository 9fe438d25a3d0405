use std::sync::atomic::{AtomicBool, Ordering};

use dualink_core::CloseReason;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// One-shot, idempotent completion signal shared by every close watcher.
///
/// The first `trigger` wins and records its reason; later triggers return
/// `false` and change nothing. Waiters observe completion through a
/// cancellation token, so read loops and watchers can `select!` on it.
#[derive(Debug, Default)]
pub struct CloseLatch {
    fired: AtomicBool,
    reason: Mutex<Option<CloseReason>>,
    token: CancellationToken,
}

impl CloseLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that completed the latch.
    pub fn trigger(&self, reason: CloseReason) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.reason.lock() = Some(reason);
        self.token.cancel();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<CloseReason> {
        self.reason.lock().clone()
    }

    /// Resolves once the latch has been triggered.
    pub async fn fired(&self) {
        self.token.cancelled().await;
    }

    /// Child token cancelled together with the latch.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }
}
