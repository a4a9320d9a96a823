use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Broadcast wake-up shared by every blocked acquirer of one lock manager.
///
/// A waiter must call [`ReleaseSignal::waiter`] *before* it attempts to take
/// the lock. A raise that happens between that call and the moment the
/// future is awaited is not lost.
#[derive(Debug, Default)]
pub struct ReleaseSignal {
    notify: Notify,
    raised: AtomicU64,
}

impl ReleaseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in the next raise.
    pub fn waiter(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Wakes every registered waiter, whatever key it is waiting for.
    pub fn raise(&self) {
        self.raised.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub fn raised_count(&self) -> u64 {
        self.raised.load(Ordering::Relaxed)
    }
}
