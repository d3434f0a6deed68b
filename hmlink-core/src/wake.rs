//! One-way wake channel from the scan task to the event loop.
//!
//! The sender bumps a counter and pokes a `Notify`; the receiver drains the whole
//! counter at once, so any burst of wakes between two reads is handled once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct Inner {
    pending: AtomicU64,
    notify: Notify,
}

/// Producer half. Cloneable; lives on the scan task.
#[derive(Clone)]
pub struct WakeSender {
    inner: Arc<Inner>,
}

/// Consumer half. Owned by the event loop.
pub struct WakeReceiver {
    inner: Arc<Inner>,
}

pub fn wake_channel() -> (WakeSender, WakeReceiver) {
    let inner = Arc::new(Inner {
        pending: AtomicU64::new(0),
        notify: Notify::new(),
    });
    (
        WakeSender {
            inner: inner.clone(),
        },
        WakeReceiver { inner },
    )
}

impl WakeSender {
    pub fn raise(&self) {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        self.inner.notify.notify_one();
    }
}

impl WakeReceiver {
    /// True when at least one wake was raised and not yet drained.
    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire) > 0
    }

    /// Take everything raised so far without waiting. Returns the coalesced count.
    pub fn drain(&self) -> u64 {
        self.inner.pending.swap(0, Ordering::AcqRel)
    }

    /// Wait until at least one wake is pending, then drain. Cancel safe.
    pub async fn wait(&mut self) -> u64 {
        loop {
            let n = self.drain();
            if n > 0 {
                return n;
            }
            self.inner.notify.notified().await;
        }
    }
}
