//! Session-wide receive token bucket.
//!
//! The bucket is the flow-control budget shared by every stream on a session:
//! a signed byte counter that inbound PSH payloads draw down and stream reads
//! (or stream teardown) pay back. The receive pump is the single waiter; it
//! parks whenever the balance is non-positive and is woken on the transition
//! back to positive. Delivery never refuses a frame, so the balance may dip
//! briefly negative during a burst — the pump just refuses to read the next
//! frame until the debt clears.

use std::sync::atomic::{AtomicI32, Ordering};

use tokio::sync::Notify;

/// Signed receive budget with a single-waiter wakeup.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    remaining: AtomicI32,
    notify: Notify,
}

impl TokenBucket {
    /// Create a bucket holding `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        Self {
            remaining: AtomicI32::new(capacity as i32),
            notify: Notify::new(),
        }
    }

    /// Draw `n` tokens for an inbound payload. May drive the balance negative.
    pub fn consume(&self, n: usize) {
        self.remaining.fetch_sub(n as i32, Ordering::AcqRel);
    }

    /// Return `n` tokens, waking the pump if the balance turns positive.
    pub fn restore(&self, n: usize) {
        if n == 0 {
            return;
        }
        let n = n as i32;
        let previous = self.remaining.fetch_add(n, Ordering::AcqRel);
        if previous <= 0 && previous + n > 0 {
            self.notify.notify_one();
        }
    }

    /// Current balance, in bytes. Negative while a burst is being drained.
    pub fn level(&self) -> i32 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Force a pump wakeup without changing the balance (keepalive nudge,
    /// session teardown).
    pub fn nudge(&self) {
        self.notify.notify_one();
    }

    /// Wait until the balance is positive.
    ///
    /// Relies on `notify_one` permit semantics: a wakeup arriving between the
    /// balance check and the await is not lost. Callers racing session death
    /// must select this against the die signal.
    pub async fn acquire(&self) {
        loop {
            if self.remaining.load(Ordering::Acquire) > 0 {
                return;
            }
            self.notify.notified().await;
        }
    }
}
