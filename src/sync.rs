use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// One-shot wakeup for a single waiter.
///
/// The flag is checked before parking and only cleared once consumed, so a
/// `secure_notify` that lands before `secure_wait` is not lost.
#[derive(Debug, Default)]
pub struct SecureNotify {
    notified: AtomicBool,
    notify: Notify,
}

impl SecureNotify {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn secure_notify(&self) {
        self.notified.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub async fn secure_wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a notify in between is seen.
            notified.as_mut().enable();

            if self.notified.swap(false, Ordering::AcqRel) {
                return;
            }
            notified.await;
        }
    }

    /// Drops a pending notification, if any.
    pub fn clear(&self) {
        self.notified.store(false, Ordering::Release);
    }
}
