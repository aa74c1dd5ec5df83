//! Global bandwidth cap shared by every transfer in the process.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Cheap to clone; all clones draw from the same bucket.
#[derive(Clone, Default)]
pub struct Throttle {
    limiter: Option<Arc<DirectLimiter>>,
    cap: Option<NonZeroU32>,
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle").field("cap", &self.cap).finish()
    }
}

impl Throttle {
    /// `None` or zero disables throttling.
    pub fn new(bytes_per_sec: Option<u32>) -> Self {
        let cap = bytes_per_sec.and_then(NonZeroU32::new);
        let limiter = cap.map(|limit| Arc::new(RateLimiter::direct(Quota::per_second(limit))));
        Self { limiter, cap }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn cap(&self) -> Option<u32> {
        self.cap.map(NonZeroU32::get)
    }

    /// Waits until `amount` bytes may pass.
    pub async fn consume(&self, amount: usize) {
        let (Some(limiter), Some(cap)) = (&self.limiter, self.cap) else {
            return;
        };
        // The bucket never holds more than one second worth, so large reads
        // are admitted in pieces.
        let mut left = amount as u64;
        while left > 0 {
            let piece = left.min(cap.get() as u64) as u32;
            if let Some(n) = NonZeroU32::new(piece) {
                if limiter.until_n_ready(n).await.is_err() {
                    return;
                }
            }
            left -= piece as u64;
        }
    }
}

/// A byte stream whose reads are admitted through a [`Throttle`].
pub struct ThrottledStream<S> {
    inner: S,
    throttle: Throttle,
}

impl<S, E> ThrottledStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    pub fn new(inner: S, throttle: Throttle) -> Self {
        Self { inner, throttle }
    }

    /// Next piece of the body straight off the wire. Callers that time the
    /// network must [`admit`](Self::admit) it separately.
    pub async fn fetch(&mut self) -> Option<Result<Bytes, E>> {
        self.inner.next().await
    }

    /// Waits for the throttle to let `bytes` through.
    pub async fn admit(&self, bytes: &Bytes) {
        self.throttle.consume(bytes.len()).await;
    }

    /// Next piece of the body, after the throttle let it through.
    pub async fn read(&mut self) -> Option<Result<Bytes, E>> {
        let item = self.fetch().await?;
        if let Ok(bytes) = &item {
            self.admit(bytes).await;
        }
        Some(item)
    }
}
