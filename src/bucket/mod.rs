//! Token bucket rate limiter.
//!
//! Wraps mutable state behind an `Arc<Mutex<..>>` and exposes small async
//! methods implementing a capacity-bounded grant/return protocol with a
//! periodic replenish tick.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Number of bucket replenishments performed per second.
pub const REFILLS_PER_SECOND: u64 = 10;

struct State {
    capacity: u64,
    tokens: u64,
    /// Monotonically increasing ticket dispensed to each waiter on entry,
    /// used to keep wakeups FIFO-fair.
    next_ticket: u64,
    next_to_serve: u64,
    /// Waiters currently parked, in ticket order, so a cancelled waiter can
    /// be removed without disturbing the order of the rest.
    waiters: VecDeque<u64>,
}

/// Capacity-bounded byte grant bucket. A zero or absent speed limit
/// disables the bucket, granting every request in full.
pub struct TokenBucket {
    state: Mutex<State>,
    notify: Notify,
    unlimited: bool,
    replenish_period: Duration,
}

impl TokenBucket {
    /// Builds a bucket from a KiB/s speed limit, or an unlimited bucket if
    /// `speed_limit_kb_per_s` is `None` or zero.
    pub fn from_speed_limit_kb_per_s(speed_limit_kb_per_s: Option<u64>) -> Self {
        match speed_limit_kb_per_s.filter(|&limit| limit > 0) {
            Some(limit) => {
                let capacity = (limit * 1024) / REFILLS_PER_SECOND;
                Self::with_capacity(capacity.max(1))
            }
            None => Self::unlimited(),
        }
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            state: Mutex::new(State {
                capacity,
                tokens: capacity,
                next_ticket: 0,
                next_to_serve: 0,
                waiters: VecDeque::new(),
            }),
            notify: Notify::new(),
            unlimited: false,
            replenish_period: Duration::from_millis(1000 / REFILLS_PER_SECOND),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            state: Mutex::new(State {
                capacity: u64::MAX,
                tokens: u64::MAX,
                next_ticket: 0,
                next_to_serve: 0,
                waiters: VecDeque::new(),
            }),
            notify: Notify::new(),
            unlimited: true,
            replenish_period: Duration::from_millis(1000 / REFILLS_PER_SECOND),
        }
    }

    /// Awaits until at least one token is available, then atomically grants
    /// `min(requested, available)`. Waiters are served in the order they
    /// called `get`. Cancellation-safe: a cancelled waiter is removed from
    /// the queue without consuming a grant.
    pub async fn get(&self, requested: u64, cancel: &CancellationToken) -> Option<u64> {
        if self.unlimited {
            return Some(requested);
        }

        let ticket = {
            let mut state = self.state.lock().await;
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.waiters.push_back(ticket);
            ticket
        };

        loop {
            {
                let mut state = self.state.lock().await;
                let is_next = state.waiters.front() == Some(&ticket);
                if is_next && state.tokens > 0 {
                    let granted = requested.min(state.tokens);
                    state.tokens -= granted;
                    state.waiters.pop_front();
                    state.next_to_serve += 1;
                    drop(state);
                    self.notify.notify_waiters();
                    return Some(granted);
                }
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => {
                    let mut state = self.state.lock().await;
                    state.waiters.retain(|&t| t != ticket);
                    drop(state);
                    self.notify.notify_waiters();
                    return None;
                }
            }
        }
    }

    /// Reintroduces `n` tokens, capped at capacity. Never leaves `tokens >
    /// capacity`.
    pub async fn give_back(&self, n: u64) {
        if self.unlimited || n == 0 {
            return;
        }
        let mut state = self.state.lock().await;
        state.tokens = (state.tokens + n).min(state.capacity);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Refills to capacity. Called once per `replenish_period` by the owner's
    /// background task.
    pub async fn replenish(&self) {
        if self.unlimited {
            return;
        }
        let mut state = self.state.lock().await;
        state.tokens = state.capacity.min(state.tokens + state.capacity);
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn replenish_period(&self) -> Duration {
        self.replenish_period
    }

    pub async fn tokens(&self) -> u64 {
        self.state.lock().await.tokens
    }

    pub async fn capacity(&self) -> u64 {
        self.state.lock().await.capacity
    }

    /// Spawns a background task that calls `replenish` every period until
    /// `cancel` fires.
    pub fn spawn_replenisher(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let bucket = Arc::clone(self);
        let period = bucket.replenish_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => bucket.replenish().await,
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_bucket_grants_everything() {
        let bucket = TokenBucket::from_speed_limit_kb_per_s(None);
        let cancel = CancellationToken::new();
        assert_eq!(bucket.get(999_999, &cancel).await, Some(999_999));
    }

    #[tokio::test]
    async fn zero_speed_limit_disables_bucket() {
        let bucket = TokenBucket::from_speed_limit_kb_per_s(Some(0));
        let cancel = CancellationToken::new();
        assert_eq!(bucket.get(5, &cancel).await, Some(5));
    }

    #[tokio::test]
    async fn capacity_derives_from_speed_limit_and_refill_rate() {
        // 100 KB/s, 10 refills/s => 10240 bytes per refill.
        let bucket = TokenBucket::from_speed_limit_kb_per_s(Some(100));
        assert_eq!(bucket.capacity().await, 10240);
    }

    #[tokio::test]
    async fn get_returns_min_of_requested_and_available() {
        let bucket = TokenBucket::with_capacity(1000);
        let cancel = CancellationToken::new();
        assert_eq!(bucket.get(400, &cancel).await, Some(400));
        assert_eq!(bucket.tokens().await, 600);
    }

    #[tokio::test]
    async fn suspended_getter_resumes_after_return() {
        let bucket = Arc::new(TokenBucket::with_capacity(1000));
        let cancel = CancellationToken::new();

        assert_eq!(bucket.get(1000, &cancel).await, Some(1000));
        assert_eq!(bucket.tokens().await, 0);

        let waiter_bucket = Arc::clone(&bucket);
        let waiter_cancel = cancel.clone();
        let waiter = tokio::spawn(async move { waiter_bucket.get(700, &waiter_cancel).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bucket.give_back(300).await;

        let granted = waiter.await.unwrap();
        assert_eq!(granted, Some(300));
    }

    #[tokio::test]
    async fn replenish_refills_to_capacity() {
        let bucket = TokenBucket::with_capacity(1000);
        let cancel = CancellationToken::new();
        bucket.get(1000, &cancel).await;
        assert_eq!(bucket.tokens().await, 0);

        bucket.replenish().await;
        assert_eq!(bucket.get(5000, &cancel).await, Some(1000));
    }

    #[tokio::test]
    async fn give_back_never_exceeds_capacity() {
        let bucket = TokenBucket::with_capacity(100);
        bucket.give_back(1_000_000).await;
        assert_eq!(bucket.tokens().await, 100);
    }

    #[tokio::test]
    async fn cancellation_does_not_leak_tokens() {
        let bucket = Arc::new(TokenBucket::with_capacity(10));
        let cancel = CancellationToken::new();
        // Drain the bucket so the next getter has to wait.
        bucket.get(10, &cancel).await;

        let waiter_bucket = Arc::clone(&bucket);
        let waiter_cancel = CancellationToken::new();
        let cancel_clone = waiter_cancel.clone();
        let waiter = tokio::spawn(async move { waiter_bucket.get(5, &cancel_clone).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter_cancel.cancel();
        assert_eq!(waiter.await.unwrap(), None);

        // Tokens are still zero: cancellation did not fabricate a grant.
        assert_eq!(bucket.tokens().await, 0);
        bucket.replenish().await;
        assert_eq!(bucket.tokens().await, 10);
    }

    #[tokio::test]
    async fn waiters_are_served_fifo() {
        let bucket = Arc::new(TokenBucket::with_capacity(10));
        let cancel = CancellationToken::new();
        bucket.get(10, &cancel).await; // drain

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3u64 {
            let bucket = Arc::clone(&bucket);
            let order = Arc::clone(&order);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                bucket.get(1, &cancel).await;
                order.lock().await.push(i);
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        bucket.replenish().await;
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }
}
