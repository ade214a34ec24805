//! Small concurrency primitives shared by the engine's background tasks:
//! one-shot stop signals, a task wait group, a fixed-capacity non-blocking
//! limiter for the compaction worker pool and a token-bucket rate limiter
//! for compactor write throughput.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// A clonable one-shot stop signal.
///
/// `stop` may be called any number of times; waiters observe the first one.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    /// Create a new, unsignalled stop signal
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopInner {
                stopped: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal stop, waking all current and future waiters
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// True once `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Wait until the signal is stopped
    pub async fn stopped(&self) {
        while !self.is_stopped() {
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                break;
            }
            notified.await;
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks a set of in-flight tasks and lets callers wait for all of them to
/// finish. Tasks register with [`WaitGroup::add`] and finish by dropping the
/// returned guard.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

struct WaitGroupInner {
    count: AtomicUsize,
    notify: Notify,
}

/// RAII registration for a task tracked by a [`WaitGroup`]
pub struct WaitGroupGuard {
    inner: Arc<WaitGroupInner>,
}

impl WaitGroup {
    /// Create an empty wait group
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WaitGroupInner {
                count: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Register one task; the task finishes when the guard is dropped
    pub fn add(&self) -> WaitGroupGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        WaitGroupGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of registered tasks still running
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until every registered task has finished
    pub async fn wait(&self) {
        while self.count() > 0 {
            let notified = self.inner.notify.notified();
            if self.count() == 0 {
                break;
            }
            notified.await;
        }
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}

/// Fixed-capacity token pool for bounding concurrent compactions.
///
/// Acquisition never blocks; callers that fail to take a token retry on a
/// later tick.
#[derive(Clone)]
pub struct FixedLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl FixedLimiter {
    /// Create a limiter with `capacity` tokens
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Try to take a token without blocking. The token is returned to the
    /// pool when the permit is dropped.
    pub fn try_take(&self) -> Option<OwnedSemaphorePermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => None,
        }
    }

    /// Total number of tokens
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tokens currently taken
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

/// Token-bucket rate limiter for byte throughput.
///
/// The bucket holds up to `burst` tokens and refills at `bytes_per_second`.
/// [`RateLimiter::take`] blocks the calling thread until the requested
/// tokens are available, so it must only be called from blocking worker
/// threads, never from an async task.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    tokens: AtomicU64,
    last_refill: Mutex<Instant>,
    capacity: u64,
    // Tokens added per second; 0 disables limiting entirely.
    refill_rate: u64,
}

impl RateLimiter {
    /// Create a limiter refilling at `bytes_per_second` with a bucket of
    /// `burst_bytes`. A burst of 0 defaults to one second of throughput; a
    /// rate of 0 disables limiting.
    pub fn new(bytes_per_second: u64, burst_bytes: u64) -> Self {
        let capacity = if burst_bytes == 0 {
            bytes_per_second
        } else {
            burst_bytes
        };
        Self {
            inner: Arc::new(RateLimiterInner {
                tokens: AtomicU64::new(capacity),
                last_refill: Mutex::new(Instant::now()),
                capacity,
                refill_rate: bytes_per_second,
            }),
        }
    }

    /// A limiter that never blocks
    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    /// True if the limiter never blocks
    pub fn is_unlimited(&self) -> bool {
        self.inner.refill_rate == 0
    }

    /// Try to consume tokens without blocking. Requests larger than the
    /// bucket capacity always fail; split them first.
    pub fn try_take(&self, bytes: u64) -> bool {
        if self.is_unlimited() || bytes == 0 {
            return true;
        }
        self.refill();

        loop {
            let current = self.inner.tokens.load(Ordering::Relaxed);
            if current < bytes {
                return false;
            }
            match self.inner.tokens.compare_exchange_weak(
                current,
                current - bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// Consume tokens, sleeping until the bucket has refilled enough.
    /// Requests larger than the bucket capacity are consumed in
    /// capacity-sized chunks.
    pub fn take(&self, bytes: u64) {
        if self.is_unlimited() || bytes == 0 {
            return;
        }
        let mut remaining = bytes;
        while remaining > 0 {
            let want = remaining.min(self.inner.capacity);
            if self.try_take(want) {
                remaining -= want;
                continue;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn refill(&self) {
        let mut last_refill = self.inner.last_refill.lock();
        let elapsed = last_refill.elapsed();
        if elapsed < Duration::from_millis(1) {
            return;
        }

        let tokens_to_add = (elapsed.as_secs_f64() * self.inner.refill_rate as f64) as u64;
        if tokens_to_add > 0 {
            let _ = self
                .inner
                .tokens
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                    Some(current.saturating_add(tokens_to_add).min(self.inner.capacity))
                });
            *last_refill = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_signal_wakes_waiter() {
        let signal = StopSignal::new();
        assert!(!signal.is_stopped());

        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.stopped().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.stop();
        handle.await.unwrap();
        assert!(signal.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_signal_after_stop_returns_immediately() {
        let signal = StopSignal::new();
        signal.stop();
        signal.stopped().await;
    }

    #[tokio::test]
    async fn test_wait_group_waits_for_guards() {
        let wg = WaitGroup::new();
        let g1 = wg.add();
        let g2 = wg.add();
        assert_eq!(wg.count(), 2);

        let waiter = wg.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        drop(g1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        drop(g2);
        handle.await.unwrap();
        assert_eq!(wg.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_group_empty_returns_immediately() {
        WaitGroup::new().wait().await;
    }

    #[test]
    fn test_limiter_capacity() {
        let limiter = FixedLimiter::new(2);
        let p1 = limiter.try_take().unwrap();
        let _p2 = limiter.try_take().unwrap();
        assert!(limiter.try_take().is_none());
        assert_eq!(limiter.in_use(), 2);

        drop(p1);
        assert!(limiter.try_take().is_some());
    }

    #[test]
    fn test_rate_limiter_unlimited_never_blocks() {
        let limiter = RateLimiter::unlimited();
        assert!(limiter.is_unlimited());
        limiter.take(10_000_000);
        assert!(limiter.try_take(10_000_000));
    }

    #[test]
    fn test_rate_limiter_burst_then_deny() {
        let limiter = RateLimiter::new(1000, 100);
        assert!(limiter.try_take(100));
        assert!(!limiter.try_take(50));
    }

    #[test]
    fn test_rate_limiter_refills_over_time() {
        let limiter = RateLimiter::new(1000, 100);
        assert!(limiter.try_take(100));
        assert!(!limiter.try_take(50));

        // 150ms at 1000 tokens/s refills well past 50 tokens.
        std::thread::sleep(Duration::from_millis(150));
        assert!(limiter.try_take(50));
    }

    #[test]
    fn test_rate_limiter_take_blocks_for_refill() {
        let limiter = RateLimiter::new(1000, 50);
        limiter.take(50);

        // The next 25 tokens cannot exist before 25ms of refill.
        let start = Instant::now();
        limiter.take(25);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_rate_limiter_burst_defaults_to_rate() {
        let limiter = RateLimiter::new(200, 0);
        assert!(limiter.try_take(200));
        assert!(!limiter.try_take(1));
    }
}
