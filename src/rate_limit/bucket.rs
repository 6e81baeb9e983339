//! Token bucket for a single rate scope.
//!
//! Each spent permit is refilled exactly one period after it was granted, so
//! no rolling window of one period ever sees more than `capacity` grants.
//! Waiters queue on a fair (FIFO) async mutex and sleep while holding it,
//! which serves them strictly in arrival order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::BucketConfig;

/// Bucket state. Owned by one scope and mutated only through
/// [`TokenBucket::acquire`] / [`TokenBucket::try_acquire`].
///
/// Invariant: `available + pending_refills.len() == capacity`.
#[derive(Debug, Clone)]
pub struct TokenBucketState {
    pub capacity: u32,
    /// Period over which `capacity` permits refill
    pub period: Duration,
    /// Permits that can be granted right now
    pub available: u32,
    /// Last time refills were applied
    pub last_refill: Instant,
    /// When each spent permit comes back, oldest first
    pending_refills: VecDeque<Instant>,
}

impl TokenBucketState {
    fn new(config: BucketConfig, now: Instant) -> Self {
        Self {
            capacity: config.capacity,
            period: config.period(),
            available: config.capacity,
            last_refill: now,
            pending_refills: VecDeque::with_capacity(config.capacity as usize),
        }
    }

    /// Average refill rate in permits per second.
    pub fn refill_rate(&self) -> f64 {
        self.capacity as f64 / self.period.as_secs_f64()
    }

    fn refill(&mut self, now: Instant) {
        while let Some(&due) = self.pending_refills.front() {
            if due > now {
                break;
            }
            self.pending_refills.pop_front();
            self.available += 1;
        }
        self.last_refill = now;
    }

    /// Take one permit, or report how long until the next one refills.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.available > 0 {
            self.available -= 1;
            self.pending_refills.push_back(now + self.period);
            return Ok(());
        }
        let next = self
            .pending_refills
            .front()
            .map(|due| due.saturating_duration_since(now))
            .unwrap_or(self.period);
        Err(next)
    }

    /// Permits available at `now`, without applying refills.
    fn available_at(&self, now: Instant) -> u32 {
        let due = self.pending_refills.iter().filter(|d| **d <= now).count() as u32;
        self.available + due
    }
}

/// One scope's limiter.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<TokenBucketState>,
    granted: AtomicU64,
}

impl TokenBucket {
    pub fn new(config: BucketConfig) -> Self {
        Self {
            state: Mutex::new(TokenBucketState::new(config, Instant::now())),
            granted: AtomicU64::new(0),
        }
    }

    /// Wait for a permit.
    ///
    /// Cancel-safe: dropping the future gives up the place in the queue
    /// without consuming a permit.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            match state.try_take(Instant::now()) {
                Ok(()) => {
                    self.granted.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Take a permit only if one is free and nobody is queued ahead.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut state) = self.state.try_lock() else {
            return false;
        };
        let taken = state.try_take(Instant::now()).is_ok();
        if taken {
            self.granted.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }

    /// Permits free right now; `None` while a waiter holds the queue.
    pub fn available(&self) -> Option<u32> {
        self.state
            .try_lock()
            .ok()
            .map(|state| state.available_at(Instant::now()))
    }

    /// Copy of the current state with due refills applied.
    pub async fn snapshot(&self) -> TokenBucketState {
        let mut state = self.state.lock().await.clone();
        state.refill(Instant::now());
        state
    }

    /// Every granted permit has refilled and nobody holds the queue.
    ///
    /// Only an idle bucket can be replaced by a fresh one without letting
    /// its scope exceed capacity within one period.
    pub fn is_idle(&self) -> bool {
        let now = Instant::now();
        self.state
            .try_lock()
            .map(|state| state.pending_refills.iter().all(|due| *due <= now))
            .unwrap_or(false)
    }

    /// Total permits granted over the bucket's lifetime.
    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_wait_for_refill() {
        let bucket = TokenBucket::new(BucketConfig::per_second(5));
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!bucket.try_acquire());

        bucket.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(bucket.granted(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_window_never_exceeds_capacity() {
        let bucket = TokenBucket::new(BucketConfig {
            capacity: 4,
            period_ms: 1_000,
        });
        let mut grants = Vec::new();
        for _ in 0..20 {
            bucket.acquire().await;
            grants.push(Instant::now());
            tokio::time::sleep(Duration::from_millis(70)).await;
        }
        for (i, start) in grants.iter().enumerate() {
            let in_window = grants[i..]
                .iter()
                .filter(|t| t.duration_since(*start) < Duration::from_secs(1))
                .count();
            assert!(in_window <= 4, "window starting at grant {i} saw {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_arrival_order() {
        let bucket = Arc::new(TokenBucket::new(BucketConfig::per_second(1)));
        bucket.acquire().await;

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in 0..3 {
            let bucket = bucket.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                bucket.acquire().await;
                order.lock().unwrap().push(id);
            }));
            // Let each task reach the queue before the next is spawned.
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_stays_within_bounds() {
        let bucket = TokenBucket::new(BucketConfig::per_second(3));
        assert_eq!(bucket.snapshot().await.available, 3);
        bucket.acquire().await;
        bucket.acquire().await;
        let state = bucket.snapshot().await;
        assert_eq!(state.available, 1);
        assert!((state.refill_rate() - 3.0).abs() < f64::EPSILON);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(bucket.snapshot().await.available, 3);
        assert_eq!(bucket.available(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_only_once_every_permit_refilled() {
        let bucket = TokenBucket::new(BucketConfig {
            capacity: 2,
            period_ms: 10_000,
        });
        assert!(bucket.is_idle());

        bucket.acquire().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        bucket.acquire().await;
        assert!(!bucket.is_idle());

        tokio::time::sleep(Duration::from_secs(7)).await;
        // First permit is back, the second is still out
        assert!(!bucket.is_idle());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(bucket.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_consume() {
        let bucket = Arc::new(TokenBucket::new(BucketConfig::per_second(1)));
        bucket.acquire().await;

        let waited =
            tokio::time::timeout(Duration::from_millis(100), bucket.acquire()).await;
        assert!(waited.is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(bucket.try_acquire());
        assert_eq!(bucket.granted(), 2);
    }
}
