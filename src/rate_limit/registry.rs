//! Registry of rate limiters across scopes.
//!
//! Two global limiters (login, general operations) live for the life of the
//! registry. Per-resource limiters (one per market id) are created on first
//! use and dropped by a periodic sweep once idle, so a long-running process
//! touching many markets does not grow without bound.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bucket::TokenBucket;
use crate::config::RateLimitConfig;
use crate::logging::targets;

/// A limiting domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateScope {
    /// Login and keep-alive
    Login,
    /// Every data call
    GeneralOperation,
    /// One resource key, e.g. a market id
    PerResource(String),
}

impl RateScope {
    pub fn resource(key: impl Into<String>) -> Self {
        RateScope::PerResource(key.into())
    }
}

impl fmt::Display for RateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateScope::Login => write!(f, "login"),
            RateScope::GeneralOperation => write!(f, "general"),
            RateScope::PerResource(key) => write!(f, "resource:{key}"),
        }
    }
}

struct ResourceEntry {
    bucket: Arc<TokenBucket>,
    last_used: Instant,
}

impl ResourceEntry {
    /// No acquire holds the bucket and all of its permits have refilled.
    fn is_removable(&self) -> bool {
        Arc::strong_count(&self.bucket) == 1 && self.bucket.is_idle()
    }
}

/// Owns every limiter. Share it behind an `Arc`.
pub struct RateLimiterRegistry {
    config: RateLimitConfig,
    login: Arc<TokenBucket>,
    general: Arc<TokenBucket>,
    /// Lookup-or-create and sweep-delete both run under this lock.
    resources: Mutex<HashMap<String, ResourceEntry>>,
    evicted_total: AtomicU64,
}

impl fmt::Debug for RateLimiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterRegistry")
            .field("config", &self.config)
            .field("resource_limiters", &self.resource_limiter_count())
            .finish()
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiterRegistry {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            login: Arc::new(TokenBucket::new(config.login)),
            general: Arc::new(TokenBucket::new(config.general)),
            resources: Mutex::new(HashMap::new()),
            evicted_total: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn resources(&self) -> MutexGuard<'_, HashMap<String, ResourceEntry>> {
        // Entries stay consistent even if a holder panicked.
        self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until a permit for `scope` is granted.
    ///
    /// A new per-resource key gets a limiter with the per-resource defaults.
    pub async fn acquire(&self, scope: &RateScope) {
        let bucket = self.limiter(scope);
        bucket.acquire().await;
        if let RateScope::PerResource(key) = scope {
            self.touch(key);
        }
        debug!(target: targets::RATE_LIMIT, scope = %scope, "Permit acquired");
        // `bucket` is dropped only now, so the sweep could not have removed
        // it while we were queued.
    }

    /// Non-blocking variant of [`acquire`](Self::acquire).
    pub fn try_acquire(&self, scope: &RateScope) -> bool {
        let bucket = self.limiter(scope);
        let granted = bucket.try_acquire();
        if granted {
            if let RateScope::PerResource(key) = scope {
                self.touch(key);
            }
        }
        granted
    }

    /// The limiter serving `scope`, creating a per-resource one if needed.
    pub fn limiter(&self, scope: &RateScope) -> Arc<TokenBucket> {
        match scope {
            RateScope::Login => self.login.clone(),
            RateScope::GeneralOperation => self.general.clone(),
            RateScope::PerResource(key) => self.lookup_or_create(key),
        }
    }

    fn lookup_or_create(&self, key: &str) -> Arc<TokenBucket> {
        let now = Instant::now();
        let mut resources = self.resources();
        if let Some(entry) = resources.get_mut(key) {
            entry.last_used = now;
            return entry.bucket.clone();
        }

        if resources.len() >= self.config.max_resource_limiters {
            self.evict_least_recently_used(&mut resources);
        }

        let bucket = Arc::new(TokenBucket::new(self.config.per_resource));
        resources.insert(
            key.to_string(),
            ResourceEntry {
                bucket: bucket.clone(),
                last_used: now,
            },
        );
        debug!(
            target: targets::RATE_LIMIT,
            key,
            live = resources.len(),
            "Created per-resource limiter"
        );
        bucket
    }

    fn evict_least_recently_used(&self, resources: &mut HashMap<String, ResourceEntry>) {
        let victim = resources
            .iter()
            .filter(|(_, entry)| entry.is_removable())
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => {
                resources.remove(&key);
                self.evicted_total.fetch_add(1, Ordering::Relaxed);
                debug!(target: targets::RATE_LIMIT, key = %key, "Evicted least recently used limiter");
            }
            None => warn!(
                target: targets::RATE_LIMIT,
                live = resources.len(),
                max = self.config.max_resource_limiters,
                "Resource limiter cap reached with no idle limiter to evict"
            ),
        }
    }

    fn touch(&self, key: &str) {
        if let Some(entry) = self.resources().get_mut(key) {
            entry.last_used = Instant::now();
        }
    }

    /// Drop per-resource limiters idle for at least the configured window.
    ///
    /// A limiter still referenced by an in-flight acquire, or with permits
    /// not yet refilled, is kept regardless of age. Returns the number removed.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let idle_window = self.config.resource_idle();
        let mut resources = self.resources();
        let before = resources.len();
        resources.retain(|_, entry| {
            let idle = now.saturating_duration_since(entry.last_used) >= idle_window;
            !(idle && entry.is_removable())
        });
        let removed = before - resources.len();
        if removed > 0 {
            self.evicted_total
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Periodic idle sweep. Runs until `shutdown` flips to `true` or its
    /// sender is dropped.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate first tick
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = self.sweep_idle();
                    if removed > 0 {
                        info!(
                            target: targets::RATE_LIMIT,
                            removed,
                            live = self.resource_limiter_count(),
                            "Swept idle per-resource limiters"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(target: targets::RATE_LIMIT, "Limiter sweep stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Live per-resource limiters.
    pub fn resource_limiter_count(&self) -> usize {
        self.resources().len()
    }

    pub fn has_resource_limiter(&self, key: &str) -> bool {
        self.resources().contains_key(key)
    }

    /// Get metrics for logging/monitoring.
    pub fn metrics(&self) -> RateLimitMetrics {
        RateLimitMetrics {
            login_available: self.login.available(),
            general_available: self.general.available(),
            login_granted: self.login.granted(),
            general_granted: self.general.granted(),
            resource_limiters: self.resource_limiter_count(),
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of registry state.
#[derive(Debug, Clone)]
pub struct RateLimitMetrics {
    /// `None` while a waiter holds the queue
    pub login_available: Option<u32>,
    pub general_available: Option<u32>,
    pub login_granted: u64,
    pub general_granted: u64,
    pub resource_limiters: usize,
    pub evicted_total: u64,
}
