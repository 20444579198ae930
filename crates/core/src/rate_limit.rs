//! Sliding-window rate limiting for message submission.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Millisecond wall clock used for attempt timestamps.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn starting_at(millis: i64) -> Self {
        Self {
            now: AtomicI64::new(millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_millis(by), Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Storage for attempt timestamps, keyed by limiter key.
pub trait AttemptStore: Send + Sync {
    /// Drops timestamps at or before `cutoff` and returns the rest, oldest
    /// first.
    fn prune(&self, key: &str, cutoff: i64) -> Vec<i64>;
    fn push(&self, key: &str, at: i64);

    /// Prunes like [`AttemptStore::prune`] and records `at` only when fewer
    /// than `max_attempts` survive, all under one lock. A refusal hands back
    /// the surviving attempts, oldest first.
    fn try_push(&self, key: &str, cutoff: i64, max_attempts: usize, at: i64) -> Result<(), Vec<i64>>;

    /// Forgets a single attempt recorded at `at`, if present.
    fn remove(&self, key: &str, at: i64);
}

/// Process-local attempt store. Keys are created on first use and kept for
/// the life of the process.
#[derive(Debug, Default)]
pub struct InMemoryAttemptStore {
    attempts: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<i64>>> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn drop_expired(entries: &mut VecDeque<i64>, cutoff: i64) {
    while entries.front().is_some_and(|at| *at <= cutoff) {
        entries.pop_front();
    }
}

fn insert_sorted(entries: &mut VecDeque<i64>, at: i64) {
    // Keep the deque sorted even if the clock steps backwards.
    let position = entries.partition_point(|existing| *existing <= at);
    entries.insert(position, at);
}

impl AttemptStore for InMemoryAttemptStore {
    fn prune(&self, key: &str, cutoff: i64) -> Vec<i64> {
        let mut attempts = self.lock();
        let Some(entries) = attempts.get_mut(key) else {
            return Vec::new();
        };
        drop_expired(entries, cutoff);
        entries.iter().copied().collect()
    }

    fn push(&self, key: &str, at: i64) {
        let mut attempts = self.lock();
        insert_sorted(attempts.entry(key.to_owned()).or_default(), at);
    }

    fn try_push(&self, key: &str, cutoff: i64, max_attempts: usize, at: i64) -> Result<(), Vec<i64>> {
        let mut attempts = self.lock();
        let entries = attempts.entry(key.to_owned()).or_default();
        drop_expired(entries, cutoff);
        if entries.len() >= max_attempts {
            return Err(entries.iter().copied().collect());
        }
        insert_sorted(entries, at);
        Ok(())
    }

    fn remove(&self, key: &str, at: i64) {
        let mut attempts = self.lock();
        if let Some(entries) = attempts.get_mut(key) {
            if let Some(position) = entries.iter().position(|existing| *existing == at) {
                entries.remove(position);
            }
        }
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn AttemptStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryAttemptStore::new()), Arc::new(SystemClock))
    }

    fn live_attempts(&self, key: &str, window: Duration) -> (i64, Vec<i64>) {
        let now = self.clock.now_millis();
        let cutoff = now.saturating_sub(duration_millis(window));
        (now, self.store.prune(key, cutoff))
    }

    /// True once `key` has `max_attempts` or more attempts inside `window`.
    pub fn is_limited(&self, key: &str, max_attempts: usize, window: Duration) -> bool {
        let (_, attempts) = self.live_attempts(key, window);
        attempts.len() >= max_attempts
    }

    /// How long until `key` may make another attempt, or `None` when it is
    /// not limited. A cap of zero never admits anything, so the full window
    /// is reported.
    pub fn retry_after(&self, key: &str, max_attempts: usize, window: Duration) -> Option<Duration> {
        let (now, attempts) = self.live_attempts(key, window);
        if attempts.len() < max_attempts {
            return None;
        }
        Some(wait_for_slot(&attempts, max_attempts, window, now))
    }

    pub fn record_attempt(&self, key: &str) {
        self.store.push(key, self.clock.now_millis());
    }

    /// Checks and records in one step. Returns the recorded timestamp, which
    /// [`SlidingWindowLimiter::release`] takes to undo the attempt, or the
    /// cooldown when `key` is already at its cap.
    pub fn try_acquire(&self, key: &str, max_attempts: usize, window: Duration) -> Result<i64, Duration> {
        let now = self.clock.now_millis();
        let cutoff = now.saturating_sub(duration_millis(window));
        match self.store.try_push(key, cutoff, max_attempts, now) {
            Ok(()) => Ok(now),
            Err(attempts) => Err(wait_for_slot(&attempts, max_attempts, window, now)),
        }
    }

    pub fn release(&self, key: &str, at: i64) {
        self.store.remove(key, at);
    }
}

/// Time until the attempt blocking the next slot ages out of `window`.
fn wait_for_slot(attempts: &[i64], max_attempts: usize, window: Duration, now: i64) -> Duration {
    if max_attempts == 0 || attempts.len() < max_attempts {
        return window;
    }
    let blocking = attempts[attempts.len() - max_attempts];
    let frees_at = blocking.saturating_add(duration_millis(window));
    let wait = frees_at.saturating_sub(now).max(0);
    Duration::from_millis(wait as u64)
}

/// Attempts allowed inside a rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub max_attempts: usize,
    pub window_secs: u64,
}

impl WindowLimit {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub burst: WindowLimit,
    pub sustained: WindowLimit,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            burst: WindowLimit {
                max_attempts: 3,
                window_secs: 10,
            },
            sustained: WindowLimit {
                max_attempts: 10,
                window_secs: 60,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    Burst,
    Sustained,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Burst => "burst",
            RateLimitScope::Sustained => "sustained",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimited {
    pub scope: RateLimitScope,
    #[serde(rename = "retry_after_ms", serialize_with = "serialize_millis")]
    pub retry_after: Duration,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

impl RateLimited {
    /// Cooldown rounded up to whole seconds, suitable for `Retry-After`.
    pub fn retry_after_secs(&self) -> u64 {
        let millis = u64::try_from(self.retry_after.as_millis()).unwrap_or(u64::MAX);
        millis.div_ceil(1000).max(1)
    }
}

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "too many messages ({} limit); try again in {} seconds",
            self.scope.as_str(),
            self.retry_after_secs()
        )
    }
}

/// Slots held in both windows by one accepted message. Hand it back to
/// [`MessageRateLimiter::release`] if the message is refused for another
/// reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Reservation {
    user_id: u64,
    burst_at: i64,
    sustained_at: i64,
}

/// Per-user message limits: a short burst window checked first, then a
/// longer sustained window.
#[derive(Clone)]
pub struct MessageRateLimiter {
    limiter: SlidingWindowLimiter,
    policy: RateLimitPolicy,
}

impl MessageRateLimiter {
    pub fn new(limiter: SlidingWindowLimiter, policy: RateLimitPolicy) -> Self {
        Self { limiter, policy }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn burst_key(user_id: u64) -> String {
        format!("message_burst_{user_id}")
    }

    pub fn sustained_key(user_id: u64) -> String {
        format!("message_rate_{user_id}")
    }

    pub fn check(&self, user_id: u64) -> Result<(), RateLimited> {
        let windows = [
            (RateLimitScope::Burst, Self::burst_key(user_id), self.policy.burst),
            (
                RateLimitScope::Sustained,
                Self::sustained_key(user_id),
                self.policy.sustained,
            ),
        ];

        for (scope, key, limit) in windows {
            if let Some(retry_after) =
                self.limiter
                    .retry_after(&key, limit.max_attempts, limit.window())
            {
                return Err(RateLimited { scope, retry_after });
            }
        }
        Ok(())
    }

    pub fn record(&self, user_id: u64) {
        self.limiter.record_attempt(&Self::burst_key(user_id));
        self.limiter.record_attempt(&Self::sustained_key(user_id));
    }

    /// Takes a slot in both windows or none. Concurrent callers for the same
    /// user can never overshoot either cap.
    pub fn acquire(&self, user_id: u64) -> Result<Reservation, RateLimited> {
        let burst_key = Self::burst_key(user_id);
        let burst = self.policy.burst;
        let burst_at = self
            .limiter
            .try_acquire(&burst_key, burst.max_attempts, burst.window())
            .map_err(|retry_after| RateLimited {
                scope: RateLimitScope::Burst,
                retry_after,
            })?;

        let sustained = self.policy.sustained;
        match self.limiter.try_acquire(
            &Self::sustained_key(user_id),
            sustained.max_attempts,
            sustained.window(),
        ) {
            Ok(sustained_at) => Ok(Reservation {
                user_id,
                burst_at,
                sustained_at,
            }),
            Err(retry_after) => {
                self.limiter.release(&burst_key, burst_at);
                Err(RateLimited {
                    scope: RateLimitScope::Sustained,
                    retry_after,
                })
            }
        }
    }

    pub fn release(&self, reservation: Reservation) {
        self.limiter
            .release(&Self::burst_key(reservation.user_id), reservation.burst_at);
        self.limiter
            .release(&Self::sustained_key(reservation.user_id), reservation.sustained_at);
    }
}
