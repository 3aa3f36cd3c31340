//! Fixed-window rate limiting (§4.5): a KV-backed atomic-increment backend
//! for sensitive counters, and a bounded in-memory fallback used either when
//! no KV is configured or when the KV call itself fails.
//!
//! Grounded on the upstream `request_throttle` module's DashMap
//! fixed-window bucket (`ThrottleKey`/`WindowState`/sweep-on-N-requests),
//! generalised from an HTTP-request-scope throttle into a `(principal,
//! purpose)`-keyed limiter usable for both client-message and
//! agent-message/typing-debounce limiting.

use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tracing::warn;

agentim_common::impl_context!();

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("KV backend unavailable: {0}")]
    KvUnavailable(String),
}

impl agentim_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What to do when the KV backend is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Reject the request. Used for client-message rate limiting — the
    /// sensitive counter named in the spec.
    Closed,
    /// Allow the request, with a warning log. Used for agent-message rate
    /// and the typing debounce.
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
}

/// An atomic `INCR key; if result==1 then EXPIRE key windowSec; return
/// result` primitive. The atomicity matters: a naive INCR-then-EXPIRE would
/// leave a key TTL-less forever if the backend restarts between the two
/// steps, permanently blocking the principal (see property P6).
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn incr_with_expire(&self, key: &str, window: Duration) -> Result<u64>;
    /// Set-if-absent-with-TTL, used by the typing debounce. Returns `true`
    /// if the key was newly set (i.e. the event is allowed through).
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool>;
}

const CLEANUP_EVERY_HITS: u64 = 512;

struct WindowState {
    started_at: tokio::time::Instant,
    count: u64,
    inserted_order: u64,
}

/// Bounded in-memory fixed-window map, used standalone or as a KV fallback.
///
/// Eviction policy when at capacity: first sweep expired entries; if still
/// full, evict the oldest-inserted entry. A background task should call
/// [`InMemoryBackend::sweep`] periodically (default every 60s).
pub struct InMemoryBackend {
    buckets: DashMap<String, WindowState>,
    max_entries: usize,
    insert_seq: std::sync::atomic::AtomicU64,
    hits: std::sync::atomic::AtomicU64,
}

impl InMemoryBackend {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            max_entries,
            insert_seq: std::sync::atomic::AtomicU64::new(0),
            hits: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn check(&self, key: &str, window: Duration, max: u64) -> Decision {
        self.check_at(key, window, max, tokio::time::Instant::now())
    }

    fn check_at(&self, key: &str, window: Duration, max: u64, now: tokio::time::Instant) -> Decision {
        let decision = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occ) => {
                let state = occ.get_mut();
                let elapsed = now.duration_since(state.started_at);
                if elapsed >= window {
                    // Window has fully elapsed: start a fresh window. TTL
                    // is re-armed here, not reset mid-window.
                    state.started_at = now;
                    state.count = 1;
                    Decision::Allowed
                } else if state.count < max {
                    state.count += 1;
                    Decision::Allowed
                } else {
                    Decision::Denied
                }
            },
            Entry::Vacant(vacant) => {
                self.make_room();
                let order = self.insert_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                vacant.insert(WindowState {
                    started_at: now,
                    count: 1,
                    inserted_order: order,
                });
                Decision::Allowed
            },
        };

        let seen = self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        if seen.is_multiple_of(CLEANUP_EVERY_HITS) {
            self.sweep_expired_older_than(window.saturating_mul(3));
        }
        decision
    }

    fn make_room(&self) {
        if self.buckets.len() < self.max_entries {
            return;
        }
        self.sweep_expired_older_than(Duration::from_secs(0));
        if self.buckets.len() >= self.max_entries {
            if let Some(oldest_key) = self
                .buckets
                .iter()
                .min_by_key(|e| e.inserted_order)
                .map(|e| e.key().clone())
            {
                self.buckets.remove(&oldest_key);
            }
        }
    }

    /// Background sweep: drop any entry whose window is older than the
    /// given staleness threshold. Call this every 60s in production.
    pub fn sweep(&self, staleness: Duration) {
        self.sweep_expired_older_than(staleness);
    }

    fn sweep_expired_older_than(&self, staleness: Duration) {
        let now = tokio::time::Instant::now();
        self.buckets
            .retain(|_, state| now.duration_since(state.started_at) <= staleness);
    }
}

/// Set-if-absent-with-TTL on the in-memory map, used for the typing
/// debounce fallback.
impl InMemoryBackend {
    pub fn set_if_absent(&self, key: &str, ttl: Duration) -> bool {
        match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occ) => {
                let state = occ.get_mut();
                if tokio::time::Instant::now().duration_since(state.started_at) >= ttl {
                    state.started_at = tokio::time::Instant::now();
                    state.count = 1;
                    true
                } else {
                    false
                }
            },
            Entry::Vacant(vacant) => {
                let order = self.insert_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                vacant.insert(WindowState {
                    started_at: tokio::time::Instant::now(),
                    count: 1,
                    inserted_order: order,
                });
                true
            },
        }
    }
}

/// Fixed-window rate limiter keyed by `(principal, purpose)`, preferring a
/// KV backend and falling back to an in-memory map per [`FailurePolicy`].
pub struct RateLimiter<K: KvBackend> {
    kv: Option<K>,
    fallback: InMemoryBackend,
}

impl<K: KvBackend> RateLimiter<K> {
    pub fn new(kv: Option<K>, fallback_max_entries: usize) -> Self {
        Self {
            kv,
            fallback: InMemoryBackend::new(fallback_max_entries),
        }
    }

    pub fn fallback(&self) -> &InMemoryBackend {
        &self.fallback
    }

    /// Check and increment a fixed-window counter for `key`, preferring the
    /// KV backend. On KV failure, apply `policy`.
    pub async fn check(
        &self,
        key: &str,
        window: Duration,
        max: u64,
        policy: FailurePolicy,
    ) -> Decision {
        if let Some(kv) = &self.kv {
            match kv.incr_with_expire(key, window).await {
                Ok(count) => {
                    return if count <= max {
                        Decision::Allowed
                    } else {
                        Decision::Denied
                    };
                },
                Err(e) => {
                    warn!(key, error = %e, "rate limiter KV backend unavailable");
                    return match policy {
                        FailurePolicy::Closed => Decision::Denied,
                        FailurePolicy::Open => self.fallback.check(key, window, max),
                    };
                },
            }
        }
        self.fallback.check(key, window, max)
    }

    /// Debounce check: true if the event should be allowed through (i.e.
    /// no identical event was seen within `ttl`). Always fail-open on KV
    /// loss, per the spec's typing-debounce rule.
    pub async fn debounce(&self, key: &str, ttl: Duration) -> bool {
        if let Some(kv) = &self.kv {
            match kv.set_if_absent(key, ttl).await {
                Ok(allowed) => return allowed,
                Err(e) => {
                    warn!(key, error = %e, "debounce KV backend unavailable, failing open");
                },
            }
        }
        self.fallback.set_if_absent(key, ttl)
    }
}

pub fn key_for(principal: impl std::fmt::Display, purpose: impl std::fmt::Display) -> String {
    format!("{principal}:{purpose}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyKv {
        fail: AtomicBool,
    }

    #[async_trait]
    impl KvBackend for FlakyKv {
        async fn incr_with_expire(&self, _key: &str, _window: Duration) -> Result<u64> {
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::KvUnavailable("simulated outage".into()))
            } else {
                Ok(1)
            }
        }
        async fn set_if_absent(&self, _key: &str, _ttl: Duration) -> Result<bool> {
            Ok(!self.fail.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn in_memory_allows_up_to_max_then_denies() {
        let backend = InMemoryBackend::new(100);
        let now = tokio::time::Instant::now();
        assert_eq!(
            backend.check_at("k", Duration::from_secs(10), 2, now),
            Decision::Allowed
        );
        assert_eq!(
            backend.check_at("k", Duration::from_secs(10), 2, now),
            Decision::Allowed
        );
        assert_eq!(
            backend.check_at("k", Duration::from_secs(10), 2, now),
            Decision::Denied
        );
    }

    #[test]
    fn in_memory_resets_after_window_elapses() {
        let backend = InMemoryBackend::new(100);
        let now = tokio::time::Instant::now();
        assert_eq!(
            backend.check_at("k", Duration::from_secs(10), 1, now),
            Decision::Allowed
        );
        assert_eq!(
            backend.check_at("k", Duration::from_secs(10), 1, now + Duration::from_secs(11)),
            Decision::Allowed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fail_closed_denies_on_kv_outage() {
        let kv = FlakyKv { fail: AtomicBool::new(true) };
        let limiter = RateLimiter::new(Some(kv), 100);
        let decision = limiter
            .check("u1:message", Duration::from_secs(60), 30, FailurePolicy::Closed)
            .await;
        assert_eq!(decision, Decision::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_open_allows_on_kv_outage() {
        let kv = FlakyKv { fail: AtomicBool::new(true) };
        let limiter = RateLimiter::new(Some(kv), 100);
        let decision = limiter
            .check("agent1:message", Duration::from_secs(60), 120, FailurePolicy::Open)
            .await;
        assert_eq!(decision, Decision::Allowed);
    }
}
