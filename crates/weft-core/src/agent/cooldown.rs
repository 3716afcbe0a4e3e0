//! Cooldown cache for throttled backends.
//!
//! When a backend answers with a throttling error it is put on cooldown until
//! `now + retry_after` (or the configured default). Fallback candidate
//! selection consults the cache and never picks a cooling backend. Expired
//! entries are dropped lazily on lookup and eagerly by [`CooldownCache::purge`].
//!
//! The cache is the only state shared across runs. Time comes from an
//! injectable [`Clock`] so tests can move time forward deterministically.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use weft_types::agent::Backend;
use weft_types::config::FallbackTable;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = add_clamped(*now, by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Backend -> cooldown expiry.
pub struct CooldownCache {
    entries: DashMap<Backend, DateTime<Utc>>,
    clock: Arc<dyn Clock>,
    default_cooldown: Duration,
    max_cooldown: Duration,
}

impl CooldownCache {
    pub fn new(clock: Arc<dyn Clock>, default_cooldown: Duration, max_cooldown: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            default_cooldown,
            max_cooldown,
        }
    }

    /// Build a cache using the wall clock and the table's cooldown settings.
    pub fn from_table(table: &FallbackTable) -> Self {
        Self::with_clock(table, Arc::new(SystemClock))
    }

    pub fn with_clock(table: &FallbackTable, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            clock,
            Duration::from_secs(table.default_cooldown_secs),
            Duration::from_secs(table.max_cooldown_secs),
        )
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Put a backend on cooldown and return the expiry.
    ///
    /// `retry_after` falls back to the default cooldown and is capped at the
    /// maximum. An existing later expiry is kept.
    pub fn put(&self, backend: &Backend, retry_after: Option<Duration>) -> DateTime<Utc> {
        let wait = retry_after
            .unwrap_or(self.default_cooldown)
            .min(self.max_cooldown);
        let expiry = add_clamped(self.clock.now(), wait);

        let mut entry = self.entries.entry(backend.clone()).or_insert(expiry);
        if *entry < expiry {
            *entry = expiry;
        }
        let stored = *entry;
        drop(entry);

        tracing::debug!(backend = %backend, until = %stored, "backend cooling down");
        stored
    }

    /// Cooldown expiry for a backend, or `None` if it is not cooling down.
    pub fn get(&self, backend: &Backend) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.entries.remove_if(backend, |_, expiry| *expiry <= now);
        self.entries.get(backend).map(|e| *e)
    }

    pub fn is_cooling(&self, backend: &Backend) -> bool {
        self.get(backend).is_some()
    }

    /// Time left on a backend's cooldown.
    pub fn remaining(&self, backend: &Backend) -> Option<Duration> {
        let expiry = self.get(backend)?;
        (expiry - self.clock.now()).to_std().ok()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Human-readable list of cooling backends, e.g. `groq/m1 (59s), groq/m2 (12s)`.
    pub fn summary(&self) -> String {
        self.purge();
        let now = self.clock.now();
        let mut cooling: Vec<(Backend, i64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), (*e.value() - now).num_seconds().max(0)))
            .collect();
        if cooling.is_empty() {
            return "no backend is cooling down".to_string();
        }
        cooling.sort();
        cooling
            .iter()
            .map(|(backend, secs)| format!("{backend} ({secs}s)"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl std::fmt::Debug for CooldownCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownCache")
            .field("entries", &self.entries.len())
            .field("default_cooldown", &self.default_cooldown)
            .field("max_cooldown", &self.max_cooldown)
            .finish()
    }
}

/// `at + duration`, saturating at the latest representable time.
fn add_clamped(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
