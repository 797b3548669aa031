//! A mockable clock abstraction.
//!
//! `deleting_at` timestamps are stamped inside serializable transactions by [`TimeProvider::now`].
//! Tests that need to assert on the exact timestamp recorded, or on time-dependent behavior
//! such as resurrection races, use [`MockProvider`] instead of the wall clock.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::{
    fmt::Debug,
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

/// A point in time, represented as nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(i64);

impl Time {
    /// The Unix epoch.
    pub const MIN: Self = Self(i64::MIN);

    /// Construct from seconds and nanoseconds since the Unix epoch.
    pub fn from_timestamp(secs: i64, nanos: u32) -> Self {
        Self(secs * 1_000_000_000 + i64::from(nanos))
    }

    /// Construct from nanoseconds since the Unix epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Nanoseconds since the Unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0
    }

    /// Convert to a [`chrono::DateTime<Utc>`].
    pub fn date_time(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }

    /// `self + duration`, saturating rather than overflowing.
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        i64::try_from(duration.as_nanos())
            .ok()
            .and_then(|d| self.0.checked_add(d))
            .map(Self)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.date_time().to_rfc3339())
    }
}

/// A source of the current time.
///
/// Abstracted so that the serializable-transaction retry loop and the deletion protocol can
/// be driven by a [`MockProvider`] in tests instead of the wall clock.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] that returns the system wall clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a new provider reading from the system clock.
    pub fn new() -> Self {
        Self {}
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        let now = Utc::now();
        Time::from_timestamp(now.timestamp(), now.timestamp_subsec_nanos())
    }
}

/// A [`TimeProvider`] with a time that can be explicitly set or advanced, for deterministic tests.
#[derive(Debug)]
pub struct MockProvider {
    now: Mutex<Time>,
}

impl MockProvider {
    /// Create a new mock provider starting at `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Overwrite the current time.
    pub fn set(&self, time: Time) {
        *self.now.lock() = time;
    }

    /// Advance the current time by `duration`.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.lock();
        let next = now.checked_add(duration).expect("time overflow");
        *now = next;
        next
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_advances() {
        let provider = MockProvider::new(Time::from_timestamp_nanos(0));
        assert_eq!(provider.now(), Time::from_timestamp_nanos(0));
        provider.inc(Duration::from_nanos(42));
        assert_eq!(provider.now(), Time::from_timestamp_nanos(42));
        provider.set(Time::from_timestamp(1, 0));
        assert_eq!(provider.now(), Time::from_timestamp_nanos(1_000_000_000));
    }

    #[test]
    fn system_provider_moves_forward() {
        let provider = SystemProvider::new();
        let t1 = provider.now();
        let t2 = provider.now();
        assert!(t2 >= t1);
    }
}
