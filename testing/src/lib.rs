//! # Outbox Testing
//!
//! Testing utilities for outbox delivery.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`MockClock`])
//! - [`InMemoryOutboxStore`]: transactional outbox store with failure injection
//! - [`InMemoryBroker`]: partitioned in-memory log implementing both the producer
//!   and the consumer side, with scripted publish and commit failures
//!
//! ## Example
//!
//! ```ignore
//! use outbox_testing::{InMemoryBroker, InMemoryOutboxStore, test_clock};
//! use outbox_runtime::{OutboxRelay, RelayConfig};
//!
//! #[tokio::test]
//! async fn relays_pending_records() {
//!     let store = Arc::new(InMemoryOutboxStore::new());
//!     let broker = Arc::new(InMemoryBroker::new());
//!     let relay = OutboxRelay::new(store.clone(), broker.clone(), Arc::new(test_clock()), RelayConfig::default());
//!
//!     relay.run_cycle().await?;
//!     assert_eq!(broker.messages("order.created").len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use outbox_core::environment::Clock;

mod broker;
mod outbox_store;

pub use broker::{InMemoryBroker, InMemorySource, PublishedMessage};
pub use outbox_store::InMemoryOutboxStore;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use outbox_testing::mocks::FixedClock;
    /// use outbox_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Manually advanced clock.
    ///
    /// Clones share the same time, so a test can keep one handle and pass another
    /// to the code under test.
    ///
    /// # Example
    ///
    /// ```
    /// use outbox_testing::mocks::MockClock;
    /// use outbox_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = MockClock::starting_at(outbox_testing::test_clock().now());
    /// let handle = clock.clone();
    /// handle.advance(Duration::from_secs(90));
    /// assert_eq!((clock.now() - outbox_testing::test_clock().now()).num_seconds(), 90);
    /// ```
    #[derive(Debug, Clone)]
    pub struct MockClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl MockClock {
        /// Create a clock frozen at `time` until advanced.
        #[must_use]
        pub fn starting_at(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        #[allow(clippy::unwrap_used)]
        pub fn advance(&self, by: std::time::Duration) {
            let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
            let mut time = self.time.lock().unwrap();
            *time = time.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }

        /// Jump to an absolute time.
        #[allow(clippy::unwrap_used)]
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap() = time;
        }
    }

    impl Clock for MockClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// A [`MockClock`] starting at the [`test_clock`] time.
    #[must_use]
    pub fn mock_clock() -> MockClock {
        MockClock::starting_at(test_clock().now())
    }
}

/// Test helpers and utilities.
pub mod helpers {
    /// Route `tracing` output to the test harness, honoring `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs the subscriber.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Aggregate ids drawn from a small pool so generated batches share aggregates.
    pub fn aggregate_id() -> impl Strategy<Value = String> {
        (0u8..4).prop_map(|n| format!("order-{n}"))
    }

    /// Per-publish failure script: `true` means the publish fails.
    pub fn failure_script(max_len: usize) -> impl Strategy<Value = Vec<bool>> {
        prop::collection::vec(any::<bool>(), 0..=max_len)
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, MockClock, mock_clock, test_clock};
