//! Shared test utilities for dnsfleet crates.
//!
//! - [`assert_eventually`] / [`eventually_some`] - Poll a condition until it holds or times out
//! - [`MockConn`] / [`CountingDialer`] - In-memory connections for connection-cache tests
//! - [`FakeLookup`] - Scripted DNS responses for resolver tests
//! - [`RecordingSink`] - Captures resolver output

#![deny(unsafe_code)]

mod assertions;
pub use assertions::{assert_eventually, eventually_some};

mod mocks;
pub use mocks::{CountingDialer, MockConn, MockDialError};

mod resolver;
pub use resolver::{FakeLookup, RecordingSink};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use dnsfleet_client::{
        Closer, ConnectError, Dialer, HostLookup, LookupErrorKind, ResolvedAddress, ResolverState,
        UpdateSink,
    };

    use super::*;

    // ============================================
    // assert_eventually tests
    // ============================================

    #[tokio::test]
    async fn test_assert_eventually_immediate_success() {
        assert!(assert_eventually(Duration::from_millis(100), || true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assert_eventually_delayed_success() {
        let counter = AtomicUsize::new(0);
        let result = assert_eventually(Duration::from_millis(500), || {
            counter.fetch_add(1, Ordering::SeqCst) >= 3
        })
        .await;
        assert!(result);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assert_eventually_timeout() {
        assert!(!assert_eventually(Duration::from_millis(50), || false).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventually_some_observes_spawned_change() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&flag);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            setter.store(true, Ordering::SeqCst);
        });

        let value =
            eventually_some(Duration::from_secs(1), || flag.load(Ordering::SeqCst).then_some(42))
                .await;
        assert_eq!(value, Some(42));
    }

    // ============================================
    // Mock tests
    // ============================================

    #[tokio::test]
    async fn test_counting_dialer_counts_and_fails() {
        let dialer = CountingDialer::new();
        let conn = dialer.dial("a:1").await.unwrap();
        assert_eq!(conn.addr(), "a:1");

        dialer.fail("b:1");
        let err = dialer.dial("b:1").await.unwrap_err();
        assert_eq!(err.to_string(), "dial b:1: connection refused");

        dialer.heal("b:1");
        assert!(dialer.dial("b:1").await.is_ok());
        assert_eq!(dialer.dials("b:1"), 2);
        assert_eq!(dialer.total_dials(), 3);
        assert_eq!(dialer.conns().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_conn_close_is_shared_by_clones() {
        let conn = MockConn::new(7, "a:1");
        let clone = conn.clone();
        clone.close().await;
        assert!(conn.is_closed());
        assert_eq!(conn.id(), 7);
    }

    // ============================================
    // Resolver helper tests
    // ============================================

    #[tokio::test]
    async fn test_fake_lookup_replays_then_repeats_last() {
        let lookup = FakeLookup::new();
        lookup.push_err(LookupErrorKind::Timeout);
        lookup.push_ok(&["10.0.0.1"]);

        let first = lookup.lookup_host("db").await.unwrap_err();
        assert_eq!(first.kind(), LookupErrorKind::Timeout);
        assert_eq!(lookup.lookup_host("db").await.unwrap(), vec!["10.0.0.1"]);
        assert_eq!(lookup.lookup_host("db").await.unwrap(), vec!["10.0.0.1"]);
        assert_eq!(lookup.calls(), 3);
        assert_eq!(lookup.hosts(), vec!["db", "db", "db"]);
    }

    #[tokio::test]
    async fn test_recording_sink_captures_output() {
        let sink = RecordingSink::new();
        sink.update_state(ResolverState::new(vec![ResolvedAddress::from("10.0.0.1:443")]));
        sink.report_error(ConnectError::NoAddresses { target: "db:443".to_string() });

        sink.wait_for_states(1).await;
        sink.wait_for_errors(1).await;
        assert_eq!(sink.last_addresses(), Some(vec!["10.0.0.1:443".to_string()]));
        assert_eq!(sink.errors(), vec!["no addresses resolved for db:443".to_string()]);
    }
}
