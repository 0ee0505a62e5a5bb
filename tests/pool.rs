//! Integration tests for the per-address connection pool and the
//! driver built on top of it: reuse, max concurrency, and closing
//! behavior against a live server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use zero_bolt::pool::Pool;
use zero_bolt::routing::table::ServerAddress;
use zero_bolt::{Driver, Opts};

const TEST_URI: &str = "bolt://localhost:7687";

fn opts() -> Opts {
    Opts::try_from(TEST_URI).expect("parse connection uri")
}

#[tokio::test]
async fn acquire_and_release_returns_the_connection_to_the_idle_queue() {
    let pool = Arc::new(Pool::new(Arc::new(opts())));
    let address = ServerAddress::new("localhost", 7687);

    let conn = pool.acquire(&address).await.expect("acquire");
    assert_eq!(pool.in_use_count(&address).await, 1);
    assert_eq!(pool.idle_count(&address).await, 0);

    conn.release();
    assert_eq!(pool.in_use_count(&address).await, 0);
    assert_eq!(pool.idle_count(&address).await, 1);
}

#[tokio::test]
async fn a_released_connection_is_reused_rather_than_reopened() {
    let pool = Arc::new(Pool::new(Arc::new(opts())));
    let address = ServerAddress::new("localhost", 7687);

    let first = pool.acquire(&address).await.expect("acquire first");
    first.release();

    assert_eq!(pool.idle_count(&address).await, 1);
    let _second = pool.acquire(&address).await.expect("acquire second");
    assert_eq!(pool.idle_count(&address).await, 0, "the idle connection should have been handed out again");
}

#[tokio::test]
async fn acquisitions_are_capped_at_max_pool_size_per_address() {
    let mut raw_opts = opts();
    raw_opts.max_pool_size_per_address = 2;
    raw_opts.connection_acquisition_timeout = Duration::from_millis(200);
    let pool = Arc::new(Pool::new(Arc::new(raw_opts)));
    let address = ServerAddress::new("localhost", 7687);

    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..4 {
        let pool = Arc::clone(&pool);
        let address = address.clone();
        let active = Arc::clone(&active);
        let max_active = Arc::clone(&max_active);
        handles.push(tokio::spawn(async move {
            let conn = pool.acquire(&address).await.expect("acquire");
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            conn.release();
        }));
    }

    for handle in handles {
        handle.await.expect("task panicked");
    }

    assert!(
        max_active.load(Ordering::SeqCst) <= 2,
        "never more than max_pool_size_per_address connections should be in use at once"
    );
}

#[tokio::test]
async fn retain_all_drops_pools_for_addresses_no_longer_present() {
    let pool = Arc::new(Pool::new(Arc::new(opts())));
    let address = ServerAddress::new("localhost", 7687);

    let conn = pool.acquire(&address).await.expect("acquire");
    conn.release();
    assert_eq!(pool.idle_count(&address).await, 1);

    pool.retain_all(&[]).await;
    assert_eq!(pool.idle_count(&address).await, 0);
}

#[tokio::test]
async fn close_fails_future_acquisitions_and_frees_idle_connections() {
    let pool = Arc::new(Pool::new(Arc::new(opts())));
    let address = ServerAddress::new("localhost", 7687);

    let conn = pool.acquire(&address).await.expect("acquire");
    conn.release();

    pool.close().await;
    let err = pool.acquire(&address).await.unwrap_err();
    assert!(matches!(err, zero_bolt::Error::ServiceUnavailable(_)));
}

#[tokio::test]
async fn verify_connectivity_succeeds_against_a_reachable_server() {
    let driver = Driver::connect(TEST_URI, "neo4j", Some("password".to_string())).expect("parse connection uri");
    driver.verify_connectivity().await.expect("verify connectivity");
    driver.close().await;
}

#[tokio::test]
async fn sessions_from_the_same_driver_share_the_underlying_pool() {
    use zero_bolt::routing::table::AccessMode;
    use zero_bolt::value::Params;

    let driver = Driver::connect(TEST_URI, "neo4j", Some("password".to_string())).expect("parse connection uri");

    let mut first = driver.session(AccessMode::Read, None);
    first.run("RETURN 1", Params::new()).await.expect("run").consume().await.expect("consume");
    first.close().await.expect("close first");

    let mut second = driver.session(AccessMode::Read, None);
    second.run("RETURN 1", Params::new()).await.expect("run").consume().await.expect("consume");
    second.close().await.expect("close second");

    driver.close().await;
}
