//! Explicit-transaction integration tests against a live Bolt server.

use zero_bolt::routing::table::AccessMode;
use zero_bolt::value::Params;
use zero_bolt::Driver;

const TEST_URI: &str = "bolt://localhost:7687";

fn driver() -> Driver {
    Driver::connect(TEST_URI, "neo4j", Some("password".to_string())).expect("parse connection uri")
}

#[tokio::test]
async fn explicit_commit_updates_the_session_bookmark() {
    let driver = driver();
    let mut session = driver.session(AccessMode::Write, None);

    let mut tx = session.begin_transaction(None).await.expect("begin");
    tx.run("CREATE (n:IntegrationTestNode) RETURN n", Params::new())
        .await
        .expect("run")
        .consume()
        .await
        .expect("consume");
    tx.commit().await.expect("commit");

    assert!(session.last_bookmark().is_some());
    session.close().await.expect("close");
}

#[tokio::test]
async fn explicit_rollback_leaves_the_bookmark_untouched() {
    let driver = driver();
    let mut session = driver.session(AccessMode::Write, None);

    let mut tx = session.begin_transaction(None).await.expect("begin");
    tx.run("CREATE (n:IntegrationTestNode) RETURN n", Params::new())
        .await
        .expect("run")
        .consume()
        .await
        .expect("consume");
    tx.rollback().await.expect("rollback");

    assert!(session.last_bookmark().is_none());
    session.close().await.expect("close");
}

#[tokio::test]
async fn close_commits_after_success_and_rolls_back_after_failure() {
    let driver = driver();
    let mut session = driver.session(AccessMode::Write, None);

    let mut tx = session.begin_transaction(None).await.expect("begin");
    tx.run("CREATE (n:IntegrationTestNode) RETURN n", Params::new())
        .await
        .expect("run")
        .consume()
        .await
        .expect("consume");
    tx.success();
    tx.close().await.expect("close commits");

    assert!(session.last_bookmark().is_some());

    let mut tx = session.begin_transaction(None).await.expect("begin second");
    tx.run("CREATE (n:IntegrationTestNode) RETURN n", Params::new())
        .await
        .expect("run")
        .consume()
        .await
        .expect("consume");
    tx.failure();
    tx.close().await.expect("close rolls back");

    session.close().await.expect("session close");
}

#[tokio::test]
async fn running_after_a_failed_statement_is_rejected() {
    let driver = driver();
    let mut session = driver.session(AccessMode::Write, None);

    let mut tx = session.begin_transaction(None).await.expect("begin");
    let err = tx.run("THIS IS NOT CYPHER", Params::new()).await.expect("run accepted, fails lazily").consume().await.unwrap_err();
    assert!(matches!(err, zero_bolt::Error::ClientException(_) | zero_bolt::Error::DatabaseException { .. }));

    let second = tx.run("RETURN 1", Params::new()).await.unwrap_err();
    assert!(matches!(second, zero_bolt::Error::ClientException(_)));

    tx.rollback().await.ok();
    session.close().await.expect("session close");
}
