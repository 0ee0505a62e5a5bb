//! The session state machine: owns the latest cursor, the latest
//! connection, and the current bookmark, and serialises operations on
//! itself.
//!
//! Nothing in this module drives a connection's read loop inline.
//! Instead `run`/`begin_transaction` hand the just-flushed connection to
//! a background task ([`ConnectionSlot::begin_drain`]) that pumps
//! `Connection::drain_until_idle` to completion and posts the connection
//! back once free — the concrete shape of "the session's connection is a
//! `future<Connection> | none`." A cursor's `next()`
//! only ever waits on its own channel; something has to be feeding that
//! channel concurrently while the caller holds the cursor and does other
//! work, and a session-owned background task is that something.

pub mod cursor;

pub use cursor::{Cursor, ResultSummary};

use std::collections::BTreeMap;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{instrument, warn};

use crate::bookmark::Bookmark;
use crate::error::{Error, Result};
use crate::pool::PooledConnection;
use crate::retry::{self, RetryAction, RetryHistory, RetryPolicy};
use crate::routing::provider::Provider;
use crate::routing::table::{AccessMode, ServerAddress};
use crate::transaction::Transaction;
use crate::value::{Params, Value};
use std::sync::Arc;

/// Holds the session's one connection, which is either sitting idle,
/// being drained by a background task on behalf of the last cursor, or
/// absent entirely.
pub(crate) enum ConnectionSlot {
    Idle(PooledConnection),
    Draining(oneshot::Receiver<PooledConnection>),
    Empty,
}

impl ConnectionSlot {
    /// Waits for any in-flight drain to finish and returns the
    /// connection, leaving the slot empty either way.
    pub(crate) async fn reclaim(&mut self) -> Option<PooledConnection> {
        match std::mem::replace(self, ConnectionSlot::Empty) {
            ConnectionSlot::Idle(conn) => Some(conn),
            ConnectionSlot::Draining(rx) => rx.await.ok(),
            ConnectionSlot::Empty => None,
        }
    }

    /// Hands the connection to a background task that pumps it to
    /// completion for the cursor/backpressure pair just created, and
    /// parks the eventual result so the next operation can reclaim it.
    pub(crate) fn begin_drain(&mut self, mut connection: PooledConnection, backpressure: crate::handler::BackpressureSignal) {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = connection.drain_until_idle(&backpressure).await;
            let _ = tx.send(connection);
        });
        *self = ConnectionSlot::Draining(rx);
    }
}

/// The session state machine. Not `Clone`/`Sync`: a session is used from
/// one call site at a time and serializes operations on itself.
pub struct Session {
    provider: Arc<Provider>,
    mode: AccessMode,
    database: Option<String>,
    bookmark: Bookmark,
    open: bool,
    pub(crate) connection: ConnectionSlot,
    cursor: Option<Cursor>,
    retry_policy: RetryPolicy,
    pub(crate) high_water_mark: usize,
    pub(crate) low_water_mark: usize,
}

impl Session {
    pub(crate) fn new(
        provider: Arc<Provider>,
        mode: AccessMode,
        database: Option<String>,
        bookmark: Bookmark,
        retry_policy: RetryPolicy,
        high_water_mark: usize,
        low_water_mark: usize,
    ) -> Self {
        Self {
            provider,
            mode,
            database,
            bookmark,
            open: true,
            connection: ConnectionSlot::Empty,
            cursor: None,
            retry_policy,
            high_water_mark,
            low_water_mark,
        }
    }

    /// The most recent bookmark this session has observed.
    pub fn last_bookmark(&self) -> Option<&str> {
        self.bookmark.max_as_string()
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.open {
            return Err(Error::client("session closed"));
        }
        Ok(())
    }

    /// Awaits the previous cursor's `failure()`; if it yields a
    /// non-null error, propagates it.
    async fn wait_for_previous_result_and_consume_failure(&mut self) -> Result<()> {
        if let Some(mut cursor) = self.cursor.take() {
            if let Some(err) = cursor.failure().await {
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn build_metadata(&self, mode: AccessMode) -> BTreeMap<String, Value> {
        let mut metadata = BTreeMap::new();
        if !self.bookmark.is_empty() {
            let bookmarks: Vec<Value> = self.bookmark.values().map(Value::from).collect();
            metadata.insert("bookmarks".to_string(), Value::List(bookmarks));
        }
        if let Some(database) = &self.database {
            metadata.insert("db".to_string(), Value::from(database.as_str()));
        }
        metadata.insert("mode".to_string(), Value::from(if mode == AccessMode::Write { "w" } else { "r" }));
        metadata
    }

    /// Reuses the currently-held connection if still open; otherwise
    /// acquires a fresh one from the provider. A quarantined-but-open
    /// connection is reset before reuse so the next RUN isn't IGNORED.
    pub(crate) async fn ensure_connection(&mut self, mode: AccessMode) -> Result<PooledConnection> {
        if let Some(mut conn) = self.connection.reclaim().await {
            if conn.is_open() {
                if !conn.is_quarantined() {
                    return Ok(conn);
                }
                if conn.reset().await.is_ok() {
                    return Ok(conn);
                }
            }
        }
        self.provider.acquire(mode, &self.database).await
    }

    /// Transport failures forget the address; a stepped-down writer is
    /// dropped from the routing table's writer set.
    pub(crate) async fn handle_connection_failure(&self, address: &ServerAddress, error: &Error) {
        match error {
            Error::ServiceUnavailable(_) => self.provider.forget(address).await,
            Error::SessionExpired(_) => self.provider.remove_writer(address).await,
            _ => {}
        }
    }

    pub(crate) fn record_bookmark(&mut self, bookmark: Option<String>) {
        if let Some(value) = bookmark {
            self.bookmark = Bookmark::from_single(value);
        }
    }

    /// Runs a query, returning a cursor over the result stream.
    #[instrument(skip(self, params), fields(statement = statement))]
    pub async fn run(&mut self, statement: &str, params: Params) -> Result<&mut Cursor> {
        self.ensure_open()?;
        self.wait_for_previous_result_and_consume_failure().await?;

        let mode = self.mode;
        let mut connection = self.ensure_connection(mode).await?;
        let address = connection.server_address().clone();
        let metadata = self.build_metadata(mode);

        let outcome = match connection
            .run_and_flush(statement, params, metadata, self.high_water_mark, self.low_water_mark)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.handle_connection_failure(&address, &err).await;
                return Err(err);
            }
        };

        let cursor = Cursor::new(outcome.keys, outcome.records, outcome.backpressure.clone());
        self.connection.begin_drain(connection, outcome.backpressure);
        Ok(self.cursor.insert(cursor))
    }

    /// Begins an explicit transaction.
    pub async fn begin_transaction(&mut self, mode: Option<AccessMode>) -> Result<Transaction<'_>> {
        self.ensure_open()?;
        self.wait_for_previous_result_and_consume_failure().await?;
        let mode = mode.unwrap_or(self.mode);
        Transaction::begin(self, mode).await
    }

    /// The transaction-function retry loop, specialised to a `READ`
    /// access mode.
    pub async fn execute_read<T, F, Fut>(&mut self, work: F) -> Result<T>
    where
        F: FnMut(&mut Transaction<'_>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.execute(AccessMode::Read, work).await
    }

    /// The transaction-function retry loop, specialised to a `WRITE`
    /// access mode.
    pub async fn execute_write<T, F, Fut>(&mut self, work: F) -> Result<T>
    where
        F: FnMut(&mut Transaction<'_>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.execute(AccessMode::Write, work).await
    }

    /// `Session.execute(mode, work) → retry_coordinator → begin_tx →
    /// work(tx) → commit/rollback`.
    ///
    /// Written as its own loop rather than reusing [`crate::retry::retry_async`]:
    /// that helper's closure takes no arguments, but each attempt here
    /// needs a fresh `&mut Transaction` borrowed from `self`, which only
    /// an inline loop over `&mut self` can hand out attempt after
    /// attempt.
    async fn execute<T, F, Fut>(&mut self, mode: AccessMode, mut work: F) -> Result<T>
    where
        F: FnMut(&mut Transaction<'_>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let policy = self.retry_policy;
        let start = Instant::now();
        let mut delay = policy.initial_delay;
        let mut history = RetryHistory::default();

        loop {
            let mut tx = self.begin_transaction(Some(mode)).await?;
            let address = tx.address().clone();
            match work(&mut tx).await {
                Ok(value) => {
                    tx.success();
                    tx.close().await?;
                    return Ok(value);
                }
                Err(error) => {
                    tx.failure();
                    let _ = tx.close().await;

                    let action = retry::classify(&error);
                    if action == RetryAction::Fatal {
                        return Err(error);
                    }
                    if action == RetryAction::RetryAndForget {
                        self.provider.forget(&address).await;
                    }
                    if start.elapsed() >= policy.max_retry_time {
                        return Err(retry::attach_suppressed(error, history));
                    }
                    warn!(error = %error, delay_ms = delay.as_millis(), "retrying transaction function after transient failure");
                    history.record(error);

                    tokio::time::sleep(retry::jitter(delay, policy.jitter_factor)).await;
                    delay = delay.mul_f64(policy.multiplier).min(policy.max_delay);
                }
            }
        }
    }

    /// Closes the session, discarding any held connection.
    pub async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let cursor_err = match self.cursor.take() {
            Some(mut cursor) => cursor.failure().await,
            None => None,
        };
        let _ = self.connection.reclaim().await;
        match cursor_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resets the session's held connection and discards its cursor.
    pub async fn reset(&mut self) -> Result<()> {
        if let Some(mut cursor) = self.cursor.take() {
            let _ = cursor.failure().await;
        }
        if let Some(mut connection) = self.connection.reclaim().await {
            if connection.is_open() {
                let _ = connection.reset().await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let pool = Arc::new(crate::pool::Pool::new(Arc::new(crate::config::Opts::default())));
        let provider = Arc::new(Provider::Direct(crate::routing::provider::DirectConnectionProvider::new(
            pool,
            ServerAddress::new("localhost", 7687),
        )));
        Session::new(
            provider,
            AccessMode::Read,
            None,
            Bookmark::empty(),
            RetryPolicy::default(),
            10_000,
            100,
        )
    }

    #[test]
    fn build_metadata_omits_bookmarks_and_db_when_absent() {
        let session = session();
        let metadata = session.build_metadata(AccessMode::Read);
        assert!(!metadata.contains_key("bookmarks"));
        assert!(!metadata.contains_key("db"));
        assert_eq!(metadata.get("mode"), Some(&Value::from("r")));
    }

    #[test]
    fn build_metadata_includes_bookmark_and_database_when_present() {
        let mut session = session();
        session.database = Some("neo4j".to_string());
        session.bookmark = Bookmark::from_single("tx:42");
        let metadata = session.build_metadata(AccessMode::Write);
        assert_eq!(metadata.get("db"), Some(&Value::from("neo4j")));
        assert_eq!(metadata.get("mode"), Some(&Value::from("w")));
        assert!(matches!(metadata.get("bookmarks"), Some(Value::List(values)) if values.len() == 1));
    }

    #[tokio::test]
    async fn closing_twice_is_a_no_op() {
        let mut session = session();
        session.close().await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn run_on_a_closed_session_fails_fast() {
        let mut session = session();
        session.close().await.unwrap();
        let err = session.run("RETURN 1", Params::new()).await.unwrap_err();
        assert!(matches!(err, Error::ClientException(_)));
    }

    #[test]
    fn last_bookmark_is_none_for_a_fresh_session() {
        let session = session();
        assert_eq!(session.last_bookmark(), None);
    }
}
