//! Explicit transactions.
//!
//! The session/transaction cyclic reference is modeled as an interface
//! borrow from a single owner rather than two parties both claiming
//! ownership. Rust has a direct way to say that: `Transaction<'a>`
//! borrows `&'a mut Session` for its entire lifetime,
//! so the borrow checker — not a runtime flag — is what stops a caller
//! from touching the session while a transaction is open. The one
//! behavior this can't express literally is "`session.reset()`
//! terminates an open transaction from outside"; nothing can call
//! `reset()` while the `&mut Session` is checked out to a live
//! `Transaction`. In practice a transaction only ever terminates because
//! the server says so, observed the next time it's used, which this
//! design still handles.

use std::collections::BTreeMap;

use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::routing::table::{AccessMode, ServerAddress};
use crate::session::{ConnectionSlot, Cursor, Session};
use crate::value::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    MarkedSuccess,
    MarkedFailed,
    Terminated,
    Closed,
}

/// A single explicit transaction, open for the lifetime of the borrow
/// it holds on its owning [`Session`].
pub struct Transaction<'a> {
    session: &'a mut Session,
    connection: ConnectionSlot,
    address: ServerAddress,
    cursor: Option<Cursor>,
    state: TxState,
}

impl<'a> Transaction<'a> {
    pub(crate) async fn begin(session: &'a mut Session, mode: AccessMode) -> Result<Transaction<'a>> {
        let metadata = session.build_metadata(mode);
        let mut connection = session.ensure_connection(mode).await?;
        let address = connection.server_address().clone();

        if let Err(err) = connection.begin(metadata).await {
            session.handle_connection_failure(&address, &err).await;
            return Err(err);
        }

        Ok(Transaction {
            session,
            connection: ConnectionSlot::Idle(connection),
            address,
            cursor: None,
            state: TxState::Active,
        })
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Rejects once the transaction has observed a terminating failure,
    /// otherwise behaves like `Session::run` but against the
    /// transaction's own connection.
    #[instrument(skip(self, params), fields(statement = statement))]
    pub async fn run(&mut self, statement: &str, params: Params) -> Result<&mut Cursor> {
        if self.state == TxState::Terminated {
            return Err(Error::ClientException(
                "cannot run more statements in this transaction, it has been terminated".into(),
            ));
        }

        if let Some(mut cursor) = self.cursor.take() {
            let had_failure = cursor.had_failure().await;
            let err = cursor.failure().await;
            if had_failure {
                self.state = TxState::Terminated;
            }
            if let Some(err) = err {
                return Err(err);
            }
            if had_failure {
                return Err(Error::ClientException(
                    "cannot run more statements in this transaction, it has been terminated".into(),
                ));
            }
        }

        let mut connection = self
            .connection
            .reclaim()
            .await
            .ok_or_else(|| Error::LibraryBug("transaction lost its connection".into()))?;

        let outcome = match connection
            .run_and_flush(statement, params, BTreeMap::new(), self.session.high_water_mark, self.session.low_water_mark)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.state = TxState::Terminated;
                self.session.handle_connection_failure(&self.address, &err).await;
                return Err(err);
            }
        };

        let cursor = Cursor::new(outcome.keys, outcome.records, outcome.backpressure.clone());
        self.connection.begin_drain(connection, outcome.backpressure);
        Ok(self.cursor.insert(cursor))
    }

    /// Marks the transaction to commit on close.
    pub fn success(&mut self) {
        if self.state == TxState::Active {
            self.state = TxState::MarkedSuccess;
        }
    }

    /// Marks the transaction to roll back on close.
    pub fn failure(&mut self) {
        if self.state == TxState::Active || self.state == TxState::MarkedSuccess {
            self.state = TxState::MarkedFailed;
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, TxState::Active | TxState::MarkedSuccess | TxState::MarkedFailed)
    }

    /// Reclaims the connection (waiting for any in-flight cursor drain
    /// to finish) and sends COMMIT or ROLLBACK. When `drain_cursors` is
    /// set, every still-open cursor's failure is awaited first and, if
    /// any surfaced, recorded as suppressed on top of whatever the
    /// commit/rollback itself returns.
    async fn finish(&mut self, commit: bool, drain_cursors: bool) -> Result<()> {
        if self.state == TxState::Closed {
            return Ok(());
        }

        let mut drain_err = None;
        if drain_cursors {
            if let Some(mut cursor) = self.cursor.take() {
                if let Some(err) = cursor.failure().await {
                    drain_err.get_or_insert(err);
                }
            }
        }

        let connection = self.connection.reclaim().await;
        self.state = TxState::Closed;

        let Some(mut connection) = connection else {
            return match drain_err {
                Some(err) => Err(err),
                None => Ok(()),
            };
        };

        let outcome = if commit {
            match connection.commit().await {
                Ok(metadata) => {
                    let bookmark = metadata.get("bookmark").and_then(|v| v.as_str()).map(str::to_string);
                    self.session.record_bookmark(bookmark);
                    Ok(())
                }
                Err(err) => {
                    self.session.handle_connection_failure(&self.address, &err).await;
                    Err(err)
                }
            }
        } else {
            match connection.rollback().await {
                Ok(()) => Ok(()),
                Err(err) => {
                    warn!(error = %err, "rollback failed, connection will be discarded on release");
                    Err(err)
                }
            }
        };

        drop(connection);
        match drain_err {
            Some(err) => Err(err),
            None => outcome,
        }
    }

    pub async fn commit(mut self) -> Result<()> {
        let result = self.finish(true, false).await;
        self.state = TxState::Closed;
        result
    }

    pub async fn rollback(mut self) -> Result<()> {
        let result = self.finish(false, false).await;
        self.state = TxState::Closed;
        result
    }

    /// If still open, drains child cursors, then commits when marked
    /// success and not failed, else rolls back.
    pub async fn close(mut self) -> Result<()> {
        if !self.is_open() {
            self.state = TxState::Closed;
            return Ok(());
        }
        let commit = self.state == TxState::MarkedSuccess;
        let result = self.finish(commit, true).await;
        self.state = TxState::Closed;
        result
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state != TxState::Closed {
            warn!("transaction dropped without an explicit commit/rollback/close, rolling back implicitly is not possible from Drop");
        }
    }
}
