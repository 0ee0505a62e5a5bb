//! A thread-blocking facade over the async [`Session`]: every method
//! parks the calling thread on `Handle::block_on` rather than asking the
//! caller to drive a `Future`.
//!
//! There's exactly one thing this can't allow: calling `block_on` from a
//! thread that is itself one of the runtime's I/O workers, which would
//! starve the reactor the blocked future is waiting on and deadlock.
//! [`mark_io_worker`] flags such threads; [`block_on`] refuses to
//! proceed on a flagged thread instead of hanging forever.

use std::cell::Cell;

use crate::error::{Error, Result};
use crate::session::{ResultSummary, Session};
use crate::value::{Params, Value};

thread_local! {
    static ON_IO_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` with the calling thread flagged as a runtime I/O worker for
/// the duration of the call. Intended to wrap a tokio runtime's worker
/// thread body; nothing in this crate calls it on the caller's behalf,
/// since that wiring belongs to whoever builds the `tokio::runtime::Runtime`.
pub fn mark_io_worker<T>(f: impl FnOnce() -> T) -> T {
    ON_IO_WORKER.with(|flag| flag.set(true));
    let result = f();
    ON_IO_WORKER.with(|flag| flag.set(false));
    result
}

fn is_io_worker() -> bool {
    ON_IO_WORKER.with(Cell::get)
}

/// Blocks the calling thread on `future`, refusing if the thread is
/// flagged as a runtime I/O worker.
pub(crate) fn block_on<F: std::future::Future>(handle: &tokio::runtime::Handle, future: F) -> Result<F::Output> {
    if is_io_worker() {
        return Err(Error::client(
            "cannot block on an async operation from a tokio I/O worker thread",
        ));
    }
    Ok(handle.block_on(future))
}

/// An eagerly-materialized `run()` result: a blocking facade can't
/// return a `&mut Cursor` borrowing the session across a `block_on` call
/// the way the async API does, so the records and summary are collected
/// up front instead.
pub struct BlockingResult {
    pub records: Vec<Vec<Value>>,
    pub summary: ResultSummary,
}

/// The blocking counterpart to [`Session`]. Every method drives the
/// underlying async session to completion on `handle` before returning.
pub struct BlockingSession {
    handle: tokio::runtime::Handle,
    inner: Session,
}

impl BlockingSession {
    pub fn new(handle: tokio::runtime::Handle, inner: Session) -> Self {
        Self { handle, inner }
    }

    /// Runs a statement and drains it fully, returning every record
    /// together with the stream's summary.
    pub fn run(&mut self, statement: &str, params: Params) -> Result<BlockingResult> {
        let inner = &mut self.inner;
        block_on(&self.handle, async move {
            let cursor = inner.run(statement, params).await?;
            let records = cursor.list().await?;
            let summary = cursor.summary().await?;
            Ok(BlockingResult { records, summary })
        })?
    }

    pub fn last_bookmark(&self) -> Option<&str> {
        self.inner.last_bookmark()
    }

    pub fn close(&mut self) -> Result<()> {
        let inner = &mut self.inner;
        block_on(&self.handle, inner.close())?
    }
}
