//! The lazy result stream and its single-visit failure policy.

use std::collections::{BTreeMap, VecDeque};

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::handler::{BackpressureSignal, PullEvent};
use crate::value::Value;

/// Result metadata, kept as opaque `Value`/string bags rather than typed
/// graph entities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSummary {
    pub statement_type: Option<String>,
    pub counters: BTreeMap<String, Value>,
    pub plan: Option<Value>,
    pub profile: Option<Value>,
    pub notifications: Vec<Value>,
    pub bookmark: Option<String>,
    pub server_address: Option<String>,
    pub result_available_after: Option<i64>,
    pub result_consumed_after: Option<i64>,
}

impl ResultSummary {
    fn from_metadata(metadata: &BTreeMap<String, Value>) -> Self {
        Self {
            statement_type: metadata.get("type").and_then(Value::as_str).map(str::to_string),
            counters: metadata
                .get("stats")
                .and_then(Value::as_map)
                .cloned()
                .unwrap_or_default(),
            plan: metadata.get("plan").cloned(),
            profile: metadata.get("profile").cloned(),
            notifications: metadata
                .get("notifications")
                .and_then(Value::as_list)
                .map(<[Value]>::to_vec)
                .unwrap_or_default(),
            bookmark: metadata.get("bookmark").and_then(Value::as_str).map(str::to_string),
            server_address: None,
            result_available_after: metadata.get("result_available_after").and_then(Value::as_i64),
            result_consumed_after: metadata.get("result_consumed_after").and_then(Value::as_i64),
        }
    }
}

/// One in-flight `run()`'s result stream. Exactly one consumer is ever
/// expected — the session enforces that by construction, never handing
/// out two live cursors at once.
pub struct Cursor {
    keys: Option<oneshot::Receiver<Result<BTreeMap<String, Value>>>>,
    records: mpsc::UnboundedReceiver<PullEvent>,
    backpressure: BackpressureSignal,
    buffer: VecDeque<Vec<Value>>,
    finished: bool,
    summary: Option<ResultSummary>,
    failure: Option<Error>,
    /// Sticky: true the moment a FAILURE is seen on the wire, and never
    /// cleared by `failure()`/`raise_failure_if_any()` taking the error
    /// out. A transaction needs this to notice termination even when the
    /// caller already drained the error themselves — server-notification
    /// termination is permanent, unlike the one-shot `failure()` used for
    /// ordinary propagation.
    saw_failure: bool,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("finished", &self.finished)
            .field("saw_failure", &self.saw_failure)
            .finish_non_exhaustive()
    }
}

impl Cursor {
    /// `pub(crate)` rather than `pub(super)`: both the session and the
    /// transaction modules build cursors directly off a fresh
    /// `run_and_flush`.
    pub(crate) fn new(
        keys: oneshot::Receiver<Result<BTreeMap<String, Value>>>,
        records: mpsc::UnboundedReceiver<PullEvent>,
        backpressure: BackpressureSignal,
    ) -> Self {
        Self {
            keys: Some(keys),
            records,
            backpressure,
            buffer: VecDeque::new(),
            finished: false,
            summary: None,
            failure: None,
            saw_failure: false,
        }
    }

    /// Completes once RUN succeeds or fails.
    pub async fn keys(&mut self) -> Result<Vec<String>> {
        if let Some(rx) = self.keys.take() {
            let metadata = rx
                .await
                .map_err(|_| Error::LibraryBug("RUN handler dropped without a reply".into()))??;
            let fields = metadata
                .get("fields")
                .and_then(Value::as_list)
                .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            return Ok(fields);
        }
        Ok(Vec::new())
    }

    /// Applies one event off the wire to buffered/terminal state. Shared by
    /// both the stop-at-first-record pump used by `next`/`peek` and the
    /// drain-to-terminal loop `summary`/`failure`/`had_failure` use.
    fn apply_event(&mut self, event: PullEvent) {
        match event {
            PullEvent::Record(fields) => self.buffer.push_back(fields),
            PullEvent::Success(metadata) => {
                self.finished = true;
                self.summary = Some(ResultSummary::from_metadata(&metadata));
            }
            PullEvent::Failure { code, message } => {
                self.finished = true;
                self.summary = Some(ResultSummary::default());
                self.failure = Some(Error::from_server_failure(code, message));
                self.saw_failure = true;
            }
        }
    }

    /// Pulls more events off the wire until at least one record is
    /// buffered or the stream has terminated. Used by `next`/`peek`, which
    /// only ever need the next record and must not over-buffer.
    async fn pump_until_record_or_terminal(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.finished {
            match self.records.recv().await {
                Some(event) => self.apply_event(event),
                None => {
                    self.finished = true;
                    if self.summary.is_none() {
                        self.summary = Some(ResultSummary::default());
                    }
                }
            }
        }
        Ok(())
    }

    /// Pulls events off the wire until the stream terminates, buffering
    /// every record seen along the way. Used by `summary`/`failure`/
    /// `had_failure`, which must reach the end of the stream regardless of
    /// how many records are already buffered — unlike
    /// `pump_until_record_or_terminal`, this cannot stop early just
    /// because the buffer is non-empty.
    async fn drain_to_terminal(&mut self) -> Result<()> {
        while !self.finished {
            match self.records.recv().await {
                Some(event) => self.apply_event(event),
                None => {
                    self.finished = true;
                    if self.summary.is_none() {
                        self.summary = Some(ResultSummary::default());
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns the next record, pulling more from the wire if needed.
    pub async fn next(&mut self) -> Result<Option<Vec<Value>>> {
        self.pump_until_record_or_terminal().await?;
        if let Some(record) = self.buffer.pop_front() {
            self.backpressure.note_consumed();
            return Ok(Some(record));
        }
        self.raise_failure_if_any()?;
        Ok(None)
    }

    /// Like `next` but does not dequeue.
    pub async fn peek(&mut self) -> Result<Option<Vec<Value>>> {
        self.pump_until_record_or_terminal().await?;
        if let Some(record) = self.buffer.front() {
            return Ok(Some(record.clone()));
        }
        self.raise_failure_if_any()?;
        Ok(None)
    }

    /// Expects exactly one record; errors with `NoSuchRecord` otherwise.
    pub async fn single(&mut self) -> Result<Vec<Value>> {
        let first = self
            .next()
            .await?
            .ok_or_else(|| Error::NoSuchRecord("cursor is empty".into()))?;
        if self.next().await?.is_some() {
            return Err(Error::NoSuchRecord(
                "cursor contains more than one record".into(),
            ));
        }
        Ok(first)
    }

    /// Drains to a `Vec`; `next`-recursion flattened into a loop to
    /// avoid stack growth on long streams.
    pub async fn list(&mut self) -> Result<Vec<Vec<Value>>> {
        let mut out = Vec::new();
        while let Some(record) = self.next().await? {
            out.push(record);
        }
        Ok(out)
    }

    pub async fn list_map<T>(&mut self, mut map_fn: impl FnMut(Vec<Value>) -> T) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(record) = self.next().await? {
            out.push(map_fn(record));
        }
        Ok(out)
    }

    /// Invokes `action` once per record, in order.
    pub async fn for_each(&mut self, mut action: impl FnMut(Vec<Value>) -> Result<()>) -> Result<()> {
        while let Some(record) = self.next().await? {
            action(record)?;
        }
        Ok(())
    }

    /// Drains and discards every remaining record, returning the summary.
    pub async fn consume(&mut self) -> Result<ResultSummary> {
        while self.next().await?.is_some() {}
        self.summary().await
    }

    /// Completes once the stream terminates, whether or not records are
    /// still buffered; any records seen along the way remain available
    /// to `next`/`list`/`peek` called afterward.
    pub async fn summary(&mut self) -> Result<ResultSummary> {
        self.drain_to_terminal().await?;
        let summary = self.summary.clone().unwrap_or_default();
        self.raise_failure_if_any()?;
        Ok(summary)
    }

    fn raise_failure_if_any(&mut self) -> Result<()> {
        if let Some(failure) = self.failure.take() {
            return Err(failure);
        }
        Ok(())
    }

    /// Returns the stream failure exactly once, then clears it. Used by
    /// the session between runs to guarantee errors are never silently
    /// dropped.
    pub async fn failure(&mut self) -> Option<Error> {
        if !self.finished {
            let _ = self.drain_to_terminal().await;
        }
        self.failure.take()
    }

    /// Whether the server ever reported a FAILURE on this stream, even
    /// if `failure()` already took the error out. Used by transactions
    /// to detect termination regardless of whether the caller already
    /// consumed the cursor directly.
    pub(crate) async fn had_failure(&mut self) -> bool {
        if !self.finished {
            let _ = self.drain_to_terminal().await;
        }
        self.saw_failure
    }

    pub fn is_drained(&self) -> bool {
        self.finished && self.buffer.is_empty()
    }
}
