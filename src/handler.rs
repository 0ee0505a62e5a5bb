//! Response handlers: the per-request callbacks the dispatcher invokes
//! as SUCCESS/FAILURE/RECORD/IGNORED frames arrive.
//!
//! Small structs implementing a narrow callback trait, so the dispatcher
//! never needs to know about RUN/PULL_ALL specifically.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot};

use crate::value::Value;

/// Invoked by the dispatcher as frames belonging to one request arrive.
/// Exactly one of `on_success`/`on_failure` is ever called, always last;
/// `on_record` may be called any number of times before it.
pub trait ResponseHandler: Send {
    fn on_record(&mut self, fields: Vec<Value>) {
        let _ = fields;
    }
    fn on_success(&mut self, metadata: BTreeMap<String, Value>);
    fn on_failure(&mut self, code: String, message: String);
    fn on_ignored(&mut self) {
        self.on_failure(
            "Neo.ClientError.Request.Invalid".to_string(),
            "request was ignored".to_string(),
        );
    }
}

/// Completes the `keys()`/RUN-metadata future once SUCCESS or FAILURE
/// for the RUN message arrives. Carries no RECORD handling of its own —
/// RUN never produces records, only PULL_ALL does.
pub struct RunResponseHandler {
    reply: Option<oneshot::Sender<crate::error::Result<BTreeMap<String, Value>>>>,
}

impl RunResponseHandler {
    pub fn new() -> (Self, oneshot::Receiver<crate::error::Result<BTreeMap<String, Value>>>) {
        let (tx, rx) = oneshot::channel();
        (Self { reply: Some(tx) }, rx)
    }
}

impl ResponseHandler for RunResponseHandler {
    fn on_success(&mut self, metadata: BTreeMap<String, Value>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Ok(metadata));
        }
    }

    fn on_failure(&mut self, code: String, message: String) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(crate::error::Error::from_server_failure(code, message)));
        }
    }
}

/// What arrives on a cursor's channel: either a record, or the terminal
/// outcome of the stream that feeds `summary()`/`failure()`.
#[derive(Debug)]
pub enum PullEvent {
    Record(Vec<Value>),
    Success(BTreeMap<String, Value>),
    Failure { code: String, message: String },
}

/// Shared buffered-record counter implementing the high/low water mark
/// backpressure policy. Held by both the boxed [`PullAllResponseHandler`]
/// (which bumps it on every RECORD) and whoever drives the channel's
/// read loop (which drains it on consumption and decides whether to
/// call `enable_auto_read`/`disable_auto_read`) — an `Arc` rather than a
/// shared `&mut` because the handler is moved into the channel's FIFO
/// the moment it's queued.
#[derive(Clone)]
pub struct BackpressureSignal {
    buffered: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    paused: std::sync::Arc<std::sync::atomic::AtomicBool>,
    resumed: std::sync::Arc<tokio::sync::Notify>,
    high_water_mark: usize,
    low_water_mark: usize,
}

impl BackpressureSignal {
    fn new(high_water_mark: usize, low_water_mark: usize) -> Self {
        Self {
            buffered: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            paused: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            resumed: std::sync::Arc::new(tokio::sync::Notify::new()),
            high_water_mark,
            low_water_mark,
        }
    }

    fn note_record(&self) {
        self.buffered.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    /// Called once the cursor has dequeued a record, so the low-water
    /// check reflects reality.
    pub fn note_consumed(&self) {
        self.buffered.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        self.resumed.notify_one();
    }

    /// Suspends the caller (the connection's read pump) until a
    /// consumer reports progress, used while paused so the pump doesn't
    /// busy-poll waiting for the low-water mark.
    pub async fn wait_for_progress(&self) {
        self.resumed.notified().await;
    }

    /// `Some(true)` to resume reads, `Some(false)` to pause, `None` if
    /// the watermark state hasn't crossed a threshold since last asked.
    pub fn transition(&self) -> Option<bool> {
        use std::sync::atomic::Ordering::SeqCst;
        let buffered = self.buffered.load(SeqCst);
        if !self.paused.load(SeqCst) && buffered > self.high_water_mark {
            self.paused.store(true, SeqCst);
            Some(false)
        } else if self.paused.load(SeqCst) && buffered < self.low_water_mark {
            self.paused.store(false, SeqCst);
            Some(true)
        } else {
            None
        }
    }
}

/// Streams RECORD frames to the owning cursor and reports the terminal
/// SUCCESS/FAILURE, applying the high/low water mark backpressure policy.
pub struct PullAllResponseHandler {
    sender: mpsc::UnboundedSender<PullEvent>,
    signal: BackpressureSignal,
}

impl PullAllResponseHandler {
    pub fn new(
        high_water_mark: usize,
        low_water_mark: usize,
    ) -> (Self, mpsc::UnboundedReceiver<PullEvent>, BackpressureSignal) {
        let (tx, rx) = mpsc::unbounded_channel();
        let signal = BackpressureSignal::new(high_water_mark, low_water_mark);
        (
            Self {
                sender: tx,
                signal: signal.clone(),
            },
            rx,
            signal,
        )
    }
}

impl ResponseHandler for PullAllResponseHandler {
    fn on_record(&mut self, fields: Vec<Value>) {
        self.signal.note_record();
        let _ = self.sender.send(PullEvent::Record(fields));
    }

    fn on_success(&mut self, metadata: BTreeMap<String, Value>) {
        let _ = self.sender.send(PullEvent::Success(metadata));
    }

    fn on_failure(&mut self, code: String, message: String) {
        let _ = self.sender.send(PullEvent::Failure { code, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_handler_completes_future_on_success() {
        let (mut handler, rx) = RunResponseHandler::new();
        let mut metadata = BTreeMap::new();
        metadata.insert("fields".to_string(), Value::List(vec![]));
        handler.on_success(metadata.clone());
        assert_eq!(rx.await.unwrap().unwrap(), metadata);
    }

    #[tokio::test]
    async fn run_handler_completes_future_on_failure() {
        let (mut handler, rx) = RunResponseHandler::new();
        handler.on_failure("Neo.ClientError.Statement.SyntaxError".into(), "bad".into());
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, crate::error::Error::ClientException(_)));
    }

    #[test]
    fn pull_handler_signals_pause_then_resume() {
        let (mut handler, _rx, signal) = PullAllResponseHandler::new(3, 1);
        for _ in 0..4 {
            handler.on_record(vec![]);
        }
        assert_eq!(signal.transition(), Some(false));
        assert_eq!(signal.transition(), None);

        for _ in 0..4 {
            signal.note_consumed();
        }
        assert_eq!(signal.transition(), Some(true));
    }
}
