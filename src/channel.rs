//! The wire channel: one transport, one inbound FIFO, one dispatcher.

use std::collections::VecDeque;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::handler::ResponseHandler;
use crate::protocol::framing::{write_framed, Reassembler};
use crate::protocol::message::{Message, ResponseMessage};
use crate::protocol::{Codec, PackStreamLiteCodec};

/// Whether the channel is accepting new requests normally or discarding
/// them behind a FAILURE until RESET clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Ready,
    Quarantined,
    Closed,
}

/// Wraps a single TCP transport plus the FIFO of handlers awaiting a
/// reply. Every read/write/dispatch for this channel happens on the
/// worker that owns it — `WireChannel` itself holds no internal lock,
/// matching the "no locks inside the channel" rule.
pub struct WireChannel {
    stream: TcpStream,
    codec: PackStreamLiteCodec,
    handlers: VecDeque<Box<dyn ResponseHandler>>,
    state: ChannelState,
    reassembler: Reassembler,
}

impl WireChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            codec: PackStreamLiteCodec,
            handlers: VecDeque::new(),
            state: ChannelState::Ready,
            reassembler: Reassembler::new(),
        }
    }

    /// Appends one handler per message to the inbound FIFO and flushes
    /// the outbound buffer as a single `send_and_flush` operation.
    #[instrument(skip_all, fields(messages = messages.len()))]
    pub async fn send_and_flush(
        &mut self,
        messages: Vec<Message>,
        handlers: Vec<Box<dyn ResponseHandler>>,
    ) -> Result<()> {
        if self.state == ChannelState::Closed {
            return Err(Error::service_unavailable("channel is closed"));
        }
        debug_assert_eq!(messages.len(), handlers.len());

        let mut out = Vec::new();
        for message in &messages {
            let mut payload = Vec::new();
            self.codec.encode_message(message, &mut payload)?;
            write_framed(&payload, &mut out);
        }

        if let Err(io_err) = self.stream.write_all(&out).await {
            self.fail_all_queued(Error::IoError(io_err));
            return Err(Error::service_unavailable("write failed, channel closed"));
        }
        if let Err(io_err) = self.stream.flush().await {
            self.fail_all_queued(Error::IoError(io_err));
            return Err(Error::service_unavailable("flush failed, channel closed"));
        }

        self.handlers.extend(handlers);
        Ok(())
    }

    /// Reads and dispatches exactly one inbound frame. Callers drive
    /// this in a loop while handlers remain queued.
    #[instrument(skip_all)]
    pub async fn poll_one(&mut self) -> Result<()> {
        let mut buf = vec![0u8; 4096];
        loop {
            if let Some(payload) = self.reassembler.pop_message() {
                return self.dispatch(payload);
            }
            let n = match self.stream.read(&mut buf).await {
                Ok(0) => {
                    let err = Error::service_unavailable("connection closed by peer");
                    self.fail_all_queued_cloned(&err);
                    self.state = ChannelState::Closed;
                    return Err(err);
                }
                Ok(n) => n,
                Err(io_err) => {
                    self.fail_all_queued(Error::IoError(io_err));
                    self.state = ChannelState::Closed;
                    return Err(Error::service_unavailable("read failed, channel closed"));
                }
            };
            self.reassembler.feed(&buf[..n]);
        }
    }

    fn dispatch(&mut self, payload: Vec<u8>) -> Result<()> {
        let response = self.codec.decode_message(&payload)?;
        self.route_response(response)
    }

    fn route_response(&mut self, response: ResponseMessage) -> Result<()> {
        match response {
            ResponseMessage::Record { fields } => {
                if self.state == ChannelState::Quarantined {
                    // A stray record for the failed request, arriving
                    // before its RESET ack. The front of the queue (if
                    // any) now belongs to a different, later-pipelined
                    // request, so this is dropped rather than routed.
                    return Ok(());
                }
                if let Some(handler) = self.handlers.front_mut() {
                    handler.on_record(fields);
                }
            }
            ResponseMessage::Success { metadata } => {
                if let Some(mut handler) = self.handlers.pop_front() {
                    handler.on_success(metadata);
                }
                if self.state == ChannelState::Quarantined && self.handlers.is_empty() {
                    self.state = ChannelState::Ready;
                }
            }
            ResponseMessage::Failure { code, message } => {
                if let Some(mut handler) = self.handlers.pop_front() {
                    handler.on_failure(code, message);
                }
                self.state = ChannelState::Quarantined;
            }
            ResponseMessage::Ignored => {
                if let Some(mut handler) = self.handlers.pop_front() {
                    handler.on_ignored();
                }
            }
        }
        Ok(())
    }

    fn fail_all_queued(&mut self, cause: Error) {
        self.fail_all_queued_cloned(&cause);
    }

    fn fail_all_queued_cloned(&mut self, cause: &Error) {
        self.state = ChannelState::Closed;
        while let Some(mut handler) = self.handlers.pop_front() {
            handler.on_failure("ServiceUnavailable".to_string(), cause.to_string());
        }
    }

    pub fn is_quarantined(&self) -> bool {
        self.state == ChannelState::Quarantined
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    pub fn pending_handlers(&self) -> usize {
        self.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use tokio::net::TcpListener;

    use super::*;
    use crate::value::Value;

    async fn loopback_stream() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
        let addr = listener.local_addr().expect("local addr");
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        let (stream, _) = accepted.expect("accept loopback connection");
        drop(stream);
        connected.expect("connect to loopback listener")
    }

    #[derive(Default)]
    struct Log {
        records: Vec<Vec<Value>>,
        successes: usize,
        failures: usize,
    }

    #[derive(Clone, Default)]
    struct RecordingHandler(Arc<Mutex<Log>>);

    impl ResponseHandler for RecordingHandler {
        fn on_record(&mut self, fields: Vec<Value>) {
            self.0.lock().expect("log mutex poisoned").records.push(fields);
        }

        fn on_success(&mut self, _metadata: BTreeMap<String, Value>) {
            self.0.lock().expect("log mutex poisoned").successes += 1;
        }

        fn on_failure(&mut self, _code: String, _message: String) {
            self.0.lock().expect("log mutex poisoned").failures += 1;
        }
    }

    async fn channel() -> WireChannel {
        WireChannel::new(loopback_stream().await)
    }

    #[tokio::test]
    async fn a_record_after_failure_is_dropped_not_routed_to_the_next_handler() {
        let mut channel = channel().await;
        let failed = RecordingHandler::default();
        let next = RecordingHandler::default();
        channel.handlers.push_back(Box::new(failed.clone()));
        channel.handlers.push_back(Box::new(next.clone()));

        channel
            .route_response(ResponseMessage::Failure {
                code: "Neo.ClientError.Statement.SyntaxError".into(),
                message: "bad".into(),
            })
            .unwrap();
        assert!(channel.is_quarantined());
        assert_eq!(failed.0.lock().unwrap().failures, 1);

        // A stray record belonging to the already-failed request, still
        // in flight before its RESET ack.
        channel
            .route_response(ResponseMessage::Record {
                fields: vec![Value::Integer(1)],
            })
            .unwrap();

        channel
            .route_response(ResponseMessage::Success {
                metadata: BTreeMap::new(),
            })
            .unwrap();

        assert_eq!(next.0.lock().unwrap().successes, 1);
        assert!(
            next.0.lock().unwrap().records.is_empty(),
            "the stray record must not have been routed to the next queued handler"
        );
        assert!(!channel.is_quarantined());
    }
}
