//! A single, handshaken Bolt connection.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

use crate::config::Opts;
use crate::error::{Error, Result};
use crate::handler::{BackpressureSignal, PullAllResponseHandler, PullEvent, ResponseHandler, RunResponseHandler};
use crate::protocol::handshake::{self, ProtocolVersion};
use crate::protocol::message::Message;
use crate::routing::table::ServerAddress;
use crate::value::{Params, Value};

/// The keys a `run_and_flush` returns as soon as RUN succeeds, plus the
/// receiver the caller drains for records and the terminal outcome.
pub struct RunOutcome {
    pub keys: tokio::sync::oneshot::Receiver<Result<BTreeMap<String, Value>>>,
    pub records: tokio::sync::mpsc::UnboundedReceiver<PullEvent>,
    pub backpressure: BackpressureSignal,
}

/// Everything the pool and session layers need from a live connection.
pub struct Connection {
    address: ServerAddress,
    channel: crate::channel::WireChannel,
    server_version: ProtocolVersion,
    auto_read: bool,
    pub(crate) last_used_at: Instant,
}

impl Connection {
    #[instrument(skip(opts), fields(address = %address))]
    pub async fn connect(address: ServerAddress, opts: &Opts) -> Result<Self> {
        let tcp = timeout(opts.connect_timeout, TcpStream::connect((address.host.as_str(), address.port)))
            .await
            .map_err(|_| Error::service_unavailable("connect timed out"))?
            .map_err(|e| Error::ServiceUnavailable(format!("connect failed: {e}")))?;
        tcp.set_nodelay(true).ok();

        let mut tcp = tcp;
        let request = handshake::handshake_request();
        tcp.write_all(&request)
            .await
            .map_err(|e| Error::ServiceUnavailable(format!("handshake write failed: {e}")))?;

        let mut reply = [0u8; 4];
        read_exact_timeout(&mut tcp, &mut reply, opts.connect_timeout).await?;
        let server_version = handshake::negotiate(reply)?;

        let mut connection = Self {
            address,
            channel: crate::channel::WireChannel::new(tcp),
            server_version,
            auto_read: true,
            last_used_at: Instant::now(),
        };
        connection.hello(opts).await?;
        Ok(connection)
    }

    async fn hello(&mut self, opts: &Opts) -> Result<()> {
        let mut auth = BTreeMap::new();
        auth.insert("scheme".to_string(), Value::from("basic"));
        auth.insert("principal".to_string(), Value::from(opts.user.as_str()));
        auth.insert(
            "credentials".to_string(),
            Value::from(opts.password.as_deref().unwrap_or("")),
        );

        let (handler, rx) = RunResponseHandler::new();
        self.channel
            .send_and_flush(
                vec![Message::Hello {
                    user_agent: opts.user_agent.clone(),
                    auth,
                }],
                vec![Box::new(handler)],
            )
            .await?;
        self.channel.poll_one().await?;
        rx.await
            .map_err(|_| Error::LibraryBug("HELLO handler dropped without a reply".into()))?
            .map(|_metadata| ())
    }

    /// Sends RUN+PULL_ALL as one batch.
    #[instrument(skip_all)]
    pub async fn run_and_flush(
        &mut self,
        statement: &str,
        params: Params,
        metadata: BTreeMap<String, Value>,
        high_water_mark: usize,
        low_water_mark: usize,
    ) -> Result<RunOutcome> {
        let (run_handler, keys) = RunResponseHandler::new();
        let (pull_handler, records, backpressure) =
            PullAllResponseHandler::new(high_water_mark, low_water_mark);

        self.channel
            .send_and_flush(
                vec![
                    Message::Run {
                        statement: statement.to_string(),
                        params,
                        metadata,
                    },
                    Message::PullAll,
                ],
                vec![
                    Box::new(run_handler) as Box<dyn ResponseHandler>,
                    Box::new(pull_handler) as Box<dyn ResponseHandler>,
                ],
            )
            .await?;
        Ok(RunOutcome {
            keys,
            records,
            backpressure,
        })
    }

    /// Drives the channel's inbound side until both handlers queued by
    /// the last `run_and_flush` have been retired, pausing reads
    /// whenever the caller's backpressure signal says the consumer has
    /// fallen behind.
    pub async fn drain_until_idle(&mut self, backpressure: &BackpressureSignal) -> Result<()> {
        loop {
            if self.channel.pending_handlers() == 0 {
                return Ok(());
            }
            match backpressure.transition() {
                Some(false) => self.disable_auto_read(),
                Some(true) => self.enable_auto_read(),
                None => {}
            }
            if !self.auto_read {
                backpressure.wait_for_progress().await;
                continue;
            }
            self.channel.poll_one().await?;
        }
    }

    /// Sends BEGIN with the caller-supplied metadata (bookmarks, mode,
    /// database) and awaits the single SUCCESS/FAILURE reply.
    #[instrument(skip_all)]
    pub async fn begin(&mut self, metadata: BTreeMap<String, Value>) -> Result<()> {
        let (handler, rx) = RunResponseHandler::new();
        self.channel
            .send_and_flush(vec![Message::Begin { metadata }], vec![Box::new(handler)])
            .await?;
        self.channel.poll_one().await?;
        rx.await
            .map_err(|_| Error::LibraryBug("BEGIN handler dropped without a reply".into()))?
            .map(|_metadata| ())
    }

    /// Sends COMMIT and returns its SUCCESS metadata (carries the
    /// updated bookmark).
    #[instrument(skip_all)]
    pub async fn commit(&mut self) -> Result<BTreeMap<String, Value>> {
        let (handler, rx) = RunResponseHandler::new();
        self.channel
            .send_and_flush(vec![Message::Commit], vec![Box::new(handler)])
            .await?;
        self.channel.poll_one().await?;
        rx.await.map_err(|_| Error::LibraryBug("COMMIT handler dropped without a reply".into()))?
    }

    /// Sends ROLLBACK and awaits its reply.
    #[instrument(skip_all)]
    pub async fn rollback(&mut self) -> Result<()> {
        let (handler, rx) = RunResponseHandler::new();
        self.channel
            .send_and_flush(vec![Message::Rollback], vec![Box::new(handler)])
            .await?;
        self.channel.poll_one().await?;
        rx.await
            .map_err(|_| Error::LibraryBug("ROLLBACK handler dropped without a reply".into()))?
            .map(|_metadata| ())
    }

    /// Sends RESET, unquarantining the channel.
    #[instrument(skip_all)]
    pub async fn reset(&mut self) -> Result<()> {
        let (handler, rx) = RunResponseHandler::new();
        self.channel
            .send_and_flush(vec![Message::Reset], vec![Box::new(handler)])
            .await?;
        while self.channel.pending_handlers() > 0 {
            self.channel.poll_one().await?;
        }
        rx.await
            .map_err(|_| Error::LibraryBug("RESET handler dropped without a reply".into()))?
            .map(|_metadata| ())
    }

    pub fn server_version(&self) -> ProtocolVersion {
        self.server_version
    }

    pub fn server_address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        !self.channel.is_closed()
    }

    pub fn is_quarantined(&self) -> bool {
        self.channel.is_quarantined()
    }

    /// Tells the transport to stop reading once the consumer falls
    /// behind, per the backpressure signal.
    pub fn disable_auto_read(&mut self) {
        self.auto_read = false;
    }

    pub fn enable_auto_read(&mut self) {
        self.auto_read = true;
    }

    pub fn auto_read(&self) -> bool {
        self.auto_read
    }
}

async fn read_exact_timeout(stream: &mut TcpStream, buf: &mut [u8], bound: Duration) -> Result<()> {
    use tokio::io::AsyncReadExt;
    timeout(bound, stream.read_exact(buf))
        .await
        .map_err(|_| Error::service_unavailable("handshake read timed out"))?
        .map_err(|e| Error::ServiceUnavailable(format!("handshake read failed: {e}")))?;
    Ok(())
}
