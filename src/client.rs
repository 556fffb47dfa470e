//! Client builder and connection runtime.
//!
//! The [`ClientBuilder`] configures the client and takes over an already
//! established byte stream. Starting it spawns three tasks:
//! 1. the read loop, which reassembles frames and dispatches them in arrival order
//! 2. the writer task, which batches outbound frames
//! 3. the tick loop, which retransmits, times out and checkpoints
//!
//! The [`Client`] handle issues resolutions and log subscriptions. It is
//! cheap to clone and every clone drives the same connection.
//!
//! # Example
//!
//! ```ignore
//! use overlay_lookup::{Client, Lookup, VnetId};
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = TcpStream::connect("127.0.0.1:1296").await?;
//!     let (reader, writer) = stream.into_split();
//!
//!     let client = Client::builder()
//!         .request_timeout(std::time::Duration::from_secs(2))
//!         .start(reader, writer)?;
//!
//!     match client.resolve_vl2(VnetId(7), "aa:bb:cc:dd:ee:ff".parse()?).await? {
//!         Lookup::Found(endpoint) => println!("underlay {endpoint}"),
//!         Lookup::Stale(endpoint) => println!("underlay {endpoint} (invalidated meanwhile)"),
//!         Lookup::NotFound => println!("unknown"),
//!     }
//!     Ok(())
//! }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::{MappingCache, MemoryCache, Stamp, StampClock};
use crate::codec::{Body, BulkRequest, LogAck, Message, MessageCodec, Vl2Request, Vl3Request};
use crate::config::ClientConfig;
use crate::error::{LookupError, Result};
use crate::log_stream::{LogAction, LogConsumer, LogState};
use crate::protocol::{registry, Direction, Frame, FrameBuffer, OpCode, OpKind, Status};
use crate::shootdown::ShootdownHandler;
use crate::tracker::{CorrelationTracker, Submitted};
use crate::types::{
    BulkPage, Cursor, Lookup, MacAddr, MappingKey, MappingRecord, Vl2Mapping, Vl3Mapping,
    Vl3Resolution, VnetId,
};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Read buffer size for the read loop.
const READ_CHUNK: usize = 64 * 1024;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the stream.
    Closed,
    /// [`Client::shutdown`] was called.
    Shutdown,
    /// The peer violated the protocol.
    Malformed(String),
    /// The transport failed.
    Io(String),
}

/// Connection state published to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected(DisconnectReason),
}

/// Builder for configuring and starting a client.
pub struct ClientBuilder {
    config: ClientConfig,
    cache: Option<Arc<dyn MappingCache>>,
}

impl ClientBuilder {
    /// Create a builder with default configuration and an in-memory cache.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            cache: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Cache that resolutions, log records and shootdowns are applied to.
    ///
    /// Default: a fresh [`MemoryCache`].
    pub fn cache(mut self, cache: Arc<dyn MappingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Time to wait for an ack before retransmitting.
    ///
    /// Default: 5 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Retransmissions before a request times out.
    ///
    /// Default: 2
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Period of the timeout and checkpoint sweep.
    ///
    /// Default: 250 milliseconds
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Acknowledge the log after this many applied records.
    ///
    /// Default: 64
    pub fn checkpoint_every(mut self, records: u64) -> Self {
        self.config.checkpoint_every = records;
        self
    }

    /// Largest body accepted from the server.
    ///
    /// Default: 1 MiB
    pub fn max_body_size(mut self, size: u32) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// Maximum pending outbound frames before senders wait.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// How long a sender waits for backpressure to clear.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Validate the configuration and take over a connected byte stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<R, W>(self, reader: R, writer: W) -> Result<Client>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.config.validate()?;
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()) as Arc<dyn MappingCache>);
        Ok(Client::start(self.config, cache, reader, writer))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the client handles and the connection tasks.
struct Shared {
    config: ClientConfig,
    tracker: CorrelationTracker,
    writer: WriterHandle,
    cache: Arc<dyn MappingCache>,
    clock: Arc<StampClock>,
    log: Mutex<LogConsumer>,
    shootdowns: ShootdownHandler,
    state: watch::Sender<ConnectionState>,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Handle to a running connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn start<R, W>(config: ClientConfig, cache: Arc<dyn MappingCache>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let clock = Arc::new(StampClock::new());
        let (writer, writer_task) = spawn_writer_task(writer, &config.writer);
        let (state, _) = watch::channel(ConnectionState::Connected);

        let shared = Arc::new(Shared {
            tracker: CorrelationTracker::new(config.tracker(), clock.clone()),
            log: Mutex::new(LogConsumer::new(config.log())),
            shootdowns: ShootdownHandler::new(cache.clone(), clock.clone()),
            config,
            writer,
            cache,
            clock,
            state,
            tasks: Mutex::new(Vec::new()),
        });

        let read_task = tokio::spawn(read_loop(reader, shared.clone()));
        let tick_task = tokio::spawn(tick_loop(shared.clone()));
        let writer_abort = writer_task.abort_handle();

        // Holds only a weak reference so an idle connection can be dropped.
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        tokio::spawn(async move {
            if let Ok(Err(e)) = writer_task.await {
                if let Some(shared) = weak.upgrade() {
                    shared.terminate(DisconnectReason::Io(e.to_string()));
                }
            }
        });

        shared.tasks.lock().extend([
            read_task.abort_handle(),
            tick_task.abort_handle(),
            writer_abort,
        ]);

        info!("lookup client connected");
        Client { shared }
    }

    /// Resolve a virtual MAC to the underlay endpoint hosting it.
    ///
    /// A found mapping is written to the cache under the request's issue
    /// stamp. If a shootdown for the MAC arrived meanwhile, the answer is
    /// returned as [`Lookup::Stale`] and not cached.
    pub async fn resolve_vl2(&self, vnet: VnetId, mac: MacAddr) -> Result<Lookup<SocketAddr>> {
        let (ack, lease) = self
            .shared
            .call(Body::Vl2Request(Vl2Request { vnet, mac }))
            .await?;

        match ack.body {
            Body::Vl2Ack(underlay) => {
                let record = MappingRecord::Vl2(Vl2Mapping { mac, underlay });
                Ok(self.shared.store_answer(vnet, &record, &lease, underlay))
            }
            Body::Nack(op) => self.shared.negative(vnet, MappingKey::Vl2(mac), op, ack.status, &lease),
            other => Err(unexpected(OpCode::Vl2Ack, &other)),
        }
    }

    /// Resolve a virtual IP to its owning MAC and underlay endpoint.
    pub async fn resolve_vl3(&self, vnet: VnetId, ip: IpAddr) -> Result<Lookup<Vl3Resolution>> {
        let (ack, lease) = self
            .shared
            .call(Body::Vl3Request(Vl3Request { vnet, ip }))
            .await?;

        match ack.body {
            Body::Vl3Ack(resolution) => {
                let record = MappingRecord::Vl3(Vl3Mapping {
                    ip,
                    mac: resolution.mac,
                    underlay: resolution.underlay,
                });
                Ok(self.shared.store_answer(vnet, &record, &lease, resolution))
            }
            Body::Nack(op) => self.shared.negative(vnet, MappingKey::Vl3(ip), op, ack.status, &lease),
            other => Err(unexpected(OpCode::Vl3Ack, &other)),
        }
    }

    /// Fetch one page of a network's mappings.
    ///
    /// Start with [`Cursor::start`] and call again with `page.next` until it
    /// is `None`. Records are written to the cache as each page arrives.
    ///
    /// Fails with [`LookupError::TooLong`] without sending anything if the
    /// cursor exceeds [`MAX_CURSOR_LEN`](crate::codec::MAX_CURSOR_LEN) bytes.
    pub async fn bulk_resolve(&self, vnet: VnetId, cursor: Cursor) -> Result<BulkPage> {
        self.shared.bulk_page(vnet, cursor).await
    }

    /// Round-trip a ping and return the latency.
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        let (ack, _) = self.shared.call(Body::Ping).await?;
        match ack.body {
            Body::Pong => Ok(start.elapsed()),
            other => Err(unexpected(OpCode::Pong, &other)),
        }
    }

    /// Subscribe to a network's log starting at `from_seq`.
    ///
    /// Returns once the server accepted the subscription. Records are then
    /// applied to the cache in sequence order by the read loop.
    pub async fn subscribe_log(&self, vnet: VnetId, from_seq: u64) -> Result<()> {
        let request = self.shared.log.lock().subscribe(vnet, from_seq, Instant::now())?;

        let outcome = self.shared.call(Body::LogRequest(request)).await;
        match outcome {
            Ok((ack, _)) => match ack.body {
                Body::LogRequestAck => {
                    self.shared.log.lock().confirm(vnet);
                    Ok(())
                }
                Body::Nack(op) => {
                    self.shared.log.lock().subscription_failed(vnet);
                    Err(LookupError::Server {
                        op,
                        status: ack.status,
                    })
                }
                other => {
                    self.shared.log.lock().subscription_failed(vnet);
                    Err(unexpected(OpCode::LogRequestAck, &other))
                }
            },
            Err(e) => {
                self.shared.log.lock().subscription_failed(vnet);
                Err(e)
            }
        }
    }

    /// Subscription state of a network's log.
    pub fn log_state(&self, vnet: VnetId) -> LogState {
        self.shared.log.lock().state(vnet)
    }

    /// Sequence number to resubscribe from after a reconnect.
    pub fn resume_point(&self, vnet: VnetId) -> Option<u64> {
        self.shared.log.lock().resume_point(vnet)
    }

    /// Send a raw request and wait for its ack. The cache is not touched.
    pub async fn call(&self, body: Body) -> Result<Message> {
        self.shared.call(body).await.map(|(ack, _)| ack)
    }

    /// Like [`Client::call`] with a caller-chosen request id.
    ///
    /// Fails with [`LookupError::DuplicateRequestId`] if the id is in flight.
    pub async fn call_with_id(&self, request_id: u64, body: Body) -> Result<Message> {
        let submitted = self.shared.tracker.submit_with_id(request_id, body)?;
        self.shared.exchange(submitted).await.map(|(ack, _)| ack)
    }

    /// The cache this client writes to.
    pub fn cache(&self) -> &Arc<dyn MappingCache> {
        &self.shared.cache
    }

    /// Number of shootdowns applied on this connection.
    pub fn shootdowns_handled(&self) -> u64 {
        self.shared.shootdowns.handled()
    }

    /// Number of requests awaiting an ack.
    pub fn in_flight(&self) -> usize {
        self.shared.tracker.in_flight()
    }

    /// Subscribe to connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Wait until the connection ends and return why.
    pub async fn closed(&self) -> DisconnectReason {
        let mut rx = self.shared.state.subscribe();
        loop {
            if let ConnectionState::Disconnected(reason) = &*rx.borrow_and_update() {
                return reason.clone();
            }
            if rx.changed().await.is_err() {
                return DisconnectReason::Shutdown;
            }
        }
    }

    /// Tear the connection down. Pending requests fail with `ConnectionLost`.
    pub fn shutdown(&self) {
        self.shared.terminate(DisconnectReason::Shutdown);
    }

    /// Get the current backpressure status.
    pub fn is_backpressure_active(&self) -> bool {
        self.shared.writer.is_backpressure_active()
    }

    /// Get the current pending frame count.
    pub fn pending_frames(&self) -> usize {
        self.shared.writer.pending_count()
    }
}

impl Shared {
    fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Connected)
    }

    /// Submit a request and wait for its outcome.
    async fn call(&self, body: Body) -> Result<(Message, Lease<'_>)> {
        let submitted = self.tracker.submit(body)?;
        self.exchange(submitted).await
    }

    async fn exchange(&self, submitted: Submitted) -> Result<(Message, Lease<'_>)> {
        let Submitted {
            request_id,
            issued,
            frame,
            response,
        } = submitted;

        // Teardown publishes the state before failing the map, so a request
        // registered after that point has to fail itself.
        if !self.is_connected() {
            self.tracker.discard(request_id);
            return Err(LookupError::ConnectionLost);
        }

        let mut guard = CancelOnDrop {
            tracker: &self.tracker,
            request_id,
            issued,
            armed: true,
        };

        if let Err(e) = self.writer.send(frame).await {
            guard.armed = false;
            self.tracker.discard(request_id);
            return Err(e);
        }
        let outcome = response.await.map_err(|_| LookupError::ConnectionLost)?;
        guard.armed = false;

        let lease = Lease {
            tracker: &self.tracker,
            issued,
        };
        outcome.map(|ack| (ack, lease))
    }

    fn store_answer<T>(&self, vnet: VnetId, record: &MappingRecord, lease: &Lease<'_>, value: T) -> Lookup<T> {
        if self.cache.store(vnet, record, lease.issued) {
            Lookup::Found(value)
        } else {
            debug!(%vnet, key = %record.key(), "answer superseded by invalidation");
            Lookup::Stale(value)
        }
    }

    fn negative<T>(
        &self,
        vnet: VnetId,
        key: MappingKey,
        op: OpCode,
        status: Status,
        lease: &Lease<'_>,
    ) -> Result<Lookup<T>> {
        if status == Status::NotFound {
            self.cache.invalidate(vnet, key, lease.issued);
            Ok(Lookup::NotFound)
        } else {
            Err(LookupError::Server { op, status })
        }
    }

    async fn bulk_page(&self, vnet: VnetId, cursor: Cursor) -> Result<BulkPage> {
        let (ack, lease) = self
            .call(Body::BulkRequest(BulkRequest { vnet, cursor }))
            .await?;

        match ack.body {
            Body::BulkAck(page) => {
                for record in &page.records {
                    self.cache.store(vnet, record, lease.issued);
                }
                let next = if page.next.is_empty() {
                    None
                } else {
                    Some(page.next)
                };
                Ok(BulkPage {
                    records: page.records,
                    next,
                })
            }
            Body::Nack(op) => Err(LookupError::Server {
                op,
                status: ack.status,
            }),
            other => Err(unexpected(OpCode::BulkAck, &other)),
        }
    }

    /// Handle one inbound frame. An error is fatal to the connection.
    fn dispatch(self: &Arc<Self>, frame: &Frame) -> Result<()> {
        let message = MessageCodec::from_frame(frame)?;
        let op = message.op();

        match registry::spec(op).kind {
            OpKind::Ack { .. } => {
                self.tracker.complete(message)?;
            }
            OpKind::Request { .. } => match message.body {
                Body::Ping => {
                    let pong = OutboundFrame::from_message(&Message::ack(message.request_id, Body::Pong))
                        .and_then(|pong| self.writer.try_send(pong));
                    if let Err(e) = pong {
                        warn!(request_id = message.request_id, "dropping pong: {}", e);
                    }
                }
                _ => {
                    return Err(LookupError::malformed(format!(
                        "server sent client-side request {op:?}"
                    )));
                }
            },
            OpKind::Push {
                direction: Direction::ToServer,
            } => {
                return Err(LookupError::malformed(format!(
                    "server sent client-side push {op:?}"
                )));
            }
            OpKind::Push {
                direction: Direction::ToClient,
            } => match message.body {
                Body::Shootdown(shootdown) => self.shootdowns.on_shootdown(&shootdown),
                Body::LogRecord(record) => {
                    let mut log = self.log.lock();
                    let actions = log.on_record(record, Instant::now());
                    self.run_log_actions(actions);
                }
                other => {
                    return Err(unexpected(op, &other));
                }
            },
        }
        Ok(())
    }

    /// Carry out log actions.
    ///
    /// Called with the log lock held so cache writes happen in sequence order.
    fn run_log_actions(self: &Arc<Self>, actions: Vec<LogAction>) {
        for action in actions {
            match action {
                LogAction::Apply { vnet, seq, record } => {
                    if !self.cache.store(vnet, &record, self.clock.next()) {
                        debug!(%vnet, seq, "log record superseded");
                    }
                }
                LogAction::Checkpoint(ack) => self.send_checkpoint(ack),
                LogAction::Resync { vnet, resume_from } => {
                    self.cache.invalidate_network(vnet, self.clock.next());
                    tokio::spawn(resync(self.clone(), vnet, resume_from));
                }
            }
        }
    }

    fn send_checkpoint(&self, ack: LogAck) {
        let sent = OutboundFrame::from_message(&Message::push(Body::LogAck(ack)))
            .and_then(|frame| self.writer.try_send(frame));
        match sent {
            Ok(()) => debug!(vnet = %ack.vnet, seq = ack.seq, "log checkpoint"),
            Err(e) => warn!(vnet = %ack.vnet, seq = ack.seq, "dropping log checkpoint: {}", e),
        }
    }

    /// Periodic sweep: retransmissions, timeouts, checkpoints and cache pruning.
    fn tick(&self, now: Instant) {
        let report = self.tracker.tick(now);
        for (request_id, frame) in report.retried {
            debug!(request_id, "retransmitting request");
            if let Err(e) = self.writer.try_send(frame) {
                warn!(request_id, "retransmission dropped: {}", e);
            }
        }
        for request_id in report.timed_out {
            warn!(request_id, "request timed out");
        }

        let due = self.log.lock().due_checkpoints(now);
        for ack in due {
            self.send_checkpoint(ack);
        }

        self.cache.prune(self.tracker.stamp_horizon());
    }

    /// End the connection once. Later calls do nothing.
    fn terminate(&self, reason: DisconnectReason) {
        let first = self.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Connected) {
                *state = ConnectionState::Disconnected(reason.clone());
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }

        match &reason {
            DisconnectReason::Closed | DisconnectReason::Shutdown => {
                info!(?reason, "lookup client disconnected")
            }
            DisconnectReason::Malformed(msg) => error!("connection dropped, malformed input: {}", msg),
            DisconnectReason::Io(msg) => error!("connection dropped, I/O error: {}", msg),
        }

        let failed = self.tracker.fail_all(|| LookupError::ConnectionLost);
        if failed > 0 {
            debug!(failed, "failed pending requests");
        }
        self.log.lock().disconnect_all();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Cancels a request whose caller stopped waiting.
struct CancelOnDrop<'a> {
    tracker: &'a CorrelationTracker,
    request_id: u64,
    issued: Stamp,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tracker.cancel(self.request_id);
            // The ack may have been delivered just before the caller left.
            self.tracker.release(self.issued);
        }
    }
}

/// Holds an answer's issue stamp below the prune horizon until dropped.
///
/// Cache writes for the answer must happen while the lease is alive.
struct Lease<'a> {
    tracker: &'a CorrelationTracker,
    issued: Stamp,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.tracker.release(self.issued);
    }
}

fn unexpected(expected: OpCode, actual: &Body) -> LookupError {
    LookupError::UnexpectedResponse {
        expected: format!("{expected:?}"),
        actual: format!("{:?}", actual.op()),
    }
}

/// Main read loop - reassembles frames and dispatches them in arrival order.
async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::with_max_body(shared.config.max_body_size);
    let mut buf = vec![0u8; READ_CHUNK];

    let reason = 'conn: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break DisconnectReason::Closed,
            Ok(n) => n,
            Err(e) => break DisconnectReason::Io(e.to_string()),
        };

        frames.extend(&buf[..n]);
        loop {
            match frames.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(e) = shared.dispatch(&frame) {
                        break 'conn reason_for(e);
                    }
                }
                Ok(None) => break,
                Err(e) => break 'conn reason_for(e),
            }
        }
    };

    shared.terminate(reason);
}

fn reason_for(e: LookupError) -> DisconnectReason {
    match e {
        LookupError::Io(io) => DisconnectReason::Io(io.to_string()),
        other => DisconnectReason::Malformed(other.to_string()),
    }
}

async fn tick_loop(shared: Arc<Shared>) {
    let mut state = shared.state.subscribe();
    let mut interval = tokio::time::interval(shared.config.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            now = interval.tick() => shared.tick(now),
            changed = state.changed() => {
                if changed.is_err() || !shared.is_connected() {
                    break;
                }
            }
        }
    }
}

/// Rebuild a network from a bulk walk, then resume its log.
async fn resync(shared: Arc<Shared>, vnet: VnetId, resume_from: u64) {
    info!(%vnet, resume_from, "resynchronizing network");

    let mut cursor = Cursor::start();
    let mut loaded = 0usize;
    let outcome = loop {
        match shared.bulk_page(vnet, cursor).await {
            Ok(page) => {
                loaded += page.records.len();
                match page.next {
                    Some(next) => cursor = next,
                    None => break Ok(()),
                }
            }
            Err(e) => break Err(e),
        }
    };

    match outcome {
        Ok(()) => {
            debug!(%vnet, loaded, "bulk reload complete");
            let mut log = shared.log.lock();
            let actions = log.finish_resync(vnet, Instant::now());
            shared.run_log_actions(actions);
        }
        Err(e) => {
            warn!(%vnet, "resync failed: {}", e);
            shared.log.lock().abort_resync(vnet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_builder_default() {
        let builder = ClientBuilder::default();
        assert_eq!(builder.config, ClientConfig::default());
        assert!(builder.cache.is_none());
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Client::builder()
            .request_timeout(Duration::from_millis(750))
            .max_retries(4)
            .tick_interval(Duration::from_millis(50))
            .checkpoint_every(8)
            .max_body_size(4096)
            .max_pending_frames(2048)
            .channel_capacity(512)
            .backpressure_timeout(Duration::from_secs(10));

        assert_eq!(builder.config.request_timeout_ms, 750);
        assert_eq!(builder.config.max_retries, 4);
        assert_eq!(builder.config.tick_interval_ms, 50);
        assert_eq!(builder.config.checkpoint_every, 8);
        assert_eq!(builder.config.max_body_size, 4096);
        assert_eq!(builder.config.writer.max_pending_frames, 2048);
        assert_eq!(builder.config.writer.channel_capacity, 512);
        assert_eq!(builder.config.writer.backpressure_timeout_ms, 10_000);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let (client_io, _server_io) = duplex(1024);
        let (reader, writer) = tokio::io::split(client_io);

        let result = Client::builder().max_body_size(0).start(reader, writer);
        assert!(matches!(result, Err(LookupError::Config(_))));
    }

    #[tokio::test]
    async fn test_peer_close_disconnects_once() {
        let (client_io, server_io) = duplex(1024);
        let (reader, writer) = tokio::io::split(client_io);
        let client = Client::builder().start(reader, writer).unwrap();
        let mut state = client.connection_state();

        drop(server_io);

        assert_eq!(client.closed().await, DisconnectReason::Closed);
        assert!(!client.is_connected());
        state.changed().await.unwrap();
        assert!(matches!(
            *state.borrow(),
            ConnectionState::Disconnected(DisconnectReason::Closed)
        ));
    }

    #[tokio::test]
    async fn test_request_after_disconnect_fails_fast() {
        let (client_io, _server_io) = duplex(1024);
        let (reader, writer) = tokio::io::split(client_io);
        let client = Client::builder().start(reader, writer).unwrap();

        client.shutdown();

        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, LookupError::ConnectionLost));
        assert_eq!(client.in_flight(), 0);
        assert_eq!(client.closed().await, DisconnectReason::Shutdown);
    }
}
