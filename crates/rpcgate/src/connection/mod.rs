//! Client connections
//!
//! A [`Connection`] is one transport session to an [`Endpoint`]. It moves
//! through `Establishing -> Open -> Closing -> Closed`; once Closed it never
//! reopens and no invocation can bind to it. In-flight twoway requests are
//! tracked in a pending table keyed by request id. A single reader task routes
//! replies into that table; a reply whose slot is gone (fenced by a timeout or
//! failed by a close) is discarded as stale.

mod cache;

pub use cache::ConnectionCache;

use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use crate::frame::{Frame, ReplyFrame, RequestFrame, ONEWAY_REQUEST_ID};
use crate::retry::SendPhase;
use crate::timeout::{bound_close_with, TimeoutSupervisor};
use crate::transport::{BoxedStream, Connector, FrameReader, FrameWriter};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

type Reader = FrameReader<ReadHalf<BoxedStream>>;
type Writer = FrameWriter<WriteHalf<BoxedStream>>;
type ReplySender = oneshot::Sender<Result<Bytes>>;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Establishing,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Establishing => "establishing",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Fail in-flight invocations and drop the stream immediately
    Forcefully,
    /// Wait for in-flight invocations, then perform the close handshake
    Gracefully,
}

/// A failed send, with the phase the failure happened in
#[derive(Debug)]
pub struct SendFailure {
    pub error: RpcError,
    pub phase: SendPhase,
}

impl SendFailure {
    pub(crate) fn before_send(error: RpcError) -> Self {
        Self {
            error,
            phase: SendPhase::BeforeSend,
        }
    }

    pub(crate) fn after_send(error: RpcError) -> Self {
        Self {
            error,
            phase: SendPhase::AfterSend,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: ConnectionState,
    pending: usize,
}

struct Shared {
    state: ConnectionState,
    pending: HashMap<u32, ReplySender>,
}

pub struct Connection {
    endpoint: Endpoint,
    shared: Mutex<Shared>,
    status: watch::Sender<Status>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    next_request_id: AtomicU32,
    close_timeout: Option<Duration>,
}

impl Connection {
    fn new(endpoint: Endpoint, close_timeout: Option<Duration>) -> Self {
        let (status, _) = watch::channel(Status {
            state: ConnectionState::Establishing,
            pending: 0,
        });
        Self {
            endpoint,
            shared: Mutex::new(Shared {
                state: ConnectionState::Establishing,
                pending: HashMap::new(),
            }),
            status,
            writer: tokio::sync::Mutex::new(None),
            reader_task: Mutex::new(None),
            next_request_id: AtomicU32::new(1),
            close_timeout,
        }
    }

    /// Establish a connection: open a stream and wait for the server to
    /// validate it, all under the connect timeout.
    pub async fn establish(
        endpoint: Endpoint,
        connector: &dyn Connector,
        supervisor: &TimeoutSupervisor,
        max_frame_size: usize,
    ) -> Result<Arc<Self>> {
        let connection = Arc::new(Self::new(endpoint, supervisor.close_timeout()));
        debug!("Establishing connection to {}", connection.endpoint);

        let handshake = async {
            let stream = connector.connect(&connection.endpoint).await?;
            let (read_half, write_half) = tokio::io::split(stream);
            let mut reader = FrameReader::new(read_half).with_max_frame_size(max_frame_size);
            match reader.read_frame().await? {
                Frame::ValidateConnection => {}
                other => {
                    return Err(RpcError::Protocol(format!(
                        "expected connection validation, got {:?}",
                        other.kind()
                    )))
                }
            }
            let writer = FrameWriter::new(write_half).with_max_frame_size(max_frame_size);
            Ok((reader, writer))
        };

        match supervisor.bound_connect(handshake).await {
            Ok((reader, writer)) => {
                connection.open(reader, writer).await;
                debug!("Connection to {} open", connection.endpoint);
                Ok(connection)
            }
            Err(e) => {
                debug!("Connection to {} failed: {}", connection.endpoint, e);
                connection.terminate(|| RpcError::ConnectionLost("establishment failed".into()));
                Err(e)
            }
        }
    }

    async fn open(self: &Arc<Self>, reader: Reader, writer: Writer) {
        *self.writer.lock().await = Some(writer);
        {
            let mut shared = lock(&self.shared);
            shared.state = ConnectionState::Open;
            self.publish(&shared);
        }
        let task = tokio::spawn(read_loop(Arc::downgrade(self), reader));
        *lock(&self.reader_task) = Some(task);
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Number of twoway invocations awaiting a reply
    pub fn pending_count(&self) -> usize {
        lock(&self.shared).pending.len()
    }

    /// Wait until the connection is Closed
    pub async fn closed(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|s| s.state == ConnectionState::Closed).await;
    }

    /// Send a twoway request under a fresh request id and return its reply slot
    pub async fn send_request(
        self: &Arc<Self>,
        mut request: RequestFrame,
    ) -> std::result::Result<PendingReply, SendFailure> {
        let (tx, rx) = oneshot::channel();
        let request_id = self.allocate_request_id();
        {
            let mut shared = lock(&self.shared);
            if shared.state != ConnectionState::Open {
                drop(shared);
                return Err(SendFailure::before_send(self.not_open_error()));
            }
            shared.pending.insert(request_id, tx);
            self.publish(&shared);
        }

        request.request_id = request_id;
        let pending = PendingReply {
            request_id,
            rx,
            connection: Arc::clone(self),
        };

        match self.write_request(Frame::Request(request)).await {
            Ok(()) => Ok(pending),
            Err(failure) => {
                pending.fence();
                Err(failure)
            }
        }
    }

    /// Send a oneway request; returns once the frame has been written
    pub async fn send_oneway(
        &self,
        mut request: RequestFrame,
    ) -> std::result::Result<(), SendFailure> {
        if !self.is_open() {
            return Err(SendFailure::before_send(self.not_open_error()));
        }
        request.request_id = ONEWAY_REQUEST_ID;
        self.write_request(Frame::Request(request)).await
    }

    async fn write_request(&self, frame: Frame) -> std::result::Result<(), SendFailure> {
        let mut writer = self.writer.lock().await;

        if self.state() == ConnectionState::Closed {
            writer.take();
            return Err(SendFailure::before_send(self.not_open_error()));
        }
        let Some(stream) = writer.as_mut() else {
            return Err(SendFailure::before_send(self.not_open_error()));
        };

        // Encoding and size failures happen before any byte is written
        let data = stream.encode(&frame).map_err(SendFailure::before_send)?;
        trace!("Write frame: kind={:?}, len={}", frame.kind(), data.len());

        match stream.write_encoded(&data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                writer.take();
                drop(writer);
                warn!("Write to {} failed: {}", self.endpoint, e);
                let reason = e.to_string();
                self.terminate(|| RpcError::ConnectionLost(reason.clone()));
                Err(SendFailure::after_send(e))
            }
        }
    }

    /// Close the connection
    pub async fn close(&self, mode: CloseMode) -> Result<()> {
        match mode {
            CloseMode::Forcefully => {
                debug!("Closing connection to {} forcefully", self.endpoint);
                self.terminate(|| RpcError::ConnectionLost("connection closed forcefully".into()));
                Ok(())
            }
            CloseMode::Gracefully => self.close_gracefully().await,
        }
    }

    async fn close_gracefully(&self) -> Result<()> {
        {
            let mut shared = lock(&self.shared);
            match shared.state {
                ConnectionState::Closed => return Ok(()),
                ConnectionState::Closing => {}
                ConnectionState::Establishing | ConnectionState::Open => {
                    shared.state = ConnectionState::Closing;
                    self.publish(&shared);
                }
            }
        }
        debug!("Closing connection to {} gracefully", self.endpoint);

        let handshake = async {
            let mut rx = self.status.subscribe();
            rx.wait_for(|s| s.pending == 0 || s.state == ConnectionState::Closed)
                .await
                .map_err(|_| RpcError::ConnectionLost("connection dropped".into()))?;

            if let Some(writer) = self.writer.lock().await.as_mut() {
                if let Err(e) = writer.write_frame(&Frame::CloseConnection).await {
                    debug!("Close handshake write to {} failed: {}", self.endpoint, e);
                }
            }

            rx.wait_for(|s| s.state == ConnectionState::Closed)
                .await
                .map_err(|_| RpcError::ConnectionLost("connection dropped".into()))?;
            Ok(())
        };

        match bound_close_with(self.close_timeout, handshake).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Forcing connection to {} closed: {}", self.endpoint, e);
                self.terminate(|| RpcError::CloseTimeout);
                Err(e)
            }
        }
    }

    fn allocate_request_id(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != ONEWAY_REQUEST_ID {
                return id;
            }
        }
    }

    fn not_open_error(&self) -> RpcError {
        RpcError::ConnectionLost(format!("connection to {} is {}", self.endpoint, self.state()))
    }

    fn publish(&self, shared: &Shared) {
        self.status.send_replace(Status {
            state: shared.state,
            pending: shared.pending.len(),
        });
    }

    /// Route a reply into its slot, or discard it as stale
    fn complete(&self, reply: ReplyFrame) {
        let mut shared = lock(&self.shared);
        match shared.pending.remove(&reply.request_id) {
            Some(tx) => {
                let request_id = reply.request_id;
                if tx.send(reply.into_result()).is_err() {
                    trace!("Reply receiver gone: request_id={}", request_id);
                }
                self.publish(&shared);
            }
            None => {
                trace!(
                    "Discarding stale reply from {}: request_id={}",
                    self.endpoint,
                    reply.request_id
                );
            }
        }
    }

    /// Remove a reply slot; true if it was still pending
    fn fence(&self, request_id: u32) -> bool {
        let mut shared = lock(&self.shared);
        let removed = shared.pending.remove(&request_id).is_some();
        if removed {
            self.publish(&shared);
        }
        removed
    }

    /// Move to Closed, failing every pending invocation with `error()`
    fn terminate(&self, error: impl Fn() -> RpcError) {
        {
            let mut shared = lock(&self.shared);
            if shared.state == ConnectionState::Closed {
                return;
            }
            shared.state = ConnectionState::Closed;
            let failed = shared.pending.len();
            for (_, tx) in shared.pending.drain() {
                let _ = tx.send(Err(error()));
            }
            self.publish(&shared);
            if failed > 0 {
                debug!(
                    "Connection to {} closed with {} pending invocations: {}",
                    self.endpoint,
                    failed,
                    error()
                );
            }
        }

        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self
            .reader_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// The reply slot of one in-flight twoway request
#[derive(Debug)]
pub struct PendingReply {
    request_id: u32,
    rx: oneshot::Receiver<Result<Bytes>>,
    connection: Arc<Connection>,
}

impl PendingReply {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Wait for the reply without a deadline
    pub async fn wait(mut self) -> Result<Bytes> {
        self.recv().await
    }

    pub(crate) async fn recv(&mut self) -> Result<Bytes> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::ConnectionLost("reply slot dropped".into())),
        }
    }

    /// Remove the slot so a late reply is discarded; false if the reply (or a
    /// connection failure) was already delivered
    pub(crate) fn fence(&self) -> bool {
        self.connection.fence(self.request_id)
    }

    /// Take a value delivered before the slot was fenced
    pub(crate) fn take_delivered(&mut self) -> Result<Bytes> {
        match self.rx.try_recv() {
            Ok(result) => result,
            Err(_) => Err(RpcError::InvocationTimeout),
        }
    }
}

async fn read_loop(connection: Weak<Connection>, mut reader: Reader) {
    let reason = loop {
        let frame = reader.read_frame().await;
        let Some(conn) = connection.upgrade() else {
            return;
        };
        match frame {
            Ok(Frame::Reply(reply)) => conn.complete(reply),
            Ok(Frame::ValidateConnection) => trace!("Ignoring repeated validation"),
            Ok(Frame::CloseConnection) => break "connection closed by peer".to_string(),
            Ok(Frame::Request(request)) => {
                break format!("unexpected request frame: request_id={}", request.request_id)
            }
            Err(e) => break e.to_string(),
        }
    };

    if let Some(conn) = connection.upgrade() {
        debug!("Connection to {} lost: {}", conn.endpoint, reason);
        conn.terminate(|| RpcError::ConnectionLost(reason.clone()));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
