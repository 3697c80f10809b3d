//! Incoming connections
//!
//! Each accepted stream is served by its own task. The connection is only
//! validated once the adapter is Active, so clients of a held adapter wait in
//! establishment. Requests are read in order and handed to the adapter gate;
//! replies flow back through a per-connection writer task.

use super::dispatch_queue::Dispatch;
use super::object_adapter::ObjectAdapter;
use super::servant::{Current, ServantMap};
use crate::error::{Result, RpcError};
use crate::frame::{Frame, ReplyFrame, RequestFrame};
use crate::transport::{BoxedStream, FrameReader, FrameWriter};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

/// Adapter statistics
#[derive(Debug, Default)]
pub struct AdapterStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub requests_received: AtomicU64,
    pub requests_dispatched: AtomicU64,
    pub requests_rejected: AtomicU64,
}

impl AdapterStats {
    pub fn snapshot(&self) -> AdapterStatsSnapshot {
        AdapterStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of adapter statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub requests_received: u64,
    pub requests_dispatched: u64,
    pub requests_rejected: u64,
}

/// Handle on the incoming connection a request arrived on
#[derive(Clone)]
pub struct ConnectionControl {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    aborted: AtomicBool,
    abort: Notify,
}

impl ConnectionControl {
    fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                aborted: AtomicBool::new(false),
                abort: Notify::new(),
            }),
        }
    }

    /// A control not attached to any connection
    pub fn detached() -> Self {
        Self::new()
    }

    /// Drop the connection without a close handshake. Replies not yet written,
    /// including the one for the current request, are discarded.
    pub fn close_forcefully(&self) {
        if !self.inner.aborted.swap(true, Ordering::SeqCst) {
            self.inner.abort.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ConnectionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionControl")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// An admitted request waiting for, or in, dispatch
pub(crate) struct DispatchTask {
    adapter: Arc<str>,
    servants: Arc<ServantMap>,
    stats: Arc<AdapterStats>,
    request: RequestFrame,
    replies: mpsc::UnboundedSender<ReplyFrame>,
    control: ConnectionControl,
}

impl DispatchTask {
    /// Fail the request without running it
    pub(crate) fn reject(self, error: RpcError) {
        trace!(
            "Rejecting request {} on {}: {}",
            self.request.request_id,
            self.request.identity,
            error
        );
        self.stats.requests_rejected.fetch_add(1, Ordering::Relaxed);
        respond(&self.request, &self.replies, &self.control, Err(error));
    }
}

impl Dispatch for DispatchTask {
    fn run(self) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let DispatchTask {
                adapter,
                servants,
                stats,
                mut request,
                replies,
                control,
            } = self;

            stats.requests_dispatched.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Dispatching {}::{} request_id={}",
                request.identity, request.operation, request.request_id
            );

            let args = std::mem::take(&mut request.args);
            let result = match servants.find(&request.identity) {
                Some(servant) => {
                    let current = Current {
                        adapter: adapter.to_string(),
                        identity: request.identity.clone(),
                        operation: request.operation.clone(),
                        mode: request.mode,
                        context: request.context.clone(),
                        request_id: request.request_id,
                        connection: control.clone(),
                    };
                    servant.dispatch(current, args).await
                }
                None => Err(RpcError::ObjectNotExist(request.identity.clone())),
            };

            respond(&request, &replies, &control, result);
        })
    }
}

fn respond(
    request: &RequestFrame,
    replies: &mpsc::UnboundedSender<ReplyFrame>,
    control: &ConnectionControl,
    result: Result<Bytes>,
) {
    if request.is_oneway() {
        if let Err(e) = result {
            debug!("Oneway {} failed: {}", request.operation, e);
        }
        return;
    }
    if control.is_closed() {
        trace!("Suppressing reply to request_id={}", request.request_id);
        return;
    }

    let reply = match result {
        Ok(body) => ReplyFrame::ok(request.request_id, body),
        Err(e) => ReplyFrame::from_error(request.request_id, &e),
    };
    if replies.send(reply).is_err() {
        trace!("Connection gone before reply to request_id={}", request.request_id);
    }
}

/// Serve one incoming stream until the peer closes it, the peer asks for a
/// graceful close, or a servant closes it forcefully
pub(crate) async fn serve_connection(
    stream: BoxedStream,
    adapter: ObjectAdapter,
    max_frame_size: usize,
) -> Result<()> {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half).with_max_frame_size(max_frame_size);
    let mut writer = FrameWriter::new(write_half).with_max_frame_size(max_frame_size);

    // Nothing is validated while the adapter holds
    tokio::select! {
        active = adapter.wait_until_active() => active?,
        frame = reader.read_frame() => {
            return match frame {
                Ok(frame) => Err(RpcError::Protocol(format!(
                    "{:?} frame before validation",
                    frame.kind()
                ))),
                Err(e) => Err(e),
            };
        }
    }
    writer.write_frame(&Frame::ValidateConnection).await?;

    let control = ConnectionControl::new();
    let (replies, mut reply_rx) = mpsc::unbounded_channel::<ReplyFrame>();

    let writer_control = control.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            if writer_control.is_closed() {
                break;
            }
            let Some(data) = encode_reply(&writer, reply) else {
                continue;
            };
            if let Err(e) = writer.write_encoded(&data).await {
                debug!("Reply write failed: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let stats = adapter.stats().clone();
    let servants = adapter.servants();
    let adapter_name: Arc<str> = Arc::from(adapter.name());

    let result = loop {
        let aborted = control.inner.abort.notified();
        if control.is_closed() {
            writer_task.abort();
            return Ok(());
        }

        tokio::select! {
            _ = aborted => {
                debug!("Connection closed forcefully by servant");
                writer_task.abort();
                return Ok(());
            }
            frame = reader.read_frame() => match frame {
                Ok(Frame::Request(request)) => {
                    stats.requests_received.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        "Received request: request_id={}, {}::{}",
                        request.request_id,
                        request.identity,
                        request.operation
                    );
                    let task = DispatchTask {
                        adapter: adapter_name.clone(),
                        servants: servants.clone(),
                        stats: stats.clone(),
                        request,
                        replies: replies.clone(),
                        control: control.clone(),
                    };
                    adapter.admit(task).await;
                }
                Ok(Frame::CloseConnection) => {
                    debug!("Peer requested close");
                    break Ok(());
                }
                Ok(other) => {
                    break Err(RpcError::Protocol(format!(
                        "unexpected {:?} frame from client",
                        other.kind()
                    )));
                }
                Err(RpcError::ConnectionLost(_)) => break Ok(()),
                Err(e) => break Err(e),
            }
        }
    };

    // Let in-flight dispatches reply, then close the stream
    drop(replies);
    if control.is_closed() {
        writer_task.abort();
    } else {
        let _ = writer_task.await;
    }
    result
}

/// Encode a reply, replacing one the frame limit cannot carry with an
/// `Unknown` failure for the same request
fn encode_reply<T>(writer: &FrameWriter<T>, reply: ReplyFrame) -> Option<Bytes> {
    let request_id = reply.request_id;
    let error = match writer.encode(&Frame::Reply(reply)) {
        Ok(data) => return Some(data),
        Err(e) => e,
    };

    warn!("Reply to request_id={} not sendable: {}", request_id, error);
    let fallback = ReplyFrame::from_error(request_id, &RpcError::Unknown(error.to_string()));
    match writer.encode(&Frame::Reply(fallback)) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!("Dropping reply to request_id={}: {}", request_id, e);
            None
        }
    }
}

fn spawn_connection(
    stream: BoxedStream,
    peer: String,
    permit: OwnedSemaphorePermit,
    adapter: ObjectAdapter,
    max_frame_size: usize,
) {
    let stats = adapter.stats().clone();
    stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
    stats.connections_active.fetch_add(1, Ordering::Relaxed);
    debug!("Adapter {} accepted connection from {}", adapter.name(), peer);

    tokio::spawn(async move {
        // Permit is held until this task completes
        let _permit = permit;

        let result = serve_connection(stream, adapter, max_frame_size).await;
        stats.connections_active.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(()) => debug!("Connection closed from {}", peer),
            Err(RpcError::AdapterUnavailable(_)) => {
                debug!("Connection from {} dropped: adapter deactivated", peer);
            }
            Err(e) => warn!("Connection error from {}: {}", peer, e),
        }
    });
}

/// Accept TCP connections until the adapter shuts its listeners down
pub(crate) async fn run_tcp_listener(
    listener: TcpListener,
    adapter: ObjectAdapter,
    max_connections: usize,
    max_frame_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(max_connections));

    loop {
        tokio::select! {
            biased;

            _ = shutdown.wait_for(|stop| *stop) => {
                info!("Adapter {} stopped listening", adapter.name());
                return;
            }

            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed on adapter {}: {}", adapter.name(), e);
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        adapter.stats().connections_rejected.fetch_add(1, Ordering::Relaxed);
                        warn!("Connection limit reached, rejecting connection from {}", peer_addr);
                        drop(stream);
                        continue;
                    }
                };

                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {}: {}", peer_addr, e);
                }
                spawn_connection(
                    Box::new(stream),
                    peer_addr.to_string(),
                    permit,
                    adapter.clone(),
                    max_frame_size,
                );
            }
        }
    }
}

/// Accept collocated connections handed over by the local registry
pub(crate) async fn run_local_listener(
    name: String,
    mut incoming: mpsc::UnboundedReceiver<BoxedStream>,
    adapter: ObjectAdapter,
    max_connections: usize,
    max_frame_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(max_connections));

    loop {
        tokio::select! {
            biased;

            _ = shutdown.wait_for(|stop| *stop) => break,

            stream = incoming.recv() => {
                let Some(stream) = stream else { break };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        adapter.stats().connections_rejected.fetch_add(1, Ordering::Relaxed);
                        warn!("Connection limit reached on local://{}", name);
                        continue;
                    }
                };

                spawn_connection(
                    stream,
                    format!("local://{}", name),
                    permit,
                    adapter.clone(),
                    max_frame_size,
                );
            }
        }
    }
    info!("Adapter {} stopped listening on local://{}", adapter.name(), name);
}
