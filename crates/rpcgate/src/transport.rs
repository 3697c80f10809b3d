//! Transport layer
//!
//! Frames are self-delimiting through the `body_length` header field, so any
//! reliable byte stream can carry them. The invocation layer only needs three
//! things from a transport: open a stream to an [`Endpoint`], read frames and
//! write frames.

use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use crate::frame::{Frame, FrameHeader};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Maximum frame size (1 MiB default)
pub const DEFAULT_MAX_FRAME_SIZE: usize = crate::config::DEFAULT_MAX_FRAME_SIZE;

/// Buffer size of in-process pipes
const LOCAL_PIPE_CAPACITY: usize = 64 * 1024;

/// A bidirectional byte stream
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Opens byte streams to endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream>;
}

/// Frame reader over the read half of a stream
pub struct FrameReader<T> {
    inner: T,
    max_frame_size: usize,
    read_buf: BytesMut,
}

impl<T> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_frame_size(mut self, max_size: usize) -> Self {
        self.max_frame_size = max_size;
        self
    }

    /// Parse one complete frame out of the buffer, if present
    fn parse_frame(&mut self) -> Result<Option<Frame>> {
        if self.read_buf.len() < FrameHeader::SIZE {
            return Ok(None);
        }

        let header = FrameHeader::decode(&self.read_buf[..FrameHeader::SIZE])?;
        let body_length = header.body_length as usize;
        let total = FrameHeader::SIZE + body_length;

        if total > self.max_frame_size {
            return Err(RpcError::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            });
        }

        if self.read_buf.len() < total {
            self.read_buf.reserve(total - self.read_buf.len());
            return Ok(None);
        }

        let mut data = self.read_buf.split_to(total).freeze();
        data.advance(FrameHeader::SIZE);
        Frame::decode(&header, data).map(Some)
    }
}

impl<T: AsyncRead + Unpin> FrameReader<T> {
    /// Read a complete frame.
    ///
    /// Cancel safe: partially received data stays buffered for the next call.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                trace!("Read frame: kind={:?}", frame.kind());
                return Ok(frame);
            }

            let n = self.inner.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Err(RpcError::ConnectionLost(
                        "connection closed by peer".to_string(),
                    ));
                }
                return Err(RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("incomplete frame: {} bytes buffered", self.read_buf.len()),
                )));
            }
        }
    }
}

/// Frame writer over the write half of a stream
pub struct FrameWriter<T> {
    inner: T,
    max_frame_size: usize,
}

impl<T> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_size: usize) -> Self {
        self.max_frame_size = max_size;
        self
    }

    /// Check that an encoded frame fits the size limit
    pub fn check_size(&self, encoded_len: usize) -> Result<()> {
        if encoded_len > self.max_frame_size {
            return Err(RpcError::FrameTooLarge {
                size: encoded_len,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Encode `frame` and check it against the size limit. Nothing is written,
    /// so an error here leaves the stream usable.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes> {
        let data = frame.encode()?;
        self.check_size(data.len())?;
        Ok(data)
    }
}

impl<T: AsyncWrite + Unpin> FrameWriter<T> {
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let data = self.encode(frame)?;
        trace!("Write frame: kind={:?}, len={}", frame.kind(), data.len());
        self.write_encoded(&data).await
    }

    /// Write a frame produced by [`FrameWriter::encode`]
    pub async fn write_encoded(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// In-process endpoints registered by adapters
#[derive(Default)]
pub struct LocalRegistry {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<BoxedStream>>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`; accepted streams are delivered on the returned channel
    pub fn register(&self, name: &str) -> Result<mpsc::UnboundedReceiver<BoxedStream>> {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.get(name).is_some_and(|tx| !tx.is_closed()) {
            return Err(RpcError::Config(format!(
                "local endpoint {} is already registered",
                name
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(name.to_string(), tx);
        debug!("Registered local endpoint {}", name);
        Ok(rx)
    }

    pub fn unregister(&self, name: &str) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.remove(name).is_some() {
            debug!("Unregistered local endpoint {}", name);
        }
    }

    /// Open an in-memory pipe to the adapter listening on `name`
    pub fn connect(&self, name: &str) -> Result<BoxedStream> {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = listeners.get(name).ok_or_else(|| {
            RpcError::ConnectFailed(format!("no adapter listening on local://{}", name))
        })?;

        let (client, server) = tokio::io::duplex(LOCAL_PIPE_CAPACITY);
        tx.send(Box::new(server))
            .map_err(|_| RpcError::ConnectFailed(format!("local://{} is shutting down", name)))?;
        Ok(Box::new(client))
    }
}

/// Dials TCP endpoints and resolves local endpoints through a [`LocalRegistry`]
pub struct DefaultConnector {
    local: Arc<LocalRegistry>,
}

impl DefaultConnector {
    pub fn new(local: Arc<LocalRegistry>) -> Self {
        Self { local }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| RpcError::ConnectFailed(format!("{}: {}", addr, e)))?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Endpoint::Local(name) => self.local.connect(name),
        }
    }
}
