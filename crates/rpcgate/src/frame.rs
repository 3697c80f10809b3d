//! Message framing
//!
//! Every message starts with a fixed 14-byte header; the body layout depends
//! on the frame kind. Argument and result payloads are opaque bytes.
//!
//! ```text
//! +--------+--------+--------+--------+
//! |          magic "RPCG"             |
//! +--------+--------+--------+--------+
//! |  vers  |  kind  |   request_id    |
//! +--------+--------+--------+--------+
//! |   request_id    |   body_length   |
//! +--------+--------+--------+--------+
//! |   body_length   |
//! +--------+--------+
//! ```
//!
//! All integers are little-endian. Request id 0 marks a oneway request.

use crate::error::{Result, RpcError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Frame magic
pub const FRAME_MAGIC: [u8; 4] = *b"RPCG";
/// Framing version
pub const FRAME_VERSION: u8 = 1;
/// Request id used by oneway requests
pub const ONEWAY_REQUEST_ID: u32 = 0;

/// Request context: string key/value pairs carried with a request
pub type Context = HashMap<String, String>;

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Reply = 2,
    ValidateConnection = 3,
    CloseConnection = 4,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            2 => Some(Self::Reply),
            3 => Some(Self::ValidateConnection),
            4 => Some(Self::CloseConnection),
            _ => None,
        }
    }
}

/// Operation mode, fixed by the interface definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum OperationMode {
    #[default]
    Normal = 0,
    /// Repeated execution has no additional observable effect
    Idempotent = 2,
}

impl OperationMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            2 => Some(Self::Idempotent),
            _ => None,
        }
    }
}

/// Frame header (14 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub request_id: u32,
    pub body_length: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 14;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.request_id);
        buf.put_u32_le(self.body_length);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(RpcError::Protocol(format!(
                "frame header too short: {} bytes",
                data.len()
            )));
        }
        if data[..4] != FRAME_MAGIC {
            return Err(RpcError::Protocol("bad frame magic".to_string()));
        }
        if data[4] != FRAME_VERSION {
            return Err(RpcError::Protocol(format!(
                "unsupported framing version {}",
                data[4]
            )));
        }
        let kind = FrameKind::from_u8(data[5])
            .ok_or_else(|| RpcError::Protocol(format!("unknown frame kind {}", data[5])))?;
        let request_id = u32::from_le_bytes([data[6], data[7], data[8], data[9]]);
        let body_length = u32::from_le_bytes([data[10], data[11], data[12], data[13]]);

        Ok(Self {
            kind,
            request_id,
            body_length,
        })
    }
}

/// Request frame
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub request_id: u32,
    pub identity: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    pub args: Bytes,
}

impl RequestFrame {
    pub fn is_oneway(&self) -> bool {
        self.request_id == ONEWAY_REQUEST_ID
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        put_string(buf, "identity", &self.identity)?;
        put_string(buf, "operation", &self.operation)?;
        buf.put_u8(self.mode as u8);
        let count = u16::try_from(self.context.len()).map_err(|_| {
            RpcError::Encoding(format!(
                "{} context entries, at most {} allowed",
                self.context.len(),
                u16::MAX
            ))
        })?;
        buf.put_u16_le(count);
        for (key, value) in &self.context {
            put_string(buf, "context key", key)?;
            put_string(buf, "context value", value)?;
        }
        buf.put_slice(&self.args);
        Ok(())
    }

    fn decode_body(request_id: u32, mut body: Bytes) -> Result<Self> {
        let identity = get_string(&mut body)?;
        let operation = get_string(&mut body)?;
        if body.remaining() < 3 {
            return Err(RpcError::Protocol("truncated request".to_string()));
        }
        let mode_raw = body.get_u8();
        let mode = OperationMode::from_u8(mode_raw)
            .ok_or_else(|| RpcError::Protocol(format!("unknown operation mode {}", mode_raw)))?;
        let count = body.get_u16_le();
        let mut context = Context::with_capacity(count as usize);
        for _ in 0..count {
            let key = get_string(&mut body)?;
            let value = get_string(&mut body)?;
            context.insert(key, value);
        }

        Ok(Self {
            request_id,
            identity,
            operation,
            mode,
            context,
            args: body,
        })
    }
}

/// Reply status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    OperationNotExist = 3,
    AdapterUnavailable = 4,
    Unknown = 5,
}

impl ReplyStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::UserException),
            2 => Some(Self::ObjectNotExist),
            3 => Some(Self::OperationNotExist),
            4 => Some(Self::AdapterUnavailable),
            5 => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Reply frame
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyFrame {
    pub request_id: u32,
    pub status: ReplyStatus,
    pub body: Bytes,
}

impl ReplyFrame {
    pub fn ok(request_id: u32, result: Bytes) -> Self {
        Self {
            request_id,
            status: ReplyStatus::Ok,
            body: result,
        }
    }

    /// Build the reply reporting `error` to the client
    pub fn from_error(request_id: u32, error: &RpcError) -> Self {
        let mut buf = BytesMut::new();
        let status = match error {
            RpcError::Application(payload) => {
                return Self {
                    request_id,
                    status: ReplyStatus::UserException,
                    body: payload.clone(),
                };
            }
            RpcError::ObjectNotExist(identity) => {
                put_truncated(&mut buf, identity);
                ReplyStatus::ObjectNotExist
            }
            RpcError::OperationNotExist {
                identity,
                operation,
            } => {
                put_truncated(&mut buf, identity);
                put_truncated(&mut buf, operation);
                ReplyStatus::OperationNotExist
            }
            RpcError::AdapterUnavailable(adapter) => {
                put_truncated(&mut buf, adapter);
                ReplyStatus::AdapterUnavailable
            }
            other => {
                put_truncated(&mut buf, &other.to_string());
                ReplyStatus::Unknown
            }
        };

        Self {
            request_id,
            status,
            body: buf.freeze(),
        }
    }

    /// Convert into the caller-visible result
    pub fn into_result(self) -> Result<Bytes> {
        let mut body = self.body;
        match self.status {
            ReplyStatus::Ok => Ok(body),
            ReplyStatus::UserException => Err(RpcError::Application(body)),
            ReplyStatus::ObjectNotExist => Err(RpcError::ObjectNotExist(get_string(&mut body)?)),
            ReplyStatus::OperationNotExist => {
                let identity = get_string(&mut body)?;
                let operation = get_string(&mut body)?;
                Err(RpcError::OperationNotExist {
                    identity,
                    operation,
                })
            }
            ReplyStatus::AdapterUnavailable => {
                Err(RpcError::AdapterUnavailable(get_string(&mut body)?))
            }
            ReplyStatus::Unknown => Err(RpcError::Unknown(get_string(&mut body)?)),
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(RequestFrame),
    Reply(ReplyFrame),
    ValidateConnection,
    CloseConnection,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Request(_) => FrameKind::Request,
            Self::Reply(_) => FrameKind::Reply,
            Self::ValidateConnection => FrameKind::ValidateConnection,
            Self::CloseConnection => FrameKind::CloseConnection,
        }
    }

    fn request_id(&self) -> u32 {
        match self {
            Self::Request(request) => request.request_id,
            Self::Reply(reply) => reply.request_id,
            Self::ValidateConnection | Self::CloseConnection => 0,
        }
    }

    /// Encode header and body. Fails, before anything is written, if a string
    /// or count does not fit its length prefix.
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        match self {
            Self::Request(request) => request.encode_body(&mut body)?,
            Self::Reply(reply) => {
                body.put_u8(reply.status as u8);
                body.put_slice(&reply.body);
            }
            Self::ValidateConnection | Self::CloseConnection => {}
        }

        let body_length = u32::try_from(body.len())
            .map_err(|_| RpcError::Encoding(format!("{} byte body", body.len())))?;
        let header = FrameHeader {
            kind: self.kind(),
            request_id: self.request_id(),
            body_length,
        };

        let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + body.len());
        header.encode(&mut buf);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode a frame body whose header has already been parsed
    pub fn decode(header: &FrameHeader, mut body: Bytes) -> Result<Self> {
        match header.kind {
            FrameKind::Request => Ok(Self::Request(RequestFrame::decode_body(
                header.request_id,
                body,
            )?)),
            FrameKind::Reply => {
                if body.is_empty() {
                    return Err(RpcError::Protocol("reply without status".to_string()));
                }
                let raw = body.get_u8();
                let status = ReplyStatus::from_u8(raw)
                    .ok_or_else(|| RpcError::Protocol(format!("unknown reply status {}", raw)))?;
                Ok(Self::Reply(ReplyFrame {
                    request_id: header.request_id,
                    status,
                    body,
                }))
            }
            FrameKind::ValidateConnection => Ok(Self::ValidateConnection),
            FrameKind::CloseConnection => Ok(Self::CloseConnection),
        }
    }
}

fn put_string(buf: &mut BytesMut, field: &str, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        RpcError::Encoding(format!(
            "{} is {} bytes, at most {} allowed",
            field,
            value.len(),
            u16::MAX
        ))
    })?;
    buf.put_u16_le(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Diagnostic strings in error replies are cut at a character boundary
fn put_truncated(buf: &mut BytesMut, value: &str) {
    let mut end = value.len().min(u16::MAX as usize);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_u16_le(end as u16);
    buf.put_slice(&value.as_bytes()[..end]);
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(RpcError::Protocol("truncated string length".to_string()));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(RpcError::Protocol(format!(
            "truncated string: need {} bytes, have {}",
            len,
            buf.remaining()
        )));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| RpcError::Protocol("string is not valid UTF-8".to_string()))
}
