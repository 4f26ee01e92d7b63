//! Wire messages and their byte layout.
//!
//! Every message travels as one length-delimited frame. The first byte of
//! the payload names the message:
//!
//! ```text
//! request  'C'  u16be(method_len) method args
//! request  'N'  stream_id
//! response 'R'  status result
//! response 'X'  flags value          flags: bit0 valid, bit1 raw
//! response 'F'  message              protocol fault
//! ```
//!
//! `args`, `result` and `value` are opaque to this layer: codec output, raw
//! chunk bytes, or a stream id in UTF-8 depending on the status.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

const TAG_CALL: u8 = b'C';
const TAG_NEXT: u8 = b'N';
const TAG_CALL_RESPONSE: u8 = b'R';
const TAG_NEXT_RESPONSE: u8 = b'X';
const TAG_FAULT: u8 = b'F';

const FLAG_VALID: u8 = 0b01;
const FLAG_RAW: u8 = 0b10;

/// Framing codec shared by server and client.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// A frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("unknown call status {0:#04x}")]
    UnknownStatus(u8),
    #[error("frame truncated")]
    Truncated,
    #[error("method name too long ({0} bytes)")]
    MethodTooLong(usize),
    #[error("text field is not UTF-8")]
    InvalidUtf8,
}

// =============================================================================
// Status
// =============================================================================

/// How to read the result of a call response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `r`: result is the encoded value.
    Plain,
    /// `n`: the method returned nothing; result is empty.
    Null,
    /// `e`: result is UTF-8 error text.
    Error,
    /// `c`: result is the id of a chunk stream holding the encoded value.
    Chunked,
    /// `i`: result is the id of an item stream.
    Iterator,
}

impl Status {
    pub fn as_byte(self) -> u8 {
        match self {
            Status::Plain => b'r',
            Status::Null => b'n',
            Status::Error => b'e',
            Status::Chunked => b'c',
            Status::Iterator => b'i',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            b'r' => Ok(Status::Plain),
            b'n' => Ok(Status::Null),
            b'e' => Ok(Status::Error),
            b'c' => Ok(Status::Chunked),
            b'i' => Ok(Status::Iterator),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_byte() as char)
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Run `method` with codec-encoded positional `args`.
    Call { method: String, args: Bytes },
    /// Pull the next element of a registered stream.
    GetNext { id: String },
}

/// Answer to [`Request::Call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    pub status: Status,
    pub result: Bytes,
}

impl CallResponse {
    pub fn new(status: Status, result: impl Into<Bytes>) -> Self {
        Self {
            status,
            result: result.into(),
        }
    }

    pub fn error(message: impl fmt::Display) -> Self {
        Self::new(Status::Error, message.to_string())
    }
}

/// Answer to [`Request::GetNext`].
///
/// An invalid response with an empty value ends the stream. An invalid
/// response carrying a value ends it with a failure; the value is the
/// UTF-8 error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextResponse {
    /// `false` once the stream is exhausted or has failed.
    pub is_valid: bool,
    /// `value` is UTF-8 text or chunk bytes rather than codec output.
    pub is_raw: bool,
    pub value: Bytes,
}

impl NextResponse {
    /// The response that ends a stream.
    pub fn exhausted() -> Self {
        Self {
            is_valid: false,
            is_raw: false,
            value: Bytes::new(),
        }
    }

    /// The response that ends a stream with an error.
    pub fn failed(message: impl fmt::Display) -> Self {
        let mut message = message.to_string();
        if message.is_empty() {
            message.push_str("item failed");
        }
        Self {
            is_valid: false,
            is_raw: true,
            value: Bytes::from(message),
        }
    }

    /// Error text of a [`failed`](NextResponse::failed) response.
    pub fn failure(&self) -> Option<String> {
        (!self.is_valid && !self.value.is_empty())
            .then(|| String::from_utf8_lossy(&self.value).into_owned())
    }
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Call(CallResponse),
    Next(NextResponse),
    /// The request was misused or could not be served at all.
    Fault(String),
}

impl Request {
    pub fn encode(&self) -> Bytes {
        match self {
            Request::Call { method, args } => {
                let mut buf = BytesMut::with_capacity(3 + method.len() + args.len());
                buf.put_u8(TAG_CALL);
                // Method names longer than u16::MAX are rejected by
                // `WireWorker` before encoding.
                buf.put_u16(method.len() as u16);
                buf.put_slice(method.as_bytes());
                buf.put_slice(args);
                buf.freeze()
            }
            Request::GetNext { id } => {
                let mut buf = BytesMut::with_capacity(1 + id.len());
                buf.put_u8(TAG_NEXT);
                buf.put_slice(id.as_bytes());
                buf.freeze()
            }
        }
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, ProtocolError> {
        if !frame.has_remaining() {
            return Err(ProtocolError::Empty);
        }
        match frame.get_u8() {
            TAG_CALL => {
                if frame.remaining() < 2 {
                    return Err(ProtocolError::Truncated);
                }
                let len = usize::from(frame.get_u16());
                if frame.remaining() < len {
                    return Err(ProtocolError::Truncated);
                }
                let method = utf8(frame.split_to(len))?;
                Ok(Request::Call {
                    method,
                    args: frame,
                })
            }
            TAG_NEXT => Ok(Request::GetNext { id: utf8(frame)? }),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

impl Response {
    pub fn encode(&self) -> Bytes {
        match self {
            Response::Call(response) => {
                let mut buf = BytesMut::with_capacity(2 + response.result.len());
                buf.put_u8(TAG_CALL_RESPONSE);
                buf.put_u8(response.status.as_byte());
                buf.put_slice(&response.result);
                buf.freeze()
            }
            Response::Next(response) => {
                let mut flags = 0;
                if response.is_valid {
                    flags |= FLAG_VALID;
                }
                if response.is_raw {
                    flags |= FLAG_RAW;
                }
                let mut buf = BytesMut::with_capacity(2 + response.value.len());
                buf.put_u8(TAG_NEXT_RESPONSE);
                buf.put_u8(flags);
                buf.put_slice(&response.value);
                buf.freeze()
            }
            Response::Fault(message) => {
                let mut buf = BytesMut::with_capacity(1 + message.len());
                buf.put_u8(TAG_FAULT);
                buf.put_slice(message.as_bytes());
                buf.freeze()
            }
        }
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, ProtocolError> {
        if !frame.has_remaining() {
            return Err(ProtocolError::Empty);
        }
        match frame.get_u8() {
            TAG_CALL_RESPONSE => {
                if !frame.has_remaining() {
                    return Err(ProtocolError::Truncated);
                }
                let status = Status::from_byte(frame.get_u8())?;
                Ok(Response::Call(CallResponse {
                    status,
                    result: frame,
                }))
            }
            TAG_NEXT_RESPONSE => {
                if !frame.has_remaining() {
                    return Err(ProtocolError::Truncated);
                }
                let flags = frame.get_u8();
                Ok(Response::Next(NextResponse {
                    is_valid: flags & FLAG_VALID != 0,
                    is_raw: flags & FLAG_RAW != 0,
                    value: frame,
                }))
            }
            TAG_FAULT => Ok(Response::Fault(utf8(frame)?)),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

fn utf8(bytes: Bytes) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}
