//! Binary frame format of the realtime socket.
//!
//! Every frame is a 16-byte big-endian header followed by an opaque payload:
//!
//! ```text
//! packet_length:u32 | header_length:u16 | version:u16 | operation:i32 | sequence:i32 | payload
//! ```
//!
//! MESSAGE payloads with version 2 are zlib streams that inflate to a run of
//! inner frames.

use std::io::Read;

use flate2::read::ZlibDecoder;
use thiserror::Error;

/// Fixed header size in bytes.
pub const HEADER_LENGTH: usize = 16;
/// Largest payload accepted on decode.
pub const MAX_BODY_SIZE: usize = 2048;
/// Largest packet accepted on decode.
pub const MAX_PACKET_LENGTH: usize = HEADER_LENGTH + MAX_BODY_SIZE;

const PACKET_LENGTH_OFFSET: usize = 0;
const HEADER_LENGTH_OFFSET: usize = 4;
const VERSION_OFFSET: usize = 6;
const OPERATION_OFFSET: usize = 8;
const SEQUENCE_OFFSET: usize = 12;

const ZLIB_VERSION: u16 = 2;
const BROTLI_VERSION: u16 = 3;

/// Operation codes understood by the stream.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    Heartbeat,
    HeartbeatReply,
    Message,
    Auth,
    AuthReply,
    Other(i32),
}

impl Operation {
    pub const HEARTBEAT: i32 = 2;
    pub const HEARTBEAT_REPLY: i32 = 3;
    pub const MESSAGE: i32 = 5;
    pub const AUTH: i32 = 7;
    pub const AUTH_REPLY: i32 = 8;

    pub fn code(self) -> i32 {
        match self {
            Self::Heartbeat => Self::HEARTBEAT,
            Self::HeartbeatReply => Self::HEARTBEAT_REPLY,
            Self::Message => Self::MESSAGE,
            Self::Auth => Self::AUTH,
            Self::AuthReply => Self::AUTH_REPLY,
            Self::Other(code) => code,
        }
    }
}

impl From<i32> for Operation {
    fn from(code: i32) -> Self {
        match code {
            Self::HEARTBEAT => Self::Heartbeat,
            Self::HEARTBEAT_REPLY => Self::HeartbeatReply,
            Self::MESSAGE => Self::Message,
            Self::AUTH => Self::Auth,
            Self::AUTH_REPLY => Self::AuthReply,
            other => Self::Other(other),
        }
    }
}

/// One decoded or to-be-encoded frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub version: u16,
    pub operation: Operation,
    pub sequence: i32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(operation: Operation, sequence: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            version: 0,
            operation,
            sequence,
            payload: payload.into(),
        }
    }

    /// AUTH frame carrying the session's one-time auth payload.
    pub fn auth(auth_body: &str) -> Self {
        Self::new(Operation::Auth, 0, auth_body.as_bytes())
    }

    /// Empty-bodied HEARTBEAT frame.
    pub fn heartbeat(sequence: i32) -> Self {
        Self::new(Operation::Heartbeat, sequence, Vec::new())
    }

    /// Reads the operation from a buffer's header without validating the rest.
    pub fn peek_operation(buf: &[u8]) -> Option<Operation> {
        Header::parse(buf)
            .ok()
            .map(|header| Operation::from(header.operation))
    }

    /// Total bytes on the wire, header included.
    pub fn packet_length(&self) -> usize {
        HEADER_LENGTH + self.payload.len()
    }

    /// Serializes the frame. Encoding never enforces the decode-side body
    /// limit; callers control what they send.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.packet_length());
        buf.extend_from_slice(&(self.packet_length() as u32).to_be_bytes());
        buf.extend_from_slice(&(HEADER_LENGTH as u16).to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.operation.code().to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parses one frame from the front of `buf`.
    ///
    /// Any error means "drop this frame and keep reading"; none of them are
    /// fatal to the stream.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let header = Header::parse(buf)?;

        if header.packet_length > MAX_PACKET_LENGTH {
            return Err(FrameError::PacketTooLarge {
                packet_length: header.packet_length,
            });
        }
        if header.packet_length <= HEADER_LENGTH {
            return Err(FrameError::EmptyBody {
                packet_length: header.packet_length,
            });
        }
        if buf.len() < header.packet_length {
            return Err(FrameError::Truncated {
                packet_length: header.packet_length,
                available: buf.len(),
            });
        }

        let end = header.packet_length;
        Ok(header.into_frame(&buf[HEADER_LENGTH..end]))
    }

    /// Splits a MESSAGE payload into its individual JSON bodies.
    ///
    /// A payload that starts with a well-formed inner frame is treated as a
    /// run of concatenated frames and each inner body is returned in order.
    /// Anything else is a single body.
    pub fn bodies(&self) -> Vec<&[u8]> {
        split_bodies(&self.payload)
    }

    /// Like [`Frame::bodies`], inflating a zlib payload first.
    ///
    /// Brotli payloads (version 3) are not supported.
    pub fn message_bodies(&self) -> Result<Vec<Vec<u8>>, FrameError> {
        match self.version {
            ZLIB_VERSION => {
                let inflated = inflate(&self.payload)?;
                Ok(to_owned_bodies(split_bodies(&inflated)))
            }
            BROTLI_VERSION => Err(FrameError::UnsupportedVersion {
                version: self.version,
            }),
            _ => Ok(to_owned_bodies(self.bodies())),
        }
    }
}

// A 2 KiB zlib payload inflates to at most a few MiB, so no cap is applied.
fn inflate(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut inflated = Vec::with_capacity(payload.len() * 4);
    ZlibDecoder::new(payload)
        .read_to_end(&mut inflated)
        .map_err(|err| FrameError::Inflate {
            reason: err.to_string(),
        })?;
    Ok(inflated)
}

fn to_owned_bodies(bodies: Vec<&[u8]>) -> Vec<Vec<u8>> {
    bodies.into_iter().map(<[u8]>::to_vec).collect()
}

fn split_bodies(payload: &[u8]) -> Vec<&[u8]> {
    let mut bodies = Vec::new();
    let mut rest = payload;

    while let Ok(header) = Header::parse(rest) {
        if header.packet_length <= HEADER_LENGTH || header.packet_length > rest.len() {
            break;
        }
        bodies.push(&rest[HEADER_LENGTH..header.packet_length]);
        rest = &rest[header.packet_length..];
    }

    if bodies.is_empty() {
        return vec![payload];
    }
    if !rest.is_empty() {
        bodies.push(rest);
    }
    bodies
}

struct Header {
    packet_length: usize,
    version: u16,
    operation: i32,
    sequence: i32,
}

impl Header {
    fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LENGTH {
            return Err(FrameError::ShortBuffer { len: buf.len() });
        }

        let header_length = read_u16(buf, HEADER_LENGTH_OFFSET);
        if header_length as usize != HEADER_LENGTH {
            return Err(FrameError::HeaderLength { header_length });
        }

        Ok(Self {
            packet_length: read_u32(buf, PACKET_LENGTH_OFFSET) as usize,
            version: read_u16(buf, VERSION_OFFSET),
            operation: read_u32(buf, OPERATION_OFFSET) as i32,
            sequence: read_u32(buf, SEQUENCE_OFFSET) as i32,
        })
    }

    fn into_frame(self, payload: &[u8]) -> Frame {
        Frame {
            version: self.version,
            operation: Operation::from(self.operation),
            sequence: self.sequence,
            payload: payload.to_vec(),
        }
    }
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Reasons a received buffer is dropped instead of dispatched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer of {len} bytes is shorter than the 16-byte header")]
    ShortBuffer { len: usize },

    #[error("header length {header_length} is not 16")]
    HeaderLength { header_length: u16 },

    #[error("packet length {packet_length} exceeds 2064")]
    PacketTooLarge { packet_length: usize },

    #[error("packet length {packet_length} leaves no body")]
    EmptyBody { packet_length: usize },

    #[error("packet length {packet_length} exceeds the {available} bytes received")]
    Truncated {
        packet_length: usize,
        available: usize,
    },

    #[error("payload version {version} is not supported")]
    UnsupportedVersion { version: u16 },

    #[error("zlib payload failed to inflate: {reason}")]
    Inflate { reason: String },
}
