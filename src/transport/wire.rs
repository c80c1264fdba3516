//! Wire format of the TCP transport
//!
//! Connections open with one length-prefixed JSON handshake in each
//! direction:
//!
//!   [4-byte big-endian length][JSON payload]
//!
//! after which only binary frames flow:
//!
//!   [u8 kind][i32 tag, big-endian][u32 length, big-endian][payload]
//!
//! An `Abort` frame carries the exit code in the tag field and the reason as
//! UTF-8 payload.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::MAX_MESSAGE_SIZE;
use crate::tag::Tag;
use crate::topology::HostId;

// ─────────────────────────────────────────────────────────────────
// Protocol Version
// ─────────────────────────────────────────────────────────────────

/// Current protocol version
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion {
    major: 1,
    minor: 0,
    patch: 0,
};

/// Protocol version identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Check if this version is compatible with another version
    ///
    /// Compatibility rules:
    /// - Major version must match exactly
    /// - Minor version of self must be >= other (backward compatible)
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major && self.minor >= other.minor
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

// ─────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────

/// Connection setup messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Handshake {
    /// Sent by the dialing host
    Hello {
        host_id: HostId,
        host_count: usize,
        job_id: String,
        protocol_version: ProtocolVersion,
    },

    /// Accepting host agrees
    HelloAck {
        host_id: HostId,
        job_id: String,
        protocol_version: ProtocolVersion,
    },

    /// Accepting host refuses the connection
    Reject { reason: String },
}

impl Handshake {
    pub fn type_name(&self) -> &'static str {
        match self {
            Handshake::Hello { .. } => "HELLO",
            Handshake::HelloAck { .. } => "HELLO_ACK",
            Handshake::Reject { .. } => "REJECT",
        }
    }
}

const MAX_HANDSHAKE_SIZE: u32 = 64 * 1024;

/// Read a length-prefixed JSON handshake message
pub async fn read_handshake<R: AsyncReadExt + Unpin>(reader: &mut R) -> anyhow::Result<Handshake> {
    let len = reader.read_u32().await?;
    if len > MAX_HANDSHAKE_SIZE {
        return Err(anyhow::anyhow!(
            "Handshake too large: {} bytes (max {})",
            len,
            MAX_HANDSHAKE_SIZE
        ));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;

    Ok(serde_json::from_slice(&buf)?)
}

/// Write a length-prefixed JSON handshake message
pub async fn write_handshake<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &Handshake,
) -> anyhow::Result<()> {
    let json = serde_json::to_vec(msg)?;

    writer.write_u32(json.len() as u32).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;

    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Frames
// ─────────────────────────────────────────────────────────────────

/// Frame discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Data = 1,
    Abort = 2,
    Goodbye = 3,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameKind::Data),
            2 => Some(FrameKind::Abort),
            3 => Some(FrameKind::Goodbye),
            _ => None,
        }
    }
}

/// Header length in bytes
pub const FRAME_HEADER_LEN: usize = 9;

/// One unit on an established connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub tag: Tag,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(tag: Tag, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Data,
            tag,
            payload,
        }
    }

    pub fn abort(code: i32, reason: &str) -> Self {
        Self {
            kind: FrameKind::Abort,
            tag: code,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    pub fn goodbye() -> Self {
        Self {
            kind: FrameKind::Goodbye,
            tag: 0,
            payload: Bytes::new(),
        }
    }

    pub fn header(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0] = self.kind as u8;
        header[1..5].copy_from_slice(&self.tag.to_be_bytes());
        header[5..9].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        header
    }
}

/// Read one frame. Returns `None` on a clean end of stream between frames.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> anyhow::Result<Option<Frame>> {
    let kind = match reader.read_u8().await {
        Ok(k) => k,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let kind = FrameKind::from_u8(kind)
        .ok_or_else(|| anyhow::anyhow!("Unknown frame kind {}", kind))?;
    let tag = reader.read_i32().await?;
    let len = reader.read_u32().await? as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow::anyhow!(
            "Frame too large: {} bytes (max {})",
            len,
            MAX_MESSAGE_SIZE
        ));
    }

    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;

    Ok(Some(Frame {
        kind,
        tag,
        payload: buf.freeze(),
    }))
}

/// Write one frame without flushing
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> anyhow::Result<()> {
    writer.write_all(&frame.header()).await?;
    writer.write_all(&frame.payload).await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
