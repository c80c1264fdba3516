//! Typed payload encoding
//!
//! Every type sent through [`crate::manager::HostManager::send_value`]
//! names its wire encoding through [`WireValue`]:
//!
//! - [`FixedLayout`]: the value's bytes are sent as they are in memory.
//!   The receiver knows the size statically.
//! - [`Serialized`]: the value goes through bincode first. The receiver
//!   learns the size by probing.
//!
//! Nothing on the wire says which encoding or type was used; both sides
//! agree on the type per tag.
//!
//! Compression is separate: a [`CompressionPolicy`] wraps byte payloads at
//! or above a size threshold.

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Payloads at least this large are compressed by default
pub const MIN_COMPRESS_SIZE: usize = 10_000;

/// Failure to turn a value into bytes or back
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("expected {expected} bytes for a fixed-layout value, got {actual}")]
    Size { expected: usize, actual: usize },

    #[error("compression failed: {0}")]
    Compression(String),
}

// ─────────────────────────────────────────────────────────────────
// Encodings
// ─────────────────────────────────────────────────────────────────

/// Strategy turning a `T` into wire bytes
pub trait Encoding<T> {
    /// Size of every encoded value, if known without looking at one
    const FIXED_SIZE: Option<usize>;

    fn encode(value: &T) -> Result<Bytes, CodecError>;

    fn decode(bytes: &[u8]) -> Result<T, CodecError>;
}

/// Raw in-memory bytes
#[derive(Debug, Clone, Copy)]
pub struct FixedLayout;

/// bincode over serde
#[derive(Debug, Clone, Copy)]
pub struct Serialized;

impl<T> Encoding<T> for FixedLayout
where
    T: IntoBytes + FromBytes + Immutable,
{
    const FIXED_SIZE: Option<usize> = Some(std::mem::size_of::<T>());

    fn encode(value: &T) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn decode(bytes: &[u8]) -> Result<T, CodecError> {
        T::read_from_bytes(bytes).map_err(|_| CodecError::Size {
            expected: std::mem::size_of::<T>(),
            actual: bytes.len(),
        })
    }
}

impl<T> Encoding<T> for Serialized
where
    T: Serialize + DeserializeOwned,
{
    const FIXED_SIZE: Option<usize> = None;

    fn encode(value: &T) -> Result<Bytes, CodecError> {
        bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<T, CodecError> {
        let (value, used) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        if used != bytes.len() {
            return Err(CodecError::Decode(format!(
                "{} trailing bytes after value",
                bytes.len() - used
            )));
        }
        Ok(value)
    }
}

/// A type that can travel through the typed send/receive calls
pub trait WireValue: Sized {
    type Encoding: Encoding<Self>;
}

/// Declare types whose in-memory bytes are their wire form
#[macro_export]
macro_rules! fixed_layout_value {
    ($($t:ty),* $(,)?) => {
        $(impl $crate::codec::WireValue for $t {
            type Encoding = $crate::codec::FixedLayout;
        })*
    };
}

/// Declare types that travel bincode-serialized
#[macro_export]
macro_rules! serialized_value {
    ($($t:ty),* $(,)?) => {
        $(impl $crate::codec::WireValue for $t {
            type Encoding = $crate::codec::Serialized;
        })*
    };
}

fixed_layout_value!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);
serialized_value!(String, crate::topology::DeviceProperties);

impl<T: Serialize + DeserializeOwned> WireValue for Vec<T> {
    type Encoding = Serialized;
}

impl<T: Serialize + DeserializeOwned> WireValue for Option<T> {
    type Encoding = Serialized;
}

/// Encode with the type's declared encoding
pub fn encode<T: WireValue>(value: &T) -> Result<Bytes, CodecError> {
    <T::Encoding as Encoding<T>>::encode(value)
}

/// Decode with the type's declared encoding
pub fn decode<T: WireValue>(bytes: &[u8]) -> Result<T, CodecError> {
    <T::Encoding as Encoding<T>>::decode(bytes)
}

/// Static wire size of `T`, if it has one
pub fn fixed_size<T: WireValue>() -> Option<usize> {
    <T::Encoding as Encoding<T>>::FIXED_SIZE
}

// ─────────────────────────────────────────────────────────────────
// Compression
// ─────────────────────────────────────────────────────────────────

/// Pluggable byte compressor
pub trait Compressor: Send + Sync {
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// zlib via flate2
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    level: u32,
}

impl ZlibCompressor {
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self::new(6)
    }
}

impl Compressor for ZlibCompressor {
    fn name(&self) -> &'static str {
        "zlib"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
}

const RAW_MARKER: u8 = 0;
const COMPRESSED_MARKER: u8 = 1;

/// Compressor plus the size from which it is applied
///
/// Packed payloads start with one marker byte saying whether the rest is
/// compressed, so receivers do not need to know the sender's threshold.
#[derive(Clone)]
pub struct CompressionPolicy {
    compressor: Arc<dyn Compressor>,
    min_size: usize,
}

impl CompressionPolicy {
    pub fn new(compressor: Arc<dyn Compressor>, min_size: usize) -> Self {
        Self {
            compressor,
            min_size,
        }
    }

    pub fn zlib(level: u32, min_size: usize) -> Self {
        Self::new(Arc::new(ZlibCompressor::new(level)), min_size)
    }

    /// Never compresses; packed payloads still carry the marker byte
    pub fn disabled() -> Self {
        Self::new(Arc::new(ZlibCompressor::default()), usize::MAX)
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn compressor(&self) -> &dyn Compressor {
        self.compressor.as_ref()
    }

    pub fn should_compress(&self, len: usize) -> bool {
        len >= self.min_size
    }

    /// Add the marker and compress if the payload is large enough
    pub fn pack(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        let (marker, body) = if self.should_compress(data.len()) {
            (COMPRESSED_MARKER, self.compressor.compress(data)?)
        } else {
            (RAW_MARKER, data.to_vec())
        };
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(marker);
        out.extend_from_slice(&body);
        Ok(Bytes::from(out))
    }

    /// Reverse [`CompressionPolicy::pack`]
    pub fn unpack(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        match data.split_first() {
            Some((&RAW_MARKER, body)) => Ok(Bytes::copy_from_slice(body)),
            Some((&COMPRESSED_MARKER, body)) => Ok(Bytes::from(self.compressor.decompress(body)?)),
            Some((marker, _)) => Err(CodecError::Decode(format!(
                "unknown compression marker {}",
                marker
            ))),
            None => Err(CodecError::Decode("empty packed payload".to_string())),
        }
    }
}

impl std::fmt::Debug for CompressionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionPolicy")
            .field("compressor", &self.compressor.name())
            .field("min_size", &self.min_size)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
