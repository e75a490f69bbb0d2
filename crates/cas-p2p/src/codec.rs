use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{TransportError, TransportResult};
use crate::message::{Rpc, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};

/// Reads one message at a time from a connection.
///
/// A decoder must return an error rather than panic on malformed input; the
/// transport closes the connection on the first error and never tries to
/// resynchronize.
#[async_trait]
pub trait Decoder: Send + Sync {
    async fn decode(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> TransportResult<Rpc>;
}

/// Treats every single byte as a message. Keeps a connection alive without
/// interpreting its content.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopDecoder;

#[async_trait]
impl Decoder for NopDecoder {
    async fn decode(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> TransportResult<Rpc> {
        let mut byte = [0u8; 1];
        match fill(reader, &mut byte).await? {
            0 => Err(TransportError::ConnectionClosed),
            _ => Ok(Rpc::new(byte.to_vec())),
        }
    }
}

/// Raw payloads framed as `[4 bytes big-endian length][payload]`.
#[derive(Clone, Copy, Debug)]
pub struct LengthPrefixedDecoder {
    max_frame_size: usize,
}

impl LengthPrefixedDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Frame a payload the way [`Decoder::decode`] expects it.
    pub fn encode(&self, payload: &[u8]) -> TransportResult<Vec<u8>> {
        encode_frame(payload, self.max_frame_size)
    }
}

impl Default for LengthPrefixedDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

#[async_trait]
impl Decoder for LengthPrefixedDecoder {
    async fn decode(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> TransportResult<Rpc> {
        let payload = read_frame(reader, self.max_frame_size).await?;
        Ok(Rpc::new(payload))
    }
}

/// Length-prefixed frames whose body is a bincode-encoded [`Rpc`].
#[derive(Clone, Copy, Debug)]
pub struct BincodeDecoder {
    max_frame_size: usize,
}

impl BincodeDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Serialize and frame a message.
    pub fn encode(&self, rpc: &Rpc) -> TransportResult<Vec<u8>> {
        let body = bincode::serialize(rpc).map_err(|e| TransportError::Decode(e.to_string()))?;
        encode_frame(&body, self.max_frame_size)
    }
}

impl Default for BincodeDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

#[async_trait]
impl Decoder for BincodeDecoder {
    async fn decode(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> TransportResult<Rpc> {
        let body = read_frame(reader, self.max_frame_size).await?;
        bincode::deserialize(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// Prefix `payload` with its big-endian u32 length.
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> TransportResult<Vec<u8>> {
    if payload.len() > max_frame_size || payload.len() > u32::MAX as usize {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            max: max_frame_size.min(u32::MAX as usize),
        });
    }
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Read one length-prefixed frame.
///
/// End of stream before the first header byte is a normal disconnect
/// ([`TransportError::ConnectionClosed`]); anywhere later it is a
/// [`TransportError::ShortRead`]. The length is checked against
/// `max_frame_size` before any payload buffer is allocated.
pub async fn read_frame(
    reader: &mut (dyn AsyncRead + Unpin + Send),
    max_frame_size: usize,
) -> TransportResult<Vec<u8>> {
    let mut header = [0u8; LENGTH_PREFIX_SIZE];
    match fill(reader, &mut header).await? {
        0 => return Err(TransportError::ConnectionClosed),
        n if n < LENGTH_PREFIX_SIZE => {
            return Err(TransportError::ShortRead {
                expected: LENGTH_PREFIX_SIZE,
                got: n,
            })
        }
        _ => {}
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_size {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }

    let mut payload = vec![0u8; len];
    let got = fill(reader, &mut payload).await?;
    if got < len {
        return Err(TransportError::ShortRead { expected: len, got });
    }
    Ok(payload)
}

/// Read until `buf` is full or the stream ends; returns the bytes read.
async fn fill(reader: &mut (dyn AsyncRead + Unpin + Send), buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Wire format selector, used where the framing comes from configuration.
///
/// Both ends of a connection must use the same kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecoderKind {
    Nop,
    #[default]
    LengthPrefixed,
    Bincode,
}

impl DecoderKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::LengthPrefixed => "length-prefixed",
            Self::Bincode => "bincode",
        }
    }

    /// Build the decoder for this format.
    pub fn decoder(&self, max_frame_size: usize) -> Arc<dyn Decoder> {
        match self {
            Self::Nop => Arc::new(NopDecoder),
            Self::LengthPrefixed => Arc::new(LengthPrefixedDecoder::new(max_frame_size)),
            Self::Bincode => Arc::new(BincodeDecoder::new(max_frame_size)),
        }
    }

    /// Encode `payload` so the matching decoder yields it back.
    ///
    /// The no-op format sends raw bytes, which the receiver sees as one
    /// message per byte.
    pub fn encode(&self, payload: &[u8], max_frame_size: usize) -> TransportResult<Vec<u8>> {
        match self {
            Self::Nop => Ok(payload.to_vec()),
            Self::LengthPrefixed => encode_frame(payload, max_frame_size),
            Self::Bincode => BincodeDecoder::new(max_frame_size).encode(&Rpc::new(payload)),
        }
    }
}

impl fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DecoderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nop" => Ok(Self::Nop),
            "length-prefixed" => Ok(Self::LengthPrefixed),
            "bincode" => Ok(Self::Bincode),
            other => Err(format!(
                "unknown decoder {other:?} (expected nop, length-prefixed or bincode)"
            )),
        }
    }
}
