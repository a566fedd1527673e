//! Block compression codecs.
//!
//! The v8 container stores the blocks of a root container as raw DEFLATE
//! streams (RFC 1951, no zlib wrapper), though a block may also be stored
//! as is; [`sniff_deflate`] tells the two apart. Nested containers store
//! their blocks verbatim. Compression runs at a fixed level so that
//! identical input always produces identical output.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use thiserror::Error;

pub mod stage;

pub use stage::{compress_and_build, decompress_and_extract};

/// Level used for every deflated block.
pub const DEFAULT_DEFLATE_LEVEL: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    None,
    Deflate,
}

impl CodecId {
    /// Human-readable name (for diagnostics only).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None    => "none",
            CodecId::Deflate => "deflate",
        }
    }

    pub fn for_block(deflated: bool) -> Self {
        if deflated { CodecId::Deflate } else { CodecId::None }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId { CodecId::None }
    fn compress(&self, data: &[u8])   -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

pub struct DeflateCodec {
    pub level: u32,
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self { level: DEFAULT_DEFLATE_LEVEL }
    }
}

impl Codec for DeflateCodec {
    fn codec_id(&self) -> CodecId { CodecId::Deflate }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = DeflateEncoder::new(
            Vec::with_capacity(data.len() / 2 + 64),
            Compression::new(self.level),
        );
        encoder
            .write_all(data)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(data.len().saturating_mul(3).max(1024));
        DeflateDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

/// Result of [`sniff_deflate`].
#[derive(Debug, PartialEq, Eq)]
pub enum Sniffed {
    /// One complete raw DEFLATE stream spanning the whole input.
    Inflated(Vec<u8>),
    /// Not a DEFLATE stream; the block is stored as is.
    Stored,
}

/// Inflate `data` if it is a raw DEFLATE stream that ends exactly at the end
/// of the input.
///
/// Input the decoder rejects before producing any output, or that has bytes
/// left after the end of the stream, is [`Sniffed::Stored`]. A stream that
/// breaks off after producing output is an error.
pub fn sniff_deflate(data: &[u8]) -> Result<Sniffed, CodecError> {
    let mut inflater = Decompress::new(false);
    let mut out = Vec::with_capacity(data.len().saturating_mul(3).max(1024));
    loop {
        let consumed = inflater.total_in() as usize;
        let produced = inflater.total_out();
        let status = inflater.decompress_vec(&data[consumed..], &mut out, FlushDecompress::None);
        match status {
            Ok(Status::StreamEnd) if inflater.total_in() as usize == data.len() => {
                return Ok(Sniffed::Inflated(out));
            }
            Ok(Status::StreamEnd) => return Ok(Sniffed::Stored),
            Ok(Status::Ok | Status::BufError) => {
                if out.len() == out.capacity() {
                    out.reserve(out.capacity().max(1024));
                    continue;
                }
                let stalled = inflater.total_in() as usize == consumed && inflater.total_out() == produced;
                if !stalled {
                    continue;
                }
                if out.is_empty() {
                    return Ok(Sniffed::Stored);
                }
                return Err(CodecError::Decompression(format!(
                    "stream ends after {} of {} bytes without a final block",
                    inflater.total_in(),
                    data.len()
                )));
            }
            Err(_) if out.is_empty() => return Ok(Sniffed::Stored),
            Err(e) => return Err(CodecError::Decompression(e.to_string())),
        }
    }
}

/// Resolve a CodecId to a built-in codec.
pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None    => Box::new(NoneCodec),
        CodecId::Deflate => Box::new(DeflateCodec::default()),
    }
}
