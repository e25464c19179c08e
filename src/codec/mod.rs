//! Codecs for packed-archive entries.
//!
//! Each directory entry of a packed archive carries a one-byte codec tag.
//! Tags are permanent: a tag is never reused for a different codec.  An entry
//! whose tag is unknown to this build cannot be served.

use std::io::{self, Read, Write};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    None,
    Zstd,
    Lz4,
    Brotli,
    Lzma,
}

impl CodecId {
    /// The tag written into archive directory entries.
    pub fn tag(self) -> u8 {
        match self {
            CodecId::None   => 0,
            CodecId::Zstd   => 1,
            CodecId::Lz4    => 2,
            CodecId::Brotli => 3,
            CodecId::Lzma   => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CodecId::None),
            1 => Some(CodecId::Zstd),
            2 => Some(CodecId::Lz4),
            3 => Some(CodecId::Brotli),
            4 => Some(CodecId::Lzma),
            _ => None,
        }
    }

    /// Human-readable name (diagnostics only, never parsed from disk).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None   => "none",
            CodecId::Zstd   => "zstd",
            CodecId::Lz4    => "lz4",
            CodecId::Brotli => "brotli",
            CodecId::Lzma   => "lzma",
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Unknown codec tag {0}")]
    UnknownCodec(u8),
    #[error("Decompressed data exceeds {0} bytes")]
    LimitExceeded(usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    /// Like `decompress`, but gives up with [`CodecError::LimitExceeded`]
    /// once the output would grow past `limit` bytes.
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError>;
}

/// Drain `reader`, failing once more than `limit` bytes come out.
fn read_bounded<R: Read>(reader: R, limit: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    if out.len() > limit {
        return Err(CodecError::LimitExceeded(limit));
    }
    Ok(out)
}

/// Output sink for decoders that push rather than pull.
struct BoundedWriter {
    out:      Vec<u8>,
    limit:    usize,
    exceeded: bool,
}

impl Write for BoundedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.out.len() + buf.len() > self.limit {
            self.exceeded = true;
            return Err(io::Error::new(io::ErrorKind::Other, "output limit reached"));
        }
        self.out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId { CodecId::None }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8])        -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        if data.len() > limit {
            return Err(CodecError::LimitExceeded(limit));
        }
        Ok(data.to_vec())
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zstd }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        let decoder = zstd::stream::read::Decoder::new(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        read_bounded(decoder, limit)
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn codec_id(&self) -> CodecId { CodecId::Lz4 }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))
    }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        // The block carries its decompressed size up front.
        let prefix: [u8; 4] = data
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| CodecError::Decompression("missing size prefix".into()))?;
        if u32::from_le_bytes(prefix) as usize > limit {
            return Err(CodecError::LimitExceeded(limit));
        }
        self.decompress(data)
    }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn codec_id(&self) -> CodecId { CodecId::Brotli }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let quality = level.clamp(0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        read_bounded(brotli::Decompressor::new(data, 4096), limit)
    }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn codec_id(&self) -> CodecId { CodecId::Lzma }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_decompress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        let mut sink = BoundedWriter { out: Vec::new(), limit, exceeded: false };
        match lzma_rs::lzma_decompress(&mut io::Cursor::new(data), &mut sink) {
            Ok(()) => Ok(sink.out),
            Err(_) if sink.exceeded => Err(CodecError::LimitExceeded(limit)),
            Err(e) => Err(CodecError::Decompression(e.to_string())),
        }
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None   => Box::new(NoneCodec),
        CodecId::Zstd   => Box::new(ZstdCodec),
        CodecId::Lz4    => Box::new(Lz4Codec),
        CodecId::Brotli => Box::new(BrotliCodec),
        CodecId::Lzma   => Box::new(LzmaCodec),
    }
}

/// Resolve an on-disk tag.  There is no fallback for unknown tags.
pub fn get_codec_by_tag(tag: u8) -> Result<Box<dyn Codec>, CodecError> {
    CodecId::from_tag(tag)
        .map(get_codec)
        .ok_or(CodecError::UnknownCodec(tag))
}
