//! Compression codec capability.
//!
//! The compression layer never talks to a compression library directly; it
//! goes through [`Codec`], which besides compress/decompress exposes the
//! frame-inspection primitives the crash-recovery rescan needs: magic
//! detection, exact compressed-frame length, and the original
//! (uncompressed) size of a frame.

use std::io::Read;
use std::io::Write;

use crate::error::Error;
use crate::error::Result;

/// Narrow compression interface consumed by the compression layer.
pub trait Codec: Send + Sync {
    /// Short identifier, also used in configuration ("zstd", "lz4").
    fn name(&self) -> &'static str;

    /// The codec's default compression level.
    fn default_level(&self) -> i32;

    /// Worst-case compressed size for `src_len` input bytes.
    fn bound(&self, src_len: usize, level: i32) -> usize;

    /// Maximum number of bytes a frame header may occupy.
    fn max_header_size(&self) -> usize;

    /// Compresses `src` into `dst`, returning the compressed length.
    fn compress(&self, src: &[u8], dst: &mut [u8], level: i32) -> Result<usize>;

    /// Decompresses one frame from `src` into `dst`, returning the
    /// decompressed length.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;

    /// Whether `buf` (at least 4 bytes) starts with this codec's magic.
    fn detect_format(&self, buf: &[u8]) -> bool;

    /// The original (uncompressed) size of the frame at the start of `src`.
    fn decode_original_size(&self, src: &[u8]) -> Result<u64>;

    /// The exact byte length of the compressed frame at the start of
    /// `src`, ignoring any trailing bytes. `expected_uncompressed` bounds
    /// the frame's content for codecs that must partially decode to find
    /// the end.
    fn find_compressed_frame_len(&self, src: &[u8], expected_uncompressed: usize)
    -> Result<usize>;
}

impl std::fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolves a codec by its configuration name.
pub fn codec_by_name(name: &str) -> Result<Box<dyn Codec>> {
    match name {
        "zstd" => Ok(Box::new(ZstdCodec)),
        "lz4" => Ok(Box::new(Lz4Codec)),
        other => Err(Error::ConfigInvalid(format!(
            "unknown compression algorithm {other:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// zstd
// ---------------------------------------------------------------------------

/// Zstandard frames via the `zstd` crate.
pub struct ZstdCodec;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

impl Codec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn default_level(&self) -> i32 {
        3
    }

    fn bound(&self, src_len: usize, _level: i32) -> usize {
        zstd::zstd_safe::compress_bound(src_len)
    }

    fn max_header_size(&self) -> usize {
        // ZSTD_FRAMEHEADERSIZE_MAX: magic + largest frame header.
        18
    }

    fn compress(&self, src: &[u8], dst: &mut [u8], level: i32) -> Result<usize> {
        zstd::bulk::compress_to_buffer(src, dst, level)
            .map_err(|err| Error::Codec(format!("zstd compress: {err}")))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        zstd::bulk::decompress_to_buffer(src, dst)
            .map_err(|err| Error::Codec(format!("zstd decompress: {err}")))
    }

    fn detect_format(&self, buf: &[u8]) -> bool {
        buf.len() >= 4 && buf[..4] == ZSTD_MAGIC
    }

    fn decode_original_size(&self, src: &[u8]) -> Result<u64> {
        match zstd::zstd_safe::get_frame_content_size(src) {
            Ok(Some(size)) => Ok(size),
            // Frame without a recorded content size; decode it to find out.
            Ok(None) => {
                let mut decoder = zstd::stream::read::Decoder::new(src)
                    .map_err(|err| Error::Codec(format!("zstd frame: {err}")))?;
                let mut content = Vec::new();
                decoder
                    .read_to_end(&mut content)
                    .map_err(|err| Error::Codec(format!("zstd decode: {err}")))?;
                Ok(content.len() as u64)
            }
            Err(err) => Err(Error::Codec(format!("zstd frame: {err:?}"))),
        }
    }

    fn find_compressed_frame_len(
        &self,
        src: &[u8],
        _expected_uncompressed: usize,
    ) -> Result<usize> {
        zstd::zstd_safe::find_frame_compressed_size(src)
            .map_err(|code| Error::Codec(format!(
                "zstd frame scan: {}",
                zstd::zstd_safe::get_error_name(code)
            )))
    }
}

// ---------------------------------------------------------------------------
// lz4
// ---------------------------------------------------------------------------

/// LZ4 frames via the `lz4` crate.
///
/// The LZ4 frame format carries no index and (as produced here) no content
/// size, so the frame-length scan walks the block headers by hand and the
/// original size falls out of a full decode.
pub struct Lz4Codec;

const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

impl Codec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn default_level(&self) -> i32 {
        1
    }

    fn bound(&self, src_len: usize, _level: i32) -> usize {
        // Frame header (max 19) + one 4-byte size word per 64 KiB block +
        // end mark and checksum, on top of incompressible content.
        let blocks = src_len / (64 * 1024) + 1;
        src_len + src_len / 255 + blocks * 8 + 32
    }

    fn max_header_size(&self) -> usize {
        // Magic + FLG/BD + content size + dictionary id + header checksum.
        19
    }

    fn compress(&self, src: &[u8], dst: &mut [u8], level: i32) -> Result<usize> {
        let mut encoder = lz4::EncoderBuilder::new()
            .level(level.max(0) as u32)
            .build(Vec::with_capacity(self.bound(src.len(), level)))
            .map_err(|err| Error::Codec(format!("lz4 encoder: {err}")))?;
        encoder
            .write_all(src)
            .map_err(|err| Error::Codec(format!("lz4 compress: {err}")))?;
        let (frame, finish) = encoder.finish();
        finish.map_err(|err| Error::Codec(format!("lz4 finish: {err}")))?;
        if frame.len() > dst.len() {
            return Err(Error::Codec(format!(
                "lz4 output {} exceeds buffer {}",
                frame.len(),
                dst.len()
            )));
        }
        dst[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let mut decoder = lz4::Decoder::new(src)
            .map_err(|err| Error::Codec(format!("lz4 frame: {err}")))?;
        let mut content = Vec::new();
        decoder
            .read_to_end(&mut content)
            .map_err(|err| Error::Codec(format!("lz4 decompress: {err}")))?;
        if content.len() > dst.len() {
            return Err(Error::Codec(format!(
                "lz4 output {} exceeds buffer {}",
                content.len(),
                dst.len()
            )));
        }
        dst[..content.len()].copy_from_slice(&content);
        Ok(content.len())
    }

    fn detect_format(&self, buf: &[u8]) -> bool {
        buf.len() >= 4 && buf[..4] == LZ4_MAGIC
    }

    fn decode_original_size(&self, src: &[u8]) -> Result<u64> {
        // Content size is optional in the frame header; honor it if present.
        if src.len() >= 5 && src[4] & 0x08 != 0 {
            if src.len() < 14 {
                return Err(Error::Codec("lz4 frame header truncated".into()));
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&src[6..14]);
            return Ok(u64::from_le_bytes(raw));
        }
        let mut decoder = lz4::Decoder::new(src)
            .map_err(|err| Error::Codec(format!("lz4 frame: {err}")))?;
        let mut content = Vec::new();
        decoder
            .read_to_end(&mut content)
            .map_err(|err| Error::Codec(format!("lz4 decode: {err}")))?;
        Ok(content.len() as u64)
    }

    fn find_compressed_frame_len(
        &self,
        src: &[u8],
        _expected_uncompressed: usize,
    ) -> Result<usize> {
        let truncated = || Error::Codec("lz4 frame truncated".into());
        if src.len() < 7 || src[..4] != LZ4_MAGIC {
            return Err(Error::Codec("not an lz4 frame".into()));
        }
        let flg = src[4];
        if (flg >> 6) & 0b11 != 0b01 {
            return Err(Error::Codec("unsupported lz4 frame version".into()));
        }
        let block_checksums = flg & 0x10 != 0;
        let content_checksum = flg & 0x04 != 0;

        // Magic, FLG, BD.
        let mut pos = 6usize;
        if flg & 0x08 != 0 {
            pos += 8; // content size
        }
        if flg & 0x01 != 0 {
            pos += 4; // dictionary id
        }
        pos += 1; // header checksum
        loop {
            let word = src.get(pos..pos + 4).ok_or_else(truncated)?;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(word);
            let block_size = u32::from_le_bytes(raw);
            pos += 4;
            if block_size == 0 {
                break; // end mark
            }
            pos += (block_size & 0x7FFF_FFFF) as usize;
            if block_checksums {
                pos += 4;
            }
            if pos > src.len() {
                return Err(truncated());
            }
        }
        if content_checksum {
            pos += 4;
        }
        if pos > src.len() {
            return Err(truncated());
        }
        Ok(pos)
    }
}
