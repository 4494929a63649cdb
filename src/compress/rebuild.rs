//! Crash-recovery rescan of a block-sparse compressed file.
//!
//! Nothing but the blocks themselves is persisted, so after a restart the
//! per-inode index has to be recovered by reading the first bytes of every
//! block slot and asking the codec what lives there. A block slot that
//! starts with the codec's magic is sized by parsing its frame; anything
//! else is a raw block whose stored size is whatever the read returned.
//! The logical EOF falls out of the last block: raw blocks end exactly at
//! the physical EOF, compressed blocks are decoded just far enough to learn
//! their uncompressed length.

use log::debug;
use log::warn;

use crate::compress::codec::Codec;
use crate::compress::mapping::BlockIndex;
use crate::compress::mapping::InodeMapping;
use crate::error::Error;
use crate::error::Result;
use crate::layer::Fd;
use crate::layer::Layer;

/// Rebuilds the in-memory mapping for the open file `fd` whose physical
/// size is `physical` (> 0). `next` is the downstream the payload bytes
/// live in.
pub(crate) fn rebuild_mapping(
    next: &dyn Layer,
    codec: &dyn Codec,
    block_size: u64,
    fd: Fd,
    physical: u64,
) -> Result<InodeMapping> {
    let block_count = physical.div_ceil(block_size);
    let mut blocks = BlockIndex::with_blocks(block_count as usize);
    let mut logical_eof = physical;
    let mut scratch = vec![0u8; block_size as usize];

    for k in 0..block_count {
        let got = next.pread(fd, &mut scratch, k * block_size)?;
        let payload = &scratch[..got];
        let last = k == block_count - 1;

        if got == 0 {
            // Sparse slot. Only reachable on the last block when the file
            // shrank underneath us; the physical EOF is all we know.
            blocks.set(k as usize, 0, false);
            continue;
        }

        if payload.len() >= 4 && codec.detect_format(payload) {
            match codec.find_compressed_frame_len(payload, block_size as usize) {
                Ok(frame_len) if frame_len <= payload.len() => {
                    blocks.set(k as usize, frame_len as u32, false);
                    if last {
                        let content = codec.decode_original_size(&payload[..frame_len])?;
                        logical_eof = k * block_size + content;
                    }
                    continue;
                }
                Ok(frame_len) => {
                    warn!(
                        "block {k}: frame length {frame_len} exceeds stored {got} bytes, \
                         treating as raw"
                    );
                }
                Err(err) => {
                    // Raw data that happens to start with the magic.
                    debug!("block {k}: magic without parsable frame ({err}), treating as raw");
                }
            }
        }

        blocks.set(k as usize, got as u32, true);
        if last {
            logical_eof = k * block_size + got as u64;
            if logical_eof != physical {
                return Err(Error::InvariantViolation(format!(
                    "raw last block ends at {logical_eof} but physical EOF is {physical}"
                )));
            }
        }
    }

    debug!("rebuilt mapping: {block_count} blocks, logical EOF {logical_eof}");
    Ok(InodeMapping::with_blocks(logical_eof, blocks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::codec::ZstdCodec;
    use crate::layer::Layer;
    use crate::local::LocalLayer;
    use crate::open_flags::OpenFlags;
    use tempfile::TempDir;

    const BS: u64 = 16;

    fn open_rw(local: &LocalLayer, path: &std::path::Path) -> Fd {
        local
            .open(path, OpenFlags(libc::O_RDWR | libc::O_CREAT), 0o644)
            .unwrap()
    }

    #[test]
    fn raw_blocks_recover_sizes_and_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let local = LocalLayer::new();
        let fd = open_rw(&local, &path);
        // Two full raw blocks and a 4-byte raw tail, laid out back to back.
        local.pwrite(fd, &[b'a'; 36], 0).unwrap();

        let mapping = rebuild_mapping(&local, &ZstdCodec, BS, fd, 36).unwrap();
        assert_eq!(mapping.logical_eof, 36);
        assert_eq!(mapping.blocks.len(), 3);
        assert_eq!(mapping.blocks.size(0), 16);
        assert_eq!(mapping.blocks.size(2), 4);
        assert!(mapping.blocks.is_raw(2));
        local.close(fd).unwrap();
    }

    #[test]
    fn compressed_last_block_decodes_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let local = LocalLayer::new();
        let codec = ZstdCodec;
        let fd = open_rw(&local, &path);

        // Block 0: a compressed frame for 16 content bytes at offset 0.
        let content = [b'z'; 16];
        let mut comp = vec![0u8; codec.bound(content.len(), 3)];
        let clen = codec.compress(&content, &mut comp, 3).unwrap();
        assert!(clen < content.len() + 16);
        local.pwrite(fd, &comp[..clen], 0).unwrap();

        let mapping = rebuild_mapping(&local, &codec, BS, fd, clen as u64).unwrap();
        assert_eq!(mapping.blocks.len(), 1);
        assert_eq!(mapping.blocks.size(0), clen as u32);
        assert!(!mapping.blocks.is_raw(0));
        assert_eq!(mapping.logical_eof, 16);
        local.close(fd).unwrap();
    }

    #[test]
    fn interior_hole_reads_as_zero_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let local = LocalLayer::new();
        let fd = open_rw(&local, &path);
        // Data only in block 2; blocks 0 and 1 are holes that read as zeros.
        local.pwrite(fd, &[b'x'; 5], 32).unwrap();

        let mapping = rebuild_mapping(&local, &ZstdCodec, BS, fd, 37).unwrap();
        assert_eq!(mapping.blocks.len(), 3);
        // Hole blocks come back as raw zeros; reads still observe zeros.
        assert!(mapping.blocks.size(0) > 0);
        assert!(mapping.blocks.is_raw(0));
        assert_eq!(mapping.blocks.size(2), 5);
        assert_eq!(mapping.logical_eof, 37);
        local.close(fd).unwrap();
    }
}
