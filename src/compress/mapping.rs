//! Per-inode block index kept by the compression layer.

/// Identity of a file independent of its name.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct InodeKey {
    pub(crate) dev: u64,
    pub(crate) ino: u64,
}

/// Parallel per-block arrays: stored payload size and raw-storage flag.
///
/// `sizes[k] == 0` means block `k` is sparse (never written or punched
/// entirely). `raw[k]` records that block `k` was stored uncompressed
/// because compression did not shrink it; `sizes[k] <= block size` always
/// holds.
#[derive(Debug, Default)]
pub(crate) struct BlockIndex {
    sizes: Vec<u32>,
    raw: Vec<bool>,
}

impl BlockIndex {
    pub(crate) fn new() -> Self {
        BlockIndex::default()
    }

    pub(crate) fn with_blocks(count: usize) -> Self {
        BlockIndex {
            sizes: vec![0; count],
            raw: vec![false; count],
        }
    }

    /// Number of tracked blocks.
    pub(crate) fn len(&self) -> usize {
        self.sizes.len()
    }

    /// Grows the arrays to cover `count` blocks; new slots are sparse.
    pub(crate) fn ensure_blocks(&mut self, count: usize) {
        if count > self.sizes.len() {
            self.sizes.resize(count, 0);
            self.raw.resize(count, false);
        }
    }

    /// Shrinks to `count` blocks, reclaiming capacity once less than half
    /// of it is used.
    pub(crate) fn truncate_blocks(&mut self, count: usize) {
        self.sizes.truncate(count);
        self.raw.truncate(count);
        if self.sizes.len() < self.sizes.capacity() / 2 {
            self.sizes.shrink_to_fit();
            self.raw.shrink_to_fit();
        }
    }

    pub(crate) fn clear(&mut self) {
        self.truncate_blocks(0);
    }

    /// Stored payload size of block `k`; zero for sparse blocks.
    pub(crate) fn size(&self, k: usize) -> u32 {
        self.sizes.get(k).copied().unwrap_or(0)
    }

    /// Whether block `k` is stored raw.
    pub(crate) fn is_raw(&self, k: usize) -> bool {
        self.raw.get(k).copied().unwrap_or(false)
    }

    /// Records block `k`'s stored payload.
    pub(crate) fn set(&mut self, k: usize, size: u32, raw: bool) {
        self.ensure_blocks(k + 1);
        self.sizes[k] = size;
        self.raw[k] = raw;
    }
}

/// Everything the layer knows about one inode.
#[derive(Debug)]
pub(crate) struct InodeMapping {
    /// Uncompressed end-of-file; authoritative for stat size reporting.
    pub(crate) logical_eof: u64,
    /// Fds in this process currently referencing the inode.
    pub(crate) open_count: usize,
    /// The name was unlinked while fds were still open; the mapping is
    /// purged once the last of them closes.
    pub(crate) unlink_called: bool,
    pub(crate) blocks: BlockIndex,
}

impl InodeMapping {
    /// Mapping for a file with no content yet.
    pub(crate) fn fresh() -> Self {
        InodeMapping {
            logical_eof: 0,
            open_count: 0,
            unlink_called: false,
            blocks: BlockIndex::new(),
        }
    }

    pub(crate) fn with_blocks(logical_eof: u64, blocks: BlockIndex) -> Self {
        InodeMapping {
            logical_eof,
            open_count: 0,
            unlink_called: false,
            blocks,
        }
    }
}
