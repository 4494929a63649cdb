//! Read cache layer.
//!
//! Caches fixed-size blocks of file content in front of a single
//! downstream. Blocks are keyed by `(inode, block index)` and live in a
//! pluggable [`CacheBackend`]. Reads are served from the cache where
//! possible; runs of consecutive misses are fetched with one coalesced
//! downstream `pread` and inserted block by block. Writes go straight
//! through and update whatever overlapping blocks are already cached, so
//! cached content is always a subset of what is on disk.

mod backend;

pub use backend::BlockKey;
pub use backend::CacheBackend;
pub use backend::LruBackend;

use std::path::Path;
use std::path::PathBuf;

use dashmap::DashMap;
use log::debug;

use crate::error::Error;
use crate::error::Result;
use crate::layer::Fd;
use crate::layer::Layer;
use crate::layer::check_path;
use crate::lock_table::PathLocks;
use crate::open_flags::OpenFlags;
use crate::stat::FileStat;

struct OpenFile {
    ino: u64,
    path: PathBuf,
}

#[derive(Default)]
struct InodeState {
    open_count: usize,
    unlinked: bool,
    /// Highest block index ever inserted for this inode; bounds purges.
    max_block: Option<u64>,
}

/// Block-keyed read cache in front of one downstream layer.
pub struct ReadCacheLayer {
    next: Box<dyn Layer>,
    block_size: u64,
    backend: Box<dyn CacheBackend>,
    fds: DashMap<Fd, OpenFile>,
    inodes: DashMap<u64, InodeState>,
    locks: PathLocks,
}

impl ReadCacheLayer {
    /// Creates a read cache over `next` with the given block size and
    /// backend.
    pub fn new(
        next: Box<dyn Layer>,
        block_size: usize,
        backend: Box<dyn CacheBackend>,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::ConfigInvalid(
                "read_cache block_size must be at least 1".into(),
            ));
        }
        Ok(ReadCacheLayer {
            next,
            block_size: block_size as u64,
            backend,
            fds: DashMap::new(),
            inodes: DashMap::new(),
            locks: PathLocks::new(),
        })
    }

    /// Creates a read cache with the bundled LRU backend holding
    /// `num_blocks` blocks.
    pub fn with_lru(next: Box<dyn Layer>, block_size: usize, num_blocks: usize) -> Result<Self> {
        let backend = Box::new(LruBackend::new(num_blocks)?);
        ReadCacheLayer::new(next, block_size, backend)
    }

    fn open_file(&self, fd: Fd) -> Result<(u64, PathBuf)> {
        let entry = self
            .fds
            .get(&fd)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown fd {fd}")))?;
        Ok((entry.ino, entry.path.clone()))
    }

    fn note_block(&self, ino: u64, index: u64) {
        let mut state = self.inodes.entry(ino).or_default();
        state.max_block = Some(state.max_block.map_or(index, |m| m.max(index)));
    }

    fn purge_inode(&self, ino: u64) {
        if let Some((_, state)) = self.inodes.remove(&ino) {
            if let Some(max) = state.max_block {
                for index in 0..=max {
                    self.backend.remove(&BlockKey { ino, index });
                }
            }
        }
    }

    /// Issues one coalesced downstream read covering blocks
    /// `first..=last`, inserts the blocks, and copies the part the caller
    /// asked for into `buf`. Returns the bytes delivered and whether the
    /// downstream read came up short.
    fn read_run(
        &self,
        fd: Fd,
        ino: u64,
        buf: &mut [u8],
        req_off: u64,
        first: u64,
        last: u64,
    ) -> Result<(usize, bool)> {
        let bs = self.block_size;
        let read_start = first * bs;
        let read_len = ((last - first + 1) * bs) as usize;
        let mut run = vec![0u8; read_len];
        let got = self.next.pread(fd, &mut run, read_start)?;
        run.truncate(got);
        debug!("cache miss run: ino {ino} blocks {first}..={last} ({got} bytes)");

        for index in first..=last {
            let s = ((index - first) * bs) as usize;
            if s >= got {
                break;
            }
            let e = (s + bs as usize).min(got);
            self.backend.insert(BlockKey { ino, index }, run[s..e].to_vec());
            self.note_block(ino, index);
        }

        let want_start = req_off.max(read_start);
        let want_end = (req_off + buf.len() as u64).min(read_start + got as u64);
        let mut delivered = 0usize;
        if want_end > want_start {
            let src = (want_start - read_start) as usize..(want_end - read_start) as usize;
            let dst = (want_start - req_off) as usize..(want_end - req_off) as usize;
            buf[dst].copy_from_slice(&run[src]);
            delivered = (want_end - want_start) as usize;
        }
        Ok((delivered, got < read_len))
    }

    /// Fetches the cached block `index` if its payload covers everything
    /// this request wants from that block. A cached block shorter than the
    /// requested sub-range (it was the EOF block when inserted) is not
    /// authoritative about the bytes past its end, so it is treated as a
    /// miss and re-read downstream.
    fn usable_hit(&self, ino: u64, index: u64, buf_len: usize, req_off: u64) -> Option<Vec<u8>> {
        let data = self.backend.get(&BlockKey { ino, index })?;
        let base = index * self.block_size;
        let want_end = (req_off + buf_len as u64).min(base + self.block_size);
        (base + data.len() as u64 >= want_end).then_some(data)
    }

    /// Copies one cached block's contribution into `buf` if the cached
    /// payload covers the whole requested sub-range.
    fn copy_hit(&self, data: &[u8], index: u64, buf: &mut [u8], req_off: u64) -> Option<usize> {
        let bs = self.block_size;
        let base = index * bs;
        let want_start = req_off.max(base);
        let want_end = (req_off + buf.len() as u64).min(base + bs);
        let avail_end = base + data.len() as u64;
        if avail_end < want_end {
            return None;
        }
        let src = (want_start - base) as usize..(want_end - base) as usize;
        let dst = (want_start - req_off) as usize..(want_end - req_off) as usize;
        buf[dst].copy_from_slice(&data[src]);
        Some((want_end - want_start) as usize)
    }
}

impl Layer for ReadCacheLayer {
    fn downstream(&self) -> Option<&dyn Layer> {
        Some(self.next.as_ref())
    }

    fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> Result<Fd> {
        check_path(path)?;
        let _w = self.locks.write(path);

        let prior = match self.next.lstat(path) {
            Ok(st) => Some(st),
            Err(err) if err.is_not_found() && flags.is_creat() => None,
            Err(err) => return Err(err),
        };

        let fd = self.next.open(path, flags, mode)?;
        let ino = match &prior {
            Some(st) => st.ino,
            None => match self.next.fstat(fd) {
                Ok(st) => st.ino,
                Err(err) => {
                    let _ = self.next.close(fd);
                    return Err(err);
                }
            },
        };

        if flags.is_trunc() {
            // Everything cached for the pre-truncation contents is stale.
            if let Some(mut state) = self.inodes.get_mut(&ino) {
                if let Some(max) = state.max_block.take() {
                    for index in 0..=max {
                        self.backend.remove(&BlockKey { ino, index });
                    }
                }
            }
        }

        self.fds.insert(
            fd,
            OpenFile {
                ino,
                path: path.to_path_buf(),
            },
        );
        self.inodes.entry(ino).or_default().open_count += 1;
        Ok(fd)
    }

    fn close(&self, fd: Fd) -> Result<()> {
        let (ino, path) = self.open_file(fd)?;
        let _w = self.locks.write(&path);
        self.fds.remove(&fd);
        self.next.close(fd)?;

        let purge = match self.inodes.get_mut(&ino) {
            Some(mut state) => {
                state.open_count = state.open_count.saturating_sub(1);
                state.open_count == 0 && state.unlinked
            }
            None => false,
        };
        if purge {
            self.purge_inode(ino);
        }
        Ok(())
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], off: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (ino, path) = self.open_file(fd)?;
        let _r = self.locks.read(&path);

        let bs = self.block_size;
        let first = off / bs;
        let last = (off + buf.len() as u64 - 1) / bs;

        let mut total = 0usize;
        let mut run_start: Option<u64> = None;
        for index in first..=last {
            match self.usable_hit(ino, index, buf.len(), off) {
                Some(data) => {
                    if let Some(start) = run_start.take() {
                        let (got, short) = self.read_run(fd, ino, buf, off, start, index - 1)?;
                        total += got;
                        if short {
                            return Ok(total);
                        }
                    }
                    if let Some(copied) = self.copy_hit(&data, index, buf, off) {
                        total += copied;
                    }
                }
                None => {
                    run_start.get_or_insert(index);
                }
            }
        }
        if let Some(start) = run_start {
            let (got, _) = self.read_run(fd, ino, buf, off, start, last)?;
            total += got;
        }
        Ok(total)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], off: u64) -> Result<usize> {
        let (ino, path) = self.open_file(fd)?;
        let _w = self.locks.write(&path);

        let written = self.next.pwrite(fd, buf, off)?;
        if written == 0 {
            return Ok(0);
        }

        // Write-through: refresh blocks that are already cached; leave the
        // rest to be read back on demand.
        let bs = self.block_size;
        let first = off / bs;
        let last = (off + written as u64 - 1) / bs;
        for index in first..=last {
            let key = BlockKey { ino, index };
            if let Some(mut data) = self.backend.get(&key) {
                let base = index * bs;
                let seg_start = off.max(base);
                let seg_end = (off + written as u64).min(base + bs);
                let needed = (seg_end - base) as usize;
                if data.len() < needed {
                    // The gap (if any) is past the old EOF; the downstream
                    // write made it read back as zeros.
                    data.resize(needed, 0);
                }
                let local = (seg_start - base) as usize;
                data[local..needed]
                    .copy_from_slice(&buf[(seg_start - off) as usize..(seg_end - off) as usize]);
                self.backend.insert(key, data);
            }
        }
        Ok(written)
    }

    fn ftruncate(&self, fd: Fd, len: u64) -> Result<()> {
        let (ino, path) = self.open_file(fd)?;
        let _w = self.locks.write(&path);
        let old = self.next.fstat(fd)?.size;
        self.next.ftruncate(fd, len)?;
        self.reconcile_truncate(ino, old, len);
        Ok(())
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        check_path(path)?;
        let _w = self.locks.write(path);
        let st = self.next.lstat(path)?;
        self.next.truncate(path, len)?;
        self.reconcile_truncate(st.ino, st.size, len);
        Ok(())
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        check_path(path)?;
        let _w = self.locks.write(path);
        let st = self.next.lstat(path)?;
        self.next.unlink(path)?;

        if st.is_regular_file() {
            let open_fds = self
                .inodes
                .get(&st.ino)
                .map(|state| state.open_count)
                .unwrap_or(0);
            if open_fds > 0 {
                if let Some(mut state) = self.inodes.get_mut(&st.ino) {
                    state.unlinked = true;
                }
            } else {
                self.purge_inode(st.ino);
            }
        }
        Ok(())
    }

    fn fstat(&self, fd: Fd) -> Result<FileStat> {
        let (_, path) = self.open_file(fd)?;
        let _r = self.locks.read(&path);
        self.next.fstat(fd)
    }
}

impl ReadCacheLayer {
    fn reconcile_truncate(&self, ino: u64, old: u64, new: u64) {
        let bs = self.block_size;
        if new >= old {
            if new > old && old > 0 {
                // Zero-extend the cached old last block up to its new end.
                let last = (old - 1) / bs;
                let key = BlockKey { ino, index: last };
                if let Some(mut data) = self.backend.get(&key) {
                    let block_end = ((last + 1) * bs).min(new);
                    let target = (block_end - last * bs) as usize;
                    if data.len() < target {
                        data.resize(target, 0);
                        self.backend.insert(key, data);
                    }
                }
            }
            return;
        }

        if new == 0 {
            if let Some(mut state) = self.inodes.get_mut(&ino) {
                if let Some(max) = state.max_block.take() {
                    for index in 0..=max {
                        self.backend.remove(&BlockKey { ino, index });
                    }
                }
            }
            return;
        }

        let new_last = (new - 1) / bs;
        let max = self
            .inodes
            .get(&ino)
            .and_then(|state| state.max_block)
            .unwrap_or(0);
        if max > new_last {
            for index in (new_last + 1)..=max {
                self.backend.remove(&BlockKey { ino, index });
            }
        }
        if let Some(mut state) = self.inodes.get_mut(&ino) {
            if let Some(m) = state.max_block {
                state.max_block = Some(m.min(new_last));
            }
        }

        // Shrink a cached, now-partial last block.
        let rem = (new - new_last * bs) as usize;
        let key = BlockKey { ino, index: new_last };
        if let Some(mut data) = self.backend.get(&key) {
            if data.len() > rem {
                data.truncate(rem);
                self.backend.insert(key, data);
            }
        }
    }
}
