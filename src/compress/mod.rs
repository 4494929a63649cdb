//! Block-sparse compression layer.
//!
//! Every logical block of `block_size` bytes is compressed independently
//! and stored at its logical position: block `k`'s payload occupies
//! `[k*B, k*B + sizes[k])` on the downstream file and the rest of the slot
//! is a hole. Random-access reads and writes therefore touch only the
//! blocks they cover. A block whose compressed form would not be smaller
//! is stored raw, so a stored payload never exceeds the block size.
//!
//! The index mapping block slots to payload sizes lives only in memory,
//! keyed by `(device, inode)`. After a restart it is rebuilt by rescanning
//! the file (see [`rebuild`]); the physical EOF and the codec's frame
//! format are the only persisted sources of truth.

pub(crate) mod codec;
mod mapping;
mod rebuild;

pub use codec::Codec;
pub use codec::Lz4Codec;
pub use codec::ZstdCodec;
pub use codec::codec_by_name;

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use log::warn;
use parking_lot::RwLock;

use crate::error::Error;
use crate::error::Result;
use crate::layer::Fd;
use crate::layer::Layer;
use crate::layer::MAX_FDS;
use crate::layer::check_path;
use crate::lock_table::PathLocks;
use crate::open_flags::FallocateMode;
use crate::open_flags::OpenAccMode;
use crate::open_flags::OpenFlags;
use crate::stat::FileStat;

use mapping::InodeKey;
use mapping::InodeMapping;
use rebuild::rebuild_mapping;

/// Tuning knobs for [`CompressLayer`].
pub struct CompressOptions {
    /// Logical block size `B` in bytes.
    pub block_size: usize,
    /// Codec compression level; `None` uses the codec's default.
    pub level: Option<i32>,
    /// Punch holes on rewrites that shrink a block's payload.
    pub punch_holes: bool,
}

impl Default for CompressOptions {
    fn default() -> Self {
        CompressOptions {
            block_size: 4096,
            level: None,
            punch_holes: false,
        }
    }
}

struct FdEntry {
    key: InodeKey,
    path: PathBuf,
}

/// Compression layer over one downstream.
pub struct CompressLayer {
    next: Box<dyn Layer>,
    codec: Box<dyn Codec>,
    level: i32,
    block_size: u64,
    punch_holes: bool,
    fds: DashMap<Fd, FdEntry>,
    inodes: DashMap<InodeKey, Arc<RwLock<InodeMapping>>>,
    locks: PathLocks,
}

impl CompressLayer {
    /// Creates a compression layer over `next` with the given codec.
    pub fn new(next: Box<dyn Layer>, codec: Box<dyn Codec>, opts: CompressOptions) -> Result<Self> {
        if opts.block_size == 0 {
            return Err(Error::ConfigInvalid(
                "compression block_size must be at least 1".into(),
            ));
        }
        if opts.block_size > u32::MAX as usize {
            return Err(Error::ConfigInvalid(
                "compression block_size exceeds the representable payload size".into(),
            ));
        }
        let level = opts.level.unwrap_or_else(|| codec.default_level());
        Ok(CompressLayer {
            next,
            codec,
            level,
            block_size: opts.block_size as u64,
            punch_holes: opts.punch_holes,
            fds: DashMap::new(),
            inodes: DashMap::new(),
            locks: PathLocks::new(),
        })
    }

    fn fd_entry(&self, fd: Fd) -> Result<(InodeKey, PathBuf)> {
        let entry = self
            .fds
            .get(&fd)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown fd {fd}")))?;
        Ok((entry.key, entry.path.clone()))
    }

    fn mapping(&self, key: &InodeKey) -> Option<Arc<RwLock<InodeMapping>>> {
        self.inodes.get(key).map(|entry| Arc::clone(&entry))
    }

    fn require_mapping(&self, key: &InodeKey) -> Result<Arc<RwLock<InodeMapping>>> {
        self.mapping(key)
            .ok_or_else(|| Error::NotFound(format!("no mapping for inode {}", key.ino)))
    }

    /// Reads exactly `buf.len()` bytes at `off` unless EOF intervenes.
    fn read_at(&self, fd: Fd, buf: &mut [u8], off: u64) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.next.pread(fd, &mut buf[total..], off + total as u64)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Writes all of `buf` at `off`.
    fn write_at(&self, fd: Fd, buf: &[u8], off: u64) -> Result<()> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.next.pwrite(fd, &buf[total..], off + total as u64)?;
            if n == 0 {
                return Err(Error::InvariantViolation(
                    "downstream pwrite made no progress".into(),
                ));
            }
            total += n;
        }
        Ok(())
    }

    /// The decompressed content of stored block `k`. Empty for sparse
    /// blocks; may be shorter than the block size for the block at EOF.
    fn block_plain(&self, fd: Fd, m: &InodeMapping, k: usize) -> Result<Vec<u8>> {
        let stored = m.blocks.size(k) as usize;
        if stored == 0 {
            return Ok(Vec::new());
        }
        let mut payload = vec![0u8; stored];
        let got = self.read_at(fd, &mut payload, k as u64 * self.block_size)?;
        if got < stored {
            return Err(Error::InvariantViolation(format!(
                "block {k}: stored size {stored} but only {got} bytes on disk"
            )));
        }
        if m.blocks.is_raw(k) {
            return Ok(payload);
        }
        let mut plain = vec![0u8; self.block_size as usize];
        let n = self.codec.decompress(&payload, &mut plain)?;
        plain.truncate(n);
        Ok(plain)
    }

    /// Compresses `plain`, falling back to raw storage when compression
    /// does not shrink it. Returns the payload and the raw flag.
    fn encode_block(&self, plain: &[u8]) -> Result<(Vec<u8>, bool)> {
        let mut comp = vec![0u8; self.codec.bound(plain.len(), self.level)];
        let clen = self.codec.compress(plain, &mut comp, self.level)?;
        if clen < plain.len() {
            comp.truncate(clen);
            Ok((comp, false))
        } else {
            Ok((plain.to_vec(), true))
        }
    }

    /// Writes block `k`'s new content, punches the shrink gap when enabled,
    /// and updates the index.
    fn store_block(&self, fd: Fd, m: &mut InodeMapping, k: usize, plain: &[u8]) -> Result<()> {
        let (payload, raw) = self.encode_block(plain)?;
        let base = k as u64 * self.block_size;
        self.write_at(fd, &payload, base)?;

        let old = m.blocks.size(k) as u64;
        let new = payload.len() as u64;
        if self.punch_holes && new < old {
            let mode = FallocateMode::PUNCH_HOLE | FallocateMode::KEEP_SIZE;
            if let Err(err) = self.next.fallocate(fd, mode, base + new, old - new) {
                warn!("hole punch for block {k} skipped: {err}");
            }
        }
        m.blocks.set(k, payload.len() as u32, raw);
        Ok(())
    }

    /// Installs (building if necessary) the mapping for an inode whose
    /// open fd and physical size are at hand.
    fn ensure_mapping(
        &self,
        fd: Fd,
        key: InodeKey,
        physical: u64,
    ) -> Result<Arc<RwLock<InodeMapping>>> {
        if let Some(existing) = self.mapping(&key) {
            return Ok(existing);
        }
        let built = if physical == 0 {
            InodeMapping::fresh()
        } else {
            rebuild_mapping(self.next.as_ref(), self.codec.as_ref(), self.block_size, fd, physical)?
        };
        // Another opener of the same inode (a hard link under a different
        // path lock) may have installed a mapping meanwhile; keep theirs.
        let arc = Arc::clone(
            &self
                .inodes
                .entry(key)
                .or_insert_with(|| Arc::new(RwLock::new(built))),
        );
        Ok(arc)
    }
}

impl Layer for CompressLayer {
    fn downstream(&self) -> Option<&dyn Layer> {
        Some(self.next.as_ref())
    }

    fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> Result<Fd> {
        check_path(path)?;
        let _w = self.locks.write(path);

        // A write-only caller still makes this layer read stored payloads
        // back (partial-block merges, tail re-encoding on truncate), so the
        // downstream open must grant read access too.
        let flags = match flags.acc_mode() {
            OpenAccMode::O_WRONLY => flags.with_acc_mode(OpenAccMode::O_RDWR),
            _ => flags,
        };
        let fd = self.next.open(path, flags, mode)?;
        if fd >= MAX_FDS {
            let _ = self.next.close(fd);
            return Err(Error::ResourceExhausted(format!(
                "fd {fd} is at or beyond MAX_FDS ({MAX_FDS})"
            )));
        }
        let st = match self.next.fstat(fd) {
            Ok(st) => st,
            Err(err) => {
                let _ = self.next.close(fd);
                return Err(err);
            }
        };
        let key = InodeKey {
            dev: st.dev,
            ino: st.ino,
        };

        let mapping = match self.ensure_mapping(fd, key, st.size) {
            Ok(mapping) => mapping,
            Err(err) => {
                let _ = self.next.close(fd);
                return Err(err);
            }
        };
        {
            let mut m = mapping.write();
            if flags.is_trunc() {
                // The downstream open already truncated the physical file.
                m.logical_eof = 0;
                m.blocks.clear();
            }
            m.open_count += 1;
        }
        self.fds.insert(
            fd,
            FdEntry {
                key,
                path: path.to_path_buf(),
            },
        );
        Ok(fd)
    }

    fn close(&self, fd: Fd) -> Result<()> {
        let (key, path) = self.fd_entry(fd)?;
        let _w = self.locks.write(&path);
        self.fds.remove(&fd);
        self.next.close(fd)?;

        if let Some(mapping) = self.mapping(&key) {
            let purge = {
                let mut m = mapping.write();
                m.open_count = m.open_count.saturating_sub(1);
                m.unlink_called && m.open_count == 0
            };
            if purge {
                self.inodes.remove(&key);
            }
        }
        Ok(())
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], off: u64) -> Result<usize> {
        let (key, path) = self.fd_entry(fd)?;
        let _r = self.locks.read(&path);
        let mapping = self.require_mapping(&key)?;
        let m = mapping.read();

        if buf.is_empty() || off >= m.logical_eof {
            return Ok(0);
        }
        let want = buf.len().min((m.logical_eof - off) as usize);
        let bs = self.block_size;
        let first = off / bs;
        let last = (off + want as u64 - 1) / bs;

        for k in first..=last {
            let base = k * bs;
            let seg_start = off.max(base);
            let seg_end = (off + want as u64).min(base + bs);
            let dst = &mut buf[(seg_start - off) as usize..(seg_end - off) as usize];

            if m.blocks.size(k as usize) == 0 {
                dst.fill(0);
                continue;
            }
            let plain = self.block_plain(fd, &m, k as usize)?;
            let local = (seg_start - base) as usize;
            let end = (seg_end - base) as usize;
            if local < plain.len() {
                let copy_end = end.min(plain.len());
                dst[..copy_end - local].copy_from_slice(&plain[local..copy_end]);
                dst[copy_end - local..].fill(0);
            } else {
                // Content ends before the requested range; logical bytes up
                // to EOF read as zeros.
                dst.fill(0);
            }
        }
        Ok(want)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], off: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (key, path) = self.fd_entry(fd)?;
        let _w = self.locks.write(&path);
        let mapping = self.require_mapping(&key)?;
        let mut m = mapping.write();

        let bs = self.block_size;
        let end = off + buf.len() as u64;
        let first = off / bs;
        let last = (end - 1) / bs;
        m.blocks.ensure_blocks(last as usize + 1);

        for k in first..=last {
            let base = k * bs;
            let seg_start = off.max(base);
            let seg_end = end.min(base + bs);
            let seg = &buf[(seg_start - off) as usize..(seg_end - off) as usize];

            // Content the block holds before this write, by the pre-write EOF.
            let existing = bs.min(m.logical_eof.saturating_sub(base)) as usize;
            let covered = seg_start == base && (seg_end - base) as usize >= existing;

            if covered {
                self.store_block(fd, &mut m, k as usize, seg)?;
            } else {
                // Partial overwrite: merge with what the block reads as now.
                let plain_len = existing.max((seg_end - base) as usize);
                let mut plain = vec![0u8; plain_len];
                if existing > 0 && m.blocks.size(k as usize) > 0 {
                    let old = self.block_plain(fd, &m, k as usize)?;
                    let keep = old.len().min(plain_len);
                    plain[..keep].copy_from_slice(&old[..keep]);
                }
                plain[(seg_start - base) as usize..(seg_end - base) as usize]
                    .copy_from_slice(seg);
                self.store_block(fd, &mut m, k as usize, &plain)?;
            }
        }

        if end > m.logical_eof {
            m.logical_eof = end;
        }
        Ok(buf.len())
    }

    fn ftruncate(&self, fd: Fd, len: u64) -> Result<()> {
        let (key, path) = self.fd_entry(fd)?;
        let _w = self.locks.write(&path);
        let mapping = self.require_mapping(&key)?;
        let mut m = mapping.write();

        if len == m.logical_eof {
            return Ok(());
        }
        if len == 0 {
            self.next.ftruncate(fd, 0)?;
            m.blocks.clear();
            m.logical_eof = 0;
            return Ok(());
        }

        let bs = self.block_size;
        if len > m.logical_eof {
            // Extend: new blocks are sparse and read as zeros. The physical
            // file is extended too, so the rescan can recover the new EOF.
            m.blocks.ensure_blocks(len.div_ceil(bs) as usize);
            self.next.ftruncate(fd, len)?;
            m.logical_eof = len;
            return Ok(());
        }

        let last = ((len - 1) / bs) as usize;
        let rem = (len % bs) as usize;
        if m.blocks.size(last) == 0 {
            // Sparse last block: physical length is the record of the tail.
            self.next.ftruncate(fd, len)?;
            m.blocks.truncate_blocks(last + 1);
        } else if rem == 0 {
            self.next
                .ftruncate(fd, last as u64 * bs + m.blocks.size(last) as u64)?;
            m.blocks.truncate_blocks(last + 1);
        } else if m.blocks.is_raw(last) {
            self.next.ftruncate(fd, last as u64 * bs + rem as u64)?;
            m.blocks.set(last, rem as u32, true);
            m.blocks.truncate_blocks(last + 1);
        } else {
            // Compressed last block: cut its content and re-store it.
            let old = self.block_plain(fd, &m, last)?;
            let mut keep = vec![0u8; rem];
            let have = old.len().min(rem);
            keep[..have].copy_from_slice(&old[..have]);
            self.next.ftruncate(fd, last as u64 * bs)?;
            self.store_block(fd, &mut m, last, &keep)?;
            m.blocks.truncate_blocks(last + 1);
        }
        m.logical_eof = len;
        Ok(())
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        // Path-mode truncate is the composition of the fd-mode pieces; each
        // takes its own lock, so none is held here. open() upgrades the
        // write-only access so a partially cut last block can be re-encoded.
        check_path(path)?;
        let fd = self.open(path, OpenFlags(libc::O_WRONLY), 0)?;
        let result = self.ftruncate(fd, len);
        let closed = self.close(fd);
        result.and(closed)
    }

    fn fstat(&self, fd: Fd) -> Result<FileStat> {
        let (key, path) = self.fd_entry(fd)?;
        {
            let _r = self.locks.read(&path);
            let mut st = self.next.fstat(fd)?;
            if !st.is_regular_file() {
                return Ok(st);
            }
            if let Some(mapping) = self.mapping(&key) {
                st.size = mapping.read().logical_eof;
                return Ok(st);
            }
            if st.size == 0 {
                return Ok(st);
            }
        }
        // Mapping missing but the file has data: rebuild under the write
        // lock, re-checking because another thread may have won the race.
        let _w = self.locks.write(&path);
        let mut st = self.next.fstat(fd)?;
        let mapping = self.ensure_mapping(fd, key, st.size)?;
        st.size = mapping.read().logical_eof;
        Ok(st)
    }

    fn lstat(&self, path: &Path) -> Result<FileStat> {
        check_path(path)?;
        {
            let _r = self.locks.read(path);
            let mut st = self.next.lstat(path)?;
            if !st.is_regular_file() || st.size == 0 {
                return Ok(st);
            }
            let key = InodeKey {
                dev: st.dev,
                ino: st.ino,
            };
            if let Some(mapping) = self.mapping(&key) {
                st.size = mapping.read().logical_eof;
                return Ok(st);
            }
        }
        // Upgrade by release-and-reacquire; re-check state afterwards.
        let _w = self.locks.write(path);
        let mut st = self.next.lstat(path)?;
        if !st.is_regular_file() || st.size == 0 {
            return Ok(st);
        }
        let key = InodeKey {
            dev: st.dev,
            ino: st.ino,
        };
        if let Some(mapping) = self.mapping(&key) {
            st.size = mapping.read().logical_eof;
            return Ok(st);
        }
        let fd = self.next.open(path, OpenFlags::RDONLY, 0)?;
        let rebuilt = rebuild_mapping(
            self.next.as_ref(),
            self.codec.as_ref(),
            self.block_size,
            fd,
            st.size,
        );
        if let Err(err) = self.next.close(fd) {
            warn!("closing rebuild fd for {} failed: {err}", path.display());
        }
        let rebuilt = rebuilt?;
        let mapping = Arc::clone(
            &self
                .inodes
                .entry(key)
                .or_insert_with(|| Arc::new(RwLock::new(rebuilt))),
        );
        st.size = mapping.read().logical_eof;
        Ok(st)
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        check_path(path)?;
        let _w = self.locks.write(path);
        let st = self.next.lstat(path)?;
        self.next.unlink(path)?;

        if st.is_regular_file() {
            let key = InodeKey {
                dev: st.dev,
                ino: st.ino,
            };
            if let Some(mapping) = self.mapping(&key) {
                let deferred = {
                    let mut m = mapping.write();
                    if m.open_count > 0 {
                        m.unlink_called = true;
                        true
                    } else {
                        false
                    }
                };
                if !deferred {
                    self.inodes.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn fallocate(&self, _fd: Fd, _mode: FallocateMode, _off: u64, _len: u64) -> Result<()> {
        // Caller offsets are logical; forwarding them would manipulate
        // physical extents of unrelated blocks.
        Err(Error::Unsupported("fallocate"))
    }
}
