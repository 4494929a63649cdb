//! The layer abstraction: one trait, one tree.
//!
//! A [`Layer`] is a node in a tree of I/O transformations. The application
//! holds the root as a `Box<dyn Layer>` and issues POSIX-shaped operations
//! on it; each layer transforms the request and forwards it to its
//! downstream layer(s), and a terminal layer performs the real syscalls.
//!
//! Composition rules:
//!
//! * the graph is a tree: a parent owns its children, and dropping the root
//!   tears the whole stack down (children after the parent's own state);
//! * an operation on a node completes all downstream calls before
//!   returning;
//! * fds are opaque tokens scoped to the node that returned them. An fd
//!   returned by one node must only be passed back into that same node.

use std::ffi::OsStr;
use std::path::Path;

use crate::error::Error;
use crate::error::Result;
use crate::open_flags::FallocateMode;
use crate::open_flags::OpenFlags;
use crate::stat::DirEntry;
use crate::stat::FileStat;

/// File descriptor token handed out by a layer.
pub type Fd = std::os::unix::io::RawFd;

/// Sentinel for "no fd"; used by the demultiplexer for branches whose open
/// failed.
pub const INVALID_FD: Fd = -1;

/// Upper bound on fd values tracked in per-fd tables. An open that returns
/// an fd at or beyond this bound is rejected as resource exhaustion.
pub const MAX_FDS: Fd = 65536;

/// One node in a layer stack.
///
/// Every operation has a default body that forwards to the single
/// [`downstream`](Layer::downstream) when one exists and otherwise fails
/// with [`Error::Unsupported`]. A layer therefore only implements the
/// operations it transforms; a terminal layer overrides everything and
/// reports no downstream.
pub trait Layer: Send + Sync {
    /// The single downstream this layer forwards unhandled operations to.
    ///
    /// Layers with zero or several downstreams (terminal layers, the
    /// demultiplexer) return `None` and handle every operation themselves.
    fn downstream(&self) -> Option<&dyn Layer> {
        None
    }

    /// Open `path` and return a layer-scoped fd.
    fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> Result<Fd> {
        match self.downstream() {
            Some(next) => next.open(path, flags, mode),
            None => Err(Error::Unsupported("open")),
        }
    }

    /// Close an fd previously returned by this node.
    fn close(&self, fd: Fd) -> Result<()> {
        match self.downstream() {
            Some(next) => next.close(fd),
            None => Err(Error::Unsupported("close")),
        }
    }

    /// Read up to `buf.len()` bytes at absolute offset `off`. Returns the
    /// number of bytes read; fewer than requested only at end of file.
    fn pread(&self, fd: Fd, buf: &mut [u8], off: u64) -> Result<usize> {
        match self.downstream() {
            Some(next) => next.pread(fd, buf, off),
            None => Err(Error::Unsupported("pread")),
        }
    }

    /// Write `buf` at absolute offset `off`. Returns the number of bytes
    /// written.
    fn pwrite(&self, fd: Fd, buf: &[u8], off: u64) -> Result<usize> {
        match self.downstream() {
            Some(next) => next.pwrite(fd, buf, off),
            None => Err(Error::Unsupported("pwrite")),
        }
    }

    /// Truncate the open file to `len` bytes.
    fn ftruncate(&self, fd: Fd, len: u64) -> Result<()> {
        match self.downstream() {
            Some(next) => next.ftruncate(fd, len),
            None => Err(Error::Unsupported("ftruncate")),
        }
    }

    /// Truncate the file at `path` to `len` bytes.
    fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        match self.downstream() {
            Some(next) => next.truncate(path, len),
            None => Err(Error::Unsupported("truncate")),
        }
    }

    /// Stat an open file.
    fn fstat(&self, fd: Fd) -> Result<FileStat> {
        match self.downstream() {
            Some(next) => next.fstat(fd),
            None => Err(Error::Unsupported("fstat")),
        }
    }

    /// Stat by path without following a final symlink.
    fn lstat(&self, path: &Path) -> Result<FileStat> {
        match self.downstream() {
            Some(next) => next.lstat(path),
            None => Err(Error::Unsupported("lstat")),
        }
    }

    /// Remove the name `path`.
    fn unlink(&self, path: &Path) -> Result<()> {
        match self.downstream() {
            Some(next) => next.unlink(path),
            None => Err(Error::Unsupported("unlink")),
        }
    }

    /// Flush file data (and metadata unless `datasync`) to stable storage.
    fn fsync(&self, fd: Fd, datasync: bool) -> Result<()> {
        match self.downstream() {
            Some(next) => next.fsync(fd, datasync),
            None => Err(Error::Unsupported("fsync")),
        }
    }

    /// Manipulate file space; used by the compression layer to punch holes.
    fn fallocate(&self, fd: Fd, mode: FallocateMode, off: u64, len: u64) -> Result<()> {
        match self.downstream() {
            Some(next) => next.fallocate(fd, mode, off, len),
            None => Err(Error::Unsupported("fallocate")),
        }
    }

    /// List the entries of the directory at `path`.
    fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        match self.downstream() {
            Some(next) => next.readdir(path),
            None => Err(Error::Unsupported("readdir")),
        }
    }

    /// Rename `from` to `to`.
    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        match self.downstream() {
            Some(next) => next.rename(from, to),
            None => Err(Error::Unsupported("rename")),
        }
    }

    /// Change the permission bits of `path`.
    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        match self.downstream() {
            Some(next) => next.chmod(path, mode),
            None => Err(Error::Unsupported("chmod")),
        }
    }
}

impl std::fmt::Debug for dyn Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Layer")
    }
}

/// Validates a path argument before it is used as a lock or mapping key.
///
/// Layers that key internal state by path reject empty paths up front so a
/// bogus argument cannot alias the tables.
pub(crate) fn check_path(path: &Path) -> Result<()> {
    if path.as_os_str() == OsStr::new("") {
        return Err(Error::InvalidArgument("empty path".into()));
    }
    Ok(())
}
