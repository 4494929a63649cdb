//! Parallel fan-out of one operation across several layers.
//!
//! The demultiplexer hands one request to N downstream subtrees at once.
//! All concurrency is structured: workers are spawned in a scope, borrow
//! their inputs, and every started worker is joined before the call
//! returns, so no worker ever outlives the operation. There is no
//! cancellation and no timeout; a worker panic is re-raised on the caller
//! after the remaining workers have been joined.
//!
//! Each worker writes into its own result slot (and, for reads, its own
//! destination buffer), so racing downstreams never share output memory.
//! The caller's request context is re-installed inside every worker.

use std::path::Path;
use std::thread;

use crate::error::Result;
use crate::layer::Fd;
use crate::layer::Layer;
use crate::open_flags::OpenFlags;
use crate::request_ctx;
use crate::stat::FileStat;

/// Runs every job on its own worker thread and returns their results in
/// job order.
pub fn fan_out<T, F>(jobs: Vec<F>) -> Vec<T>
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    let ctx = request_ctx::current();
    thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let ctx = ctx.clone();
                scope.spawn(move || {
                    let _guard = ctx.map(request_ctx::install);
                    job()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(value) => value,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    })
}

/// One open to issue during a fan-out.
pub struct OpenTarget<'a> {
    /// Downstream subtree to open through.
    pub layer: &'a dyn Layer,
    /// Path to open.
    pub path: &'a Path,
    /// Flags for the open.
    pub flags: OpenFlags,
    /// Creation mode bits.
    pub mode: u32,
}

/// Opens on all targets in parallel.
pub fn open_all(targets: Vec<OpenTarget<'_>>) -> Vec<Result<Fd>> {
    fan_out(
        targets
            .into_iter()
            .map(|t| move || t.layer.open(t.path, t.flags, t.mode))
            .collect(),
    )
}

/// One fd-scoped operation to issue during a fan-out.
pub struct FdTarget<'a> {
    /// Downstream subtree to call into.
    pub layer: &'a dyn Layer,
    /// The fd valid within that subtree.
    pub fd: Fd,
}

/// Closes on all targets in parallel.
pub fn close_all(targets: Vec<FdTarget<'_>>) -> Vec<Result<()>> {
    fan_out(
        targets
            .into_iter()
            .map(|t| move || t.layer.close(t.fd))
            .collect(),
    )
}

/// Stats all targets in parallel, one stat slot per worker.
pub fn fstat_all(targets: Vec<FdTarget<'_>>) -> Vec<Result<FileStat>> {
    fan_out(
        targets
            .into_iter()
            .map(|t| move || t.layer.fstat(t.fd))
            .collect(),
    )
}

/// Syncs all targets in parallel.
pub fn fsync_all(targets: Vec<FdTarget<'_>>, datasync: bool) -> Vec<Result<()>> {
    fan_out(
        targets
            .into_iter()
            .map(|t| move || t.layer.fsync(t.fd, datasync))
            .collect(),
    )
}

/// One truncation to issue during a fan-out.
pub struct TruncateTarget<'a> {
    /// Downstream subtree to call into.
    pub layer: &'a dyn Layer,
    /// The fd valid within that subtree.
    pub fd: Fd,
    /// New length.
    pub len: u64,
}

/// Truncates all targets in parallel.
pub fn ftruncate_all(targets: Vec<TruncateTarget<'_>>) -> Vec<Result<()>> {
    fan_out(
        targets
            .into_iter()
            .map(|t| move || t.layer.ftruncate(t.fd, t.len))
            .collect(),
    )
}

/// One read to issue during a fan-out.
pub struct ReadTarget<'a> {
    /// Downstream subtree to read from.
    pub layer: &'a dyn Layer,
    /// The fd valid within that subtree.
    pub fd: Fd,
    /// Bytes requested.
    pub len: usize,
    /// Absolute offset.
    pub off: u64,
    /// Passthrough: report `len` bytes read without performing any I/O.
    pub skip: bool,
}

/// Reads from all targets in parallel.
///
/// Every worker reads into its own buffer; the caller picks one buffer
/// after the join and copies it out, so concurrent downstreams never race
/// on shared destination memory.
pub fn pread_all(targets: Vec<ReadTarget<'_>>) -> Vec<(Result<usize>, Vec<u8>)> {
    fan_out(
        targets
            .into_iter()
            .map(|t| {
                move || {
                    if t.skip {
                        return (Ok(t.len), Vec::new());
                    }
                    let mut buf = vec![0u8; t.len];
                    let result = t.layer.pread(t.fd, &mut buf, t.off);
                    (result, buf)
                }
            })
            .collect(),
    )
}

/// One write to issue during a fan-out.
pub struct WriteTarget<'a> {
    /// Downstream subtree to write into.
    pub layer: &'a dyn Layer,
    /// The fd valid within that subtree.
    pub fd: Fd,
    /// Bytes to write; borrowed by the worker for the call's duration.
    pub buf: &'a [u8],
    /// Absolute offset.
    pub off: u64,
    /// Passthrough: report the full length written without performing I/O.
    pub skip: bool,
}

/// Writes to all targets in parallel.
pub fn pwrite_all(targets: Vec<WriteTarget<'_>>) -> Vec<Result<usize>> {
    fan_out(
        targets
            .into_iter()
            .map(|t| {
                move || {
                    if t.skip {
                        return Ok(t.buf.len());
                    }
                    t.layer.pwrite(t.fd, t.buf, t.off)
                }
            })
            .collect(),
    )
}

/// One path-scoped operation to issue during a fan-out.
pub struct PathTarget<'a> {
    /// Downstream subtree to call into.
    pub layer: &'a dyn Layer,
    /// The path argument.
    pub path: &'a Path,
}

/// Stats all targets by path in parallel.
pub fn lstat_all(targets: Vec<PathTarget<'_>>) -> Vec<Result<FileStat>> {
    fan_out(
        targets
            .into_iter()
            .map(|t| move || t.layer.lstat(t.path))
            .collect(),
    )
}

/// Unlinks on all targets in parallel.
pub fn unlink_all(targets: Vec<PathTarget<'_>>) -> Vec<Result<()>> {
    fan_out(
        targets
            .into_iter()
            .map(|t| move || t.layer.unlink(t.path))
            .collect(),
    )
}
