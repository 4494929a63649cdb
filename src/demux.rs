//! Demultiplexer layer: one operation, N downstream subtrees.
//!
//! Every operation fans out to all configured branches in parallel through
//! the dispatcher and the caller sees a single aggregated result. Branches
//! marked *enforced* decide success: the first enforced branch to fail
//! fails the whole operation with its error, otherwise the first enforced
//! branch's result is returned. Branches may also be *passthrough* for one
//! I/O direction, in which case that direction is simulated as an
//! immediately successful no-op.
//!
//! Master fds are branch 0's fds; the per-branch fds backing a master fd
//! live in the `layer_fds` table and never escape to the caller.

use std::path::Path;

use dashmap::DashMap;
use log::warn;
use smallvec::SmallVec;

use crate::dispatch;
use crate::error::Error;
use crate::error::Result;
use crate::layer::Fd;
use crate::layer::INVALID_FD;
use crate::layer::Layer;
use crate::open_flags::FallocateMode;
use crate::open_flags::OpenFlags;
use crate::stat::DirEntry;
use crate::stat::FileStat;

/// One downstream subtree plus its dispatch policy.
#[derive(Debug)]
pub struct DemuxBranch {
    /// The downstream subtree.
    pub layer: Box<dyn Layer>,
    /// This branch's result is authoritative for success and failure.
    pub enforced: bool,
    /// Reads are skipped for this branch and reported as successful.
    pub passthrough_read: bool,
    /// Writes are skipped for this branch and reported as successful.
    pub passthrough_write: bool,
}

impl DemuxBranch {
    /// An enforced branch with no passthrough.
    pub fn enforced(layer: Box<dyn Layer>) -> Self {
        DemuxBranch {
            layer,
            enforced: true,
            passthrough_read: false,
            passthrough_write: false,
        }
    }

    /// A best-effort branch with no passthrough.
    pub fn best_effort(layer: Box<dyn Layer>) -> Self {
        DemuxBranch {
            layer,
            enforced: false,
            passthrough_read: false,
            passthrough_write: false,
        }
    }
}

type BranchFds = SmallVec<[Fd; 4]>;

/// Layer that dispatches each operation across an ordered set of branches.
#[derive(Debug)]
pub struct DemuxLayer {
    branches: Vec<DemuxBranch>,
    layer_fds: DashMap<Fd, BranchFds>,
}

impl DemuxLayer {
    /// Builds a demultiplexer from `branches`, validating the dispatch
    /// policy. If no branch is marked enforced, branch 0 becomes enforced.
    pub fn new(mut branches: Vec<DemuxBranch>) -> Result<Self> {
        if branches.is_empty() {
            return Err(Error::ConfigInvalid(
                "demultiplexer needs at least one downstream".into(),
            ));
        }
        if !branches.iter().any(|b| b.enforced) {
            branches[0].enforced = true;
        }
        for (i, branch) in branches.iter().enumerate() {
            if branch.passthrough_read && branch.passthrough_write {
                return Err(Error::ConfigInvalid(format!(
                    "downstream {i} is passthrough for both directions"
                )));
            }
            if branch.enforced && (branch.passthrough_read || branch.passthrough_write) {
                return Err(Error::ConfigInvalid(format!(
                    "downstream {i} cannot be both enforced and passthrough"
                )));
            }
        }
        if branches.iter().all(|b| b.passthrough_read) {
            return Err(Error::ConfigInvalid(
                "every downstream is passthrough for reads".into(),
            ));
        }
        if branches.iter().all(|b| b.passthrough_write) {
            return Err(Error::ConfigInvalid(
                "every downstream is passthrough for writes".into(),
            ));
        }
        Ok(DemuxLayer {
            branches,
            layer_fds: DashMap::new(),
        })
    }

    fn branch_fds(&self, fd: Fd) -> Result<BranchFds> {
        self.layer_fds
            .get(&fd)
            .map(|row| row.clone())
            .ok_or_else(|| Error::InvalidArgument(format!("unknown master fd {fd}")))
    }

    /// Applies the shared resolution rule: the first enforced failure wins,
    /// otherwise the first enforced result is returned.
    fn select<T: Clone>(&self, results: &[Result<T>]) -> Result<T> {
        for (branch, result) in self.branches.iter().zip(results) {
            if branch.enforced {
                if let Err(err) = result {
                    return Err(clone_err(err));
                }
            }
        }
        for (branch, result) in self.branches.iter().zip(results) {
            if branch.enforced {
                if let Ok(value) = result {
                    return Ok(value.clone());
                }
            }
        }
        Err(Error::InvariantViolation(
            "demultiplexer has no enforced downstream".into(),
        ))
    }

    fn log_best_effort_failures<T>(&self, op: &str, results: &[Result<T>]) {
        for (i, result) in results.iter().enumerate() {
            if !self.branches[i].enforced {
                if let Err(err) = result {
                    warn!("best-effort downstream {i} failed {op}: {err}");
                }
            }
        }
    }
}

/// Errors are not `Clone`; rebuild the data-bearing part for selection.
fn clone_err(err: &Error) -> Error {
    match err {
        Error::InvalidArgument(msg) => Error::InvalidArgument(msg.clone()),
        Error::ResourceExhausted(msg) => Error::ResourceExhausted(msg.clone()),
        Error::NotFound(msg) => Error::NotFound(msg.clone()),
        Error::Downstream(errno) => Error::Downstream(*errno),
        Error::InvariantViolation(msg) => Error::InvariantViolation(msg.clone()),
        Error::Codec(msg) => Error::Codec(msg.clone()),
        Error::Unsupported(op) => Error::Unsupported(op),
        Error::ConfigInvalid(msg) => Error::ConfigInvalid(msg.clone()),
    }
}

impl Layer for DemuxLayer {
    fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> Result<Fd> {
        let targets = self
            .branches
            .iter()
            .map(|b| dispatch::OpenTarget {
                layer: b.layer.as_ref(),
                path,
                flags,
                mode,
            })
            .collect();
        let results = dispatch::open_all(targets);

        // Branch 0's fd is the master fd, success or failure; its result is
        // authoritative because the master fd is.
        match &results[0] {
            Ok(master) => {
                let master = *master;
                let mut row = BranchFds::new();
                for (i, result) in results.iter().enumerate() {
                    match result {
                        Ok(fd) => row.push(*fd),
                        Err(err) => {
                            warn!("downstream {i} failed open of {}: {err}", path.display());
                            row.push(INVALID_FD);
                        }
                    }
                }
                self.layer_fds.insert(master, row);
                Ok(master)
            }
            Err(_) => {
                // Close whatever the other branches opened; nothing leaks.
                let strays: Vec<_> = self
                    .branches
                    .iter()
                    .zip(&results)
                    .filter_map(|(b, r)| {
                        r.as_ref()
                            .ok()
                            .map(|fd| dispatch::FdTarget {
                                layer: b.layer.as_ref(),
                                fd: *fd,
                            })
                    })
                    .collect();
                for (i, close) in dispatch::close_all(strays).into_iter().enumerate() {
                    if let Err(err) = close {
                        warn!("closing stray fd on branch {i} failed: {err}");
                    }
                }
                results.into_iter().next().unwrap_or_else(|| {
                    Err(Error::InvariantViolation("open fan-out lost branch 0".into()))
                })
            }
        }
    }

    fn close(&self, fd: Fd) -> Result<()> {
        let fds = self.branch_fds(fd)?;
        let targets = self
            .branches
            .iter()
            .zip(&fds)
            .map(|(b, branch_fd)| dispatch::FdTarget {
                layer: b.layer.as_ref(),
                fd: *branch_fd,
            })
            .collect();
        let results = dispatch::close_all(targets);
        self.layer_fds.remove(&fd);
        self.log_best_effort_failures("close", &results);
        self.select(&results)
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], off: u64) -> Result<usize> {
        let fds = self.branch_fds(fd)?;
        let targets = self
            .branches
            .iter()
            .zip(&fds)
            .map(|(b, branch_fd)| dispatch::ReadTarget {
                layer: b.layer.as_ref(),
                fd: *branch_fd,
                len: buf.len(),
                off,
                skip: b.passthrough_read,
            })
            .collect();
        let results = dispatch::pread_all(targets);

        let statuses: Vec<Result<usize>> = results
            .iter()
            .map(|(status, _)| match status {
                Ok(n) => Ok(*n),
                Err(err) => Err(clone_err(err)),
            })
            .collect();
        self.log_best_effort_failures("pread", &statuses);
        let chosen = self.select(&statuses)?;

        // Copy the chosen enforced branch's private buffer out. Validation
        // guarantees an enforced branch is never passthrough, so its buffer
        // is real.
        for (i, branch) in self.branches.iter().enumerate() {
            if branch.enforced && statuses[i].is_ok() {
                let n = chosen.min(buf.len()).min(results[i].1.len());
                buf[..n].copy_from_slice(&results[i].1[..n]);
                return Ok(n);
            }
        }
        Ok(chosen)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], off: u64) -> Result<usize> {
        let fds = self.branch_fds(fd)?;
        let targets = self
            .branches
            .iter()
            .zip(&fds)
            .map(|(b, branch_fd)| dispatch::WriteTarget {
                layer: b.layer.as_ref(),
                fd: *branch_fd,
                buf,
                off,
                skip: b.passthrough_write,
            })
            .collect();
        let results = dispatch::pwrite_all(targets);
        self.log_best_effort_failures("pwrite", &results);
        self.select(&results)
    }

    fn ftruncate(&self, fd: Fd, len: u64) -> Result<()> {
        let fds = self.branch_fds(fd)?;
        let targets = self
            .branches
            .iter()
            .zip(&fds)
            .map(|(b, branch_fd)| dispatch::TruncateTarget {
                layer: b.layer.as_ref(),
                fd: *branch_fd,
                len,
            })
            .collect();
        let results = dispatch::ftruncate_all(targets);
        self.log_best_effort_failures("ftruncate", &results);
        self.select(&results)
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        let results = dispatch::fan_out(
            self.branches
                .iter()
                .map(|b| move || b.layer.truncate(path, len))
                .collect(),
        );
        self.log_best_effort_failures("truncate", &results);
        self.select(&results)
    }

    fn fstat(&self, fd: Fd) -> Result<FileStat> {
        let fds = self.branch_fds(fd)?;
        let targets = self
            .branches
            .iter()
            .zip(&fds)
            .map(|(b, branch_fd)| dispatch::FdTarget {
                layer: b.layer.as_ref(),
                fd: *branch_fd,
            })
            .collect();
        let results = dispatch::fstat_all(targets);
        self.select(&results)
    }

    fn lstat(&self, path: &Path) -> Result<FileStat> {
        let targets = self
            .branches
            .iter()
            .map(|b| dispatch::PathTarget {
                layer: b.layer.as_ref(),
                path,
            })
            .collect();
        let results = dispatch::lstat_all(targets);
        self.select(&results)
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        let targets = self
            .branches
            .iter()
            .map(|b| dispatch::PathTarget {
                layer: b.layer.as_ref(),
                path,
            })
            .collect();
        let results = dispatch::unlink_all(targets);
        self.log_best_effort_failures("unlink", &results);
        self.select(&results)
    }

    fn fsync(&self, fd: Fd, datasync: bool) -> Result<()> {
        let fds = self.branch_fds(fd)?;
        let targets = self
            .branches
            .iter()
            .zip(&fds)
            .map(|(b, branch_fd)| dispatch::FdTarget {
                layer: b.layer.as_ref(),
                fd: *branch_fd,
            })
            .collect();
        let results = dispatch::fsync_all(targets, datasync);
        self.log_best_effort_failures("fsync", &results);
        self.select(&results)
    }

    fn fallocate(&self, fd: Fd, mode: FallocateMode, off: u64, len: u64) -> Result<()> {
        let fds = self.branch_fds(fd)?;
        let results = dispatch::fan_out(
            self.branches
                .iter()
                .zip(&fds)
                .map(|(b, branch_fd)| {
                    let branch_fd = *branch_fd;
                    move || b.layer.fallocate(branch_fd, mode, off, len)
                })
                .collect(),
        );
        self.log_best_effort_failures("fallocate", &results);
        self.select(&results)
    }

    fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let results = dispatch::fan_out(
            self.branches
                .iter()
                .map(|b| move || b.layer.readdir(path))
                .collect(),
        );
        self.select(&results)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let results = dispatch::fan_out(
            self.branches
                .iter()
                .map(|b| move || b.layer.rename(from, to))
                .collect(),
        );
        self.log_best_effort_failures("rename", &results);
        self.select(&results)
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        let results = dispatch::fan_out(
            self.branches
                .iter()
                .map(|b| move || b.layer.chmod(path, mode))
                .collect(),
        );
        self.log_best_effort_failures("chmod", &results);
        self.select(&results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalLayer;
    use tempfile::TempDir;

    fn local_branch(enforced: bool) -> DemuxBranch {
        DemuxBranch {
            layer: Box::new(LocalLayer::new()),
            enforced,
            passthrough_read: false,
            passthrough_write: false,
        }
    }

    #[test]
    fn validation_rejects_enforced_passthrough() {
        let mut branch = local_branch(true);
        branch.passthrough_read = true;
        assert!(matches!(
            DemuxLayer::new(vec![branch]).unwrap_err(),
            Error::ConfigInvalid(_)
        ));
    }

    #[test]
    fn validation_rejects_double_passthrough() {
        let mut branch = local_branch(false);
        branch.passthrough_read = true;
        branch.passthrough_write = true;
        assert!(matches!(
            DemuxLayer::new(vec![branch, local_branch(true)]).unwrap_err(),
            Error::ConfigInvalid(_)
        ));
    }

    #[test]
    fn validation_requires_a_real_reader_and_writer() {
        let mut a = local_branch(false);
        a.passthrough_read = true;
        let mut b = local_branch(false);
        b.passthrough_read = true;
        assert!(matches!(
            DemuxLayer::new(vec![a, b]).unwrap_err(),
            Error::ConfigInvalid(_)
        ));
    }

    #[test]
    fn branch_zero_is_enforced_by_default() {
        let demux = DemuxLayer::new(vec![local_branch(false), local_branch(false)]).unwrap();
        assert!(demux.branches[0].enforced);
        assert!(!demux.branches[1].enforced);
    }

    #[test]
    fn empty_branch_list_is_rejected() {
        assert!(matches!(
            DemuxLayer::new(Vec::new()).unwrap_err(),
            Error::ConfigInvalid(_)
        ));
    }

    #[test]
    fn fans_out_writes_to_every_branch() {
        // Both local branches resolve the same file, so the fan-out writes
        // are idempotent; this exercises fd translation and join.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let demux = DemuxLayer::new(vec![local_branch(true), local_branch(false)]).unwrap();

        let fd = demux
            .open(&path, OpenFlags(libc::O_RDWR | libc::O_CREAT), 0o644)
            .unwrap();
        assert_eq!(demux.pwrite(fd, b"abc", 0).unwrap(), 3);

        let mut buf = [0u8; 3];
        assert_eq!(demux.pread(fd, &mut buf, 0).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(demux.fstat(fd).unwrap().size, 3);
        demux.close(fd).unwrap();
        assert!(demux.layer_fds.is_empty());
    }

    #[test]
    fn unknown_master_fd_is_rejected() {
        let demux = DemuxLayer::new(vec![local_branch(true)]).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(
            demux.pread(99, &mut buf, 0).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }
}
