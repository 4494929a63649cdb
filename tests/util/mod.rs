//! Mock layers shared by the integration tests.
// Not every test binary uses every helper.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use iostack::Errno;
use iostack::Error;
use iostack::Fd;
use iostack::Layer;
use iostack::LocalLayer;
use iostack::OpenFlags;

/// Shared pread/pwrite counters handed out by [`CountingLayer`].
pub type Counters = (Arc<AtomicUsize>, Arc<AtomicUsize>);

/// Wraps a real layer and counts downstream preads and pwrites.
pub struct CountingLayer {
    inner: LocalLayer,
    pub preads: Arc<AtomicUsize>,
    pub pwrites: Arc<AtomicUsize>,
}

impl CountingLayer {
    pub fn new() -> Self {
        CountingLayer {
            inner: LocalLayer::new(),
            preads: Arc::new(AtomicUsize::new(0)),
            pwrites: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn counters(&self) -> Counters {
        (Arc::clone(&self.preads), Arc::clone(&self.pwrites))
    }
}

impl Layer for CountingLayer {
    fn downstream(&self) -> Option<&dyn Layer> {
        Some(&self.inner)
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], off: u64) -> iostack::Result<usize> {
        self.preads.fetch_add(1, Ordering::SeqCst);
        self.inner.pread(fd, buf, off)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], off: u64) -> iostack::Result<usize> {
        self.pwrites.fetch_add(1, Ordering::SeqCst);
        self.inner.pwrite(fd, buf, off)
    }
}

/// Accepts opens and closes but fails every I/O operation with `EIO`.
pub struct FailingLayer {
    next_fd: AtomicI32,
}

impl FailingLayer {
    pub fn new() -> Self {
        FailingLayer {
            // Arbitrary fd space far from real descriptors.
            next_fd: AtomicI32::new(1000),
        }
    }

    fn fail<T>(&self) -> iostack::Result<T> {
        Err(Error::Downstream(Errno::EIO))
    }
}

impl Layer for FailingLayer {
    fn open(&self, _path: &Path, _flags: OpenFlags, _mode: u32) -> iostack::Result<Fd> {
        Ok(self.next_fd.fetch_add(1, Ordering::SeqCst))
    }

    fn close(&self, _fd: Fd) -> iostack::Result<()> {
        Ok(())
    }

    fn pread(&self, _fd: Fd, _buf: &mut [u8], _off: u64) -> iostack::Result<usize> {
        self.fail()
    }

    fn pwrite(&self, _fd: Fd, _buf: &[u8], _off: u64) -> iostack::Result<usize> {
        self.fail()
    }

    fn ftruncate(&self, _fd: Fd, _len: u64) -> iostack::Result<()> {
        self.fail()
    }

    fn fstat(&self, _fd: Fd) -> iostack::Result<iostack::FileStat> {
        self.fail()
    }

    fn lstat(&self, _path: &Path) -> iostack::Result<iostack::FileStat> {
        self.fail()
    }

    fn unlink(&self, _path: &Path) -> iostack::Result<()> {
        self.fail()
    }
}

/// Open flags used by most tests.
pub fn rw_create() -> OpenFlags {
    OpenFlags(libc::O_RDWR | libc::O_CREAT)
}
