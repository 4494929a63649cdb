//! Terminal layer that performs real syscalls.

use std::os::fd::BorrowedFd;
use std::os::fd::IntoRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::error::Error;
use crate::error::Result;
use crate::layer::Fd;
use crate::layer::Layer;
use crate::open_flags::FallocateMode;
use crate::open_flags::OpenFlags;
use crate::stat::DirEntry;
use crate::stat::FileStat;
use crate::stat::FileType;

/// The base case of every stack: each operation maps to the corresponding
/// native POSIX call and its result is returned verbatim.
#[derive(Debug, Default)]
pub struct LocalLayer;

impl LocalLayer {
    /// Creates a terminal layer operating on the host filesystem.
    pub fn new() -> Self {
        LocalLayer
    }
}

fn off(value: u64) -> Result<libc::off_t> {
    libc::off_t::try_from(value)
        .map_err(|_| Error::InvalidArgument(format!("offset {value} exceeds off_t")))
}

/// Borrow a raw fd for the duration of one syscall.
///
/// Callers must have validated `fd >= 0`; layer-scoped fds are exactly the
/// host fds here, so a non-negative token is an open descriptor or the
/// syscall fails with `EBADF` on its own.
fn borrowed(fd: Fd) -> Result<BorrowedFd<'static>> {
    if fd < 0 {
        return Err(Error::InvalidArgument(format!("bad fd {fd}")));
    }
    Ok(unsafe { BorrowedFd::borrow_raw(fd) })
}

impl Layer for LocalLayer {
    fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> Result<Fd> {
        let oflag = OFlag::from_bits_retain(flags.0);
        let mode = Mode::from_bits_truncate(mode as libc::mode_t);
        let owned = nix::fcntl::open(path, oflag, mode)?;
        Ok(owned.into_raw_fd())
    }

    fn close(&self, fd: Fd) -> Result<()> {
        borrowed(fd)?;
        nix::unistd::close(fd)?;
        Ok(())
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], off_: u64) -> Result<usize> {
        let fd = borrowed(fd)?;
        Ok(nix::sys::uio::pread(fd, buf, off(off_)?)?)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], off_: u64) -> Result<usize> {
        let fd = borrowed(fd)?;
        Ok(nix::sys::uio::pwrite(fd, buf, off(off_)?)?)
    }

    fn ftruncate(&self, fd: Fd, len: u64) -> Result<()> {
        let fd = borrowed(fd)?;
        nix::unistd::ftruncate(fd, off(len)?)?;
        Ok(())
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        nix::unistd::truncate(path, off(len)?)?;
        Ok(())
    }

    fn fstat(&self, fd: Fd) -> Result<FileStat> {
        let fd = borrowed(fd)?;
        let st = nix::sys::stat::fstat(fd)?;
        Ok(FileStat::from(st))
    }

    fn lstat(&self, path: &Path) -> Result<FileStat> {
        let st = nix::sys::stat::lstat(path)?;
        Ok(FileStat::from(st))
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        nix::unistd::unlink(path)?;
        Ok(())
    }

    fn fsync(&self, fd: Fd, datasync: bool) -> Result<()> {
        let fd = borrowed(fd)?;
        if datasync {
            nix::unistd::fdatasync(fd)?;
        } else {
            nix::unistd::fsync(fd)?;
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn fallocate(&self, fd: Fd, mode: FallocateMode, off_: u64, len: u64) -> Result<()> {
        use nix::fcntl::FallocateFlags;

        let fd = borrowed(fd)?;
        let mut flags = FallocateFlags::empty();
        if mode.contains(FallocateMode::PUNCH_HOLE) {
            flags |= FallocateFlags::FALLOC_FL_PUNCH_HOLE;
        }
        if mode.contains(FallocateMode::KEEP_SIZE) {
            flags |= FallocateFlags::FALLOC_FL_KEEP_SIZE;
        }
        nix::fcntl::fallocate(fd, flags, off(off_)?, off(len)?)?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn fallocate(&self, _fd: Fd, _mode: FallocateMode, _off: u64, _len: u64) -> Result<()> {
        Err(Error::Unsupported("fallocate"))
    }

    fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let kind = entry.file_type().ok().and_then(|t| {
                use std::os::unix::fs::FileTypeExt;
                if t.is_file() {
                    Some(FileType::RegularFile)
                } else if t.is_dir() {
                    Some(FileType::Directory)
                } else if t.is_symlink() {
                    Some(FileType::Symlink)
                } else if t.is_fifo() {
                    Some(FileType::NamedPipe)
                } else if t.is_socket() {
                    Some(FileType::Socket)
                } else if t.is_char_device() {
                    Some(FileType::CharDevice)
                } else if t.is_block_device() {
                    Some(FileType::BlockDevice)
                } else {
                    None
                }
            });
            entries.push(DirEntry {
                name: entry.file_name(),
                kind,
            });
        }
        Ok(entries)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let layer = LocalLayer::new();

        let fd = layer
            .open(
                &path,
                OpenFlags(libc::O_RDWR | libc::O_CREAT),
                0o644,
            )
            .unwrap();
        assert_eq!(layer.pwrite(fd, b"payload", 0).unwrap(), 7);
        let mut buf = [0u8; 7];
        assert_eq!(layer.pread(fd, &mut buf, 0).unwrap(), 7);
        assert_eq!(&buf, b"payload");

        let st = layer.fstat(fd).unwrap();
        assert_eq!(st.size, 7);
        assert!(st.is_regular_file());

        layer.ftruncate(fd, 3).unwrap();
        assert_eq!(layer.fstat(fd).unwrap().size, 3);

        layer.close(fd).unwrap();
        layer.unlink(&path).unwrap();
        assert!(layer.lstat(&path).unwrap_err().is_not_found());
    }

    #[test]
    fn pread_past_eof_is_short() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let layer = LocalLayer::new();
        let fd = layer
            .open(&path, OpenFlags(libc::O_RDWR | libc::O_CREAT), 0o644)
            .unwrap();
        layer.pwrite(fd, b"abc", 0).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(layer.pread(fd, &mut buf, 1).unwrap(), 2);
        assert_eq!(layer.pread(fd, &mut buf, 3).unwrap(), 0);
        layer.close(fd).unwrap();
    }

    #[test]
    fn negative_fd_is_invalid_argument() {
        let layer = LocalLayer::new();
        let mut buf = [0u8; 1];
        assert!(matches!(
            layer.pread(-1, &mut buf, 0).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn readdir_lists_created_files() {
        let dir = TempDir::new().unwrap();
        let layer = LocalLayer::new();
        std::fs::write(dir.path().join("a"), b"1").unwrap();
        std::fs::write(dir.path().join("b"), b"2").unwrap();
        let mut names: Vec<_> = layer
            .readdir(dir.path())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }
}
