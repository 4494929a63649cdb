//! Owned stat records returned by the stat operations.

use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// File types
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Named pipe (`S_IFIFO`)
    NamedPipe,
    /// Character device (`S_IFCHR`)
    CharDevice,
    /// Block device (`S_IFBLK`)
    BlockDevice,
    /// Directory (`S_IFDIR`)
    Directory,
    /// Regular file (`S_IFREG`)
    RegularFile,
    /// Symbolic link (`S_IFLNK`)
    Symlink,
    /// Unix domain socket (`S_IFSOCK`)
    Socket,
}

impl FileType {
    fn from_mode(mode: u32) -> FileType {
        match mode & libc::S_IFMT as u32 {
            x if x == libc::S_IFIFO as u32 => FileType::NamedPipe,
            x if x == libc::S_IFCHR as u32 => FileType::CharDevice,
            x if x == libc::S_IFBLK as u32 => FileType::BlockDevice,
            x if x == libc::S_IFDIR as u32 => FileType::Directory,
            x if x == libc::S_IFLNK as u32 => FileType::Symlink,
            x if x == libc::S_IFSOCK as u32 => FileType::Socket,
            _ => FileType::RegularFile,
        }
    }
}

/// File attributes as observed through a layer stack.
///
/// Layers that change the apparent size of a file (the compression layer)
/// rewrite `size` while leaving the rest of the record untouched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileStat {
    /// Device containing the file
    pub dev: u64,
    /// Inode number
    pub ino: u64,
    /// Size in bytes
    pub size: u64,
    /// Allocated size in 512-byte blocks. May be smaller than the actual file size
    /// if the file is compressed or sparse.
    pub blocks: u64,
    /// Kind of file (directory, file, pipe, etc)
    pub kind: FileType,
    /// Full mode word including permission bits
    pub mode: u32,
    /// Number of hard links
    pub nlink: u64,
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
    /// Rdev
    pub rdev: u64,
    /// Preferred I/O block size
    pub block_size: u32,
    /// Time of last access
    pub atime: SystemTime,
    /// Time of last modification
    pub mtime: SystemTime,
    /// Time of last change
    pub ctime: SystemTime,
}

impl FileStat {
    /// Whether this record describes a regular file.
    pub fn is_regular_file(&self) -> bool {
        self.kind == FileType::RegularFile
    }
}

fn system_time(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        // Pre-epoch timestamps; nanos counts forward from the (negative) second.
        UNIX_EPOCH - Duration::new((-secs) as u64, 0) + Duration::new(0, nanos as u32)
    }
}

impl From<libc::stat> for FileStat {
    fn from(st: libc::stat) -> Self {
        FileStat {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            size: st.st_size as u64,
            blocks: st.st_blocks as u64,
            kind: FileType::from_mode(st.st_mode as u32),
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev as u64,
            block_size: st.st_blksize as u32,
            atime: system_time(st.st_atime as i64, st.st_atime_nsec as i64),
            mtime: system_time(st.st_mtime as i64, st.st_mtime_nsec as i64),
            ctime: system_time(st.st_ctime as i64, st.st_ctime_nsec as i64),
        }
    }
}

/// A single directory entry returned by readdir.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// File name within the directory (no path components).
    pub name: std::ffi::OsString,
    /// Entry type, when the host filesystem reports one.
    pub kind: Option<FileType>,
}
