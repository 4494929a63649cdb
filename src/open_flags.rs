use std::fmt;
use std::fmt::Formatter;
use std::fmt::LowerHex;
use std::fmt::UpperHex;

/// Access direction requested by an open: the `O_ACCMODE` part of the
/// flags.
///
/// Layers that transform stored data care about this: the compression
/// layer upgrades write-only opens to read-write downstream because
/// merging a partial block write means reading the old payload back.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum OpenAccMode {
    /// Reading only.
    O_RDONLY = libc::O_RDONLY,
    /// Writing only.
    O_WRONLY = libc::O_WRONLY,
    /// Reading and writing.
    O_RDWR = libc::O_RDWR,
}

/// Open flags as passed to the open operation.
///
/// A thin wrapper over the raw `O_*` bits so layers can inspect the flags
/// that change their bookkeeping (`O_CREAT`, `O_TRUNC`, the access mode)
/// without caring about the rest.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OpenFlags(pub i32);

impl LowerHex for OpenFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        LowerHex::fmt(&self.0, f)
    }
}

impl UpperHex for OpenFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        UpperHex::fmt(&self.0, f)
    }
}

impl OpenFlags {
    /// Read-only open with no other bits set.
    pub const RDONLY: OpenFlags = OpenFlags(libc::O_RDONLY);
    /// Read-write open with no other bits set.
    pub const RDWR: OpenFlags = OpenFlags(libc::O_RDWR);

    /// File access mode.
    pub fn acc_mode(self) -> OpenAccMode {
        if self.0 & libc::O_ACCMODE == libc::O_RDWR {
            OpenAccMode::O_RDWR
        } else if self.0 & libc::O_ACCMODE == libc::O_WRONLY {
            OpenAccMode::O_WRONLY
        } else {
            // O_RDONLY, or a nonsense accmode the field's owner put there;
            // the downstream open will reject the latter on its own.
            OpenAccMode::O_RDONLY
        }
    }

    /// These flags with the access mode replaced by `mode`.
    pub fn with_acc_mode(self, mode: OpenAccMode) -> OpenFlags {
        OpenFlags((self.0 & !libc::O_ACCMODE) | mode as i32)
    }

    /// Whether `O_CREAT` is set.
    pub fn is_creat(self) -> bool {
        self.0 & libc::O_CREAT != 0
    }

    /// Whether `O_TRUNC` is set.
    pub fn is_trunc(self) -> bool {
        self.0 & libc::O_TRUNC != 0
    }
}

bitflags::bitflags! {
    /// Mode bits accepted by the fallocate operation.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct FallocateMode: i32 {
        /// Deallocate the byte range, leaving a hole.
        const PUNCH_HOLE = 0x02;
        /// Do not change the apparent file size.
        const KEEP_SIZE = 0x01;
    }
}
