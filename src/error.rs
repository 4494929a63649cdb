//! Error type shared by every layer.
//!
//! Operations return [`Error`] instead of a bare negative integer; front-ends
//! that need a POSIX-shaped result can recover one through [`Error::errno`].
//! Errors raised by a downstream syscall keep the original [`Errno`] so it
//! survives the trip back up the stack.

use nix::errno::Errno;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error raised by a layer operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument was rejected (bad fd, bogus range, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A fixed resource limit was hit, e.g. an fd at or beyond `MAX_FDS`.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A mapping entry that must exist was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A downstream operation failed; carries the propagated errno.
    #[error("downstream failure: {0}")]
    Downstream(Errno),

    /// Internal bookkeeping disagreed with observed state.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Compression or decompression failed.
    #[error("codec failure: {0}")]
    Codec(String),

    /// The layer does not implement this operation and has no downstream
    /// to forward it to.
    #[error("operation {0} is not supported by this layer")]
    Unsupported(&'static str),

    /// Configuration was rejected at stack construction time. Terminal:
    /// no stack is built.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl Error {
    /// The errno a POSIX front-end should report for this error.
    pub fn errno(&self) -> Errno {
        match self {
            Error::InvalidArgument(_) => Errno::EINVAL,
            Error::ResourceExhausted(_) => Errno::EMFILE,
            Error::NotFound(_) => Errno::ENOENT,
            Error::Downstream(errno) => *errno,
            Error::InvariantViolation(_) => Errno::EIO,
            Error::Codec(_) => Errno::EIO,
            Error::Unsupported(_) => Errno::ENOSYS,
            Error::ConfigInvalid(_) => Errno::EINVAL,
        }
    }

    /// True when the error propagates a downstream `ENOENT`.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::Downstream(Errno::ENOENT)
        )
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Downstream(errno)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Error::Downstream(Errno::from_raw(code)),
            None => Error::Codec(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::InvalidArgument("x".into()).errno(), Errno::EINVAL);
        assert_eq!(Error::NotFound("x".into()).errno(), Errno::ENOENT);
        assert_eq!(Error::Unsupported("rename").errno(), Errno::ENOSYS);
        assert_eq!(Error::Downstream(Errno::EACCES).errno(), Errno::EACCES);
    }

    #[test]
    fn io_error_keeps_os_code() {
        let io = std::io::Error::from_raw_os_error(libc::ENOSPC);
        let err: Error = io.into();
        assert_eq!(err.errno(), Errno::ENOSPC);
    }

    #[test]
    fn not_found_detection() {
        assert!(Error::Downstream(Errno::ENOENT).is_not_found());
        assert!(Error::NotFound("m".into()).is_not_found());
        assert!(!Error::Downstream(Errno::EIO).is_not_found());
    }
}
