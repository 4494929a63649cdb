//! Composable layered POSIX-style I/O stacks.
//!
//! An application holds a single root [`Layer`] and issues POSIX-shaped
//! operations on it (`open`/`close`/`pread`/`pwrite`/`ftruncate`/`fstat`/
//! `lstat`/`unlink`, plus a few helpers). Each layer transforms the request
//! and forwards it to its downstream layer(s); a terminal [`LocalLayer`]
//! performs the real syscalls. The application never sees the stack, only
//! the root.
//!
//! The crate ships three substantial layers: block-sparse compression
//! ([`CompressLayer`]), a block read cache ([`ReadCacheLayer`]) and a
//! parallel demultiplexer ([`DemuxLayer`]), plus the terminal layer and
//! the concurrency substrate they share. Stacks can be assembled directly
//! or built from a declarative JSON description (see [`config`]).
//!
//! ```no_run
//! use std::path::Path;
//! use iostack::{CompressLayer, CompressOptions, Layer, LocalLayer, OpenFlags, ZstdCodec};
//!
//! # fn main() -> iostack::Result<()> {
//! let root = CompressLayer::new(
//!     Box::new(LocalLayer::new()),
//!     Box::new(ZstdCodec),
//!     CompressOptions::default(),
//! )?;
//! let fd = root.open(Path::new("/tmp/f"), OpenFlags(libc::O_RDWR | libc::O_CREAT), 0o644)?;
//! root.pwrite(fd, b"Hello, World!", 0)?;
//! assert_eq!(root.fstat(fd)?.size, 13);
//! root.close(fd)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod cache;
pub mod compress;
pub mod config;
pub mod demux;
pub mod dispatch;
mod error;
pub mod hash;
mod layer;
mod local;
pub mod lock_table;
mod open_flags;
pub mod request_ctx;
mod stat;

pub use crate::cache::CacheBackend;
pub use crate::cache::LruBackend;
pub use crate::cache::ReadCacheLayer;
pub use crate::compress::Codec;
pub use crate::compress::CompressLayer;
pub use crate::compress::CompressOptions;
pub use crate::compress::Lz4Codec;
pub use crate::compress::ZstdCodec;
pub use crate::compress::codec_by_name;
pub use crate::config::StackConfig;
pub use crate::config::build_stack;
pub use crate::config::load_stack;
pub use crate::demux::DemuxBranch;
pub use crate::demux::DemuxLayer;
pub use crate::error::Error;
pub use crate::error::Result;
pub use nix::errno::Errno;
pub use crate::hash::Blake3Hasher;
pub use crate::hash::Hasher;
pub use crate::layer::Fd;
pub use crate::layer::INVALID_FD;
pub use crate::layer::Layer;
pub use crate::layer::MAX_FDS;
pub use crate::local::LocalLayer;
pub use crate::lock_table::PathLocks;
pub use crate::open_flags::FallocateMode;
pub use crate::open_flags::OpenAccMode;
pub use crate::open_flags::OpenFlags;
pub use crate::stat::DirEntry;
pub use crate::stat::FileStat;
pub use crate::stat::FileType;
