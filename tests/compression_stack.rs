//! End-to-end tests for a compression-over-local stack.

mod util;

use std::path::Path;
use std::path::PathBuf;

use iostack::CompressLayer;
use iostack::CompressOptions;
use iostack::Layer;
use iostack::LocalLayer;
use iostack::Lz4Codec;
use iostack::OpenFlags;
use iostack::ZstdCodec;
use tempfile::TempDir;
use util::rw_create;

fn stack(block_size: usize) -> CompressLayer {
    CompressLayer::new(
        Box::new(LocalLayer::new()),
        Box::new(ZstdCodec),
        CompressOptions {
            block_size,
            level: None,
            punch_holes: false,
        },
    )
    .unwrap()
}

fn file(dir: &TempDir) -> PathBuf {
    dir.path().join("f")
}

#[test]
fn hello_world_round_trip() {
    let dir = TempDir::new().unwrap();
    let root = stack(4096);
    let path = file(&dir);

    let fd = root.open(&path, rw_create(), 0o644).unwrap();
    assert_eq!(root.pwrite(fd, b"Hello, World!\0", 0).unwrap(), 14);

    let mut buf = [0u8; 14];
    assert_eq!(root.pread(fd, &mut buf, 0).unwrap(), 14);
    assert_eq!(&buf, b"Hello, World!\0");
    assert_eq!(root.fstat(fd).unwrap().size, 14);
    root.close(fd).unwrap();
}

#[test]
fn random_access_overwrite_inside_block() {
    let dir = TempDir::new().unwrap();
    let root = stack(16);
    let path = file(&dir);

    let fd = root.open(&path, rw_create(), 0o644).unwrap();
    root.pwrite(fd, &[b'A'; 48], 0).unwrap();
    assert_eq!(root.pwrite(fd, b"ZZZZ", 20).unwrap(), 4);

    let mut buf = [0u8; 48];
    assert_eq!(root.pread(fd, &mut buf, 0).unwrap(), 48);
    let mut expect = [b'A'; 48];
    expect[20..24].copy_from_slice(b"ZZZZ");
    assert_eq!(buf, expect);
    root.close(fd).unwrap();
}

#[test]
fn truncate_shrink_across_block_boundary() {
    let dir = TempDir::new().unwrap();
    let root = stack(16);
    let path = file(&dir);

    let fd = root.open(&path, rw_create(), 0o644).unwrap();
    root.pwrite(fd, &[b'A'; 48], 0).unwrap();
    root.ftruncate(fd, 20).unwrap();

    assert_eq!(root.fstat(fd).unwrap().size, 20);
    let mut buf = [0u8; 32];
    assert_eq!(root.pread(fd, &mut buf, 0).unwrap(), 20);
    assert_eq!(&buf[..20], &[b'A'; 20]);

    // Truncating to the same length twice changes nothing.
    root.ftruncate(fd, 20).unwrap();
    assert_eq!(root.fstat(fd).unwrap().size, 20);
    root.close(fd).unwrap();
}

#[test]
fn restart_rebuilds_index_from_storage() {
    let dir = TempDir::new().unwrap();
    let path = file(&dir);
    let payload: Vec<u8> = (0..48u8).map(|i| i % 7 + b'a').collect();

    {
        let root = stack(16);
        let fd = root.open(&path, rw_create(), 0o644).unwrap();
        root.pwrite(fd, &payload, 0).unwrap();
        root.close(fd).unwrap();
        // Dropping the stack simulates a process restart: the in-memory
        // index is gone, the file stays.
    }

    let root = stack(16);
    assert_eq!(root.lstat(&path).unwrap().size, 48);

    let fd = root.open(&path, OpenFlags::RDWR, 0o644).unwrap();
    let mut buf = [0u8; 48];
    assert_eq!(root.pread(fd, &mut buf, 0).unwrap(), 48);
    assert_eq!(&buf[..], &payload[..]);
    root.close(fd).unwrap();
}

#[test]
fn restart_rebuilds_mixed_raw_and_compressed_blocks() {
    let dir = TempDir::new().unwrap();
    let path = file(&dir);

    // Block 0 compresses well, block 1 does not and is stored raw.
    let mut payload = vec![b'A'; 16];
    payload.extend((0..16u8).map(|i| i.wrapping_mul(41) ^ 0x3C));

    {
        let root = stack(16);
        let fd = root.open(&path, rw_create(), 0o644).unwrap();
        root.pwrite(fd, &payload, 0).unwrap();
        root.close(fd).unwrap();
    }

    let root = stack(16);
    let fd = root.open(&path, OpenFlags::RDWR, 0o644).unwrap();
    assert_eq!(root.fstat(fd).unwrap().size, 32);
    let mut buf = [0u8; 32];
    assert_eq!(root.pread(fd, &mut buf, 0).unwrap(), 32);
    assert_eq!(&buf[..], &payload[..]);
    root.close(fd).unwrap();
}

#[test]
fn restart_recovers_sparse_tail() {
    let dir = TempDir::new().unwrap();
    let path = file(&dir);

    {
        let root = stack(16);
        let fd = root.open(&path, rw_create(), 0o644).unwrap();
        root.pwrite(fd, &[b'x'; 4], 0).unwrap();
        root.ftruncate(fd, 40).unwrap();
        root.close(fd).unwrap();
    }

    let root = stack(16);
    assert_eq!(root.lstat(&path).unwrap().size, 40);
    let fd = root.open(&path, OpenFlags::RDWR, 0o644).unwrap();
    let mut buf = [0xFFu8; 40];
    assert_eq!(root.pread(fd, &mut buf, 0).unwrap(), 40);
    assert_eq!(&buf[..4], b"xxxx");
    assert!(buf[4..].iter().all(|&b| b == 0));
    root.close(fd).unwrap();
}

#[test]
fn lz4_stack_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = file(&dir);
    let root = CompressLayer::new(
        Box::new(LocalLayer::new()),
        Box::new(Lz4Codec),
        CompressOptions {
            block_size: 64,
            level: None,
            punch_holes: false,
        },
    )
    .unwrap();

    let payload = b"lz4 round trip payload, repeated enough to compress. \
                    lz4 round trip payload, repeated enough to compress."
        .to_vec();
    let fd = root.open(&path, rw_create(), 0o644).unwrap();
    assert_eq!(root.pwrite(fd, &payload, 0).unwrap(), payload.len());
    root.close(fd).unwrap();

    // Reopen through a fresh stack to force an lz4 frame rescan as well.
    let root = CompressLayer::new(
        Box::new(LocalLayer::new()),
        Box::new(Lz4Codec),
        CompressOptions {
            block_size: 64,
            level: None,
            punch_holes: false,
        },
    )
    .unwrap();
    let fd = root.open(&path, OpenFlags::RDWR, 0o644).unwrap();
    let mut buf = vec![0u8; payload.len()];
    assert_eq!(root.pread(fd, &mut buf, 0).unwrap(), payload.len());
    assert_eq!(buf, payload);
    root.close(fd).unwrap();
}

#[test]
fn unlink_with_open_fd_keeps_data_until_close() {
    let dir = TempDir::new().unwrap();
    let path = file(&dir);
    let root = stack(16);

    let fd = root.open(&path, rw_create(), 0o644).unwrap();
    root.pwrite(fd, b"still here", 0).unwrap();
    root.unlink(&path).unwrap();

    let mut buf = [0u8; 10];
    assert_eq!(root.pread(fd, &mut buf, 0).unwrap(), 10);
    assert_eq!(&buf, b"still here");
    root.close(fd).unwrap();

    assert!(root.lstat(&path).unwrap_err().is_not_found());
}

#[test]
fn hole_punching_stack_preserves_content() {
    let dir = TempDir::new().unwrap();
    let path = file(&dir);
    let root = CompressLayer::new(
        Box::new(LocalLayer::new()),
        Box::new(ZstdCodec),
        CompressOptions {
            block_size: 4096,
            level: None,
            punch_holes: true,
        },
    )
    .unwrap();

    let fd = root.open(&path, rw_create(), 0o644).unwrap();
    // A poorly compressible block first, then a rewrite that shrinks it.
    let noisy: Vec<u8> = (0..4096u32).map(|i| (i * 2654435761 >> 13) as u8).collect();
    root.pwrite(fd, &noisy, 0).unwrap();
    root.pwrite(fd, &vec![b'z'; 4096], 0).unwrap();

    let mut buf = vec![0u8; 4096];
    assert_eq!(root.pread(fd, &mut buf, 0).unwrap(), 4096);
    assert!(buf.iter().all(|&b| b == b'z'));
    root.close(fd).unwrap();
}

#[test]
fn stat_of_directory_is_untouched() {
    let dir = TempDir::new().unwrap();
    let root = stack(4096);
    let st = root.lstat(dir.path()).unwrap();
    assert_eq!(st.kind, iostack::FileType::Directory);
}

#[test]
fn path_truncate_equals_fd_truncate(){
    let dir = TempDir::new().unwrap();
    let path = file(&dir);
    let root = stack(16);

    let fd = root.open(&path, rw_create(), 0o644).unwrap();
    root.pwrite(fd, &[b'B'; 40], 0).unwrap();
    root.close(fd).unwrap();

    root.truncate(&path, 18).unwrap();
    assert_eq!(root.lstat(&path).unwrap().size, 18);

    let fd = root.open(&path, OpenFlags::RDWR, 0o644).unwrap();
    let mut buf = [0u8; 40];
    assert_eq!(root.pread(fd, &mut buf, 0).unwrap(), 18);
    assert_eq!(&buf[..18], &[b'B'; 18]);
    root.close(fd).unwrap();
}

#[test]
fn many_small_random_writes_read_back_exactly() {
    let dir = TempDir::new().unwrap();
    let path = file(&dir);
    let root = stack(32);

    let fd = root.open(&path, rw_create(), 0o644).unwrap();
    // Deterministic pseudo-random write pattern over a 1 KiB file.
    let mut expect = vec![0u8; 1024];
    let mut seed = 0x2545F491u64;
    for _ in 0..200 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let off = (seed >> 33) as usize % 1000;
        let len = 1 + (seed >> 20) as usize % 24;
        let byte = (seed >> 11) as u8;
        let chunk = vec![byte; len];
        root.pwrite(fd, &chunk, off as u64).unwrap();
        expect[off..off + len].copy_from_slice(&chunk);
    }
    let eof = root.fstat(fd).unwrap().size as usize;
    let mut buf = vec![0u8; 1024];
    assert_eq!(root.pread(fd, &mut buf, 0).unwrap(), eof);
    assert_eq!(&buf[..eof], &expect[..eof]);
    root.close(fd).unwrap();
}

#[test]
fn empty_path_is_rejected() {
    let root = stack(16);
    assert!(root.open(Path::new(""), rw_create(), 0o644).is_err());
}
