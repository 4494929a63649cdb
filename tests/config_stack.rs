//! Stacks built from declarative configuration, driven end to end.

mod util;

use iostack::StackConfig;
use iostack::build_stack;
use iostack::load_stack;
use tempfile::TempDir;
use util::rw_create;

#[test]
fn cache_over_compression_stack_from_json() {
    let dir = TempDir::new().unwrap();
    let root = build_stack(
        &StackConfig::from_json(
            r#"{
                "root": "cache",
                "layers": {
                    "cache": { "type": "read_cache", "next": "comp",
                               "block_size": 8, "num_blocks": 32 },
                    "comp": { "type": "compression", "algorithm": "zstd",
                              "block_size": 16, "next": "disk" },
                    "disk": { "type": "local" }
                }
            }"#,
        )
        .unwrap(),
    )
    .unwrap();

    let path = dir.path().join("f");
    let fd = root.open(&path, rw_create(), 0o644).unwrap();
    let payload: Vec<u8> = (0..64u8).map(|i| i / 3 + b'0').collect();
    assert_eq!(root.pwrite(fd, &payload, 0).unwrap(), 64);
    assert_eq!(root.fstat(fd).unwrap().size, 64);

    let mut buf = vec![0u8; 64];
    assert_eq!(root.pread(fd, &mut buf, 0).unwrap(), 64);
    assert_eq!(buf, payload);
    root.close(fd).unwrap();
}

#[test]
fn demultiplexer_stack_from_json() {
    let dir = TempDir::new().unwrap();
    let root = build_stack(
        &StackConfig::from_json(
            r#"{
                "root": "mux",
                "layers": {
                    "mux": { "type": "demultiplexer",
                             "layers": ["store", "mirror"],
                             "enforced_layers": ["store"],
                             "passthrough_writes": ["mirror"] },
                    "store": { "type": "compression", "algorithm": "lz4",
                               "block_size": 32, "next": "disk" },
                    "mirror": { "type": "local" },
                    "disk": { "type": "local" }
                }
            }"#,
        )
        .unwrap(),
    )
    .unwrap();

    let path = dir.path().join("f");
    let fd = root.open(&path, rw_create(), 0o644).unwrap();
    assert_eq!(root.pwrite(fd, b"fan out", 0).unwrap(), 7);
    let mut buf = [0u8; 7];
    assert_eq!(root.pread(fd, &mut buf, 0).unwrap(), 7);
    assert_eq!(&buf, b"fan out");
    root.close(fd).unwrap();
}

#[test]
fn load_stack_reads_the_config_file() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("stack.json");
    std::fs::write(
        &config_path,
        r#"{ "root": "disk", "layers": { "disk": { "type": "local" } } }"#,
    )
    .unwrap();

    let root = load_stack(&config_path).unwrap();
    let path = dir.path().join("f");
    let fd = root.open(&path, rw_create(), 0o644).unwrap();
    root.pwrite(fd, b"configured", 0).unwrap();
    assert_eq!(root.lstat(&path).unwrap().size, 10);
    root.close(fd).unwrap();
}

#[test]
fn missing_config_file_is_a_config_error() {
    assert!(matches!(
        load_stack(std::path::Path::new("/no/such/stack.json")).unwrap_err(),
        iostack::Error::ConfigInvalid(_)
    ));
}
