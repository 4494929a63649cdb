//! Declarative stack configuration.
//!
//! A stack is described as a map of named layer definitions plus the name
//! of the root; unary layers point at their downstream through `next`, the
//! demultiplexer lists its ordered downstreams in `layers`. The builder
//! resolves the names into a layer tree, rejecting unknown names, reuse of
//! a definition (the graph must be a tree) and cycles.
//!
//! ```json
//! {
//!   "root": "cache",
//!   "layers": {
//!     "cache": { "type": "read_cache", "next": "comp", "num_blocks": 200 },
//!     "comp":  { "type": "compression", "algorithm": "zstd", "next": "disk" },
//!     "disk":  { "type": "local" }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::cache::ReadCacheLayer;
use crate::compress::CompressLayer;
use crate::compress::CompressOptions;
use crate::compress::codec_by_name;
use crate::demux::DemuxBranch;
use crate::demux::DemuxLayer;
use crate::error::Error;
use crate::error::Result;
use crate::layer::Layer;
use crate::local::LocalLayer;

fn default_block_size() -> usize {
    4096
}

fn default_num_blocks() -> usize {
    100
}

fn default_mode() -> String {
    "sparse_block".into()
}

/// Compression layer options.
#[derive(Clone, Debug, Deserialize)]
pub struct CompressionConfig {
    /// Codec selector ("zstd", "lz4").
    pub algorithm: String,
    /// Codec compression level; the codec's default when absent.
    #[serde(default)]
    pub level: Option<i32>,
    /// Name of the downstream layer.
    pub next: String,
    /// Storage mode; only "sparse_block" is supported.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Logical block size in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Punch holes when a rewrite shrinks a block's payload.
    #[serde(default)]
    pub free_space: bool,
}

/// Read cache layer options.
#[derive(Clone, Debug, Deserialize)]
pub struct ReadCacheConfig {
    /// Name of the downstream layer.
    pub next: String,
    /// Cache block size in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Cache capacity in blocks.
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
}

/// Demultiplexer layer options.
#[derive(Clone, Debug, Deserialize)]
pub struct DemuxConfig {
    /// Ordered downstream layer names.
    pub layers: Vec<String>,
    /// Downstreams whose results are authoritative. Defaults to the first
    /// downstream when empty.
    #[serde(default)]
    pub enforced_layers: Vec<String>,
    /// Downstreams whose preads are simulated as no-ops.
    #[serde(default)]
    pub passthrough_reads: Vec<String>,
    /// Downstreams whose pwrites are simulated as no-ops.
    #[serde(default)]
    pub passthrough_writes: Vec<String>,
}

/// One named layer definition.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerConfig {
    /// Terminal layer performing native syscalls.
    Local,
    /// Block-sparse compression layer.
    Compression(CompressionConfig),
    /// Block read cache layer.
    ReadCache(ReadCacheConfig),
    /// Parallel multi-downstream dispatch layer.
    Demultiplexer(DemuxConfig),
}

/// A full stack description.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    /// Name of the root layer.
    pub root: String,
    /// Layer definitions by name.
    pub layers: HashMap<String, LayerConfig>,
}

impl StackConfig {
    /// Parses a JSON stack description.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| Error::ConfigInvalid(format!("stack config: {err}")))
    }
}

/// Builds the layer tree a config describes.
pub fn build_stack(config: &StackConfig) -> Result<Box<dyn Layer>> {
    let mut used = HashSet::new();
    build_node(config, &config.root, &mut used)
}

/// Reads a JSON stack description from `path` and builds it.
///
/// An unreadable config file is a configuration error, not a downstream
/// I/O failure: nothing was built and retrying will not help.
pub fn load_stack(path: &Path) -> Result<Box<dyn Layer>> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| Error::ConfigInvalid(format!("reading stack config {path:?}: {err}")))?;
    build_stack(&StackConfig::from_json(&text)?)
}

fn build_node(
    config: &StackConfig,
    name: &str,
    used: &mut HashSet<String>,
) -> Result<Box<dyn Layer>> {
    if !used.insert(name.to_string()) {
        return Err(Error::ConfigInvalid(format!(
            "layer {name:?} is referenced more than once; the stack must be a tree"
        )));
    }
    let definition = config
        .layers
        .get(name)
        .ok_or_else(|| Error::ConfigInvalid(format!("unknown layer {name:?}")))?;

    match definition {
        LayerConfig::Local => Ok(Box::new(LocalLayer::new())),

        LayerConfig::Compression(c) => {
            if c.mode != "sparse_block" {
                return Err(Error::ConfigInvalid(format!(
                    "compression mode {:?} is not supported",
                    c.mode
                )));
            }
            let next = build_node(config, &c.next, used)?;
            let codec = codec_by_name(&c.algorithm)?;
            let layer = CompressLayer::new(
                next,
                codec,
                CompressOptions {
                    block_size: c.block_size,
                    level: c.level,
                    punch_holes: c.free_space,
                },
            )?;
            Ok(Box::new(layer))
        }

        LayerConfig::ReadCache(c) => {
            let next = build_node(config, &c.next, used)?;
            Ok(Box::new(ReadCacheLayer::with_lru(
                next,
                c.block_size,
                c.num_blocks,
            )?))
        }

        LayerConfig::Demultiplexer(c) => {
            if c.layers.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "demultiplexer {name:?} lists no downstreams"
                )));
            }
            for list in [&c.enforced_layers, &c.passthrough_reads, &c.passthrough_writes] {
                for referenced in list {
                    if !c.layers.contains(referenced) {
                        return Err(Error::ConfigInvalid(format!(
                            "demultiplexer {name:?} references {referenced:?} \
                             which is not one of its downstreams"
                        )));
                    }
                }
            }
            let mut branches = Vec::with_capacity(c.layers.len());
            for downstream in &c.layers {
                branches.push(DemuxBranch {
                    layer: build_node(config, downstream, used)?,
                    enforced: c.enforced_layers.contains(downstream),
                    passthrough_read: c.passthrough_reads.contains(downstream),
                    passthrough_write: c.passthrough_writes.contains(downstream),
                });
            }
            Ok(Box::new(DemuxLayer::new(branches)?))
        }
    }
}
