//! Narrow interface to the block store used by the read cache.
//!
//! The read cache does not care how entries are stored or evicted; it talks
//! to whatever the embedder links through [`CacheBackend`]. The shipped
//! implementation wraps an LRU map.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::Error;
use crate::error::Result;

/// Cache key: one block of one inode.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BlockKey {
    /// Inode the block belongs to.
    pub ino: u64,
    /// Block index within the file.
    pub index: u64,
}

/// Block store capability consumed by the read cache layer.
pub trait CacheBackend: Send + Sync {
    /// Stores `data` under `key`, replacing any previous entry.
    fn insert(&self, key: BlockKey, data: Vec<u8>);

    /// Returns a copy of the entry under `key`, marking it recently used.
    fn get(&self, key: &BlockKey) -> Option<Vec<u8>>;

    /// Whether an entry exists under `key`, without touching recency.
    fn contains(&self, key: &BlockKey) -> bool;

    /// Removes the entry under `key`; returns whether one existed.
    fn remove(&self, key: &BlockKey) -> bool;

    /// Number of live entries.
    fn len(&self) -> usize;

    /// Whether the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`CacheBackend`] over an LRU map with a fixed capacity in blocks.
#[derive(Debug)]
pub struct LruBackend {
    entries: Mutex<LruCache<BlockKey, Vec<u8>>>,
}

impl LruBackend {
    /// Creates a backend holding at most `capacity` blocks.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| Error::ConfigInvalid("cache capacity must be at least 1".into()))?;
        Ok(LruBackend {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }
}

impl CacheBackend for LruBackend {
    fn insert(&self, key: BlockKey, data: Vec<u8>) {
        self.entries.lock().put(key, data);
    }

    fn get(&self, key: &BlockKey) -> Option<Vec<u8>> {
        self.entries.lock().get(key).cloned()
    }

    fn contains(&self, key: &BlockKey) -> bool {
        self.entries.lock().contains(key)
    }

    fn remove(&self, key: &BlockKey) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
