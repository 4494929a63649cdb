//! Path-keyed reader-writer locks with refcounted cleanup.
//!
//! Layers that keep per-path state serialize operations through a
//! [`PathLocks`] table: readers share, writers exclude, and a path's lock
//! entry exists only while someone holds or is waiting on it. The table
//! itself is guarded by one mutex; the per-path rwlocks are independent, so
//! operations on different paths never contend beyond the brief map lookup.
//!
//! Invariant: an entry's refcount equals acquires minus releases; the entry
//! is removed from the map exactly when it reaches zero. No entry can
//! disappear while a holder still references it because the holder's
//! acquire is counted until its guard drops.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::ArcRwLockReadGuard;
use parking_lot::ArcRwLockWriteGuard;
use parking_lot::Mutex;
use parking_lot::RawRwLock;
use parking_lot::RwLock;

struct Slot {
    lock: Arc<RwLock<()>>,
    refs: usize,
}

/// Table of per-path reader-writer locks.
#[derive(Default)]
pub struct PathLocks {
    table: Mutex<HashMap<PathBuf, Slot>>,
}

impl PathLocks {
    /// Creates an empty table.
    pub fn new() -> Self {
        PathLocks::default()
    }

    /// Looks up or creates the slot for `path` and counts one acquire.
    fn retain(&self, path: &Path) -> Arc<RwLock<()>> {
        let mut table = self.table.lock();
        let slot = table.entry(path.to_path_buf()).or_insert_with(|| Slot {
            lock: Arc::new(RwLock::new(())),
            refs: 0,
        });
        slot.refs += 1;
        Arc::clone(&slot.lock)
    }

    /// Counts one release; drops the slot when nobody references it.
    fn release(&self, path: &Path) {
        let mut table = self.table.lock();
        if let Some(slot) = table.get_mut(path) {
            slot.refs -= 1;
            if slot.refs == 0 {
                table.remove(path);
            }
        }
    }

    /// Acquires the read side of `path`'s lock, blocking while a writer
    /// holds it.
    pub fn read(&self, path: &Path) -> PathReadGuard<'_> {
        let lock = self.retain(path);
        PathReadGuard {
            table: self,
            path: path.to_path_buf(),
            guard: Some(lock.read_arc()),
        }
    }

    /// Acquires the write side of `path`'s lock, blocking out all other
    /// holders.
    pub fn write(&self, path: &Path) -> PathWriteGuard<'_> {
        let lock = self.retain(path);
        PathWriteGuard {
            table: self,
            path: path.to_path_buf(),
            guard: Some(lock.write_arc()),
        }
    }

    /// Number of live entries. Zero whenever no guard is outstanding.
    pub fn entry_count(&self) -> usize {
        self.table.lock().len()
    }

    #[cfg(test)]
    fn refcount(&self, path: &Path) -> usize {
        self.table.lock().get(path).map(|s| s.refs).unwrap_or(0)
    }
}

/// Shared hold on one path's lock; released on drop.
#[must_use = "dropping the guard releases the lock"]
pub struct PathReadGuard<'a> {
    table: &'a PathLocks,
    path: PathBuf,
    guard: Option<ArcRwLockReadGuard<RawRwLock, ()>>,
}

impl Drop for PathReadGuard<'_> {
    fn drop(&mut self) {
        // Release the rwlock before the refcount so a waiter that wins the
        // race still finds a live entry.
        drop(self.guard.take());
        self.table.release(&self.path);
    }
}

/// Exclusive hold on one path's lock; released on drop.
#[must_use = "dropping the guard releases the lock"]
pub struct PathWriteGuard<'a> {
    table: &'a PathLocks,
    path: PathBuf,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, ()>>,
}

impl Drop for PathWriteGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.table.release(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    #[test]
    fn refcount_tracks_acquires_and_releases() {
        let locks = PathLocks::new();
        let path = Path::new("/a");

        let r1 = locks.read(path);
        let r2 = locks.read(path);
        assert_eq!(locks.refcount(path), 2);
        drop(r1);
        assert_eq!(locks.refcount(path), 1);
        drop(r2);
        assert_eq!(locks.refcount(path), 0);
        assert_eq!(locks.entry_count(), 0);
    }

    #[test]
    fn entries_are_per_path() {
        let locks = PathLocks::new();
        let _a = locks.write(Path::new("/a"));
        let _b = locks.write(Path::new("/b"));
        assert_eq!(locks.entry_count(), 2);
    }

    #[test]
    fn writer_excludes_readers() {
        let locks = Arc::new(PathLocks::new());
        let observed = Arc::new(AtomicUsize::new(0));

        let w = locks.write(Path::new("/a"));
        let handle = {
            let locks = Arc::clone(&locks);
            let observed = Arc::clone(&observed);
            std::thread::spawn(move || {
                let _r = locks.read(Path::new("/a"));
                observed.store(1, Ordering::SeqCst);
            })
        };
        // The reader must be parked behind the writer.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        drop(w);
        handle.join().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(locks.entry_count(), 0);
    }

    #[test]
    fn readers_share() {
        let locks = Arc::new(PathLocks::new());
        let _r = locks.read(Path::new("/a"));
        let locks2 = Arc::clone(&locks);
        std::thread::spawn(move || {
            let _also = locks2.read(Path::new("/a"));
        })
        .join()
        .expect("concurrent reader");
    }
}
