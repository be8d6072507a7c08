//! Free-list manager: hands region-sized extents to the allocator and takes
//! retired regions' extents back.
//!
//! Each extent comes out of one of a fixed number of per-thread shards, an
//! address-ordered `BTreeMap<start, size>` that coalesces with its
//! neighbors on free exactly the way the original collector's single
//! process-wide free deque did. Splitting this across shards means two
//! threads allocating concurrently don't fight over one lock; an
//! allocation that misses its own shard steals from the others before
//! giving up and mapping a fresh OS extent.

use std::sync::Mutex as StdMutex;
use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::arena::Arena;
use crate::error::Result;

struct Shard {
    free: BTreeMap<usize, usize>,
}

impl Shard {
    fn new() -> Shard {
        Shard {
            free: BTreeMap::new(),
        }
    }

    fn take(&mut self, size: usize) -> Option<(usize, usize)> {
        let hit = self
            .free
            .iter()
            .find(|(_, &blk_size)| blk_size >= size)
            .map(|(&start, &blk_size)| (start, blk_size));
        let (start, blk_size) = hit?;
        self.free.remove(&start);
        if blk_size > size {
            self.free.insert(start + size, blk_size - size);
        }
        Some((start, size))
    }

    /// Inserts `[start, start + size)` back, merging with the free block
    /// immediately before and/or after it.
    fn give(&mut self, start: usize, size: usize) {
        let end = start + size;

        let mut merged_start = start;
        let mut merged_size = size;

        if let Some((&prev_start, &prev_size)) = self.free.range(..start).next_back() {
            if prev_start + prev_size == start {
                self.free.remove(&prev_start);
                merged_start = prev_start;
                merged_size += prev_size;
            }
        }
        if let Some((&next_start, &next_size)) = self.free.range(end..).next() {
            if next_start == merged_start + merged_size {
                self.free.remove(&next_start);
                merged_size += next_size;
            }
        }
        self.free.insert(merged_start, merged_size);
    }
}

/// Owns every OS mapping this collector has requested and sub-allocates
/// region-sized extents out of them. Mappings themselves are never
/// returned to the OS while the manager is alive — only the extents carved
/// from them move between "free" and "in use".
pub struct FreeListManager {
    shards: Vec<Mutex<Shard>>,
    initial_single_size: usize,
    // Kept solely to outlive every extent handed out; never read after push.
    backing: StdMutex<Vec<Arena>>,
}

impl FreeListManager {
    pub fn new(shard_count: usize, initial_single_size: usize) -> FreeListManager {
        FreeListManager {
            shards: (0..shard_count.max(1)).map(|_| Mutex::new(Shard::new())).collect(),
            initial_single_size,
            backing: StdMutex::new(Vec::new()),
        }
    }

    fn shard_index(&self) -> usize {
        use std::hash::{Hash, Hasher};
        let tid = std::thread::current().id();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        tid.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Maps a fresh OS extent of at least `max(initial_single_size, size)`
    /// bytes and returns it in full, already recorded as backing storage.
    fn map_fresh(&self, size: usize) -> Result<(usize, usize)> {
        let map_size = size.max(self.initial_single_size);
        let arena = Arena::new(map_size)?;
        let start = arena.start();
        let len = arena.len();
        self.backing.lock().unwrap().push(arena);
        log::debug!("free-list manager mapped a fresh {len}-byte OS extent at {start:#x}");
        Ok((start, len))
    }

    /// Returns `(start, size)` of an extent at least `size` bytes long.
    /// Tries the calling thread's own shard first, then steals from every
    /// other shard, and only maps fresh OS memory once every shard is
    /// exhausted.
    pub fn allocate(&self, size: usize) -> Result<(usize, usize)> {
        let home = self.shard_index();
        if let Some(extent) = self.shards[home].lock().take(size) {
            return Ok(extent);
        }
        for (i, shard) in self.shards.iter().enumerate() {
            if i == home {
                continue;
            }
            if let Some(extent) = shard.lock().take(size) {
                return Ok(extent);
            }
        }
        let (start, mapped_len) = self.map_fresh(size)?;
        if mapped_len > size {
            self.shards[home].lock().give(start + size, mapped_len - size);
        }
        Ok((start, size))
    }

    /// Returns `[start, start + size)` to the calling thread's shard,
    /// coalescing with neighboring free blocks already in that shard.
    pub fn free(&self, start: usize, size: usize) {
        if size == 0 {
            return;
        }
        let home = self.shard_index();
        self.shards[home].lock().give(start, size);
    }
}
