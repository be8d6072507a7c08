//! SATB (snapshot-at-the-beginning) queue pool.
//!
//! Every handle write or destruction that overwrites a live target during
//! `CONCURRENT_MARK` enqueues that old target here instead of relying on
//! the marker having already seen it. Sharded the same way as the root set
//! so concurrent mutators on different threads don't serialize on one
//! queue; the collector drains every shard during remark.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::region::Region;

/// One overwritten handle target recorded for remark to re-trace.
#[derive(Clone)]
pub struct SatbEntry {
    pub addr: usize,
    pub size: usize,
    pub region: Arc<Region>,
}

struct Shard {
    queue: Vec<SatbEntry>,
    distinct: Option<HashSet<usize>>,
}

impl Shard {
    fn new(distinct: bool) -> Shard {
        Shard {
            queue: Vec::new(),
            distinct: distinct.then(HashSet::new),
        }
    }
}

/// Sharded SATB buffer. `distinct` mirrors `GcConfig::distinct_satb`: when
/// enabled, an address already queued this cycle is not queued again.
pub struct SatbQueuePool {
    shards: Vec<Mutex<Shard>>,
}

impl SatbQueuePool {
    pub fn new(shard_count: usize, distinct: bool) -> SatbQueuePool {
        SatbQueuePool {
            shards: (0..shard_count.max(1)).map(|_| Mutex::new(Shard::new(distinct))).collect(),
        }
    }

    fn home_shard(&self) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    pub fn push(&self, entry: SatbEntry) {
        let mut shard = self.shards[self.home_shard()].lock();
        if let Some(seen) = &mut shard.distinct {
            if !seen.insert(entry.addr) {
                return;
            }
        }
        shard.queue.push(entry);
    }

    /// Drains every shard, returning all entries and clearing both the
    /// queues and any distinct-set bookkeeping for the next cycle.
    pub fn drain_all(&self) -> Vec<SatbEntry> {
        let mut all = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            all.append(&mut shard.queue);
            if let Some(seen) = &mut shard.distinct {
                seen.clear();
            }
        }
        all
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().queue.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
