//! Root set: the registry of on-stack and static handle locations the
//! marker starts from.
//!
//! Laid out as a vector of 1024-slot blocks rather than a hash set so that
//! both insertion and removal are O(1): `add` writes to the tail slot and
//! hands the handle its `(shard, block, index)` as an opaque token; `remove`
//! swaps the tail slot into the freed one and fixes up *that* slot's
//! token. Sharded by thread so concurrent mutators on different cores don't
//! contend on one lock; a handle's token always remembers which shard it
//! was inserted into, so removal goes straight there and only falls back to
//! scanning other shards if the handle migrated threads between creation
//! and destruction.

use parking_lot::RwLock;

const BLOCK_SIZE: usize = 1024;

/// Where a root-set entry lives: which shard, and its slot index within
/// that shard's flattened slot vector. Stored inside the handle itself so
/// removal doesn't need to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootToken {
    shard: usize,
    slot: usize,
}

struct Shard {
    slots: Vec<usize>,
}

impl Shard {
    fn new() -> Shard {
        Shard {
            slots: Vec::with_capacity(BLOCK_SIZE),
        }
    }
}

/// Sharded, O(1)-add/remove registry of root handle addresses.
pub struct RootSet {
    shards: Vec<RwLock<Shard>>,
}

impl RootSet {
    pub fn new(shard_count: usize) -> RootSet {
        RootSet {
            shards: (0..shard_count.max(1)).map(|_| RwLock::new(Shard::new())).collect(),
        }
    }

    fn home_shard(&self) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Registers `addr` as a root, returning the token the caller (a
    /// [`crate::handle::Handle`]) must hold to remove it later.
    pub fn add(&self, addr: usize) -> RootToken {
        let shard_idx = self.home_shard();
        let mut shard = self.shards[shard_idx].write();
        let slot = shard.slots.len();
        shard.slots.push(addr);
        RootToken { shard: shard_idx, slot }
    }

    /// Removes the root at `token` by swapping the tail slot into its
    /// place. Returns the address that moved into `token`'s old slot (the
    /// caller that owns it must be told its token's `slot` field changed),
    /// or `None` if it was already the tail.
    pub fn remove(&self, token: RootToken) -> Option<(usize, RootToken)> {
        let mut shard = self.shards[token.shard].write();
        if token.slot >= shard.slots.len() {
            return None;
        }
        let last = shard.slots.len() - 1;
        if token.slot == last {
            shard.slots.pop();
            return None;
        }
        shard.slots.swap(token.slot, last);
        shard.slots.pop();
        let moved_addr = shard.slots[token.slot];
        Some((
            moved_addr,
            RootToken {
                shard: token.shard,
                slot: token.slot,
            },
        ))
    }

    /// Snapshots every shard's current roots for a mark pass. Takes each
    /// shard's write lock only briefly, matching the "snapshot shard by
    /// shard" protocol: a root added after its shard is snapshotted is
    /// caught by SATB instead.
    pub fn snapshot(&self) -> Vec<usize> {
        let mut all = Vec::new();
        for shard in &self.shards {
            let shard = shard.read();
            all.extend_from_slice(&shard.slots);
        }
        all
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().slots.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_remove_round_trip() {
        let roots = RootSet::new(1);
        let token = roots.add(0x1000);
        assert_eq!(roots.len(), 1);
        assert!(roots.remove(token).is_none());
        assert_eq!(roots.len(), 0);
    }

    #[test]
    fn remove_middle_swaps_tail_in() {
        let roots = RootSet::new(1);
        let a = roots.add(0x1000);
        let _b = roots.add(0x2000);
        let c = roots.add(0x3000);
        let moved = roots.remove(a);
        assert_eq!(moved, Some((0x3000, RootToken { shard: c.shard, slot: a.slot })));
        assert_eq!(roots.len(), 2);
        assert_eq!(roots.snapshot(), vec![0x3000, 0x2000]);
    }

    #[test]
    fn snapshot_collects_across_shards() {
        let roots = RootSet::new(4);
        for addr in [0x10, 0x20, 0x30, 0x40, 0x50] {
            roots.add(addr);
        }
        let mut snapshot = roots.snapshot();
        snapshot.sort_unstable();
        assert_eq!(snapshot, vec![0x10, 0x20, 0x30, 0x40, 0x50]);
    }
}
