//! Memory allocator: the region directory.
//!
//! Owns one append-only list per size class plus an address-ordered map
//! from region start address to region, so a pointer can be resolved back
//! to its owning region in `O(log n)`. New regions are requested from the
//! free-list manager; an allocation that doesn't fit any existing region of
//! its class simply grows the class with a fresh one and retries — the
//! same loop the original collector's region allocator runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;

use crate::config::GcConfig;
use crate::error::Result;
use crate::freelist::FreeListManager;
use crate::phase::{MarkColor, MarkState};
use crate::region::{classify_size, unit_size_for, Region, RegionKind};

/// Per-size-class region directory plus the global address map used to
/// resolve an arbitrary pointer back to its region.
pub struct MemoryAllocator {
    config: GcConfig,
    free_list: FreeListManager,
    tiny: RwLock<Vec<Arc<Region>>>,
    small: RwLock<Vec<Arc<Region>>>,
    medium: RwLock<Vec<Arc<Region>>>,
    large: RwLock<Vec<Arc<Region>>>,
    by_address: RwLock<BTreeMap<usize, Arc<Region>>>,
    live_size: AtomicUsize,
}

impl MemoryAllocator {
    pub fn new(config: GcConfig) -> MemoryAllocator {
        let shard_count = config.shard_count;
        let initial_single_size = config.initial_single_size;
        MemoryAllocator {
            config,
            free_list: FreeListManager::new(shard_count, initial_single_size),
            tiny: RwLock::new(Vec::new()),
            small: RwLock::new(Vec::new()),
            medium: RwLock::new(Vec::new()),
            large: RwLock::new(Vec::new()),
            by_address: RwLock::new(BTreeMap::new()),
            live_size: AtomicUsize::new(0),
        }
    }

    fn list_for(&self, kind: RegionKind) -> &RwLock<Vec<Arc<Region>>> {
        match kind {
            RegionKind::Tiny => &self.tiny,
            RegionKind::Small => &self.small,
            RegionKind::Medium => &self.medium,
            RegionKind::Large => &self.large,
        }
    }

    fn region_size_for(&self, kind: RegionKind, requested: usize) -> usize {
        match kind {
            RegionKind::Tiny => self.config.tiny_region_size,
            RegionKind::Small => self.config.small_region_size,
            RegionKind::Medium => self.config.medium_region_size,
            RegionKind::Large => requested,
        }
    }

    fn add_region(&self, kind: RegionKind, size: usize) -> Result<Arc<Region>> {
        let (start, extent) = self.free_list.allocate(size)?;
        let unit_size = unit_size_for(kind, self.config.tiny_object_threshold);
        let region = Arc::new(Region::new(kind, start, extent, unit_size, self.config.destructor_support));
        self.list_for(kind).write().push(region.clone());
        self.by_address.write().insert(start, region.clone());
        Ok(region)
    }

    /// Allocates `size` bytes, classifying into a size class, retrying
    /// against existing regions of that class before growing it.
    pub fn allocate(&self, size: usize, during_gc: bool, color: MarkColor) -> Result<usize> {
        if size == 0 {
            return Err(crate::error::GcError::InvariantViolation(
                "cannot allocate a zero-sized object".into(),
            ));
        }
        let kind = classify_size(
            size,
            self.config.tiny_object_threshold,
            self.config.small_object_threshold,
            self.config.medium_object_threshold,
        );
        if kind == RegionKind::Large {
            let region = self.add_region(RegionKind::Large, size)?;
            let addr = region
                .allocate(size, during_gc, color)
                .expect("a freshly mapped large region always fits its own object");
            self.live_size.fetch_add(size, Ordering::Relaxed);
            return Ok(addr);
        }
        loop {
            {
                let regions = self.list_for(kind).read();
                for region in regions.iter().rev() {
                    if let Some(addr) = region.allocate(size, during_gc, color) {
                        self.live_size.fetch_add(size, Ordering::Relaxed);
                        return Ok(addr);
                    }
                }
            }
            self.add_region(kind, self.region_size_for(kind, size))?;
        }
    }

    /// Resolves `addr` to its owning region, if any region claims it.
    pub fn region_for(&self, addr: usize) -> Option<Arc<Region>> {
        let map = self.by_address.read();
        map.range(..=addr)
            .next_back()
            .map(|(_, region)| region.clone())
            .filter(|region| region.inside_region(addr))
    }

    pub fn inside_allocated_regions(&self, addr: usize) -> bool {
        self.region_for(addr).is_some()
    }

    /// Sweeps every region, in parallel if `parallel_gc` is enabled,
    /// reclaiming spans whose mark state doesn't match the live color.
    pub fn sweep(&self, needs_sweep: impl Fn(MarkState) -> bool + Sync) {
        let snapshot = self.all_regions();
        if self.config.parallel_gc {
            snapshot.par_iter().for_each(|region| {
                if region.kind() != RegionKind::Large {
                    region.clear_unmarked(&needs_sweep);
                }
            });
        } else {
            for region in &snapshot {
                if region.kind() != RegionKind::Large {
                    region.clear_unmarked(&needs_sweep);
                }
            }
        }
        self.retire_freeable(&needs_sweep);
    }

    /// Evacuates every region whose fragmentation crosses the configured
    /// thresholds, in parallel if `parallel_gc` is enabled. LARGE regions
    /// are never evacuated — they hold exactly one object, so moving it
    /// buys nothing.
    pub fn relocate(&self, needs_sweep: impl Fn(MarkState) -> bool + Sync) {
        for kind in [RegionKind::Tiny, RegionKind::Small, RegionKind::Medium] {
            let candidates: Vec<Arc<Region>> = self
                .list_for(kind)
                .read()
                .iter()
                .filter(|region| {
                    !region.is_evacuated()
                        && region.needs_evacuate(
                            self.config.fragmentation_threshold,
                            self.config.free_ratio_threshold,
                        )
                })
                .cloned()
                .collect();
            let evacuate_one = |region: &Arc<Region>| {
                self.evacuate_region(region, &needs_sweep);
            };
            if self.config.parallel_gc {
                candidates.par_iter().for_each(evacuate_one);
            } else {
                candidates.iter().for_each(evacuate_one);
            }
        }
        self.retire_freeable(&needs_sweep);
    }

    fn evacuate_region(&self, region: &Arc<Region>, needs_sweep: &(impl Fn(MarkState) -> bool + Sync)) {
        let _guard = region.relocation_lock();
        if region.is_evacuated() {
            return;
        }
        region.mark_evacuated();
        let Some(bitmap_units) = region.live_units(needs_sweep) else {
            return;
        };
        for (addr, size, state) in bitmap_units {
            self.relocate_object(region, addr, size, state);
        }
    }

    /// Copies a single live object out to a fresh span and records the
    /// forwarding entry. Used both by bulk evacuation and by a mutator's
    /// self-heal path when it observes a region marked evacuated but not
    /// yet done moving a particular object.
    pub fn relocate_object(&self, region: &Arc<Region>, addr: usize, size: usize, state: MarkState) {
        if region.query_forwarding(addr).is_some() {
            return;
        }
        let color = match state {
            MarkState::M0 => MarkColor::M0,
            MarkState::M1 => MarkColor::M1,
            MarkState::Remapped | MarkState::NotAllocated => return,
        };
        let new_addr = match self.allocate(size, true, color) {
            Ok(addr) => addr,
            Err(_) => return,
        };
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, new_addr as *mut u8, size);
        }
        region.invoke_move_constructor(addr, addr as *mut u8, new_addr as *mut u8);
        let new_region = self
            .region_for(new_addr)
            .expect("relocate_object's own allocation must resolve to a region");
        region.migrate_destructor(addr, new_addr, &new_region);
        region.migrate_move_constructor(addr, new_addr, &new_region);
        region.migrate_tracer(addr, new_addr, &new_region);
        region.publish_forwarding(addr, new_addr, new_region);
    }

    fn retire_freeable(&self, needs_sweep: &impl Fn(MarkState) -> bool) {
        for kind in [RegionKind::Tiny, RegionKind::Small, RegionKind::Medium, RegionKind::Large] {
            let mut list = self.list_for(kind).write();
            list.retain(|region| {
                if region.can_free(needs_sweep) {
                    if let Some((start, size)) = region.retire() {
                        self.by_address.write().remove(&start);
                        self.free_list.free(start, size);
                    }
                    false
                } else {
                    true
                }
            });
        }
    }

    fn all_regions(&self) -> Vec<Arc<Region>> {
        let mut all = Vec::new();
        for kind in [RegionKind::Tiny, RegionKind::Small, RegionKind::Medium, RegionKind::Large] {
            all.extend(self.list_for(kind).read().iter().cloned());
        }
        all
    }

    pub fn reset_live_size(&self) {
        self.live_size.store(0, Ordering::Relaxed);
    }

    pub fn live_size(&self) -> usize {
        self.live_size.load(Ordering::Relaxed)
    }

    pub fn region_count(&self) -> usize {
        self.tiny.read().len() + self.small.read().len() + self.medium.read().len() + self.large.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> MemoryAllocator {
        MemoryAllocator::new(GcConfig::default())
    }

    #[test]
    fn allocate_resolves_back_through_region_for() {
        let alloc = allocator();
        let addr = alloc.allocate(32, false, MarkColor::M0).unwrap();
        let region = alloc.region_for(addr).unwrap();
        assert!(region.inside_region(addr));
    }

    #[test]
    fn large_objects_get_their_own_region() {
        let alloc = allocator();
        let size = alloc.config.medium_object_threshold + 1;
        let addr = alloc.allocate(size, false, MarkColor::M0).unwrap();
        let region = alloc.region_for(addr).unwrap();
        assert_eq!(region.kind(), RegionKind::Large);
    }

    #[test]
    fn sweep_reclaims_unmarked_spans_and_keeps_marked_ones() {
        let alloc = allocator();
        let keep = alloc.allocate(32, true, MarkColor::M0).unwrap();
        let drop_addr = alloc.allocate(32, false, MarkColor::M0).unwrap();
        // `drop_addr` was tagged Remapped (outside a GC cycle); a sweep
        // that treats anything other than M0 as needing sweep should
        // reclaim it but not the M0-marked `keep`.
        alloc.sweep(|state| state != MarkState::M0);
        let region = alloc.region_for(keep).unwrap();
        assert!(region.marked(keep, MarkColor::M0));
        let _ = drop_addr;
    }

    #[test]
    fn region_for_returns_none_outside_any_region() {
        let alloc = allocator();
        assert!(alloc.region_for(0xdead_beef).is_none());
    }
}
