//! Regions: the unit of allocation, marking, and (optionally) evacuation.
//!
//! A region bump-allocates out of a raw extent handed to it by the
//! free-list manager; it does not own the underlying OS mapping, so
//! retiring a region returns the extent to the free-list manager rather
//! than unmapping it. Its mark bitmap tracks liveness at a size-class-
//! dependent granularity; a LARGE region skips the bitmap entirely since it
//! holds exactly one object and tracks that object's mark state directly.
//! Evacuation publishes old-address to new-address mappings into the
//! forwarding table so that a handle which observes a stale address during
//! self-heal can still locate its object.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};

use crate::bitmap::MarkBitmap;
use crate::error::{GcError, Result};
use crate::phase::{MarkColor, MarkState};
use crate::trace::Visitor;

/// Size class a region was carved for. Determines the bitmap's unit
/// granularity and whether a bitmap exists at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Tiny,
    Small,
    Medium,
    Large,
}

pub type Destructor = Box<dyn Fn(*mut u8) + Send + Sync>;
pub type MoveConstructor = Box<dyn Fn(*mut u8, *mut u8) + Send + Sync>;
/// Registered alongside an object's destructor at `make_managed` time;
/// invokes the object's `Trace::trace` without the marker needing to know
/// its concrete type. Replaces the source collector's magic-sentinel scan.
pub type Tracer = Box<dyn Fn(*mut u8, &mut dyn Visitor) + Send + Sync>;

/// One contiguous arena plus its allocation and liveness bookkeeping.
///
/// `Region` is always handled behind an `Arc` — forwarding-table entries
/// from *other* regions hold a clone of it, keeping an evacuated object's
/// destination region alive for as long as any handle might still resolve
/// through the source region's table.
pub struct Region {
    kind: RegionKind,
    unit_size: usize,
    start_address: AtomicUsize,
    total_size: AtomicUsize,
    allocated_offset: AtomicUsize,
    frag_size: AtomicUsize,
    bitmap: Option<MarkBitmap>,
    large_mark_state: AtomicU8,
    forwarding_table: RwLock<HashMap<usize, (usize, Arc<Region>)>>,
    destructors: RwLock<HashMap<usize, Destructor>>,
    move_constructors: RwLock<HashMap<usize, MoveConstructor>>,
    tracers: RwLock<HashMap<usize, Arc<Tracer>>>,
    /// Rounded object size by head address, for every live (non-Tiny,
    /// non-Large) allocation — a multi-unit object's bitmap span only has
    /// its head and tail units marked, so re-marking it during tracing needs
    /// to know its size to touch both. Ground: spec.md §3's "head bit color
    /// and tail bit color of one object are equal at all times" invariant.
    sizes: RwLock<HashMap<usize, usize>>,
    destructor_support: bool,
    relocation_mutex: ReentrantMutex<()>,
    evacuated: AtomicBool,
    all_free: AtomicBool,
    use_count: AtomicI32,
    zero_use_count: (Mutex<()>, Condvar),
}

impl Region {
    /// Builds a region bump-allocating out of `[start, start + size)`. That
    /// extent must have been handed out by a [`crate::freelist::FreeListManager`]
    /// and not be in use anywhere else.
    pub fn new(kind: RegionKind, start: usize, size: usize, unit_size: usize, destructor_support: bool) -> Region {
        let bitmap = if kind == RegionKind::Large {
            None
        } else {
            Some(MarkBitmap::new(size.div_ceil(unit_size)))
        };
        Region {
            kind,
            unit_size,
            start_address: AtomicUsize::new(start),
            total_size: AtomicUsize::new(size),
            allocated_offset: AtomicUsize::new(0),
            frag_size: AtomicUsize::new(0),
            bitmap,
            large_mark_state: AtomicU8::new(0),
            forwarding_table: RwLock::new(HashMap::new()),
            destructors: RwLock::new(HashMap::new()),
            move_constructors: RwLock::new(HashMap::new()),
            tracers: RwLock::new(HashMap::new()),
            sizes: RwLock::new(HashMap::new()),
            destructor_support,
            relocation_mutex: ReentrantMutex::new(()),
            evacuated: AtomicBool::new(false),
            all_free: AtomicBool::new(false),
            use_count: AtomicI32::new(0),
            zero_use_count: (Mutex::new(()), Condvar::new()),
        }
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn start_address(&self) -> usize {
        self.start_address.load(Ordering::Acquire)
    }

    pub fn total_size(&self) -> usize {
        self.total_size.load(Ordering::Acquire)
    }

    pub fn inside_region(&self, addr: usize) -> bool {
        let start = self.start_address();
        if start == 0 {
            return false;
        }
        addr >= start && addr < start + self.total_size()
    }

    fn round_up(&self, size: usize) -> usize {
        if self.kind == RegionKind::Tiny {
            self.unit_size
        } else {
            size.div_ceil(self.unit_size) * self.unit_size
        }
    }

    /// Bump-allocates `size` bytes, returning the object's address. Tags it
    /// with the current mark color if a cycle is running so it survives
    /// concurrent marking, or `Remapped` otherwise.
    pub fn allocate(&self, size: usize, during_gc: bool, color: MarkColor) -> Option<usize> {
        if self.start_address() == 0 {
            return None;
        }
        let size = if self.kind == RegionKind::Large {
            size
        } else {
            self.round_up(size)
        };
        loop {
            let offset = self.allocated_offset.load(Ordering::Relaxed);
            if offset + size > self.total_size() {
                return None;
            }
            if self
                .allocated_offset
                .compare_exchange_weak(offset, offset + size, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let addr = self.start_address() + offset;
                if let Some(bitmap) = &self.bitmap {
                    let (head, tail) = self.span_units(offset, size);
                    self.sizes.write().insert(addr, size);
                    if during_gc {
                        bitmap.mark(head, color);
                        if tail != head {
                            bitmap.mark(tail, color);
                        }
                    } else {
                        bitmap.mark_remapped(head);
                        if tail != head {
                            bitmap.mark_remapped(tail);
                        }
                    }
                } else {
                    let state = if during_gc {
                        MarkState::from_color(color)
                    } else {
                        MarkState::Remapped
                    };
                    self.large_mark_state.store(state as u8, Ordering::Release);
                }
                return Some(addr);
            }
        }
    }

    /// Computes the `(head_unit, tail_unit)` pair an object at `offset`
    /// spanning `size` bytes occupies — equal for a single-unit object,
    /// distinct for a multi-unit one. Only the head and tail units ever
    /// carry a mark bit; everything between stays `NotAllocated`.
    fn span_units(&self, offset: usize, size: usize) -> (usize, usize) {
        let head = offset / self.unit_size;
        let units = size.div_ceil(self.unit_size).max(1);
        (head, head + units - 1)
    }

    /// The recorded allocation size for the object whose head unit is at
    /// `addr`, or one unit's worth if it was never registered (a Tiny slot,
    /// always exactly `unit_size`).
    fn object_size_at(&self, addr: usize) -> usize {
        self.sizes.read().get(&addr).copied().unwrap_or(self.unit_size)
    }

    /// Marks the object at `addr` with the current cycle's live color,
    /// touching both its head and tail bitmap units so the invariant that
    /// the two always agree survives re-marking.
    pub fn mark(&self, addr: usize, color: MarkColor) {
        if let Some(bitmap) = &self.bitmap {
            let offset = addr - self.start_address();
            let unit = offset / self.unit_size;
            let size = self.sizes.read().get(&addr).copied().unwrap_or(self.unit_size);
            let (head, tail) = self.span_units(offset, size);
            debug_assert_eq!(head, unit);
            bitmap.mark(head, color);
            if tail != head {
                bitmap.mark(tail, color);
            }
        } else {
            self.large_mark_state
                .store(MarkState::from_color(color) as u8, Ordering::Release);
        }
    }

    pub fn marked(&self, addr: usize, color: MarkColor) -> bool {
        if let Some(bitmap) = &self.bitmap {
            let unit = (addr - self.start_address()) / self.unit_size;
            bitmap.get(unit) == MarkState::from_color(color)
        } else {
            self.large_mark_state.load(Ordering::Acquire) == MarkState::from_color(color) as u8
        }
    }

    /// Walks the bitmap during sweep, reclaiming every unmarked span back
    /// into fragmentation and calling registered destructors. Not valid for
    /// a LARGE region, whose liveness is checked with [`Region::can_free`]
    /// instead.
    pub fn clear_unmarked(&self, needs_sweep: impl Fn(MarkState) -> bool) {
        let Some(bitmap) = &self.bitmap else {
            return;
        };
        let mut any_live = false;

        // TINY slots are all one unit wide, so a simple per-unit walk works.
        // SMALL/MEDIUM spans can cover several units with everything between
        // their head and tail left `NotAllocated`, so the head's recorded
        // size (from `self.sizes`) tells us exactly where the tail is rather
        // than scanning for a second matching bit.
        let unit_count = bitmap.unit_count();
        if self.kind == RegionKind::Tiny {
            for unit in 0..unit_count {
                let state = bitmap.get(unit);
                if state == MarkState::NotAllocated {
                    continue;
                }
                if needs_sweep(state) {
                    let addr = self.start_address() + unit * self.unit_size;
                    self.reclaim_span(addr, self.unit_size, unit, unit);
                } else {
                    any_live = true;
                }
            }
        } else {
            let mut unit = 0;
            while unit < unit_count {
                let state = bitmap.get(unit);
                if state == MarkState::NotAllocated {
                    unit += 1;
                    continue;
                }
                let addr = self.start_address() + unit * self.unit_size;
                let size = self.object_size_at(addr);
                let (head, tail) = self.span_units(unit * self.unit_size, size);
                debug_assert_eq!(head, unit);
                if needs_sweep(state) {
                    self.reclaim_span(addr, size, head, tail);
                } else {
                    any_live = true;
                }
                unit = tail + 1;
            }
        }
        self.all_free.store(!any_live, Ordering::Release);
    }

    fn reclaim_span(&self, addr: usize, size: usize, head_unit: usize, tail_unit: usize) {
        if let Some(bitmap) = &self.bitmap {
            bitmap.clear(head_unit);
            if tail_unit != head_unit {
                bitmap.clear(tail_unit);
            }
        }
        self.sizes.write().remove(&addr);
        self.call_destructor(addr);
        if addr < self.start_address() + self.allocated_offset.load(Ordering::Relaxed) {
            self.frag_size.fetch_add(size, Ordering::Relaxed);
        }
    }

    /// Collects `(addr, size, state)` for every still-live span, for the
    /// evacuator to copy out before the region is swept. `None` for a
    /// LARGE region, which has no bitmap to walk.
    pub fn live_units(&self, needs_sweep: impl Fn(MarkState) -> bool) -> Option<Vec<(usize, usize, MarkState)>> {
        let bitmap = self.bitmap.as_ref()?;
        let mut spans = Vec::new();
        let unit_count = bitmap.unit_count();
        if self.kind == RegionKind::Tiny {
            for unit in 0..unit_count {
                let state = bitmap.get(unit);
                if state != MarkState::NotAllocated && !needs_sweep(state) {
                    spans.push((self.start_address() + unit * self.unit_size, self.unit_size, state));
                }
            }
        } else {
            let mut unit = 0;
            while unit < unit_count {
                let state = bitmap.get(unit);
                if state == MarkState::NotAllocated {
                    unit += 1;
                    continue;
                }
                let addr = self.start_address() + unit * self.unit_size;
                let size = self.object_size_at(addr);
                let (head, tail) = self.span_units(unit * self.unit_size, size);
                debug_assert_eq!(head, unit);
                if !needs_sweep(state) {
                    spans.push((addr, size, state));
                }
                unit = tail + 1;
            }
        }
        Some(spans)
    }

    pub fn fragment_ratio(&self) -> f32 {
        let offset = self.allocated_offset.load(Ordering::Relaxed);
        if offset == 0 {
            0.0
        } else {
            self.frag_size.load(Ordering::Relaxed) as f32 / offset as f32
        }
    }

    pub fn free_ratio(&self) -> f32 {
        let total = self.total_size();
        if total == 0 {
            0.0
        } else {
            1.0 - self.allocated_offset.load(Ordering::Relaxed) as f32 / total as f32
        }
    }

    /// Whether this region's fragmentation has crossed the configured
    /// thresholds and it should be chosen for evacuation.
    pub fn needs_evacuate(&self, frag_threshold: f32, free_threshold: f32) -> bool {
        self.fragment_ratio() >= frag_threshold && self.free_ratio() < free_threshold
    }

    pub fn is_evacuated(&self) -> bool {
        self.evacuated.load(Ordering::Acquire)
    }

    pub fn mark_evacuated(&self) {
        self.evacuated.store(true, Ordering::Release);
    }

    pub fn can_free(&self, needs_sweep: impl Fn(MarkState) -> bool) -> bool {
        if self.kind == RegionKind::Large {
            let state = match self.large_mark_state.load(Ordering::Acquire) {
                1 => MarkState::M0,
                2 => MarkState::M1,
                _ => MarkState::Remapped,
            };
            needs_sweep(state)
        } else {
            self.all_free.load(Ordering::Acquire)
        }
    }

    /// Releases the backing extent, leaving only the forwarding table
    /// behind so in-flight self-heals can still resolve through it. Returns
    /// the `(start, size)` the caller should hand back to the free-list
    /// manager, or `None` if the region was already retired.
    pub fn retire(&self) -> Option<(usize, usize)> {
        let start = self.start_address.swap(0, Ordering::AcqRel);
        if start == 0 {
            return None;
        }
        let size = self.total_size.swap(0, Ordering::AcqRel);
        self.allocated_offset.store(0, Ordering::Release);
        self.evacuated.store(true, Ordering::Release);
        Some((start, size))
    }

    pub fn is_retired(&self) -> bool {
        self.start_address() == 0 && self.is_evacuated()
    }

    /// Records `old_addr -> (new_addr, new_region)` so later lookups find
    /// the relocated object.
    pub fn publish_forwarding(&self, old_addr: usize, new_addr: usize, new_region: Arc<Region>) {
        self.forwarding_table
            .write()
            .insert(old_addr, (new_addr, new_region));
    }

    pub fn query_forwarding(&self, old_addr: usize) -> Option<(usize, Arc<Region>)> {
        self.forwarding_table.read().get(&old_addr).cloned()
    }

    /// Guards recursive relocation: a self-heal triggered while this region
    /// is already mid-evacuation on the same thread must not deadlock.
    pub fn relocation_lock(&self) -> parking_lot::ReentrantMutexGuard<'_, ()> {
        self.relocation_mutex.lock()
    }

    pub fn register_destructor(&self, addr: usize, destructor: Destructor) {
        self.destructors.write().insert(addr, destructor);
    }

    pub fn register_move_constructor(&self, addr: usize, mover: MoveConstructor) {
        self.move_constructors.write().insert(addr, mover);
    }

    /// Invokes the move-constructor registered for `addr` against
    /// `(src, dst)`, if one was registered, without removing it — a
    /// relocatable object keeps its mover across every future evacuation.
    pub fn invoke_move_constructor(&self, addr: usize, src: *mut u8, dst: *mut u8) {
        if let Some(mover) = self.move_constructors.read().get(&addr) {
            mover(src, dst);
        }
    }

    /// Moves a destructor entry to its object's new address and region
    /// after evacuation.
    pub fn migrate_destructor(&self, addr: usize, new_addr: usize, new_region: &Region) {
        if let Some(destructor) = self.destructors.write().remove(&addr) {
            new_region.destructors.write().insert(new_addr, destructor);
        }
    }

    /// Moves a move-constructor entry to its object's new address and
    /// region after evacuation.
    pub fn migrate_move_constructor(&self, addr: usize, new_addr: usize, new_region: &Region) {
        if let Some(mover) = self.move_constructors.write().remove(&addr) {
            new_region.move_constructors.write().insert(new_addr, mover);
        }
    }

    fn call_destructor(&self, addr: usize) {
        let destructor = self.destructors.write().remove(&addr);
        if self.destructor_support {
            if let Some(destructor) = destructor {
                destructor(addr as *mut u8);
            }
        }
    }

    pub fn register_tracer(&self, addr: usize, tracer: Tracer) {
        self.tracers.write().insert(addr, Arc::new(tracer));
    }

    /// Migrates a tracer from one address to another, used when an object
    /// survives evacuation. No-op if `addr` never registered one (e.g. a
    /// leaf type with nothing to trace).
    pub fn migrate_tracer(&self, addr: usize, new_addr: usize, new_region: &Region) {
        if let Some(tracer) = self.tracers.write().remove(&addr) {
            new_region.tracers.write().insert(new_addr, tracer);
        }
    }

    /// Invokes the tracer registered for `addr`, if any, against `visitor`.
    /// Clones the `Arc` out before calling so the tracer can recurse into
    /// other regions' handles without re-entering this region's lock.
    pub fn trace_at(&self, addr: usize, visitor: &mut dyn Visitor) -> bool {
        let tracer = self.tracers.read().get(&addr).cloned();
        match tracer {
            Some(tracer) => {
                tracer(addr as *mut u8, visitor);
                true
            }
            None => false,
        }
    }

    pub fn inc_use_count(&self) {
        self.use_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_use_count(&self) {
        let prev = self.use_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            let (lock, cvar) = &self.zero_use_count;
            let _guard = lock.lock();
            cvar.notify_all();
        }
    }

    pub fn use_count(&self) -> i32 {
        self.use_count.load(Ordering::Acquire)
    }

    /// Blocks until no mutator is pinning an object in this region, i.e.
    /// no [`crate::handle::PtrGuard`] is currently live for it.
    pub fn wait_for_zero_use_count(&self) {
        let (lock, cvar) = &self.zero_use_count;
        let mut guard = lock.lock();
        while self.use_count() != 0 {
            cvar.wait(&mut guard);
        }
    }
}

pub fn classify_size(size: usize, tiny: usize, small: usize, medium: usize) -> RegionKind {
    if size <= tiny {
        RegionKind::Tiny
    } else if size <= small {
        RegionKind::Small
    } else if size <= medium {
        RegionKind::Medium
    } else {
        RegionKind::Large
    }
}

pub fn unit_size_for(kind: RegionKind, tiny_object_threshold: usize) -> usize {
    match kind {
        RegionKind::Tiny => tiny_object_threshold,
        RegionKind::Small | RegionKind::Medium => 8,
        RegionKind::Large => 1,
    }
}

/// Fails fast if a caller tries to allocate from a retired region; callers
/// should always route through the allocator's live-region list instead, so
/// seeing this means a region escaped retirement bookkeeping.
pub fn assert_not_retired(region: &Region) -> Result<()> {
    if region.is_retired() {
        return Err(GcError::InvariantViolation(
            "allocate() called on a retired region".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_region(kind: RegionKind, size: usize) -> Region {
        // A fake but uniquely-identifiable base address; these tests never
        // dereference it, only do arithmetic and bitmap bookkeeping.
        Region::new(kind, 0x1_0000_0000, size, unit_size_for(kind, 4), true)
    }

    #[test]
    fn allocate_bumps_offset_and_marks_remapped_outside_gc() {
        let region = fresh_region(RegionKind::Small, 64 * 1024);
        let addr = region.allocate(32, false, MarkColor::M0).unwrap();
        assert!(region.inside_region(addr));
        assert!(!region.marked(addr, MarkColor::M0));
    }

    #[test]
    fn allocate_during_gc_marks_current_color() {
        let region = fresh_region(RegionKind::Small, 64 * 1024);
        let addr = region.allocate(32, true, MarkColor::M1).unwrap();
        assert!(region.marked(addr, MarkColor::M1));
    }

    #[test]
    fn tiny_region_allocates_fixed_size_slots() {
        let region = fresh_region(RegionKind::Tiny, 4096);
        let a = region.allocate(1, false, MarkColor::M0).unwrap();
        let b = region.allocate(1, false, MarkColor::M0).unwrap();
        assert_eq!(b - a, 4);
    }

    #[test]
    fn large_region_has_no_bitmap_and_tracks_single_state() {
        let region = fresh_region(RegionKind::Large, 4096);
        let addr = region.allocate(4096, true, MarkColor::M0).unwrap();
        assert!(region.marked(addr, MarkColor::M0));
        assert!(!region.marked(addr, MarkColor::M1));
    }

    #[test]
    fn allocate_fails_once_region_is_full() {
        let region = fresh_region(RegionKind::Small, 64);
        assert!(region.allocate(64, false, MarkColor::M0).is_some());
        assert!(region.allocate(8, false, MarkColor::M0).is_none());
    }

    #[test]
    fn retire_clears_addressing_but_keeps_forwarding_table() {
        let region = Arc::new(fresh_region(RegionKind::Small, 4096));
        let dest = Arc::new(fresh_region(RegionKind::Small, 4096));
        region.publish_forwarding(0x1000, 0x2000, dest.clone());
        let freed = region.retire();
        assert!(freed.is_some());
        assert!(region.is_retired());
        assert_eq!(region.query_forwarding(0x1000).unwrap().0, 0x2000);
    }

    #[test]
    fn use_count_wait_returns_once_decremented() {
        let region = fresh_region(RegionKind::Small, 4096);
        region.inc_use_count();
        region.dec_use_count();
        region.wait_for_zero_use_count();
    }

    #[test]
    fn clear_unmarked_reclaims_a_multi_unit_span_and_keeps_its_neighbor() {
        let region = fresh_region(RegionKind::Small, 4096);
        let dead = region.allocate(24, true, MarkColor::M0).unwrap();
        let live = region.allocate(16, true, MarkColor::M0).unwrap();
        region.mark(live, MarkColor::M1);
        region.clear_unmarked(|state| state != MarkState::M1);
        let unit = |addr: usize| (addr - region.start_address()) / region.unit_size;
        assert_eq!(region.bitmap.as_ref().unwrap().get(unit(dead)), MarkState::NotAllocated);
        let (head, tail) = region.span_units(live - region.start_address(), 16);
        assert_ne!(region.bitmap.as_ref().unwrap().get(head), MarkState::NotAllocated);
        assert_ne!(region.bitmap.as_ref().unwrap().get(tail), MarkState::NotAllocated);
    }

    #[test]
    fn live_units_reports_a_single_unit_span_exactly_once() {
        let region = fresh_region(RegionKind::Small, 4096);
        let addr = region.allocate(8, true, MarkColor::M0).unwrap();
        let spans = region.live_units(|state| state != MarkState::M0).unwrap();
        assert_eq!(spans, vec![(addr, 8, MarkState::M0)]);
    }

    #[test]
    fn live_units_reports_a_multi_unit_span_once_with_its_full_size() {
        let region = fresh_region(RegionKind::Small, 4096);
        let addr = region.allocate(24, true, MarkColor::M0).unwrap();
        let spans = region.live_units(|state| state != MarkState::M0).unwrap();
        assert_eq!(spans, vec![(addr, 24, MarkState::M0)]);
    }
}
