//! `Handle<T>`: the opaque, copyable reference mutator code and managed
//! objects hold into the heap.
//!
//! A handle carries its target address, the target's size, a shared pointer
//! to the target's region, and an inlined mark color. Dereferencing goes
//! through the self-healing read barrier in [`Handle::get`]: if the
//! handle's recorded color says its target may have moved, it consults the
//! region's forwarding table (or, if the region is mid-evacuation and
//! hasn't forwarded this particular object yet, evacuates it on the spot)
//! before returning a pin guard. Ground: `GCPtr.h`, `PtrGuard.h`,
//! `GCWorker::getHealedPointer`.

use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::gc::platform;
use crate::phase::{MarkColor, MarkState};
use crate::region::Region;
use crate::rootset::RootToken;
use crate::trace::{Collectable, Finalize, Trace, Visitor};

/// A handle's own recorded color. Distinct from [`crate::phase::MarkState`]:
/// it adds `DeAllocated`, reachable only by an explicit destroy/null-assign,
/// which a region's bitmap state never represents. Ground: the split between
/// `MarkStateBit` (region bitmap, 3 states) and `MarkState` (handle-carried,
/// 4 states via `DE_ALLOCATED`) in `GCBitMap.h` vs `GCPtrBase.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InlineColor {
    Remapped = 0,
    M0 = 1,
    M1 = 2,
    DeAllocated = 3,
}

impl InlineColor {
    fn from_u8(v: u8) -> InlineColor {
        match v {
            0 => InlineColor::Remapped,
            1 => InlineColor::M0,
            2 => InlineColor::M1,
            _ => InlineColor::DeAllocated,
        }
    }

    fn from_color(color: MarkColor) -> InlineColor {
        match color {
            MarkColor::M0 => InlineColor::M0,
            MarkColor::M1 => InlineColor::M1,
        }
    }

    /// Projects onto the region bitmap's 3-state encoding; only meaningful
    /// when `self != DeAllocated`, which callers check first.
    fn to_mark_state(self) -> MarkState {
        match self {
            InlineColor::Remapped | InlineColor::DeAllocated => MarkState::Remapped,
            InlineColor::M0 => MarkState::M0,
            InlineColor::M1 => MarkState::M1,
        }
    }
}

/// Scoped pin: while live, the target region will not be retired underneath
/// it. Dropping decrements the region's use count, waking any evacuation
/// waiting for it to reach zero. Ground: `PtrGuard.h`.
pub struct PtrGuard<'a, T> {
    addr: usize,
    region: Arc<Region>,
    marker: PhantomData<(&'a (), T)>,
}

impl<T> Deref for PtrGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*(self.addr as *const T) }
    }
}

impl<T> Drop for PtrGuard<'_, T> {
    fn drop(&mut self) {
        self.region.dec_use_count();
    }
}

/// A reference to a managed object. `Copy`-free by design — copying a
/// handle is a barrier-relevant operation (it must register a new root for
/// a stack-resident copy), so it goes through [`Handle::clone`] instead of
/// an implicit bitwise `Copy`.
pub struct Handle<T: Collectable> {
    target: AtomicUsize,
    size: usize,
    region: RwLock<Option<Arc<Region>>>,
    color: AtomicU8,
    /// `Some` for a handle registered as a root (returned by `make_managed`/
    /// `make_static`); `None` for a handle embedded as a field inside
    /// another managed object, which is discovered by the owner's `Trace`
    /// impl instead.
    root: Option<RootToken>,
    marker: PhantomData<T>,
}

impl<T: Collectable> Handle<T> {
    /// Builds a handle over a freshly allocated object and registers it as
    /// a root — the constructor `make_managed`/`make_static` use.
    pub(crate) fn new_root(addr: usize, size: usize, region: Arc<Region>) -> Handle<T> {
        let token = platform().roots().add(addr);
        let color = InlineColor::from_color(platform().phase().current_mark_color());
        Handle {
            target: AtomicUsize::new(addr),
            size,
            region: RwLock::new(Some(region)),
            color: AtomicU8::new(color as u8),
            root: Some(token),
            marker: PhantomData,
        }
    }

    /// Builds an interior handle with no root registration, for a field
    /// inside another managed object. The owner's `Trace::trace` calls
    /// [`Handle::trace`] on it; the marker never consults a root set entry.
    /// Host types embed these directly as struct fields rather than going
    /// through `make_managed`.
    pub fn new_interior(addr: usize, size: usize, region: Option<Arc<Region>>) -> Handle<T> {
        Handle {
            target: AtomicUsize::new(addr),
            size,
            region: RwLock::new(region),
            color: AtomicU8::new(InlineColor::Remapped as u8),
            root: None,
            marker: PhantomData,
        }
    }

    /// A handle with no target at all — `Handle::null()`.
    pub fn null() -> Handle<T> {
        Handle {
            target: AtomicUsize::new(0),
            size: 0,
            region: RwLock::new(None),
            color: AtomicU8::new(InlineColor::DeAllocated as u8),
            root: None,
            marker: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.target.load(Ordering::Acquire) == 0
    }

    fn inline_color(&self) -> InlineColor {
        InlineColor::from_u8(self.color.load(Ordering::Acquire))
    }

    /// Replaces this handle's target with a de-allocated marker, running
    /// the SATB write barrier on the previous value first. Ground: "handle
    /// operations: ... null-assign".
    pub fn assign_null(&self) {
        let _mutator = platform().phase().enter_mutator();
        self.write_barrier_current();
        self.target.store(0, Ordering::Release);
        *self.region.write() = None;
        self.color.store(InlineColor::DeAllocated as u8, Ordering::Release);
    }

    /// Reassigns this handle to a new target, SATB-enqueuing the previous
    /// one first. Ground: "handle operations: ... assign".
    pub fn assign(&self, addr: usize, size_hint: usize, region: Arc<Region>) {
        let _mutator = platform().phase().enter_mutator();
        self.write_barrier_current();
        self.target.store(addr, Ordering::Release);
        *self.region.write() = Some(region);
        let color = InlineColor::from_color(platform().phase().current_mark_color());
        self.color.store(color as u8, Ordering::Release);
        let _ = size_hint;
    }

    fn write_barrier_current(&self) {
        let addr = self.target.load(Ordering::Acquire);
        let region = self.region.read().clone();
        crate::barrier::enqueue_overwritten(platform().phase(), platform().satb(), addr, self.size, region);
    }

    /// Dereferences through the self-healing read barrier, pinning the
    /// target's region for the guard's lifetime. Returns `None` for a null
    /// or de-allocated handle.
    pub fn get(&self) -> Option<PtrGuard<'_, T>> {
        let _mutator = platform().phase().enter_mutator();
        loop {
            if self.inline_color() == InlineColor::DeAllocated {
                log::warn!("dereferenced a de-allocated handle");
                return None;
            }
            let region = self.region.read().clone()?;
            let state = self.inline_color().to_mark_state();
            if platform().config().relocation && platform().phase().needs_self_heal(state) {
                self.self_heal(&region);
                continue;
            }
            region.inc_use_count();
            let addr = self.target.load(Ordering::Acquire);
            return Some(PtrGuard {
                addr,
                region,
                marker: PhantomData,
            });
        }
    }

    /// Resolves a stale address against `region`'s forwarding table,
    /// evacuating the object synchronously if the region is mid-evacuation
    /// and hasn't forwarded it yet. Always settles the handle's inline color
    /// to `Remapped` when done, whether or not a forwarding entry existed —
    /// otherwise a never-evacuated region would leave `needs_self_heal` true
    /// forever and spin `get()`.
    fn self_heal(&self, region: &Arc<Region>) {
        let addr = self.target.load(Ordering::Acquire);
        if region.is_evacuated() {
            let state = self.inline_color().to_mark_state();
            platform().allocator().relocate_object(region, addr, self.size, state);
        }
        if let Some((new_addr, new_region)) = region.query_forwarding(addr) {
            self.target.store(new_addr, Ordering::Release);
            *self.region.write() = Some(new_region);
        }
        let color = if platform().phase().during_marking() {
            InlineColor::from_color(platform().phase().current_mark_color())
        } else {
            InlineColor::Remapped
        };
        self.color.store(color as u8, Ordering::Release);
    }

    pub fn target_addr(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }
}

impl<T: Collectable> Clone for Handle<T> {
    /// A clone of a root handle registers its own, independent root entry
    /// (it may live at a different stack slot or struct field); a clone of
    /// an interior handle stays interior, discovered through whichever
    /// owner's `Trace` impl reaches it.
    fn clone(&self) -> Handle<T> {
        let addr = self.target.load(Ordering::Acquire);
        let region = self.region.read().clone();
        let color = self.color.load(Ordering::Acquire);
        let root = if self.root.is_some() && addr != 0 {
            Some(platform().roots().add(addr))
        } else {
            None
        };
        Handle {
            target: AtomicUsize::new(addr),
            size: self.size,
            region: RwLock::new(region),
            color: AtomicU8::new(color),
            root,
            marker: PhantomData,
        }
    }
}

impl<T: Collectable> Drop for Handle<T> {
    fn drop(&mut self) {
        let _mutator = platform().phase().enter_mutator();
        self.write_barrier_current();
        if let Some(token) = self.root {
            platform().roots().remove(token);
        }
    }
}

impl<T: Collectable> Trace for Handle<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        let addr = self.target.load(Ordering::Acquire);
        let region = self.region.read().clone();
        visitor.visit_handle(addr, self.size, region);
    }
}

impl<T: Collectable> Finalize for Handle<T> {}
