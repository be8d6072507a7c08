//! The phase oracle: the single source of truth for where the collector is
//! in its cycle, and the only place mutators and the collector thread
//! rendezvous to agree on what "live" currently means.
//!
//! Every mutator thread consults [`PhaseOracle::current_mark_color`] and
//! [`PhaseOracle::phase`] on the hot allocation and barrier paths, so both
//! are single atomic loads. The phase transition itself (`advance`) is rare
//! — once or twice per GC cycle — and is allowed to take a lock.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Where the collector is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// No cycle in progress; mutators allocate and mutate freely.
    Idle = 0,
    /// The mark color has flipped and worker threads are tracing roots
    /// concurrently with mutators.
    ConcurrentMark = 1,
    /// A short stop-the-world re-trace of the SATB buffer and any roots
    /// added since concurrent marking began.
    Remark = 2,
    /// Dead spans are being reclaimed (and, if relocation is enabled, live
    /// spans evacuated) region by region.
    Sweep = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Idle,
            1 => Phase::ConcurrentMark,
            2 => Phase::Remark,
            3 => Phase::Sweep,
            _ => unreachable!("corrupt phase byte {v}"),
        }
    }

    fn next(self) -> Phase {
        match self {
            Phase::Idle => Phase::ConcurrentMark,
            Phase::ConcurrentMark => Phase::Remark,
            Phase::Remark => Phase::Sweep,
            Phase::Sweep => Phase::Idle,
        }
    }
}

/// The color an object's mark bits must carry to be considered live in the
/// current cycle. Flips every time a cycle restarts from `Idle`, so that an
/// object marked in the previous cycle reads as unmarked in the new one
/// without a separate clearing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MarkColor {
    M0 = 0,
    M1 = 1,
}

impl MarkColor {
    fn flip(self) -> MarkColor {
        match self {
            MarkColor::M0 => MarkColor::M1,
            MarkColor::M1 => MarkColor::M0,
        }
    }
}

/// A region bitmap unit's recorded state, as opposed to the oracle's current
/// color. `NotAllocated` is a free or never-allocated unit and is never
/// swept or self-healed. `Remapped` marks an object that has already been
/// evacuated (or was allocated outside a cycle and is implicitly live until
/// the next mark proves otherwise); it never equals a [`MarkColor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MarkState {
    NotAllocated = 0,
    Remapped = 1,
    M0 = 2,
    M1 = 3,
}

impl MarkState {
    pub fn from_color(color: MarkColor) -> MarkState {
        match color {
            MarkColor::M0 => MarkState::M0,
            MarkColor::M1 => MarkState::M1,
        }
    }

    fn matches(self, color: MarkColor) -> bool {
        matches!(
            (self, color),
            (MarkState::M0, MarkColor::M0) | (MarkState::M1, MarkColor::M1)
        )
    }
}

/// Coordinates phase transitions and stop-the-world windows.
///
/// Mutators acquire the STW lock in read mode around every allocation and
/// barrier operation; the collector acquires it in write mode for the
/// remark pause. `parking_lot::RwLock` is reentrant-unsafe but writer-fair,
/// which is what a STW pause needs: once the collector requests the write
/// lock, no new mutator read-lock acquisitions should be able to starve it.
pub struct PhaseOracle {
    phase: AtomicU8,
    mark_color: AtomicU8,
    transition_lock: Mutex<()>,
    stw_lock: RwLock<()>,
}

impl Default for PhaseOracle {
    fn default() -> Self {
        PhaseOracle::new()
    }
}

impl PhaseOracle {
    pub fn new() -> PhaseOracle {
        PhaseOracle {
            phase: AtomicU8::new(Phase::Idle as u8),
            mark_color: AtomicU8::new(MarkColor::M0 as u8),
            transition_lock: Mutex::new(()),
            stw_lock: RwLock::new(()),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn current_mark_color(&self) -> MarkColor {
        match self.mark_color.load(Ordering::Acquire) {
            0 => MarkColor::M0,
            _ => MarkColor::M1,
        }
    }

    /// True while the collector is tracing (concurrently or during the
    /// remark pause) — the window in which a newly-discovered mutation must
    /// be pushed to the SATB queue to stay snapshot-consistent.
    pub fn during_marking(&self) -> bool {
        matches!(self.phase(), Phase::ConcurrentMark | Phase::Remark)
    }

    pub fn during_gc(&self) -> bool {
        self.phase() != Phase::Idle
    }

    /// Advances to the next phase, wrapping `Sweep` back to `Idle`. Flips
    /// the mark color on the `Idle -> ConcurrentMark` edge only.
    pub fn advance(&self) -> Phase {
        let _guard = self.transition_lock.lock();
        let current = self.phase();
        let next = current.next();
        if current == Phase::Idle {
            let flipped = self.current_mark_color().flip();
            self.mark_color.store(flipped as u8, Ordering::Release);
        }
        self.phase.store(next as u8, Ordering::Release);
        log::debug!("GC phase {current:?} -> {next:?}");
        next
    }

    /// A region is due for sweeping if its recorded state isn't the current
    /// live color. `NotAllocated` units are already free and are never
    /// considered. `Remapped` spans — allocated outside a cycle and never
    /// re-marked live by this cycle's trace — do need sweeping, since the
    /// current color is always `M0`/`M1`, never `Remapped` itself.
    pub fn needs_sweep(&self, state: MarkState) -> bool {
        if state == MarkState::NotAllocated {
            return false;
        }
        !state.matches(self.current_mark_color())
    }

    /// A handle needs its pointer self-healed if its recorded mark state no
    /// longer matches what "live" means right now. During marking this
    /// means the object was live *last* cycle (so its forwarding record, if
    /// any, is from the cycle before); otherwise it means the object was
    /// marked live *this* cycle and may already have been evacuated.
    pub fn needs_self_heal(&self, state: MarkState) -> bool {
        if state == MarkState::Remapped {
            return false;
        }
        let live_now = state.matches(self.current_mark_color());
        if self.during_marking() {
            !live_now
        } else {
            live_now
        }
    }

    pub fn is_live(&self, state: MarkState) -> bool {
        if state == MarkState::Remapped {
            return false;
        }
        state.matches(self.current_mark_color())
    }

    /// Acquires the mutator side of the STW lock. Held across an
    /// allocation or a barrier fast path; never held across a blocking
    /// call.
    pub fn enter_mutator(&self) -> RwLockReadGuard<'_, ()> {
        self.stw_lock.read()
    }

    /// Acquires the collector side of the STW lock for the remark pause.
    pub fn enter_stw(&self) -> RwLockWriteGuard<'_, ()> {
        self.stw_lock.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_to_concurrent_mark_flips_color() {
        let oracle = PhaseOracle::new();
        let before = oracle.current_mark_color();
        assert_eq!(oracle.phase(), Phase::Idle);
        oracle.advance();
        assert_eq!(oracle.phase(), Phase::ConcurrentMark);
        assert_ne!(oracle.current_mark_color(), before);
    }

    #[test]
    fn full_cycle_returns_to_idle() {
        let oracle = PhaseOracle::new();
        oracle.advance(); // -> ConcurrentMark
        oracle.advance(); // -> Remark
        oracle.advance(); // -> Sweep
        assert_eq!(oracle.phase(), Phase::Sweep);
        oracle.advance(); // -> Idle
        assert_eq!(oracle.phase(), Phase::Idle);
    }

    #[test]
    fn sweep_skips_not_allocated_and_current_color() {
        let oracle = PhaseOracle::new();
        let live = MarkState::from_color(oracle.current_mark_color());
        assert!(!oracle.needs_sweep(live));
        assert!(!oracle.needs_sweep(MarkState::NotAllocated));
    }

    #[test]
    fn sweep_reclaims_remapped_and_stale_color() {
        let oracle = PhaseOracle::new();
        oracle.advance(); // Idle -> ConcurrentMark, picks a current color
        let stale = match oracle.current_mark_color() {
            MarkColor::M0 => MarkState::M1,
            MarkColor::M1 => MarkState::M0,
        };
        assert!(oracle.needs_sweep(MarkState::Remapped));
        assert!(oracle.needs_sweep(stale));
    }

    #[test]
    fn self_heal_during_marking_targets_previous_cycle_survivors() {
        let oracle = PhaseOracle::new();
        let stale = MarkState::from_color(oracle.current_mark_color());
        oracle.advance(); // enters ConcurrentMark, flips color
        assert!(oracle.during_marking());
        assert!(oracle.needs_self_heal(stale));
        let fresh = MarkState::from_color(oracle.current_mark_color());
        assert!(!oracle.needs_self_heal(fresh));
    }

    #[test]
    fn self_heal_outside_marking_targets_current_cycle_survivors() {
        let oracle = PhaseOracle::new();
        oracle.advance(); // ConcurrentMark
        oracle.advance(); // Remark
        oracle.advance(); // Sweep
        assert!(!oracle.during_marking());
        let fresh = MarkState::from_color(oracle.current_mark_color());
        assert!(oracle.needs_self_heal(fresh));
    }
}
