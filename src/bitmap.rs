//! Per-region mark bitmap.
//!
//! Each allocation unit gets 2 bits instead of the teacher's 1, because the
//! mark state here has four values (`NotAllocated` / `Remapped` / `M0` /
//! `M1`) rather than a plain marked/unmarked flag — a free unit, a unit
//! allocated outside a cycle, and a unit swept under the wrong color all
//! need to stay distinguishable. Bits are packed 4 units per byte and
//! updated with the same load/CAS-loop idiom the teacher's `SpaceBitmap`
//! uses per word, just at byte granularity.

use atomic::{Atomic, Ordering};

use crate::phase::{MarkColor, MarkState};

const BITS_PER_UNIT: usize = 2;
const UNITS_PER_BYTE: usize = 8 / BITS_PER_UNIT;

const CODE_NOT_ALLOCATED: u8 = 0b00;
const CODE_REMAPPED: u8 = 0b01;
const CODE_M0: u8 = 0b10;
const CODE_M1: u8 = 0b11;

fn state_to_code(state: MarkState) -> u8 {
    match state {
        MarkState::NotAllocated => CODE_NOT_ALLOCATED,
        MarkState::Remapped => CODE_REMAPPED,
        MarkState::M0 => CODE_M0,
        MarkState::M1 => CODE_M1,
    }
}

fn code_to_state(code: u8) -> MarkState {
    match code {
        CODE_REMAPPED => MarkState::Remapped,
        CODE_M0 => MarkState::M0,
        CODE_M1 => MarkState::M1,
        _ => MarkState::NotAllocated,
    }
}

/// A fixed-capacity 2-bit-per-unit mark bitmap covering `unit_count` aligned
/// allocation units of a region.
pub struct MarkBitmap {
    bytes: Box<[Atomic<u8>]>,
    unit_count: usize,
}

impl MarkBitmap {
    /// Allocates a bitmap with all units initialized to `NotAllocated`.
    pub fn new(unit_count: usize) -> MarkBitmap {
        let byte_count = unit_count.div_ceil(UNITS_PER_BYTE).max(1);
        let bytes = (0..byte_count).map(|_| Atomic::new(0u8)).collect();
        MarkBitmap { bytes, unit_count }
    }

    pub fn unit_count(&self) -> usize {
        self.unit_count
    }

    fn locate(&self, unit: usize) -> (usize, u32) {
        debug_assert!(unit < self.unit_count, "unit {unit} out of bounds");
        let byte_index = unit / UNITS_PER_BYTE;
        let shift = ((unit % UNITS_PER_BYTE) * BITS_PER_UNIT) as u32;
        (byte_index, shift)
    }

    pub fn get(&self, unit: usize) -> MarkState {
        let (byte_index, shift) = self.locate(unit);
        let byte = self.bytes[byte_index].load(Ordering::Acquire);
        code_to_state((byte >> shift) & 0b11)
    }

    /// Sets a unit to `color`. Returns the previous state. Spins on CAS
    /// failure, matching the teacher's per-word mark loop.
    pub fn mark(&self, unit: usize, color: MarkColor) -> MarkState {
        self.set(unit, MarkState::from_color(color))
    }

    /// Sets a unit to `Remapped` — an object allocated outside a GC cycle is
    /// implicitly live until the next mark proves otherwise.
    pub fn mark_remapped(&self, unit: usize) -> MarkState {
        self.set(unit, MarkState::Remapped)
    }

    /// CAS-updates a single unit's 2-bit field to `state` without disturbing
    /// its neighbors in the same byte.
    fn set(&self, unit: usize, state: MarkState) -> MarkState {
        let (byte_index, shift) = self.locate(unit);
        let mask = 0b11u8 << shift;
        let code = state_to_code(state) << shift;
        let atomic_byte = &self.bytes[byte_index];
        loop {
            let old = atomic_byte.load(Ordering::Relaxed);
            let prev_state = code_to_state((old >> shift) & 0b11);
            if prev_state == state {
                return prev_state;
            }
            let new = (old & !mask) | code;
            if atomic_byte
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return prev_state;
            }
        }
    }

    /// Resets every unit's state to `NotAllocated`. Used when a region is
    /// retired or its arena is returned to the free-list manager.
    pub fn clear_all(&self) {
        for byte in self.bytes.iter() {
            byte.store(0, Ordering::Relaxed);
        }
    }

    /// Frees a single unit back to `NotAllocated`, e.g. once its span has
    /// been reclaimed by the sweeper or evacuated and the forwarding table
    /// now owns its liveness.
    pub fn clear(&self, unit: usize) {
        self.set(unit, MarkState::NotAllocated);
    }

    /// Iterates `(unit, state)` for every allocated unit (anything but
    /// `NotAllocated`), used by the sweeper to find spans and by the marker
    /// to report already-marked objects.
    pub fn visit_marked(&self, mut visitor: impl FnMut(usize, MarkState)) {
        for unit in 0..self.unit_count {
            let state = self.get(unit);
            if state != MarkState::NotAllocated {
                visitor(unit, state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_bitmap_is_all_not_allocated() {
        let bitmap = MarkBitmap::new(100);
        for unit in 0..100 {
            assert_eq!(bitmap.get(unit), MarkState::NotAllocated);
        }
    }

    #[test]
    fn mark_and_clear_round_trip() {
        let bitmap = MarkBitmap::new(16);
        assert_eq!(bitmap.mark(5, MarkColor::M0), MarkState::NotAllocated);
        assert_eq!(bitmap.get(5), MarkState::M0);
        assert_eq!(bitmap.get(4), MarkState::NotAllocated);
        bitmap.clear(5);
        assert_eq!(bitmap.get(5), MarkState::NotAllocated);
    }

    #[test]
    fn mark_remapped_is_distinct_from_not_allocated() {
        let bitmap = MarkBitmap::new(4);
        bitmap.mark_remapped(1);
        assert_eq!(bitmap.get(0), MarkState::NotAllocated);
        assert_eq!(bitmap.get(1), MarkState::Remapped);
    }

    #[test]
    fn adjacent_units_do_not_interfere() {
        let bitmap = MarkBitmap::new(8);
        bitmap.mark(0, MarkColor::M0);
        bitmap.mark(1, MarkColor::M1);
        bitmap.mark(2, MarkColor::M0);
        assert_eq!(bitmap.get(0), MarkState::M0);
        assert_eq!(bitmap.get(1), MarkState::M1);
        assert_eq!(bitmap.get(2), MarkState::M0);
        assert_eq!(bitmap.get(3), MarkState::NotAllocated);
    }

    #[test]
    fn visit_marked_skips_unmarked_units() {
        let bitmap = MarkBitmap::new(10);
        bitmap.mark(3, MarkColor::M1);
        bitmap.mark(7, MarkColor::M0);
        let mut seen = Vec::new();
        bitmap.visit_marked(|unit, state| seen.push((unit, state)));
        assert_eq!(seen, vec![(3, MarkState::M1), (7, MarkState::M0)]);
    }
}
