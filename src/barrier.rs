//! SATB write barrier: the half of the barrier pair that runs on a mutator
//! overwriting or dropping a handle, as opposed to `handle.rs`'s self-healing
//! read barrier.
//!
//! Kept as free functions taking the phase oracle and queue pool explicitly
//! rather than methods on `Handle` so the barrier logic is exercised here in
//! isolation from the handle's own locking.

use std::sync::Arc;

use crate::phase::PhaseOracle;
use crate::region::Region;
use crate::satb::{SatbEntry, SatbQueuePool};

/// Enqueues `old_target` for remark if a concurrent mark is in progress.
/// A no-op outside `ConcurrentMark`/`Remark` — the marker hasn't produced a
/// snapshot yet, so there's nothing for this write to invalidate.
pub fn enqueue_overwritten(
    phase: &PhaseOracle,
    satb: &SatbQueuePool,
    old_addr: usize,
    old_size: usize,
    old_region: Option<Arc<Region>>,
) {
    if old_addr == 0 || !phase.during_marking() {
        return;
    }
    let Some(region) = old_region else {
        return;
    };
    satb.push(SatbEntry {
        addr: old_addr,
        size: old_size,
        region,
    });
}
