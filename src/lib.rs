//! A concurrent, region-based, relocating tracing garbage collector.
//!
//! Mutators allocate through [`gc::make_managed`] and hold [`handle::Handle`]
//! values into the heap. A background [`worker::CollectorWorker`] traces the
//! [`rootset::RootSet`] with a tri-color mark, re-traces the
//! [`satb::SatbQueuePool`] under a short stop-the-world pause, and then
//! sweeps or relocates each [`region::Region`] depending on its
//! fragmentation. A handle that observes a stale address after relocation
//! heals itself by consulting the region's forwarding table, synchronously
//! finishing the evacuation of its own target if the region got there first.
//!
//! Call [`gc::GcPlatform::initialize`] once at startup before allocating
//! anything, and [`gc::GcPlatform::shutdown`] to stop the background thread
//! before exit.

pub mod allocator;
pub mod arena;
pub mod barrier;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod freelist;
pub mod gc;
pub mod handle;
pub mod phase;
pub mod region;
pub mod rootset;
pub mod satb;
pub mod trace;
pub mod worker;

pub mod prelude {
    pub use crate::config::GcConfig;
    pub use crate::error::{GcError, Result};
    pub use crate::gc::{make_managed, make_static, trigger_gc, trigger_gc_blocking, GcPlatform};
    pub use crate::handle::{Handle, PtrGuard};
    pub use crate::trace::{Collectable, Finalize, Trace, Visitor};
}
