//! Public facade: the process-wide platform and the `make_managed`/
//! `trigger_gc` entry points host code calls.
//!
//! The platform is an explicit initialize/shutdown singleton rather than a
//! lazy-on-first-use one — ground: the Design Notes' recommendation to
//! "wrap the singleton in an explicit initialize/shutdown pair rather than
//! lazy-on-first-use", translated from `GCWorker`'s process-wide instance.

use std::sync::OnceLock;

use crate::allocator::MemoryAllocator;
use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::handle::Handle;
use crate::phase::PhaseOracle;
use crate::rootset::RootSet;
use crate::satb::SatbQueuePool;
use crate::trace::Collectable;
use crate::worker::CollectorWorker;

static PLATFORM: OnceLock<GcPlatform> = OnceLock::new();

/// Every shared component a mutator or the collector thread needs:
/// the phase oracle, the region allocator, the root set, the SATB queue
/// pool, and the background worker. Lives for the process once
/// initialized; there is deliberately no way to tear down and rebuild a
/// second instance in the same process.
pub struct GcPlatform {
    config: GcConfig,
    phase: PhaseOracle,
    allocator: MemoryAllocator,
    roots: RootSet,
    satb: SatbQueuePool,
    worker: CollectorWorker,
}

impl GcPlatform {
    /// Validates `config` and brings up the collector. Returns a
    /// `ConfigurationError` if called twice or if `config` is invalid;
    /// never panics, matching the error taxonomy's "configuration error...
    /// rejected at construction, never a panic".
    pub fn initialize(config: GcConfig) -> Result<()> {
        config.validate()?;
        if PLATFORM.get().is_some() {
            return Err(GcError::ConfigurationError(
                "GcPlatform::initialize called more than once".into(),
            ));
        }
        let shard_count = config.shard_count;
        let distinct_satb = config.distinct_satb;
        let platform = GcPlatform {
            allocator: MemoryAllocator::new(config.clone()),
            roots: RootSet::new(shard_count),
            satb: SatbQueuePool::new(shard_count, distinct_satb),
            phase: PhaseOracle::new(),
            worker: CollectorWorker::new(),
            config,
        };
        if PLATFORM.set(platform).is_err() {
            return Err(GcError::ConfigurationError(
                "GcPlatform::initialize raced with another initializer".into(),
            ));
        }
        let platform = PLATFORM.get().expect("just initialized");
        if platform.config.concurrent_gc {
            platform.worker.start(platform);
        }
        log::info!("GC platform initialized: {:?}", platform.config);
        Ok(())
    }

    /// Signals the background worker (if running) to stop and joins it.
    /// A no-op if the platform was never initialized.
    pub fn shutdown() {
        if let Some(platform) = PLATFORM.get() {
            platform.worker.shutdown();
            log::info!("GC platform shut down");
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn phase(&self) -> &PhaseOracle {
        &self.phase
    }

    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    pub fn satb(&self) -> &SatbQueuePool {
        &self.satb
    }

    pub fn worker(&self) -> &CollectorWorker {
        &self.worker
    }
}

/// Returns the process-wide platform.
///
/// # Panics
/// Panics if `GcPlatform::initialize` has not run yet — every entry point
/// in this module calls it on the mutator's behalf, so this only fires if
/// a handle somehow outlives `GcPlatform::shutdown` and is used again.
pub fn platform() -> &'static GcPlatform {
    PLATFORM
        .get()
        .expect("GcPlatform::initialize must be called before using the collector")
}

/// Allocates `value`, registers its destructor/move-constructor/tracer on
/// the owning region, and returns a handle rooted until dropped. Ground:
/// "`make_managed<T>(args...) -> Handle<T>` — allocate, construct in
/// place, register destructor and bitwise-move constructor, return a
/// handle whose storage lives on the calling stack/struct."
pub fn make_managed<T: Collectable>(value: T) -> Handle<T> {
    let platform = platform();
    let size = std::mem::size_of::<T>().max(1);
    let during_gc = platform.phase.during_gc();
    let color = platform.phase.current_mark_color();
    let addr = platform
        .allocator
        .allocate(size, during_gc, color)
        .expect("GC allocation failed");
    unsafe {
        std::ptr::write(addr as *mut T, value);
    }
    let region = platform
        .allocator
        .region_for(addr)
        .expect("a freshly allocated address must resolve to its own region");

    region.register_destructor(
        addr,
        Box::new(|ptr: *mut u8| unsafe {
            let p = ptr as *mut T;
            (*p).finalize();
            std::ptr::drop_in_place(p);
        }),
    );
    // The byte-level copy already performed by the allocator's evacuation
    // path is a correct move-constructor for every `Collectable` type this
    // crate can name (no type here is self-referential), so the registered
    // mover has nothing left to do.
    region.register_move_constructor(addr, Box::new(|_src: *mut u8, _dst: *mut u8| {}));
    region.register_tracer(
        addr,
        Box::new(|ptr: *mut u8, visitor: &mut dyn crate::trace::Visitor| unsafe {
            (*(ptr as *const T)).trace(visitor);
        }),
    );

    Handle::new_root(addr, size, region)
}

/// Identical to [`make_managed`] — the distinction spec.md draws is in
/// intended use (a long-lived static holder inside the host) rather than
/// in what the allocator does, since every root handle here already keeps
/// its target alive for as long as the handle itself lives.
pub fn make_static<T: Collectable>(value: T) -> Handle<T> {
    make_managed(value)
}

/// Nudges the background worker to run a cycle without waiting for it.
/// A no-op if `concurrent_gc` is disabled — call `trigger_gc_blocking`
/// instead in that configuration.
pub fn trigger_gc() {
    platform().worker().request_cycle();
}

/// Runs (or waits for) one full collector cycle before returning.
pub fn trigger_gc_blocking() {
    let platform = platform();
    if platform.config().concurrent_gc {
        let baseline = platform.worker().cycles_completed();
        platform.worker().request_cycle();
        platform.worker().wait_past(baseline);
    } else {
        platform.worker().run_cycle(platform);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[derive(Default)]
    struct Leaf(u64);
    impl crate::trace::Trace for Leaf {
        fn trace(&self, _visitor: &mut dyn crate::trace::Visitor) {}
    }
    impl crate::trace::Finalize for Leaf {}

    #[test]
    fn initialize_twice_is_a_configuration_error() {
        let _guard = TEST_LOCK.lock();
        let _ = GcPlatform::initialize(GcConfig::default());
        assert!(GcPlatform::initialize(GcConfig::default()).is_err());
    }

    #[test]
    fn invalid_config_is_rejected_before_touching_the_singleton() {
        let config = GcConfig {
            relocation: true,
            memory_allocator: false,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn make_managed_allocates_and_resolves() {
        let _guard = TEST_LOCK.lock();
        let _ = GcPlatform::initialize(GcConfig {
            concurrent_gc: false,
            ..Default::default()
        });
        let handle = make_managed(Leaf(9));
        assert!(!handle.is_null());
        assert_eq!(handle.get().unwrap().0, 9);
    }
}
