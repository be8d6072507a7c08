//! The collector worker: runs the concurrent mark / stop-the-world remark /
//! sweep-or-relocate cycle described in the phase state machine, either on
//! its own background thread or synchronously when asked to.
//!
//! Ground: `GCWorker::GCThreadLoop`/`wakeUpGCThread` for the wait/wake
//! background loop, `GCWorker::selectRelocationSet`/`beginSweep` for the
//! sweep-then-relocate boundary.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::gc::GcPlatform;
use crate::phase::Phase;
use crate::trace::Visitor;

/// Visitor implementation the marker drives: every handle discovered while
/// tracing a live object is pushed onto the shared worklist for the marker
/// to pick up next.
struct MarkVisitor<'a> {
    worklist: &'a mut Vec<usize>,
}

impl Visitor for MarkVisitor<'_> {
    fn visit_handle(&mut self, addr: usize, _size: usize, region: Option<std::sync::Arc<crate::region::Region>>) {
        if addr != 0 && region.is_some() {
            self.worklist.push(addr);
        }
    }
}

/// Background driver for the collector's cycle. Owns nothing but its own
/// thread handle and the wake/completion signaling the mutator-facing
/// `trigger_gc`/`trigger_gc_blocking` calls use.
pub struct CollectorWorker {
    shutdown: AtomicBool,
    wake: (Mutex<bool>, Condvar),
    completed: AtomicU64,
    completed_signal: Condvar,
    completed_lock: Mutex<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CollectorWorker {
    pub fn new() -> CollectorWorker {
        CollectorWorker {
            shutdown: AtomicBool::new(false),
            wake: (Mutex::new(false), Condvar::new()),
            completed: AtomicU64::new(0),
            completed_signal: Condvar::new(),
            completed_lock: Mutex::new(()),
            thread: Mutex::new(None),
        }
    }

    /// Starts the background thread if `concurrent_gc` is enabled. The
    /// thread loop is woken either by an explicit `trigger_gc` or, failing
    /// that, a periodic timeout, matching `wakeUpGCThread`'s dual wakeup
    /// paths.
    pub fn start(&self, platform: &'static GcPlatform) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }
        *thread = Some(std::thread::spawn(move || Self::thread_loop(platform)));
    }

    fn thread_loop(platform: &'static GcPlatform) {
        let worker = platform.worker();
        loop {
            {
                let (lock, cvar) = &worker.wake;
                let mut woken = lock.lock();
                if !*woken {
                    cvar.wait_for(&mut woken, Duration::from_millis(200));
                }
                *woken = false;
            }
            if worker.shutdown.load(Ordering::Acquire) {
                return;
            }
            worker.run_cycle(platform);
        }
    }

    pub fn request_cycle(&self) {
        let (lock, cvar) = &self.wake;
        let mut woken = lock.lock();
        *woken = true;
        cvar.notify_one();
    }

    pub fn cycles_completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Blocks until at least one more cycle completes past `baseline`.
    pub fn wait_past(&self, baseline: u64) {
        let mut guard = self.completed_lock.lock();
        while self.cycles_completed() <= baseline {
            self.completed_signal.wait(&mut guard);
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.request_cycle();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Runs one full Idle -> ConcurrentMark -> Remark -> Sweep -> Idle
    /// cycle. Safe to call directly (synchronous `trigger_gc_blocking`) or
    /// from the background thread.
    pub fn run_cycle(&self, platform: &GcPlatform) {
        let phase = platform.phase();
        let allocator = platform.allocator();
        let roots = platform.roots();
        let satb = platform.satb();
        let config = platform.config();

        log::info!("GC cycle starting");
        phase.advance(); // Idle -> ConcurrentMark, flips color

        let mut worklist: Vec<usize> = roots.snapshot();
        Self::drain_worklist(platform, &mut worklist);

        {
            let _stw = phase.enter_stw();
            phase.advance(); // ConcurrentMark -> Remark
            let mut remark_work: Vec<usize> = satb
                .drain_all()
                .into_iter()
                .map(|entry| entry.addr)
                .collect();
            Self::drain_worklist(platform, &mut remark_work);
            phase.advance(); // Remark -> Sweep
        }
        // The world resumes here: sweep and relocation run against a
        // remark-complete mark bitmap, concurrently with mutators, which is
        // why both consult `needs_sweep` (a pure function of that bitmap)
        // rather than anything the STW lock was protecting.

        if config.relocation {
            let start = std::time::Instant::now();
            allocator.relocate(|state| phase.needs_sweep(state));
            log::debug!("relocation pass took {:?}", start.elapsed());
        }
        let start = std::time::Instant::now();
        allocator.sweep(|state| phase.needs_sweep(state));
        let elapsed = start.elapsed();
        if elapsed.as_micros() as u64 > config.stw_warn_threshold_micros {
            log::warn!("sweep/relocation pass took {elapsed:?}, exceeding configured threshold");
        }

        let next = phase.advance(); // Sweep -> Idle
        debug_assert_eq!(next, Phase::Idle);

        self.completed.fetch_add(1, Ordering::AcqRel);
        {
            let _guard = self.completed_lock.lock();
            self.completed_signal.notify_all();
        }
        log::info!("GC cycle complete ({} live bytes)", allocator.live_size());
    }

    fn drain_worklist(platform: &GcPlatform, worklist: &mut Vec<usize>) {
        let allocator = platform.allocator();
        let phase = platform.phase();
        while let Some(addr) = worklist.pop() {
            let Some(region) = allocator.region_for(addr) else {
                continue;
            };
            if region.marked(addr, phase.current_mark_color()) {
                continue;
            }
            region.mark(addr, phase.current_mark_color());
            let mut visitor = MarkVisitor { worklist };
            region.trace_at(addr, &mut visitor);
        }
    }
}

impl Default for CollectorWorker {
    fn default() -> Self {
        CollectorWorker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::gc::{self, GcPlatform};
    use parking_lot::Mutex as StdMutex;

    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    #[derive(Default)]
    struct Leaf(u64);
    impl crate::trace::Trace for Leaf {
        fn trace(&self, _visitor: &mut dyn Visitor) {}
    }
    impl crate::trace::Finalize for Leaf {
        fn finalize(&mut self) {
            assert_eq!(self.0, 1);
        }
    }

    #[test]
    fn synchronous_cycle_reclaims_unrooted_objects() {
        let _guard = TEST_LOCK.lock();
        let _ = GcPlatform::initialize(GcConfig {
            concurrent_gc: false,
            ..Default::default()
        });
        {
            let _handle = gc::make_managed(Leaf(1));
        }
        gc::trigger_gc_blocking();
        assert_eq!(gc::platform().phase().phase(), Phase::Idle);
    }
}
