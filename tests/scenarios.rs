//! End-to-end scenarios driving the public `GcPlatform`/`Handle<T>` API.
//!
//! `GcPlatform` is a process-wide singleton, so every scenario here takes
//! `SESSION` before touching it — not because the scenarios interfere with
//! each other's data (each allocates its own objects), but because
//! `cargo test` runs this file's tests concurrently by default and the
//! phase oracle and root set are shared state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use regiongc::config::GcConfig;
use regiongc::gc::{self, GcPlatform};
use regiongc::handle::Handle;
use regiongc::trace::{Finalize, Trace, Visitor};

static SESSION: Mutex<()> = Mutex::new(());

fn start() -> parking_lot::MutexGuard<'static, ()> {
    let guard = SESSION.lock();
    let _ = GcPlatform::initialize(GcConfig {
        concurrent_gc: false,
        ..Default::default()
    });
    guard
}

struct Node {
    value: i64,
    next: RwLock<Handle<Node>>,
    drops: Option<Arc<AtomicUsize>>,
}

impl Trace for Node {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.next.read().trace(visitor);
    }
}

impl Finalize for Node {
    fn finalize(&mut self) {
        if let Some(counter) = &self.drops {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn node(value: i64) -> Node {
    Node {
        value,
        next: RwLock::new(Handle::null()),
        drops: None,
    }
}

fn link(parent: &Handle<Node>, child: Handle<Node>) {
    *parent.get().unwrap().next.write() = child;
}

#[test]
fn dropped_handle_is_reclaimed_on_trigger_gc() {
    let _session = start();
    let handle = gc::make_managed(node(1));
    let addr = handle.target_addr();
    drop(handle);
    gc::trigger_gc_blocking();
    assert!(
        gc::platform().allocator().region_for(addr).is_none(),
        "a region holding only the dropped object must retire once it's swept"
    );
}

#[test]
fn three_link_chain_survives_through_the_root() {
    let _session = start();
    let a = gc::make_managed(node(1));
    let b = gc::make_managed(node(2));
    let c = gc::make_managed(node(3));
    link(&b, c);
    link(&a, b);

    gc::trigger_gc_blocking();

    let a_guard = a.get().expect("a survives, it's rooted");
    let b_handle = a_guard.next.read();
    let b_guard = b_handle.get().expect("b survives through a");
    assert_eq!(b_guard.value, 2);
    let c_handle = b_guard.next.read();
    let c_guard = c_handle.get().expect("c survives through b");
    assert_eq!(c_guard.value, 3);
}

/// Simulates "unlink mid-cycle": mutates a handle's target between
/// concurrent mark and remark by driving the phase oracle directly rather
/// than through `trigger_gc_blocking`'s single opaque call, proving the
/// SATB write barrier — not reachability through the live graph — is what
/// keeps the unlinked suffix alive for this cycle.
#[test]
fn satb_keeps_unlinked_suffix_alive_until_remark_drains_it() {
    let _session = start();
    let a = gc::make_managed(node(1));
    let b = gc::make_managed(node(2));
    let c = gc::make_managed(node(3));
    link(&b, c.clone());
    link(&a, b.clone());

    let platform = gc::platform();
    platform.phase().advance(); // Idle -> ConcurrentMark, flips live color

    // Mark `a` from its root snapshot before unlinking `b`.
    mark_reachable(&[a.target_addr()]);

    // Unlink b from a while marking is still in progress: the write
    // barrier must SATB-enqueue `b` (the value being overwritten).
    a.get().unwrap().next.write().assign_null();

    assert!(
        !platform.satb().is_empty(),
        "overwriting a handle during ConcurrentMark must enqueue its old target"
    );

    let _stw = platform.phase().enter_stw();
    platform.phase().advance(); // ConcurrentMark -> Remark
    let satb_targets: Vec<usize> = platform.satb().drain_all().into_iter().map(|e| e.addr).collect();
    mark_reachable(&satb_targets);
    platform.phase().advance(); // Remark -> Sweep
    drop(_stw);

    platform.allocator().sweep(|state| platform.phase().needs_sweep(state));
    platform.phase().advance(); // Sweep -> Idle

    assert!(platform.allocator().region_for(b.target_addr()).is_some());
    assert!(platform.allocator().region_for(c.target_addr()).is_some());
}

fn mark_reachable(roots: &[usize]) {
    let platform = gc::platform();
    let allocator = platform.allocator();
    let phase = platform.phase();
    let mut worklist: Vec<usize> = roots.to_vec();
    while let Some(addr) = worklist.pop() {
        let Some(region) = allocator.region_for(addr) else {
            continue;
        };
        if region.marked(addr, phase.current_mark_color()) {
            continue;
        }
        region.mark(addr, phase.current_mark_color());
        struct Collect<'a>(&'a mut Vec<usize>);
        impl Visitor for Collect<'_> {
            fn visit_handle(&mut self, addr: usize, _size: usize, region: Option<Arc<regiongc::region::Region>>) {
                if addr != 0 && region.is_some() {
                    self.0.push(addr);
                }
            }
        }
        let mut visitor = Collect(&mut worklist);
        region.trace_at(addr, &mut visitor);
    }
}

#[test]
fn relocation_forwards_stale_addresses_across_two_cycles() {
    let _session = start();
    let config = GcConfig {
        concurrent_gc: false,
        relocation: true,
        ..Default::default()
    };
    let _ = GcPlatform::initialize(config);

    let mut kept = Vec::new();
    let mut first_cycle_addrs = Vec::new();
    for i in 0..2000i64 {
        let handle = gc::make_managed(node(i));
        first_cycle_addrs.push(handle.target_addr());
        if i % 7 == 0 {
            kept.push(handle);
        } else {
            drop(handle);
        }
    }

    gc::trigger_gc_blocking();
    gc::trigger_gc_blocking();

    for handle in &kept {
        assert!(handle.get().is_some(), "a kept handle must still resolve after two cycles");
    }
}

#[test]
fn destructor_runs_exactly_once_when_the_root_is_dropped() {
    let _session = start();
    let counter = Arc::new(AtomicUsize::new(0));
    let handle = gc::make_managed(Node {
        value: 9,
        next: RwLock::new(Handle::null()),
        drops: Some(counter.clone()),
    });
    drop(handle);
    gc::trigger_gc_blocking();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn two_threads_assigning_the_same_handle_leave_exactly_one_target_visible() {
    let _session = start();
    let a = gc::make_managed(node(10));
    let b = gc::make_managed(node(20));
    let shared: Handle<Node> = gc::make_managed(node(0));
    let shared = Arc::new(shared);

    let writers: Vec<_> = [a.clone(), b.clone()]
        .into_iter()
        .map(|target| {
            let shared = shared.clone();
            std::thread::spawn(move || {
                shared.assign(target.target_addr(), std::mem::size_of::<Node>(), region_of(&target));
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let visible = shared.target_addr();
    assert!(visible == a.target_addr() || visible == b.target_addr());
}

fn region_of(handle: &Handle<Node>) -> Arc<regiongc::region::Region> {
    gc::platform()
        .allocator()
        .region_for(handle.target_addr())
        .expect("allocated handle must resolve to a region")
}
