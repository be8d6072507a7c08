//! Demo: a cyclic object graph and a long allocation loop, both surviving
//! concurrent collection. Translates the teacher's `examples/alloc.rs`
//! (a `Node`/`letroot!`-based linked-list allocator) to this crate's own
//! `make_managed`/`Handle<T>`/`trigger_gc` API.

use parking_lot::RwLock;
use regiongc::config::GcConfig;
use regiongc::gc::{self, GcPlatform};
use regiongc::handle::Handle;
use regiongc::trace::{Finalize, Trace, Visitor};

struct Node {
    value: i64,
    next: RwLock<Handle<Node>>,
}

impl Trace for Node {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.next.read().trace(visitor);
    }
}

impl Finalize for Node {}

fn leaf(value: i64) -> Handle<Node> {
    gc::make_managed(Node {
        value,
        next: RwLock::new(Handle::null()),
    })
}

fn main() {
    GcPlatform::initialize(GcConfig::default()).expect("failed to start the collector");

    // A two-node cycle: a -> b -> a. Each node only keeps the other alive
    // through an interior handle, so the cycle is collected as soon as
    // neither `a` nor `b` is rooted — proving the marker doesn't need a
    // cycle-breaking refcount scheme to reclaim it.
    let a = leaf(1);
    let b = leaf(2);
    *a.get().unwrap().next.write() = b.clone();
    *b.get().unwrap().next.write() = a.clone();

    let start = std::time::Instant::now();
    let mut list = leaf(0);
    for i in 0..500_000i64 {
        let node = gc::make_managed(Node {
            value: i,
            next: RwLock::new(list.clone()),
        });
        list = node;
        if i % 8192 == 0 {
            list = leaf(0);
        }
    }
    drop(a);
    drop(b);

    gc::trigger_gc_blocking();
    println!(
        "finished in {:.4}s, last node value {}, {} live bytes, {} GC cycles",
        start.elapsed().as_secs_f64(),
        list.get().unwrap().value,
        gc::platform().allocator().live_size(),
        gc::platform().worker().cycles_completed(),
    );

    GcPlatform::shutdown();
}
