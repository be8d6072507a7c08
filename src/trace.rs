//! Tracing: how the marker discovers the handles embedded inside a managed
//! object.
//!
//! The source this collector descends from finds handles inside raw object
//! bytes by scanning for a pair of magic sentinel integers — a trick that
//! only works because the original ran without a type system to lean on.
//! Rust has one, so every managed type implements [`Trace`] explicitly, and
//! `make_managed` registers a small tracing closure alongside the
//! destructor and move-constructor already kept per region. A `Handle`'s
//! own `Trace` impl calls back into the visitor with its erased address and
//! region; everything else about discovery composes out of ordinary trait
//! dispatch instead of scanning memory for sentinels.

use std::sync::Arc;

use crate::region::Region;

/// Callback the marker implements: told about every handle reachable from
/// a traced object.
pub trait Visitor {
    /// `region` is `None` for a handle whose target isn't heap-resident
    /// (never allocated, or already cleared) — nothing to mark.
    fn visit_handle(&mut self, addr: usize, size: usize, region: Option<Arc<Region>>);
}

/// Implemented by every type embeddable in a managed allocation. Recurses
/// into child handles by calling `visitor.visit_handle` once per handle
/// field (directly, or by delegating to the child's own `trace`).
pub trait Trace {
    fn trace(&self, visitor: &mut dyn Visitor);
}

/// Implemented by every managed type to release non-GC resources (open
/// files, native handles) when the collector reclaims it. Distinct from
/// `Drop` because it runs from inside the collector, under the registered
/// destructor callback, not on ordinary scope exit.
pub trait Finalize {
    fn finalize(&mut self) {}
}

/// A type the collector can allocate, trace, and finalize.
pub trait Collectable: Trace + Finalize + Send + Sync + 'static {}
impl<T: Trace + Finalize + Send + Sync + 'static> Collectable for T {}

macro_rules! leaf_trace {
    ($($t:ty),* $(,)?) => {
        $(
            impl Trace for $t {
                fn trace(&self, _visitor: &mut dyn Visitor) {}
            }
            impl Finalize for $t {}
        )*
    };
}

leaf_trace!(bool, char, f32, f64, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, String);

impl<T: Trace> Trace for Option<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        if let Some(value) = self {
            value.trace(visitor);
        }
    }
}
impl<T: Trace> Finalize for Option<T> {}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }
}
impl<T: Trace> Finalize for Vec<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting(std::cell::Cell<usize>);

    impl Visitor for Counting {
        fn visit_handle(&mut self, _addr: usize, _size: usize, _region: Option<Arc<Region>>) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn vec_of_leaves_traces_nothing() {
        let values = vec![1u32, 2, 3];
        let mut visitor = Counting(std::cell::Cell::new(0));
        values.trace(&mut visitor);
        assert_eq!(visitor.0.get(), 0);
    }
}
