//! Crate-wide error type.
//!
//! Mirrors the error taxonomy of a concurrent region allocator: invariant
//! violations are fatal and abort the collector thread, configuration
//! errors are rejected at construction, allocation exhaustion and user
//! misuse (dereferencing a de-allocated handle) are returned to the caller.
//! Transient CAS contention is not an error at all — callers spin.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GcError {
    /// A corrupted bitmap, a mark on an already-evacuated region, or an SATB
    /// entry whose region no longer exists. The collector cannot continue
    /// safely; callers should treat this as fatal.
    #[error("GC invariant violation: {0}")]
    InvariantViolation(String),

    /// Rejected at `GcPlatform::initialize` time, e.g. relocation requested
    /// without the region allocator, or an unimplemented knob enabled.
    #[error("invalid GC configuration: {0}")]
    ConfigurationError(String),

    /// The OS denied a fresh memory mapping after retrying.
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Dereferencing or self-healing a handle whose target was already
    /// destroyed.
    #[error("use after free: handle at {address:#x} was already destroyed")]
    UseAfterFree { address: usize },
}

pub type Result<T> = std::result::Result<T, GcError>;

/// Panics with a formatted invariant-violation message after logging it.
/// Used for checks the spec classifies as fatal (bitmap corruption, a mark
/// request against an evacuated region, and similar impossible states).
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::error!("{}", msg);
        panic!("{}", msg);
    }};
}
