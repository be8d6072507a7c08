//! Tunable knobs.
//!
//! The original collector this crate reimplements expressed every knob in
//! this module as a compile-time constant. A validated runtime struct gets
//! the same "rejected at construction" behavior without turning every
//! collector type into a pile of const generics, and it is what every other
//! region-based GC in this codebase's lineage does.

use crate::error::{GcError, Result};

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

/// Validated configuration for [`crate::gc::GcPlatform::initialize`].
///
/// # Examples
///
/// ```
/// use regiongc::config::GcConfig;
///
/// let config = GcConfig::default();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Run the collector cycle on its own background thread.
    ///
    /// Default: `true`.
    pub concurrent_gc: bool,

    /// Use the region allocator. The original collector this crate
    /// reimplements falls back to the host language's own `new` when this is
    /// off; this crate has no such alternate backend, so `validate()`
    /// rejects `false` outright rather than silently ignoring it.
    ///
    /// Default: `true`.
    pub memory_allocator: bool,

    /// Compact live objects during sweep, populating per-region forwarding
    /// tables. Requires `memory_allocator`.
    ///
    /// Default: `false`.
    pub relocation: bool,

    /// Dispatch marking and sweeping across a worker pool. Requires
    /// `memory_allocator`.
    ///
    /// Default: `true`.
    pub parallel_gc: bool,

    /// Invoke a registered destructor before a region reclaims a dead
    /// object's span.
    ///
    /// Default: `true`.
    pub destructor_support: bool,

    /// Use a per-region hashmap instead of a mark bitmap. Not implemented —
    /// `validate()` rejects `true`.
    ///
    /// Default: `false`.
    pub regional_hashmap: bool,

    /// Give every handle its own last-seen mark color for a fast self-heal
    /// path. Forced on whenever `relocation` is enabled.
    ///
    /// Default: `false`.
    pub inline_mark_state: bool,

    /// Dedupe the SATB queue by target address.
    ///
    /// Default: `false`.
    pub distinct_satb: bool,

    /// Tombstone roots at removal time and compact the root set during the
    /// next mark walk, instead of swap-with-tail removal.
    ///
    /// Default: `false`.
    pub defer_remove_root: bool,

    /// Number of worker threads used for parallel mark/sweep.
    ///
    /// Default: 4.
    pub gc_thread_count: usize,

    /// Number of root-set / SATB-queue / free-list shards. Defaults to the
    /// number of hardware threads.
    pub shard_count: usize,

    /// Size of a TINY region.
    pub tiny_region_size: usize,
    /// Size of a SMALL region.
    pub small_region_size: usize,
    /// Size of a MEDIUM region.
    pub medium_region_size: usize,

    /// Objects at or below this size go in a TINY region.
    pub tiny_object_threshold: usize,
    /// Objects at or below this size go in a SMALL region.
    pub small_object_threshold: usize,
    /// Objects at or below this size go in a MEDIUM region; above, LARGE.
    pub medium_object_threshold: usize,

    /// Bytes covered by one 2-bit mark-bitmap unit.
    pub region_to_bitmap_ratio: usize,

    /// Minimum size of a fresh OS extent requested by the free-list manager.
    pub initial_single_size: usize,

    /// Fragmentation ratio (`frag_size / allocated_offset`) at/above which a
    /// region becomes an evacuation candidate.
    pub fragmentation_threshold: f32,
    /// Free ratio (`frag_size / total_size`) below which a region becomes an
    /// evacuation candidate.
    pub free_ratio_threshold: f32,

    /// Log a sweep/relocation pass that takes longer than this at `warn!`
    /// instead of `debug!`.
    pub stw_warn_threshold_micros: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            concurrent_gc: true,
            memory_allocator: true,
            relocation: false,
            parallel_gc: true,
            destructor_support: true,
            regional_hashmap: false,
            inline_mark_state: false,
            distinct_satb: false,
            defer_remove_root: false,

            gc_thread_count: 4,
            shard_count: num_cpus::get().max(1),

            tiny_region_size: 256 * KB,
            small_region_size: MB,
            medium_region_size: 32 * MB,

            tiny_object_threshold: 4,
            small_object_threshold: 16 * KB,
            medium_object_threshold: MB,

            region_to_bitmap_ratio: 1,
            initial_single_size: 8 * MB,

            fragmentation_threshold: 0.25,
            free_ratio_threshold: 0.25,

            stw_warn_threshold_micros: 5_000,
        }
    }
}

impl GcConfig {
    /// Checks the knob combinations the collector cannot start with.
    pub fn validate(&self) -> Result<()> {
        if !self.memory_allocator {
            return Err(GcError::ConfigurationError(
                "memory_allocator is not implemented; the region allocator is always in use".into(),
            ));
        }
        if self.regional_hashmap {
            return Err(GcError::ConfigurationError(
                "regional_hashmap is not implemented; only bitmap marking is available".into(),
            ));
        }
        if self.tiny_object_threshold >= self.small_object_threshold
            || self.small_object_threshold >= self.medium_object_threshold
        {
            return Err(GcError::ConfigurationError(
                "object size thresholds must be strictly increasing tiny < small < medium".into(),
            ));
        }
        if self.region_to_bitmap_ratio == 0 {
            return Err(GcError::ConfigurationError(
                "region_to_bitmap_ratio must be > 0".into(),
            ));
        }
        if self.gc_thread_count == 0 {
            return Err(GcError::ConfigurationError(
                "gc_thread_count must be > 0".into(),
            ));
        }
        if self.shard_count == 0 {
            return Err(GcError::ConfigurationError("shard_count must be > 0".into()));
        }
        Ok(())
    }

    /// Effective `inline_mark_state`: forced on by relocation.
    pub fn effective_inline_mark_state(&self) -> bool {
        self.inline_mark_state || self.relocation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(GcConfig::default().validate().is_ok());
    }

    #[test]
    fn relocation_without_allocator_is_rejected() {
        let config = GcConfig {
            memory_allocator: false,
            relocation: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn regional_hashmap_is_rejected() {
        let config = GcConfig {
            regional_hashmap: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn relocation_forces_inline_mark_state() {
        let config = GcConfig {
            relocation: true,
            ..Default::default()
        };
        assert!(config.effective_inline_mark_state());
    }
}
