use crate::gc::GcKind;
use crate::lua_vm::lua_limits::{
    DEFAULT_GC_PAUSE, DEFAULT_GC_STEPMUL, DEFAULT_GC_STEPSIZE, DEFAULT_GEN_THRESHOLDS,
    DEFAULT_RECYCLE_THRESHOLD, LUAI_MAXSHORTLEN, NUM_GENERATIONS,
};

/// What happens to an error raised by a finalizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalizerErrors {
    /// Log it and carry on
    #[default]
    Discard,
    /// Hand the first one back to whoever requested the collection
    Propagate,
}

#[derive(Debug, Clone)]
pub struct SafeOption {
    /// Maximum memory limit in bytes
    pub max_memory_limit: usize,
    pub gc_kind: GcKind,
    /// Strings up to this length are interned
    pub short_string_limit: usize,
    pub generation_thresholds: [usize; NUM_GENERATIONS],
    pub recycle_threshold: usize,
    /// Tracing collector pause, percent
    pub gc_pause: u32,
    /// Tracing collector speed, percent
    pub gc_stepmul: u32,
    /// Bytes of allocation between tracing steps
    pub gc_stepsize: u32,
    pub finalizer_errors: FinalizerErrors,
    /// Seed for string hashes
    pub hash_seed: u64,
}

impl Default for SafeOption {
    fn default() -> Self {
        Self {
            max_memory_limit: usize::MAX,
            gc_kind: GcKind::Generational,
            short_string_limit: LUAI_MAXSHORTLEN,
            generation_thresholds: DEFAULT_GEN_THRESHOLDS,
            recycle_threshold: DEFAULT_RECYCLE_THRESHOLD,
            gc_pause: DEFAULT_GC_PAUSE,
            gc_stepmul: DEFAULT_GC_STEPMUL,
            gc_stepsize: DEFAULT_GC_STEPSIZE,
            finalizer_errors: FinalizerErrors::Discard,
            hash_seed: 0x2545_f491_4f6c_dd1d,
        }
    }
}
