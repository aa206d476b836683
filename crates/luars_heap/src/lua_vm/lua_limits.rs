//! Centralized heap limits and configuration constants.
//!
//! Mirrors the `llimits.h` / `lgc.h` split of the reference runtime:
//! every magic number that controls collector behavior lives here.

// ===== Stack =====

/// Minimum guaranteed stack slots for a new thread.
pub const LUA_MINSTACK: usize = 20;

/// Initial stack capacity for new threads.
pub const BASIC_STACK_SIZE: usize = 2 * LUA_MINSTACK;

// ===== Strings =====

/// Maximum length for "short" strings (interned in the string table).
pub const LUAI_MAXSHORTLEN: usize = 40;

/// Minimum size of the string table; it never shrinks below this.
pub const MINSTRTABSIZE: usize = 64;

// ===== Constant pool =====

/// Boxed integers in this range are pinned once at startup and shared.
pub const SMALL_INT_MIN: i64 = -32;
pub const SMALL_INT_MAX: i64 = 256;

// ===== Generational collector =====

pub const NUM_GENERATIONS: usize = 3;

/// Gen 0 threshold counts allocations; older thresholds count scans of
/// the next younger generation.
pub const DEFAULT_GEN_THRESHOLDS: [usize; NUM_GENERATIONS] = [600, 5, 5];

/// Recycle bin length that triggers a confirmation scan.
pub const DEFAULT_RECYCLE_THRESHOLD: usize = 1000;

// ===== Tracing collector =====

/// Default pause (percentage): wait until memory doubles after a cycle.
pub const DEFAULT_GC_PAUSE: u32 = 200;

/// Default step multiplier (percentage).
pub const DEFAULT_GC_STEPMUL: u32 = 200;

/// Default step size in bytes (about 8 KB of allocation per step).
pub const DEFAULT_GC_STEPSIZE: u32 = 8 * 1024;

/// Maximum number of arena slots swept per single step.
pub const GCSWEEPMAX: usize = 100;

/// Initial number of finalizers called per CallFin step; doubles each step.
pub const GCFINNUM: usize = 1;

/// Work units charged for one finalizer call.
pub const GCFINALIZECOST: isize = 50;

// ===== Registry =====

/// Registry slot holding the main thread.
pub const LUA_RIDX_MAINTHREAD: i64 = 1;

/// Registry slot holding the globals table.
pub const LUA_RIDX_GLOBALS: i64 = 2;
