// Test module organization
pub mod common;
pub mod test_heap;
pub mod test_intern;
pub mod test_refcount;
pub mod test_tracing;
