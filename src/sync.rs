//! Synchronization primitives with optional loom support.
//!
//! Every word that lives in the shared region is accessed through these
//! atomics. In production they are the std atomics, whose layout matches the
//! plain integers they replace, so a region mapped by several processes has
//! one agreed layout. Under the `loom` feature they are swapped for loom's
//! model-checked atomics; loom tests only ever build slots and cursors on the
//! heap, never inside a mapped region.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

/// Spin loop hint for busy waiting.
///
/// Under loom this yields instead, so the model checker can schedule the
/// thread we are waiting on.
#[inline]
pub fn spin_loop() {
    #[cfg(not(feature = "loom"))]
    std::hint::spin_loop();

    #[cfg(feature = "loom")]
    loom::thread::yield_now();
}
