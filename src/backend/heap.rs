//! Process-local heap fallback.
//!
//! Useful where shared mappings are unavailable or not wanted (tests, single
//! process deployments). Other processes never see this memory.

use super::{MappedRegion, Release, SegmentBackend, page_size};
use crate::error::{StorageError, StorageResult};
use std::alloc::Layout;
use std::ptr::NonNull;

/// Backend that allocates zeroed, page-aligned heap memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapBackend;

impl HeapBackend {
    /// Create a heap backend.
    pub fn new() -> Self {
        Self
    }
}

impl SegmentBackend for HeapBackend {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn map(&self, size: usize) -> StorageResult<MappedRegion> {
        if size == 0 {
            return Err(StorageError::allocation("cannot allocate zero bytes"));
        }

        let layout = Layout::from_size_align(size, page_size())
            .map_err(|e| StorageError::allocation(format!("layout: {}", e)))?;

        // Safety: layout has a non-zero size
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| StorageError::allocation("alloc_zeroed"))?;

        Ok(MappedRegion::new(ptr, size, true, Release::Heap(layout)))
    }
}
