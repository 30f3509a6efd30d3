//! Shared memory segment backends.
//!
//! A backend maps one contiguous region large enough for the key region and
//! every value segment, then carves it into a [`SegmentDirectory`]:
//!
//! ```text
//! +--------------+-----------+-----------+-----+-----------------------+
//! | key region   | segment 1 | segment 2 | ... | segment N (remainder) |
//! +--------------+-----------+-----------+-----+-----------------------+
//!   entry 0        entry 1     entry 2           entry N
//! ```
//!
//! Entry 0 owns the mapping. Value segment entries borrow into it and own
//! nothing, so detaching them is a no-op.

mod heap;
mod mmap;
mod shm;

pub use heap::HeapBackend;
pub use mmap::AnonymousBackend;
pub use shm::NamedBackend;

use crate::error::StorageResult;
use memmap2::MmapMut;
use std::alloc::Layout;
use std::ptr::NonNull;

/// Largest number of value segments a region is split into.
pub const MAX_SEGMENTS: usize = 1024;

/// Value segments are cut on this boundary so record headers stay aligned.
pub const SEGMENT_ALIGN: usize = 8;

/// Fallback when the OS page size cannot be queried.
const DEFAULT_PAGE_SIZE: usize = 4096;

/// Round up to the nearest multiple of `align` (a power of two).
#[inline]
pub(crate) fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Round down to the nearest multiple of `align` (a power of two).
#[inline]
pub(crate) fn round_down(size: usize, align: usize) -> usize {
    size & !(align - 1)
}

/// The OS page size.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

/// How a value region is split into segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    /// Number of value segments (a power of two).
    pub count: usize,
    /// Size of every segment but the last.
    pub segment_size: usize,
    /// Size of the last segment, which absorbs the rounding remainder.
    pub last_segment_size: usize,
}

/// Split `value_size` bytes into the largest power-of-two number of segments
/// (at most [`MAX_SEGMENTS`], at least one) that keeps each segment at or
/// above `min_segment_size`.
pub fn plan_segments(value_size: usize, min_segment_size: usize) -> SegmentPlan {
    let mut count = MAX_SEGMENTS;
    while count > 1 && value_size / count < min_segment_size {
        count >>= 1;
    }

    let segment_size = round_down(value_size / count, SEGMENT_ALIGN);
    let last_segment_size = value_size - segment_size * (count - 1);

    SegmentPlan {
        count,
        segment_size,
        last_segment_size,
    }
}

/// How the memory behind a [`MappedRegion`] is given back.
#[derive(Debug)]
pub(crate) enum Release {
    /// `munmap` the range.
    Munmap,
    /// Drop the file mapping.
    File(#[allow(dead_code)] MmapMut),
    /// Free the heap allocation.
    Heap(Layout),
}

/// A raw memory region returned by a backend. Released on drop.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    created: bool,
    release: Release,
}

impl MappedRegion {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize, created: bool, release: Release) -> Self {
        Self {
            ptr,
            len,
            created,
            release,
        }
    }

    /// Pointer to the start of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this call created the region, as opposed to attaching to one
    /// another process created.
    pub fn created(&self) -> bool {
        self.created
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        match &self.release {
            Release::Munmap => unsafe {
                let result = libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
                debug_assert_eq!(result, 0, "munmap failed");
            },
            // MmapMut unmaps itself when the enum is dropped.
            Release::File(_) => {}
            Release::Heap(layout) => unsafe {
                std::alloc::dealloc(self.ptr.as_ptr(), *layout);
            },
        }
    }
}

// Safety: the region is raw memory whose concurrent use goes through atomics.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

/// One entry of a [`SegmentDirectory`].
#[derive(Debug)]
pub struct Segment {
    base: NonNull<u8>,
    size: usize,
    mapping: Option<MappedRegion>,
}

impl Segment {
    /// Start of the segment.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Usable size of the segment in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes this entry unmaps when detached. Zero for entries that only
    /// borrow into another entry's mapping.
    pub fn mapped_size(&self) -> usize {
        self.mapping.as_ref().map_or(0, MappedRegion::len)
    }

}

// Safety: see `MappedRegion`.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

/// The key region followed by every value segment.
#[derive(Debug)]
pub struct SegmentDirectory {
    segments: Vec<Segment>,
    created: bool,
}

impl SegmentDirectory {
    /// Lay a directory over a freshly mapped region.
    ///
    /// `region` must be at least `key_size + value_size` bytes.
    pub(crate) fn carve(
        region: MappedRegion,
        key_size: usize,
        value_size: usize,
        plan: SegmentPlan,
    ) -> Self {
        debug_assert!(region.len() >= key_size + value_size);

        let base = region.ptr;
        let created = region.created();
        let mut segments = Vec::with_capacity(plan.count + 1);

        segments.push(Segment {
            base,
            size: key_size,
            mapping: Some(region),
        });

        let mut offset = key_size;
        for i in 0..plan.count {
            let size = if i + 1 == plan.count {
                plan.last_segment_size
            } else {
                plan.segment_size
            };
            // Safety: offset + size <= key_size + value_size <= region length.
            let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
            segments.push(Segment {
                base: ptr,
                size,
                mapping: None,
            });
            offset += size;
        }

        Self { segments, created }
    }

    /// The key region (entry 0).
    pub fn key_region(&self) -> &Segment {
        &self.segments[0]
    }

    /// The value segments (entries 1..=N).
    pub fn value_segments(&self) -> &[Segment] {
        &self.segments[1..]
    }

    /// Number of entries, including the key region.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the directory has no entries.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether the backend created the region rather than attaching to it.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Mutable access to all entries, for detaching.
    pub(crate) fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }
}

/// A source of shared memory regions.
///
/// Implementations only have to map raw memory. Sizing, carving and
/// detaching are shared.
pub trait SegmentBackend: Send + Sync {
    /// Short name of the backend, for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Map (or attach to) a zero-initialized region of `size` bytes.
    ///
    /// `size` is already a multiple of the page size.
    fn map(&self, size: usize) -> StorageResult<MappedRegion>;

    /// Map a key region of `key_size` bytes followed by `value_size` bytes of
    /// value segments and lay a directory over it.
    ///
    /// Both sizes are rounded up to the page size. On failure nothing stays
    /// mapped.
    fn create_segments(
        &self,
        key_size: usize,
        value_size: usize,
        min_segment_size: usize,
    ) -> StorageResult<SegmentDirectory> {
        let page = page_size();
        let key_size = round_up(key_size, page);
        let value_size = round_up(value_size, page);
        let plan = plan_segments(value_size, min_segment_size);

        let region = self.map(key_size + value_size)?;

        tracing::debug!(
            backend = self.name(),
            key_size,
            value_size,
            segments = plan.count,
            segment_size = plan.segment_size,
            created = region.created(),
            "mapped shared region"
        );

        Ok(SegmentDirectory::carve(region, key_size, value_size, plan))
    }

    /// Detach one directory entry from this process. Entries that do not own
    /// the mapping are left untouched.
    fn detach_segment(&self, segment: &mut Segment) {
        if let Some(region) = segment.mapping.take() {
            tracing::debug!(
                backend = self.name(),
                bytes = region.len(),
                "detaching shared region"
            );
            drop(region);
        }
        segment.size = 0;
    }

    /// Throw away a region this backend just created, after it turned out
    /// unusable and before anything was published in it. Backends whose
    /// regions die with their last mapping have nothing to do.
    fn discard(&self) {}

    /// Size of one directory entry, for callers that lay out directories of
    /// their own.
    fn segment_descriptor_size(&self) -> usize {
        std::mem::size_of::<Segment>()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    const MB: usize = 1024 * 1024;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_down(4097, 8), 4096);
        assert_eq!(round_down(7, 8), 0);
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }

    #[test]
    fn test_plan_default_sizes() {
        // 64MB with a 4MB floor gives 16 segments of 4MB
        let plan = plan_segments(64 * MB, 4 * MB);
        assert_eq!(plan.count, 16);
        assert_eq!(plan.segment_size, 4 * MB);
        assert_eq!(plan.last_segment_size, 4 * MB);
    }

    #[test]
    fn test_plan_caps_segment_count() {
        let plan = plan_segments(8192 * MB, MB);
        assert_eq!(plan.count, MAX_SEGMENTS);
        assert_eq!(plan.segment_size, 8 * MB);
    }

    #[test]
    fn test_plan_region_smaller_than_floor() {
        let plan = plan_segments(4096, 4 * MB);
        assert_eq!(plan.count, 1);
        assert_eq!(plan.segment_size, 4096);
        assert_eq!(plan.last_segment_size, 4096);
    }

    #[test]
    fn test_plan_last_segment_absorbs_remainder() {
        let value_size = 3 * MB + 100;
        let plan = plan_segments(value_size, MB);
        assert_eq!(plan.count, 2);
        assert_eq!(plan.segment_size % SEGMENT_ALIGN, 0);
        assert!(plan.last_segment_size >= plan.segment_size);
        assert_eq!(
            plan.segment_size * (plan.count - 1) + plan.last_segment_size,
            value_size
        );
    }

    #[test]
    fn test_create_segments_layout() {
        let backend = HeapBackend::new();
        let page = page_size();
        let directory = backend
            .create_segments(1, 4 * page, page)
            .expect("heap mapping failed");

        assert!(directory.created());
        assert_eq!(directory.len(), 5);
        assert_eq!(directory.key_region().size(), page);
        assert_eq!(directory.key_region().mapped_size(), 5 * page);

        let base = directory.key_region().as_ptr() as usize;
        for (i, segment) in directory.value_segments().iter().enumerate() {
            assert_eq!(segment.size(), page);
            assert_eq!(segment.mapped_size(), 0);
            assert_eq!(segment.as_ptr() as usize, base + page * (i + 1));
        }
    }

    #[test]
    fn test_detach_segment() {
        let backend = HeapBackend::new();
        let page = page_size();
        let mut directory = backend
            .create_segments(page, page, page)
            .expect("heap mapping failed");

        // Value segments own nothing, detaching them is a no-op
        let value = &mut directory.segments_mut()[1];
        backend.detach_segment(value);
        assert_eq!(value.mapped_size(), 0);

        let key = &mut directory.segments_mut()[0];
        assert_eq!(key.mapped_size(), 2 * page);
        backend.detach_segment(key);
        assert_eq!(key.size(), 0);

        // Detaching twice is harmless
        backend.detach_segment(key);
        assert_eq!(key.mapped_size(), 0);
    }

    #[test]
    fn test_segment_descriptor_size() {
        let heap = HeapBackend::new();
        let anon = AnonymousBackend::default();
        assert_eq!(
            heap.segment_descriptor_size(),
            anon.segment_descriptor_size()
        );
        assert!(heap.segment_descriptor_size() > 0);
    }
}
