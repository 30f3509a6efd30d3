//! Anonymous shared mappings.
//!
//! The region is mapped `MAP_SHARED | MAP_ANONYMOUS`, so processes forked
//! after startup see the same physical pages. With a hugepage preference the
//! mapping is first attempted with `MAP_HUGETLB` and falls back to regular
//! pages with a THP hint.

use super::{MappedRegion, Release, SegmentBackend, round_up};
use crate::config::HugepageSize;
use crate::error::{StorageError, StorageResult};
use std::ptr::NonNull;

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const GB: usize = 1024 * MB;

/// Backend that maps anonymous shared memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousBackend {
    hugepage_size: HugepageSize,
}

impl AnonymousBackend {
    /// Create a backend with the given hugepage preference.
    pub fn new(hugepage_size: HugepageSize) -> Self {
        Self { hugepage_size }
    }
}

impl SegmentBackend for AnonymousBackend {
    fn name(&self) -> &'static str {
        "mmap"
    }

    fn map(&self, size: usize) -> StorageResult<MappedRegion> {
        if size == 0 {
            return Err(StorageError::allocation("cannot map zero bytes"));
        }

        let (ptr, len) = match self.hugepage_size {
            HugepageSize::OneGigabyte => map_prefer_hugepage(size, GB),
            HugepageSize::TwoMegabyte => map_prefer_hugepage(size, 2 * MB),
            HugepageSize::None => map_shared(size, 0),
        }
        .map_err(|e| StorageError::os("mmap", e))?;

        Ok(MappedRegion::new(ptr, len, true, Release::Munmap))
    }
}

/// Try explicit hugepages, falling back to regular pages.
///
/// The fallback is rounded to 2MB so THP can still back it.
fn map_prefer_hugepage(
    size: usize,
    page_size: usize,
) -> Result<(NonNull<u8>, usize), std::io::Error> {
    let rounded = round_up(size, page_size);

    // Only worth it if rounding wastes at most half the mapping
    if size >= page_size && (rounded - size) * 2 <= rounded {
        match map_shared(rounded, hugetlb_flags(page_size)) {
            Ok(mapping) => {
                tracing::info!(bytes = rounded, page_size, "mapped with explicit hugepages");
                return Ok(mapping);
            }
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    page_size,
                    "hugepage mapping failed, falling back to regular pages"
                );
            }
        }
    }

    let (ptr, len) = map_shared(round_up(size, 2 * MB), 0)?;
    advise_hugepage(ptr, len);
    Ok((ptr, len))
}

#[cfg(target_os = "linux")]
fn hugetlb_flags(page_size: usize) -> libc::c_int {
    const MAP_HUGE_SHIFT: libc::c_int = 26;

    let log2 = if page_size == GB { 30 } else { 21 };
    libc::MAP_HUGETLB | (log2 << MAP_HUGE_SHIFT)
}

#[cfg(not(target_os = "linux"))]
fn hugetlb_flags(_page_size: usize) -> libc::c_int {
    0
}

/// Hint the kernel to back the mapping with transparent hugepages.
#[cfg(target_os = "linux")]
fn advise_hugepage(ptr: NonNull<u8>, len: usize) {
    unsafe {
        let _ = libc::madvise(ptr.as_ptr() as *mut libc::c_void, len, libc::MADV_HUGEPAGE);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_hugepage(_ptr: NonNull<u8>, _len: usize) {}

/// `mmap` an anonymous shared range of `len` bytes with extra `flags`.
fn map_shared(len: usize, flags: libc::c_int) -> Result<(NonNull<u8>, usize), std::io::Error> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS | flags,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }

    // Safety: mmap never returns null on success
    Ok((unsafe { NonNull::new_unchecked(ptr as *mut u8) }, len))
}
