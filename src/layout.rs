//! Layout of the key region.
//!
//! ```text
//! +----------------+------------------------+---------------------------+
//! | header (128B)  | cursor table (4B x1024)| slot array (96B x slots)  |
//! +----------------+------------------------+---------------------------+
//! 0                128                      4224
//! ```
//!
//! The header records the geometry the region was created with, so a process
//! attaching to an existing named segment can refuse a region laid out
//! differently from what it expects. The cursor table always has room for
//! the largest segment count; only the first `segments_num` entries are used.

use crate::backend::{MAX_SEGMENTS, SegmentPlan, page_size, plan_segments, round_up};
use crate::error::{StorageError, StorageResult};
use crate::slot::Slot;
use crate::stats::Counters;
use crate::sync::{AtomicU32, AtomicU64, Ordering};
use std::ptr::NonNull;

/// Marks an initialized region ("SHMCACHE").
pub const MAGIC: u64 = u64::from_le_bytes(*b"SHMCACHE");

/// Bumped whenever the shared layout changes.
pub const FORMAT_VERSION: u32 = 1;

/// Bytes reserved for the header.
pub const HEADER_SIZE: usize = 128;

/// Offset of the cursor table.
pub const CURSORS_OFFSET: usize = HEADER_SIZE;

/// Offset of the slot array.
pub const SLOTS_OFFSET: usize = CURSORS_OFFSET + MAX_SEGMENTS * 4;

/// Size of one slot in the shared layout.
pub const SLOT_SIZE: usize = 96;

#[cfg(not(feature = "loom"))]
const _: () = {
    assert!(std::mem::size_of::<Header>() <= HEADER_SIZE);
    assert!(std::mem::size_of::<Slot>() == SLOT_SIZE);
    assert!(SLOTS_OFFSET % 64 == 0);
};

/// Sizes fixed when a region is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Number of key slots (a power of two).
    pub slots_num: usize,
    /// Key region size, page aligned.
    pub key_region_size: usize,
    /// Value region size, page aligned.
    pub value_region_size: usize,
    /// How the value region is split.
    pub plan: SegmentPlan,
}

impl Geometry {
    /// Work out the geometry of a region of `total_size` bytes.
    ///
    /// With `hashtable_power` set the table has exactly `2^power` slots and
    /// the key region is sized to fit them. Otherwise the table gets the
    /// largest power of two number of slots that fits `key_region_size`.
    /// The value region is whatever `total_size` leaves after the key region.
    pub fn new(
        key_region_size: usize,
        total_size: usize,
        hashtable_power: Option<u8>,
        min_segment_size: usize,
    ) -> StorageResult<Self> {
        let (slots_num, key_region_size) = key_layout(key_region_size, hashtable_power)?;
        Self::split(
            slots_num,
            key_region_size,
            total_size.saturating_sub(key_region_size),
            min_segment_size,
        )
    }

    /// Like [`new`](Self::new), but with the value region sized directly.
    pub fn with_value_region(
        key_region_size: usize,
        value_region_size: usize,
        hashtable_power: Option<u8>,
        min_segment_size: usize,
    ) -> StorageResult<Self> {
        let (slots_num, key_region_size) = key_layout(key_region_size, hashtable_power)?;
        Self::split(slots_num, key_region_size, value_region_size, min_segment_size)
    }

    fn split(
        slots_num: usize,
        key_region_size: usize,
        value_region_size: usize,
        min_segment_size: usize,
    ) -> StorageResult<Self> {
        let value_region_size = round_up(value_region_size, page_size());
        if value_region_size == 0 {
            return Err(StorageError::allocation(format!(
                "no room for values after a {} byte key region",
                key_region_size
            )));
        }

        let plan = plan_segments(value_region_size, min_segment_size);
        if plan.last_segment_size > u32::MAX as usize {
            return Err(StorageError::allocation(format!(
                "value segments of {} bytes exceed the 4GB segment limit",
                plan.last_segment_size
            )));
        }

        Ok(Self {
            slots_num,
            key_region_size,
            value_region_size,
            plan,
        })
    }

    /// Total bytes mapped for the region.
    pub fn total_size(&self) -> usize {
        self.key_region_size + self.value_region_size
    }
}

/// Slot count and page-aligned size of a key region.
fn key_layout(key_region_size: usize, hashtable_power: Option<u8>) -> StorageResult<(usize, usize)> {
    let page = page_size();

    match hashtable_power {
        Some(power) => {
            let slots_num = 1usize
                .checked_shl(power as u32)
                .filter(|&n| n <= u32::MAX as usize)
                .ok_or_else(|| {
                    StorageError::allocation(format!("hashtable power {} too large", power))
                })?;
            Ok((slots_num, round_up(SLOTS_OFFSET + slots_num * SLOT_SIZE, page)))
        }
        None => {
            let key_region_size = round_up(key_region_size, page);
            let fits = key_region_size.saturating_sub(SLOTS_OFFSET) / SLOT_SIZE;
            if fits == 0 {
                return Err(StorageError::allocation(format!(
                    "key region of {} bytes cannot hold a slot",
                    key_region_size
                )));
            }
            let slots_num = (1usize << fits.ilog2()).min(1 << 31);
            Ok((slots_num, key_region_size))
        }
    }
}

/// Header at the start of the key region.
#[repr(C)]
pub struct Header {
    magic: AtomicU64,
    format: AtomicU32,
    slots_num: AtomicU32,
    segments_num: AtomicU32,
    segment_size: AtomicU32,
    checksum_threshold: AtomicU32,
    _reserved: AtomicU32,
    key_region_size: AtomicU64,
    value_region_size: AtomicU64,
    counters: Counters,
}

impl Header {
    /// View the header at the start of a key region.
    ///
    /// # Safety
    ///
    /// `base` must point at a mapped key region of at least [`SLOTS_OFFSET`]
    /// bytes, 8-byte aligned, that outlives the returned reference.
    pub(crate) unsafe fn at<'a>(base: NonNull<u8>) -> &'a Header {
        unsafe { &*(base.as_ptr() as *const Header) }
    }

    /// Record the geometry of a freshly created region and mark it
    /// initialized. The rest of the region is expected to be zeroed.
    pub(crate) fn initialize(&self, geometry: &Geometry, checksum_threshold: u32) {
        self.format.store(FORMAT_VERSION, Ordering::Relaxed);
        self.slots_num
            .store(geometry.slots_num as u32, Ordering::Relaxed);
        self.segments_num
            .store(geometry.plan.count as u32, Ordering::Relaxed);
        self.segment_size
            .store(geometry.plan.segment_size as u32, Ordering::Relaxed);
        self.checksum_threshold
            .store(checksum_threshold, Ordering::Relaxed);
        self.key_region_size
            .store(geometry.key_region_size as u64, Ordering::Relaxed);
        self.value_region_size
            .store(geometry.value_region_size as u64, Ordering::Relaxed);

        self.magic.store(MAGIC, Ordering::Release);
    }

    /// Check that an existing region was created with the same geometry.
    pub(crate) fn validate(&self, geometry: &Geometry, checksum_threshold: u32) -> StorageResult<()> {
        if self.magic.load(Ordering::Acquire) != MAGIC {
            return Err(StorageError::allocation(
                "shared region is not initialized",
            ));
        }

        let format = self.format.load(Ordering::Relaxed);
        if format != FORMAT_VERSION {
            return Err(StorageError::allocation(format!(
                "shared region has format {}, expected {}",
                format, FORMAT_VERSION
            )));
        }

        let found = (
            self.slots_num.load(Ordering::Relaxed) as usize,
            self.segments_num.load(Ordering::Relaxed) as usize,
            self.segment_size.load(Ordering::Relaxed) as usize,
            self.key_region_size.load(Ordering::Relaxed) as usize,
            self.value_region_size.load(Ordering::Relaxed) as usize,
            self.checksum_threshold.load(Ordering::Relaxed),
        );
        let expected = (
            geometry.slots_num,
            geometry.plan.count,
            geometry.plan.segment_size,
            geometry.key_region_size,
            geometry.value_region_size,
            checksum_threshold,
        );

        if found != expected {
            return Err(StorageError::allocation(format!(
                "shared region geometry mismatch: found (slots, segments, segment size, key size, value size, threshold) = {:?}, expected {:?}",
                found, expected
            )));
        }

        Ok(())
    }

    /// Shared counters.
    #[inline]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }
}

/// Cursor table of a key region.
///
/// # Safety
///
/// Same requirements as [`Header::at`].
pub(crate) unsafe fn cursors(base: NonNull<u8>) -> NonNull<AtomicU32> {
    unsafe { NonNull::new_unchecked(base.as_ptr().add(CURSORS_OFFSET) as *mut AtomicU32) }
}

/// Slot array of a key region.
///
/// # Safety
///
/// `base` must point at a key region sized by [`Geometry`].
pub(crate) unsafe fn slots(base: NonNull<u8>) -> NonNull<Slot> {
    unsafe { NonNull::new_unchecked(base.as_ptr().add(SLOTS_OFFSET) as *mut Slot) }
}
