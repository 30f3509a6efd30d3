//! Value arena.
//!
//! Values live in fixed-size segments carved from the value region. Each
//! segment is a ring: a bump cursor hands out space from the tail and rewinds
//! to 0 when the tail is too short, overwriting whatever records were there.
//! Nothing is ever freed. A slot that still points at overwritten bytes is
//! caught by the integrity check on its next read.
//!
//! # Record Layout
//!
//! ```text
//! +-------+-----+-----+-----------+-------------+---------+
//! | atime | len | pad | key bytes | value bytes | padding |
//! |   8   |  4  |  4  |    k      |      v      | to 8    |
//! +-------+-----+-----+-----------+-------------+---------+
//! ```
//!
//! `len` is `k + v`. Records start on an 8-byte boundary.

use crate::backend::round_up;
use crate::sync::{AtomicU32, AtomicU64, Ordering, fence};
use std::ptr::NonNull;

/// Bytes in front of every record payload.
pub const RECORD_HEADER_SIZE: usize = 16;

const RECORD_ALIGN: usize = 8;

/// Bytes a record with a payload of `payload_len` occupies in a segment.
#[inline]
pub fn record_size(payload_len: usize) -> usize {
    round_up(RECORD_HEADER_SIZE + payload_len, RECORD_ALIGN)
}

/// Claim `size` bytes from a segment of `capacity` bytes.
///
/// Returns the offset of the claimed range and whether the cursor had to
/// rewind to 0 to find it, or `None` if `size` can never fit.
pub fn claim(cursor: &AtomicU32, capacity: u32, size: u32) -> Option<(u32, bool)> {
    if size > capacity {
        return None;
    }

    let mut current = cursor.load(Ordering::Relaxed);
    loop {
        let (offset, next, wrapped) = match current.checked_add(size) {
            Some(end) if end <= capacity => (current, end, false),
            _ => (0, size, true),
        };

        match cursor.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return Some((offset, wrapped)),
            Err(actual) => current = actual,
        }
    }
}

/// Where a record was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Value segment index.
    pub segment: u32,
    /// Offset within the segment.
    pub offset: u32,
    /// Bytes reserved.
    pub size: u32,
    /// The cursor rewound to place this record.
    pub wrapped: bool,
}

/// A record copied out of the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Last access time in seconds.
    pub atime: u64,
    /// Payload length the record header claims.
    pub len: u32,
    /// Leading payload bytes (key then value), as many as were asked for.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct ArenaSegment {
    base: NonNull<u8>,
    capacity: u32,
}

/// The value segments of one storage region.
pub struct ValueArena {
    segments: Vec<ArenaSegment>,
    cursors: NonNull<AtomicU32>,
}

impl ValueArena {
    /// Build an arena over `segments` (base pointer and capacity of each),
    /// using the cursor table at `cursors`.
    ///
    /// # Safety
    ///
    /// Every segment must be valid for reads and writes of its capacity and
    /// 8-byte aligned. `cursors` must point at one initialized cursor per
    /// segment. Both must outlive the arena. The number of segments must be
    /// a non-zero power of two.
    pub(crate) unsafe fn from_raw(
        segments: impl IntoIterator<Item = (NonNull<u8>, u32)>,
        cursors: NonNull<AtomicU32>,
    ) -> Self {
        let segments: Vec<_> = segments
            .into_iter()
            .map(|(base, capacity)| ArenaSegment { base, capacity })
            .collect();
        debug_assert!(segments.len().is_power_of_two());
        Self { segments, cursors }
    }

    /// Number of value segments.
    #[inline]
    pub fn segments(&self) -> usize {
        self.segments.len()
    }

    /// Current cursor of segment `index`.
    pub fn cursor(&self, index: usize) -> Option<u32> {
        self.cursor_ref(index).map(|c| c.load(Ordering::Relaxed))
    }

    /// Segment a key hash writes to. Uses the high half of the hash, the low
    /// half picks the bucket.
    #[inline]
    pub fn segment_for(&self, hash: u64) -> usize {
        (hash >> 32) as usize & (self.segments.len() - 1)
    }

    /// Reserve space for a record with `payload_len` payload bytes in the
    /// segment chosen by `hash`.
    ///
    /// Returns `None` if the record is larger than the whole segment.
    pub fn allocate(&self, hash: u64, payload_len: usize) -> Option<Allocation> {
        let index = self.segment_for(hash);
        let segment = self.segments[index];
        let size = u32::try_from(record_size(payload_len)).ok()?;
        let cursor = self.cursor_ref(index)?;

        let (offset, wrapped) = claim(cursor, segment.capacity, size)?;
        Some(Allocation {
            segment: index as u32,
            offset,
            size,
            wrapped,
        })
    }

    /// Write a record into space returned by [`allocate`](Self::allocate).
    ///
    /// The record bytes are fenced before returning, so a slot published
    /// afterwards never points at unwritten bytes.
    pub fn write(&self, allocation: &Allocation, key: &[u8], value: &[u8], now: u64) {
        let payload_len = key.len() + value.len();
        debug_assert!(record_size(payload_len) <= allocation.size as usize);

        let Some(ptr) = self.record_ptr(allocation.segment, allocation.offset, allocation.size)
        else {
            return;
        };

        unsafe {
            let header = ptr.as_ptr();
            (*(header as *const AtomicU64)).store(now, Ordering::Relaxed);
            (*(header.add(8) as *const AtomicU32)).store(payload_len as u32, Ordering::Relaxed);

            let payload = header.add(RECORD_HEADER_SIZE);
            std::ptr::copy_nonoverlapping(key.as_ptr(), payload, key.len());
            if !value.is_empty() {
                std::ptr::copy_nonoverlapping(value.as_ptr(), payload.add(key.len()), value.len());
            }
        }

        fence(Ordering::Release);
    }

    /// Copy `payload_len` payload bytes out of the record at `offset`.
    ///
    /// Returns `None` if the location does not describe a record inside its
    /// segment. The bytes may belong to a newer record; callers verify them.
    pub fn read(&self, segment: u32, offset: u32, size: u32, payload_len: usize) -> Option<Record> {
        self.read_prefix(segment, offset, size, payload_len, payload_len)
    }

    /// Like [`read`](Self::read), but only copies the first `prefix_len` of
    /// the `payload_len` payload bytes.
    pub fn read_prefix(
        &self,
        segment: u32,
        offset: u32,
        size: u32,
        payload_len: usize,
        prefix_len: usize,
    ) -> Option<Record> {
        if record_size(payload_len) > size as usize || prefix_len > payload_len {
            return None;
        }
        let ptr = self.record_ptr(segment, offset, size)?;

        fence(Ordering::Acquire);

        unsafe {
            let header = ptr.as_ptr();
            let atime = (*(header as *const AtomicU64)).load(Ordering::Relaxed);
            let len = (*(header.add(8) as *const AtomicU32)).load(Ordering::Relaxed);

            let mut payload = Vec::with_capacity(prefix_len);
            std::ptr::copy_nonoverlapping(
                header.add(RECORD_HEADER_SIZE),
                payload.as_mut_ptr(),
                prefix_len,
            );
            payload.set_len(prefix_len);

            Some(Record {
                atime,
                len,
                payload,
            })
        }
    }

    /// Record an access at `now`.
    pub fn touch(&self, segment: u32, offset: u32, size: u32, now: u64) {
        if let Some(ptr) = self.record_ptr(segment, offset, size) {
            unsafe { (*(ptr.as_ptr() as *const AtomicU64)).store(now, Ordering::Relaxed) };
        }
    }

    /// Pointer to a record, if the range lies inside its segment.
    fn record_ptr(&self, segment: u32, offset: u32, size: u32) -> Option<NonNull<u8>> {
        let segment = self.segments.get(segment as usize)?;
        let end = offset.checked_add(size)?;
        if end > segment.capacity
            || (size as usize) < RECORD_HEADER_SIZE
            || offset as usize % RECORD_ALIGN != 0
        {
            return None;
        }
        // Safety: offset + size is within the segment
        Some(unsafe { NonNull::new_unchecked(segment.base.as_ptr().add(offset as usize)) })
    }

    fn cursor_ref(&self, index: usize) -> Option<&AtomicU32> {
        (index < self.segments.len())
            // Safety: one cursor per segment
            .then(|| unsafe { &*self.cursors.as_ptr().add(index) })
    }
}

// Safety: segment memory is shared raw memory, cursors are atomics.
unsafe impl Send for ValueArena {}
unsafe impl Sync for ValueArena {}
