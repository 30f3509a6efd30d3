//! Key table slots.
//!
//! A slot holds the metadata of at most one key. Slots live in the shared
//! key region, so every field is an atomic word and the whole slot is
//! published as a unit through a sequence counter:
//!
//! - Writers: `sequence` even -> odd (CAS, Acquire) -> `fence(Release)` ->
//!   store fields -> `sequence` odd -> next even (Release)
//! - Readers: load `sequence` (Acquire) -> load fields -> `fence(Acquire)` ->
//!   reload `sequence`; the copy is valid only if both loads saw the same
//!   even value
//!
//! Readers never wait. A reader that races a writer gets no copy and the
//! caller treats it as a miss. A writer that finds the slot claimed by
//! another writer retries briefly, then drops its write.
//!
//! # Layout
//!
//! ```text
//! +----------+-----+------+----------+------+-----+------+---------+--------+-----+----------+
//! | sequence | len | hash | checksum | flag | ttl | size | segment | offset | pad | key[48]  |
//! |    4     |  4  |  8   |    4     |  4   |  8  |  4   |    4    |   4    |  4  |   48     |
//! +----------+-----+------+----------+------+-----+------+---------+--------+-----+----------+
//! ```
//!
//! `len` packs the key length into the low 8 bits and the value length into
//! the upper 24 bits.

use crate::sync::{AtomicU32, AtomicU64, Ordering, fence, spin_loop};

/// Longest key stored inline in a slot.
pub const MAX_KEY_LEN: usize = 48;

/// Longest value whose length fits the packed length word.
pub const MAX_VALUE_LEN: usize = (1 << 24) - 1;

const KEY_LEN_MASK: u32 = 0xFF;
const VALUE_LEN_SHIFT: u32 = 8;
const KEY_WORDS: usize = MAX_KEY_LEN / 8;

/// Attempts a writer makes to claim a slot another writer holds.
const CLAIM_ATTEMPTS: usize = 64;

/// Pack key and value lengths into one word.
#[inline]
pub fn pack_len(key_len: usize, value_len: usize) -> u32 {
    debug_assert!(key_len <= MAX_KEY_LEN);
    debug_assert!(value_len <= MAX_VALUE_LEN);
    ((value_len as u32) << VALUE_LEN_SHIFT) | (key_len as u32 & KEY_LEN_MASK)
}

/// A point-in-time copy of a slot's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMeta {
    /// Key hash, 0 when the slot is empty.
    pub hash: u64,
    /// Checksum of the value record payload.
    pub checksum: u32,
    /// Absolute expiry in seconds, 0 for none.
    pub ttl: u64,
    /// Packed key and value lengths.
    pub len: u32,
    /// Opaque caller flag.
    pub flag: u32,
    /// Bytes reserved for the value record.
    pub size: u32,
    /// Value segment holding the record.
    pub segment: u32,
    /// Offset of the record within its segment.
    pub offset: u32,
    /// Inline key bytes, `key_len()` of them meaningful.
    pub key: [u8; MAX_KEY_LEN],
}

impl SlotMeta {
    /// The contents of an empty slot.
    pub const EMPTY: SlotMeta = SlotMeta {
        hash: 0,
        checksum: 0,
        ttl: 0,
        len: 0,
        flag: 0,
        size: 0,
        segment: 0,
        offset: 0,
        key: [0; MAX_KEY_LEN],
    };

    /// Whether the slot holds no key.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hash == 0
    }

    /// Length of the stored key.
    #[inline]
    pub fn key_len(&self) -> usize {
        (self.len & KEY_LEN_MASK) as usize
    }

    /// Length of the stored value.
    #[inline]
    pub fn value_len(&self) -> usize {
        (self.len >> VALUE_LEN_SHIFT) as usize
    }

    /// The stored key.
    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.key[..self.key_len().min(MAX_KEY_LEN)]
    }

    /// Whether the slot holds exactly this key.
    #[inline]
    pub fn holds(&self, hash: u64, key: &[u8]) -> bool {
        !self.is_empty() && self.hash == hash && self.key() == key
    }

    /// Whether the entry has expired at `now`.
    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        self.ttl != 0 && self.ttl <= now
    }

    /// Copy `key` into the inline key buffer.
    pub fn set_key(&mut self, key: &[u8]) {
        self.key = [0; MAX_KEY_LEN];
        self.key[..key.len()].copy_from_slice(key);
    }
}

impl Default for SlotMeta {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Outcome of [`Slot::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// New contents were stored. Carries what the slot held before.
    Stored(SlotMeta),
    /// The update closure declined to change the slot.
    Declined,
    /// Another writer held the slot for every claim attempt.
    Contended,
}

/// One slot of the key table.
#[repr(C)]
pub struct Slot {
    sequence: AtomicU32,
    len: AtomicU32,
    hash: AtomicU64,
    checksum: AtomicU32,
    flag: AtomicU32,
    ttl: AtomicU64,
    size: AtomicU32,
    segment: AtomicU32,
    offset: AtomicU32,
    _pad: AtomicU32,
    key: [AtomicU64; KEY_WORDS],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(std::mem::size_of::<Slot>() == 96);

impl Slot {
    /// Create an empty slot outside of a shared region.
    pub fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
            len: AtomicU32::new(0),
            hash: AtomicU64::new(0),
            checksum: AtomicU32::new(0),
            flag: AtomicU32::new(0),
            ttl: AtomicU64::new(0),
            size: AtomicU32::new(0),
            segment: AtomicU32::new(0),
            offset: AtomicU32::new(0),
            _pad: AtomicU32::new(0),
            key: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Take a consistent copy of the slot.
    ///
    /// Returns the copy and the sequence it was taken at, or `None` if a
    /// writer was publishing concurrently.
    pub fn read(&self) -> Option<(SlotMeta, u32)> {
        let before = self.sequence.load(Ordering::Acquire);
        if before & 1 == 1 {
            return None;
        }

        let meta = self.load_fields();

        fence(Ordering::Acquire);
        let after = self.sequence.load(Ordering::Relaxed);

        (before == after).then_some((meta, before))
    }

    /// Current sequence value. Odd while a write is in progress.
    #[inline]
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Replace the slot's contents.
    ///
    /// `update` sees the current contents while the slot is claimed and
    /// returns the new contents, or `None` to leave the slot untouched.
    pub fn publish<F>(&self, update: F) -> Publish
    where
        F: FnOnce(&SlotMeta) -> Option<SlotMeta>,
    {
        let Some(claimed) = self.claim() else {
            return Publish::Contended;
        };

        let current = self.load_fields();

        match update(&current) {
            Some(next) => {
                self.store_fields(&next);
                self.sequence
                    .store(claimed.wrapping_add(2), Ordering::Release);
                Publish::Stored(current)
            }
            None => {
                // Nothing changed, readers that straddled the claim are
                // still consistent
                self.sequence.store(claimed, Ordering::Release);
                Publish::Declined
            }
        }
    }

    /// Move the sequence from even to odd. Returns the even value claimed.
    fn claim(&self) -> Option<u32> {
        for _ in 0..CLAIM_ATTEMPTS {
            let current = self.sequence.load(Ordering::Relaxed);
            if current & 1 == 0
                && self
                    .sequence
                    .compare_exchange_weak(
                        current,
                        current.wrapping_add(1),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                // Keep the field stores below from becoming visible before
                // the odd sequence
                fence(Ordering::Release);
                return Some(current);
            }
            spin_loop();
        }
        None
    }

    fn load_fields(&self) -> SlotMeta {
        let mut key = [0u8; MAX_KEY_LEN];
        for (chunk, word) in key.chunks_exact_mut(8).zip(self.key.iter()) {
            chunk.copy_from_slice(&word.load(Ordering::Relaxed).to_ne_bytes());
        }

        SlotMeta {
            hash: self.hash.load(Ordering::Relaxed),
            checksum: self.checksum.load(Ordering::Relaxed),
            ttl: self.ttl.load(Ordering::Relaxed),
            len: self.len.load(Ordering::Relaxed),
            flag: self.flag.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
            segment: self.segment.load(Ordering::Relaxed),
            offset: self.offset.load(Ordering::Relaxed),
            key,
        }
    }

    fn store_fields(&self, meta: &SlotMeta) {
        self.hash.store(meta.hash, Ordering::Relaxed);
        self.checksum.store(meta.checksum, Ordering::Relaxed);
        self.ttl.store(meta.ttl, Ordering::Relaxed);
        self.len.store(meta.len, Ordering::Relaxed);
        self.flag.store(meta.flag, Ordering::Relaxed);
        self.size.store(meta.size, Ordering::Relaxed);
        self.segment.store(meta.segment, Ordering::Relaxed);
        self.offset.store(meta.offset, Ordering::Relaxed);

        for (chunk, word) in meta.key.chunks_exact(8).zip(self.key.iter()) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            word.store(u64::from_ne_bytes(bytes), Ordering::Relaxed);
        }
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn meta(hash: u64, key: &[u8], value_len: usize) -> SlotMeta {
        let mut meta = SlotMeta {
            hash,
            checksum: 0xDEAD_BEEF,
            ttl: 0,
            len: pack_len(key.len(), value_len),
            flag: 7,
            size: 64,
            segment: 1,
            offset: 128,
            ..SlotMeta::EMPTY
        };
        meta.set_key(key);
        meta
    }

    #[test]
    fn test_new_slot_is_empty() {
        let slot = Slot::new();
        let (meta, sequence) = slot.read().expect("uncontended read");
        assert!(meta.is_empty());
        assert_eq!(meta, SlotMeta::EMPTY);
        assert_eq!(sequence, 0);
    }

    #[test]
    fn test_pack_len() {
        let packed = pack_len(48, MAX_VALUE_LEN);
        let meta = SlotMeta {
            len: packed,
            ..SlotMeta::EMPTY
        };
        assert_eq!(meta.key_len(), 48);
        assert_eq!(meta.value_len(), MAX_VALUE_LEN);

        let meta = SlotMeta {
            len: pack_len(3, 1000),
            ..SlotMeta::EMPTY
        };
        assert_eq!(meta.key_len(), 3);
        assert_eq!(meta.value_len(), 1000);
    }

    #[test]
    fn test_publish_and_read() {
        let slot = Slot::new();
        let stored = meta(42, b"hello", 5);

        let result = slot.publish(|current| {
            assert!(current.is_empty());
            Some(stored)
        });
        assert_eq!(result, Publish::Stored(SlotMeta::EMPTY));

        let (read, sequence) = slot.read().expect("uncontended read");
        assert_eq!(read, stored);
        assert_eq!(read.key(), b"hello");
        assert_eq!(sequence, 2);
        assert!(read.holds(42, b"hello"));
        assert!(!read.holds(42, b"hellx"));
        assert!(!read.holds(43, b"hello"));
    }

    #[test]
    fn test_publish_returns_previous() {
        let slot = Slot::new();
        let first = meta(1, b"a", 1);
        let second = meta(2, b"b", 2);

        slot.publish(|_| Some(first));
        assert_eq!(slot.publish(|_| Some(second)), Publish::Stored(first));
        assert_eq!(slot.read().map(|(m, _)| m), Some(second));
    }

    #[test]
    fn test_declined_publish_keeps_sequence() {
        let slot = Slot::new();
        slot.publish(|_| Some(meta(1, b"a", 1)));
        let before = slot.sequence();

        assert_eq!(slot.publish(|_| None), Publish::Declined);
        assert_eq!(slot.sequence(), before);
    }

    #[test]
    fn test_read_during_write_fails() {
        let slot = Slot::new();
        let claimed = slot.claim().expect("claim");
        assert_eq!(claimed, 0);
        assert_eq!(slot.sequence() & 1, 1);
        assert!(slot.read().is_none());

        // A second writer gives up
        assert_eq!(slot.publish(|_| Some(SlotMeta::EMPTY)), Publish::Contended);

        slot.sequence.store(claimed + 2, Ordering::Release);
        assert!(slot.read().is_some());
    }

    #[test]
    fn test_expiry() {
        let mut m = meta(1, b"k", 1);
        assert!(!m.is_expired(u64::MAX));
        m.ttl = 100;
        assert!(!m.is_expired(99));
        assert!(m.is_expired(100));
        assert!(m.is_expired(101));
    }

    #[test]
    fn test_full_length_key() {
        let slot = Slot::new();
        let key = [0x5Au8; MAX_KEY_LEN];
        slot.publish(|_| Some(meta(9, &key, 0)));
        let (read, _) = slot.read().expect("read");
        assert_eq!(read.key(), &key[..]);
    }

    #[test]
    fn test_concurrent_writers_never_tear() {
        use std::sync::Arc;
        use std::thread;

        let slot = Arc::new(Slot::new());
        let a = meta(0xAAAA, b"aaaaaaaa", 100);
        let b = meta(0xBBBB, b"bbbbbbbbbbbbbbbbbbbb", 200);

        let writers: Vec<_> = [a, b]
            .into_iter()
            .map(|m| {
                let slot = slot.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        slot.publish(|_| Some(m));
                    }
                })
            })
            .collect();

        let reader = {
            let slot = slot.clone();
            thread::spawn(move || {
                for _ in 0..50_000 {
                    if let Some((m, _)) = slot.read() {
                        assert!(m == a || m == b || m.is_empty(), "torn read: {:?}", m);
                    }
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
    }
}

#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    /// A slot is a few dozen atomic operations, so bound preemptions to keep
    /// the state space tractable.
    fn model<F>(f: F)
    where
        F: Fn() + Sync + Send + 'static,
    {
        let mut builder = loom::model::Builder::new();
        builder.preemption_bound = Some(2);
        builder.check(f);
    }

    fn meta(hash: u64, flag: u32) -> SlotMeta {
        SlotMeta {
            hash,
            checksum: hash as u32,
            flag,
            len: pack_len(1, 1),
            ..SlotMeta::EMPTY
        }
    }

    #[test]
    fn loom_reader_sees_whole_slot_or_nothing() {
        model(|| {
            let slot = Arc::new(Slot::new());
            let published = meta(0x1234, 9);

            let writer = {
                let slot = slot.clone();
                thread::spawn(move || {
                    slot.publish(|_| Some(published));
                })
            };

            if let Some((m, _)) = slot.read() {
                assert!(m == published || m == SlotMeta::EMPTY);
            }

            writer.join().unwrap();
            assert_eq!(slot.read().map(|(m, _)| m), Some(published));
        });
    }

    #[test]
    fn loom_two_writers_leave_one_winner() {
        model(|| {
            let slot = Arc::new(Slot::new());
            let a = meta(1, 1);
            let b = meta(2, 2);

            let t1 = {
                let slot = slot.clone();
                thread::spawn(move || slot.publish(|_| Some(a)))
            };
            let t2 = {
                let slot = slot.clone();
                thread::spawn(move || slot.publish(|_| Some(b)))
            };

            t1.join().unwrap();
            t2.join().unwrap();

            let (m, sequence) = slot.read().expect("writers finished");
            assert!(m == a || m == b);
            assert_eq!(sequence & 1, 0);
        });
    }
}
