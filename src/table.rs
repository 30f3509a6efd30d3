//! Direct-mapped key table.
//!
//! A fixed power-of-two array of [`Slot`]s indexed by `hash & mask`. There is
//! no chaining and no probing: a key either sits in its one bucket or is not
//! in the table, and a write for a different key evicts the occupant.

use crate::slot::{MAX_KEY_LEN, Publish, Slot, SlotMeta};
use std::ptr::NonNull;
use xxhash_rust::xxh3::xxh3_64;

/// Hash a key.
///
/// The hash is stable across processes and builds, so every process mapping
/// a region agrees on bucket and segment selection. Never returns 0, which
/// marks an empty slot.
#[inline]
pub fn hash_key(key: &[u8]) -> u64 {
    match xxh3_64(key) {
        0 => 1,
        hash => hash,
    }
}

/// Whether a key can be stored inline.
#[inline]
pub fn is_valid_key(key: &[u8]) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LEN
}

/// The slot array laid over the key region.
pub struct KeyTable {
    slots: NonNull<Slot>,
    mask: u64,
}

impl KeyTable {
    /// Lay a table over `len` slots starting at `slots`.
    ///
    /// # Safety
    ///
    /// `slots` must point at `len` initialized slots (zeroed memory is a valid
    /// array of empty slots) that outlive the table. `len` must be a power of
    /// two.
    pub(crate) unsafe fn from_raw(slots: NonNull<Slot>, len: usize) -> Self {
        debug_assert!(len.is_power_of_two());
        Self {
            slots,
            mask: (len - 1) as u64,
        }
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.mask as usize + 1
    }

    /// Always false, a table has at least one slot.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Mask applied to a hash to pick a bucket.
    #[inline]
    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Bucket index for a hash.
    #[inline]
    pub fn index(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    /// The slot at `index`.
    #[inline]
    pub fn slot(&self, index: usize) -> Option<&Slot> {
        if index < self.len() {
            // Safety: index is in bounds of the slot array
            Some(unsafe { &*self.slots.as_ptr().add(index) })
        } else {
            None
        }
    }

    /// The bucket a hash maps to.
    #[inline]
    pub fn bucket(&self, hash: u64) -> &Slot {
        // Safety: a masked hash is always in bounds
        unsafe { &*self.slots.as_ptr().add(self.index(hash)) }
    }

    /// Read the entry for `key`, if its bucket currently holds it.
    ///
    /// Returns the slot contents and the sequence they were read at. A bucket
    /// caught mid-publish reads as absent.
    pub fn lookup(&self, hash: u64, key: &[u8]) -> Option<(SlotMeta, u32)> {
        self.bucket(hash)
            .read()
            .filter(|(meta, _)| meta.holds(hash, key))
    }

    /// Clear the bucket for `key` if it holds that key.
    ///
    /// Returns whether a slot was cleared.
    pub fn remove(&self, hash: u64, key: &[u8]) -> bool {
        matches!(
            self.bucket(hash).publish(|current| {
                current.holds(hash, key).then_some(SlotMeta::EMPTY)
            }),
            Publish::Stored(_)
        )
    }

    /// Clear every occupied slot. Returns the number cleared.
    pub fn clear(&self) -> usize {
        self.iter()
            .filter(|slot| {
                matches!(
                    slot.publish(|current| (!current.is_empty()).then_some(SlotMeta::EMPTY)),
                    Publish::Stored(_)
                )
            })
            .count()
    }

    /// Number of slots that read as occupied.
    pub fn occupied(&self) -> usize {
        self.iter()
            .filter(|slot| slot.read().is_some_and(|(meta, _)| !meta.is_empty()))
            .count()
    }

    /// Iterate over every slot in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        (0..self.len()).filter_map(|i| self.slot(i))
    }
}

// Safety: slots are only accessed through atomics.
unsafe impl Send for KeyTable {}
unsafe impl Sync for KeyTable {}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::slot::pack_len;

    struct TestTable {
        _slots: Vec<Slot>,
        table: KeyTable,
    }

    fn table(len: usize) -> TestTable {
        let mut slots: Vec<Slot> = (0..len).map(|_| Slot::new()).collect();
        let ptr = NonNull::new(slots.as_mut_ptr()).unwrap();
        let table = unsafe { KeyTable::from_raw(ptr, len) };
        TestTable {
            _slots: slots,
            table,
        }
    }

    fn entry(hash: u64, key: &[u8]) -> SlotMeta {
        let mut meta = SlotMeta {
            hash,
            checksum: 1,
            len: pack_len(key.len(), 1),
            ..SlotMeta::EMPTY
        };
        meta.set_key(key);
        meta
    }

    /// Find a key, distinct from `key`, that lands in the same bucket.
    fn colliding_key(key: &[u8], mask: u64) -> Vec<u8> {
        let bucket = hash_key(key) & mask;
        (0u32..)
            .map(|i| format!("collide-{}", i).into_bytes())
            .find(|k| k != key && hash_key(k) & mask == bucket)
            .unwrap()
    }

    #[test]
    fn test_hash_is_stable_and_nonzero() {
        assert_eq!(hash_key(b"hello"), hash_key(b"hello"));
        assert_ne!(hash_key(b"hello"), hash_key(b"world"));
        assert_ne!(hash_key(b""), 0);
    }

    #[test]
    fn test_key_validation() {
        assert!(!is_valid_key(b""));
        assert!(is_valid_key(b"a"));
        assert!(is_valid_key(&[b'k'; MAX_KEY_LEN]));
        assert!(!is_valid_key(&[b'k'; MAX_KEY_LEN + 1]));
    }

    #[test]
    fn test_lookup_and_remove() {
        let t = table(16);
        let hash = hash_key(b"a");
        assert!(t.table.lookup(hash, b"a").is_none());

        t.table.bucket(hash).publish(|_| Some(entry(hash, b"a")));
        let (meta, _) = t.table.lookup(hash, b"a").expect("present");
        assert_eq!(meta.key(), b"a");

        // Removing a different key in the same bucket is a no-op
        let other = colliding_key(b"a", t.table.mask());
        assert!(!t.table.remove(hash_key(&other), &other));
        assert!(t.table.lookup(hash, b"a").is_some());

        assert!(t.table.remove(hash, b"a"));
        assert!(t.table.lookup(hash, b"a").is_none());
        assert!(!t.table.remove(hash, b"a"));
    }

    #[test]
    fn test_colliding_key_replaces_occupant() {
        let t = table(16);
        let a = hash_key(b"a");
        let other = colliding_key(b"a", t.table.mask());
        let b = hash_key(&other);
        assert_eq!(t.table.index(a), t.table.index(b));

        t.table.bucket(a).publish(|_| Some(entry(a, b"a")));
        t.table.bucket(b).publish(|_| Some(entry(b, &other)));

        assert!(t.table.lookup(a, b"a").is_none());
        assert!(t.table.lookup(b, &other).is_some());
    }

    #[test]
    fn test_clear_and_occupied() {
        let t = table(64);
        for i in 0..10u32 {
            let key = format!("key-{}", i).into_bytes();
            let hash = hash_key(&key);
            t.table.bucket(hash).publish(|_| Some(entry(hash, &key)));
        }
        let occupied = t.table.occupied();
        assert!(occupied > 0 && occupied <= 10);

        assert_eq!(t.table.clear(), occupied);
        assert_eq!(t.table.occupied(), 0);
        assert_eq!(t.table.clear(), 0);
    }

    #[test]
    fn test_slot_bounds() {
        let t = table(4);
        assert_eq!(t.table.len(), 4);
        assert_eq!(t.table.mask(), 3);
        assert!(t.table.slot(3).is_some());
        assert!(t.table.slot(4).is_none());
        assert_eq!(t.table.iter().count(), 4);
    }
}
