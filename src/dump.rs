//! Walking the key table.
//!
//! [`Dump`] yields one [`SlotInfo`] per occupied slot in index order. It reads
//! slots one at a time without stopping writers, so the walk is not a
//! snapshot of the whole table, but every descriptor is a consistent copy of
//! one slot. Slots caught mid-publish are skipped.

use crate::slot::SlotMeta;
use crate::table::KeyTable;

/// Metadata of one occupied slot. Values are not copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// Slot index.
    pub index: usize,
    /// Key hash.
    pub hash: u64,
    /// Value record checksum.
    pub checksum: u32,
    /// Absolute expiry in seconds, 0 for none.
    pub ttl: u64,
    /// Key length in bytes.
    pub key_len: usize,
    /// Value length in bytes.
    pub value_len: usize,
    /// Caller flag.
    pub flag: u32,
    /// Bytes reserved for the value record.
    pub size: u32,
    /// Key bytes.
    pub key: Vec<u8>,
}

impl SlotInfo {
    fn new(index: usize, meta: &SlotMeta) -> Self {
        Self {
            index,
            hash: meta.hash,
            checksum: meta.checksum,
            ttl: meta.ttl,
            key_len: meta.key_len(),
            value_len: meta.value_len(),
            flag: meta.flag,
            size: meta.size,
            key: meta.key().to_vec(),
        }
    }

    /// Whether the entry has expired at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.ttl != 0 && self.ttl <= now
    }
}

/// Iterator over occupied slots, see [`Storage::dump`](crate::Storage::dump).
pub struct Dump<'a> {
    table: &'a KeyTable,
    next: usize,
    remaining: Option<usize>,
}

impl<'a> Dump<'a> {
    /// Walk `table`, stopping after `limit` occupied slots (0 for no limit).
    pub(crate) fn new(table: &'a KeyTable, limit: usize) -> Self {
        Self {
            table,
            next: 0,
            remaining: (limit > 0).then_some(limit),
        }
    }
}

impl Iterator for Dump<'_> {
    type Item = SlotInfo;

    fn next(&mut self) -> Option<SlotInfo> {
        if self.remaining == Some(0) {
            return None;
        }

        while let Some(slot) = self.table.slot(self.next) {
            let index = self.next;
            self.next += 1;

            if let Some((meta, _)) = slot.read()
                && !meta.is_empty()
            {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Some(SlotInfo::new(index, &meta));
            }
        }

        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.table.len().saturating_sub(self.next);
        (0, Some(self.remaining.map_or(left, |r| r.min(left))))
    }
}
