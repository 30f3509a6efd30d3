//! Read-time validation of entries.
//!
//! Writers never coordinate with readers beyond the slot sequence, and the
//! arena overwrites old records without telling their slots. Every read is
//! therefore checked against the slot that led to it: the record must still
//! hold the same key, the same length, and bytes matching the slot's
//! checksum. Anything else is reported as a miss.

use crate::arena::Record;
use crate::slot::SlotMeta;

/// Payloads shorter than this are checksummed in full by default.
pub const DEFAULT_FULL_CHECKSUM_THRESHOLD: usize = 256;

/// Why an entry was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The entry's TTL has passed.
    Expired,
    /// The record no longer matches its slot.
    Corrupted,
}

/// Checksums payloads and validates records against slots.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityGuard {
    threshold: usize,
}

impl Default for IntegrityGuard {
    fn default() -> Self {
        Self::new(DEFAULT_FULL_CHECKSUM_THRESHOLD)
    }
}

impl IntegrityGuard {
    /// Create a guard that fully covers payloads shorter than `threshold`.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    /// The full checksum threshold.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Checksum a record payload (key bytes followed by value bytes).
    ///
    /// Short payloads are covered in full. Longer ones only have their first
    /// `threshold` bytes covered. The payload length is mixed in either way.
    pub fn checksum(&self, payload: &[u8]) -> u32 {
        self.checksum_parts(payload, &[])
    }

    /// Checksum a payload given as key and value, without joining them.
    pub fn checksum_parts(&self, key: &[u8], value: &[u8]) -> u32 {
        let len = key.len() + value.len();
        let covered = self.covered(len);
        let from_key = covered.min(key.len());
        digest(&[&key[..from_key], &value[..covered - from_key]], len)
    }

    /// Leading payload bytes the checksum of a `payload_len` byte payload
    /// reads.
    #[inline]
    pub fn covered(&self, payload_len: usize) -> usize {
        payload_len.min(self.threshold)
    }

    /// Leading payload bytes [`verify`](Self::verify) needs to check an entry
    /// with this slot: the key plus the checksummed prefix.
    #[inline]
    pub fn verified_prefix(&self, meta: &SlotMeta) -> usize {
        let payload_len = meta.key_len() + meta.value_len();
        meta.key_len().max(self.covered(payload_len))
    }

    /// Check a slot's TTL.
    #[inline]
    pub fn check_ttl(&self, meta: &SlotMeta, now: u64) -> Result<(), Rejection> {
        if meta.is_expired(now) {
            Err(Rejection::Expired)
        } else {
            Ok(())
        }
    }

    /// Check a record copied out of the arena against the slot that points
    /// at it.
    ///
    /// The record may hold the whole payload or only its first
    /// [`verified_prefix`](Self::verified_prefix) bytes.
    pub fn verify(&self, meta: &SlotMeta, record: &Record) -> Result<(), Rejection> {
        let key_len = meta.key_len();
        let payload_len = key_len + meta.value_len();
        let covered = self.covered(payload_len);

        if record.len as usize != payload_len
            || record.payload.len() > payload_len
            || record.payload.len() < self.verified_prefix(meta)
            || record.payload[..key_len] != *meta.key()
            || digest(&[&record.payload[..covered]], payload_len) != meta.checksum
        {
            return Err(Rejection::Corrupted);
        }

        Ok(())
    }
}

/// CRC-32 over `parts` followed by the full payload length.
fn digest(parts: &[&[u8]], payload_len: usize) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.update(&(payload_len as u32).to_le_bytes());
    hasher.finalize()
}
