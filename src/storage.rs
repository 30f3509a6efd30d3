//! The storage handle.
//!
//! [`Storage`] owns one mapped region and runs every operation against it.
//! Nothing here takes a lock: lookups read a slot through its sequence word
//! and verify the record it points at, writers place a fresh record in the
//! arena and then publish the slot.
//!
//! Handles are independent. Two handles created from the same named segment
//! share data and counters, two anonymous or heap handles never do.

use crate::arena::ValueArena;
use crate::backend::{AnonymousBackend, HeapBackend, NamedBackend, SegmentBackend, SegmentDirectory};
use crate::config::{BackendKind, Config};
use crate::dump::Dump;
use crate::error::{StorageError, StorageResult};
use crate::integrity::{DEFAULT_FULL_CHECKSUM_THRESHOLD, IntegrityGuard, Rejection};
use crate::layout::{self, Geometry, Header, SLOT_SIZE};
use crate::slot::{MAX_VALUE_LEN, Publish, SlotMeta, pack_len};
use crate::stats::{Counters, StatsSnapshot, StorageInfo};
use crate::table::{KeyTable, hash_key, is_valid_key};
use std::ptr::NonNull;
use std::time::{SystemTime, UNIX_EPOCH};

/// An entry returned by [`Storage::find`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Value bytes.
    pub value: Vec<u8>,
    /// Flag stored with the value.
    pub flag: u32,
    /// Version stamp of the slot when it was read. Any later write to the
    /// key changes it.
    pub cas: u32,
}

impl Item {
    /// Value length in bytes.
    pub fn size(&self) -> usize {
        self.value.len()
    }
}

/// Current time in seconds since the Unix epoch.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// A key-value store over one shared memory region.
pub struct Storage {
    table: KeyTable,
    arena: ValueArena,
    guard: IntegrityGuard,
    header: NonNull<Header>,
    geometry: Geometry,
    max_value_size: usize,
    backend: Box<dyn SegmentBackend>,
    directory: SegmentDirectory,
}

// Safety: the raw pointers all point into `directory`, which lives as long
// as the handle, and shared state is only touched through atomics.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    /// Create a storage region on an anonymous shared mapping.
    ///
    /// `first_region_size` bytes go to the key region, the rest of
    /// `total_size` to values. Every call maps a new, independent region.
    pub fn startup(first_region_size: usize, total_size: usize) -> StorageResult<Self> {
        Self::builder()
            .key_region_size(first_region_size)
            .total_size(total_size)
            .build()
    }

    /// Create a builder with default settings.
    pub fn builder() -> StorageBuilder {
        StorageBuilder::new()
    }

    /// Create or attach to the region described by a configuration.
    pub fn from_config(config: &Config) -> StorageResult<Self> {
        config.validate()?;

        let mut builder = Self::builder()
            .key_region_size(config.key_region_size)
            .total_size(config.total_size)
            .min_segment_size(config.min_segment_size)
            .max_value_size(config.max_value_size)
            .full_checksum_threshold(config.full_checksum_threshold);

        if let Some(power) = config.hashtable_power {
            builder = builder.hashtable_power(power);
        }

        let builder = match config.backend {
            BackendKind::Anonymous => builder.backend(AnonymousBackend::new(config.hugepage)),
            BackendKind::Named => builder.backend(NamedBackend::new(config.segment_path())),
            BackendKind::Heap => builder.backend(HeapBackend::new()),
        };

        builder.build()
    }

    /// Look up a key.
    ///
    /// Returns `None` for absent, expired, and corrupted entries alike, and
    /// for invalid keys (without counting those as misses).
    pub fn find(&self, key: &[u8], now: u64) -> Option<Item> {
        let (meta, cas, value) = self.fetch(key, now, |meta| self.read_value(meta))?;
        Some(Item {
            value,
            flag: meta.flag,
            cas,
        })
    }

    /// Whether a key is present, unexpired, and intact.
    ///
    /// Runs the same checks as [`find`](Self::find) and counts the same way,
    /// but only reads the key and the checksummed prefix of the record.
    pub fn exists(&self, key: &[u8], now: u64) -> bool {
        self.fetch(key, now, |meta| self.check_value(meta)).is_some()
    }

    fn fetch<T>(
        &self,
        key: &[u8],
        now: u64,
        read: impl FnOnce(&SlotMeta) -> Result<T, Rejection>,
    ) -> Option<(SlotMeta, u32, T)> {
        if !is_valid_key(key) {
            return None;
        }

        let hash = hash_key(key);
        let counters = self.counters();

        let Some((meta, cas)) = self.table.lookup(hash, key) else {
            counters.record_miss();
            return None;
        };

        let result = self.guard.check_ttl(&meta, now).and_then(|()| read(&meta));

        match result {
            Ok(value) => {
                self.arena.touch(meta.segment, meta.offset, meta.size, now);
                counters.record_hit();
                Some((meta, cas, value))
            }
            Err(Rejection::Expired) => {
                counters.record_expired();
                None
            }
            Err(Rejection::Corrupted) => {
                tracing::debug!(
                    hash = meta.hash,
                    segment = meta.segment,
                    offset = meta.offset,
                    "integrity check failed"
                );
                counters.record_corrupted();
                None
            }
        }
    }

    fn read_value(&self, meta: &SlotMeta) -> Result<Vec<u8>, Rejection> {
        let payload_len = meta.key_len() + meta.value_len();
        let record = self
            .arena
            .read(meta.segment, meta.offset, meta.size, payload_len)
            .ok_or(Rejection::Corrupted)?;

        self.guard.verify(meta, &record)?;

        let mut value = record.payload;
        value.drain(..meta.key_len());
        Ok(value)
    }

    fn check_value(&self, meta: &SlotMeta) -> Result<(), Rejection> {
        let payload_len = meta.key_len() + meta.value_len();
        let record = self
            .arena
            .read_prefix(
                meta.segment,
                meta.offset,
                meta.size,
                payload_len,
                self.guard.verified_prefix(meta),
            )
            .ok_or(Rejection::Corrupted)?;

        self.guard.verify(meta, &record)
    }

    /// Store a value.
    ///
    /// `ttl` is in seconds from `now`, 0 for no expiry. With `add_only` the
    /// write fails with [`StorageError::AlreadyExists`] if the key holds a
    /// live entry. A write that loses a race for its slot is dropped without
    /// an error.
    pub fn update(
        &self,
        key: &[u8],
        value: &[u8],
        flag: u32,
        ttl: u64,
        add_only: bool,
        now: u64,
    ) -> StorageResult<()> {
        if !is_valid_key(key) {
            return Err(StorageError::InvalidKey);
        }

        let counters = self.counters();
        if value.len() > self.max_value_size {
            counters.record_fail();
            return Err(StorageError::ValueTooLarge);
        }

        let hash = hash_key(key);
        if add_only && self.is_live(hash, key, now) {
            return Err(StorageError::AlreadyExists);
        }

        let Some(allocation) = self.arena.allocate(hash, key.len() + value.len()) else {
            counters.record_fail();
            return Err(StorageError::ValueTooLarge);
        };

        if allocation.wrapped {
            counters.record_recycle();
            tracing::debug!(segment = allocation.segment, "value segment wrapped");
        }

        self.arena.write(&allocation, key, value, now);

        let mut meta = SlotMeta {
            hash,
            checksum: self.guard.checksum_parts(key, value),
            ttl: expiry(ttl, now),
            len: pack_len(key.len(), value.len()),
            flag,
            size: allocation.size,
            segment: allocation.segment,
            offset: allocation.offset,
            ..SlotMeta::EMPTY
        };
        meta.set_key(key);

        let outcome = self.table.bucket(hash).publish(|current| {
            if add_only && current.holds(hash, key) && !current.is_expired(now) {
                None
            } else {
                Some(meta)
            }
        });

        match outcome {
            Publish::Stored(previous) => {
                if !previous.is_empty() && !previous.holds(hash, key) {
                    counters.record_kick();
                    tracing::trace!(
                        evicted = previous.hash,
                        by = hash,
                        index = self.table.index(hash),
                        "slot collision"
                    );
                }
                Ok(())
            }
            Publish::Declined => Err(StorageError::AlreadyExists),
            Publish::Contended => {
                tracing::debug!(hash, "slot contended, update dropped");
                Ok(())
            }
        }
    }

    fn is_live(&self, hash: u64, key: &[u8], now: u64) -> bool {
        self.table
            .lookup(hash, key)
            .is_some_and(|(meta, _)| !meta.is_expired(now))
    }

    /// Remove a key.
    ///
    /// With `ttl` 0 the slot is cleared now. Otherwise a live entry is left
    /// in place and set to expire `ttl` seconds from `now`, unless it already
    /// expires sooner. Removing an absent or expired key is not an error and
    /// changes nothing.
    pub fn delete(&self, key: &[u8], ttl: u64, now: u64) -> StorageResult<()> {
        if !is_valid_key(key) {
            return Err(StorageError::InvalidKey);
        }

        let hash = hash_key(key);
        if ttl == 0 {
            self.table.remove(hash, key);
        } else {
            let deadline = expiry(ttl, now);
            self.table.bucket(hash).publish(|current| {
                if !current.holds(hash, key) || current.is_expired(now) {
                    return None;
                }
                let ttl = match current.ttl {
                    0 => deadline,
                    existing => existing.min(deadline),
                };
                Some(SlotMeta { ttl, ..*current })
            });
        }

        Ok(())
    }

    /// Clear every slot. Value bytes are left for the arena to overwrite.
    pub fn flush(&self) {
        let cleared = self.table.clear();
        tracing::info!(cleared, "flushed storage");
    }

    /// Sizing and a counter snapshot.
    pub fn info(&self) -> StorageInfo {
        StorageInfo {
            backend: self.backend.name(),
            slots_num: self.table.len(),
            slots_used: self.table.occupied(),
            slot_size: SLOT_SIZE,
            segments_num: self.arena.segments(),
            segment_size: self.geometry.plan.segment_size,
            key_region_size: self.geometry.key_region_size,
            value_region_size: self.geometry.value_region_size,
            max_value_size: self.max_value_size,
            full_checksum_threshold: self.guard.threshold(),
            stats: self.stats(),
        }
    }

    /// Snapshot of the shared counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.counters().snapshot()
    }

    /// Walk occupied slots in index order, stopping after `limit` of them
    /// (0 for no limit).
    pub fn dump(&self, limit: usize) -> Dump<'_> {
        Dump::new(&self.table, limit)
    }

    /// Name of the backend that mapped the region.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Whether this handle created the region rather than attaching to it.
    pub fn is_creator(&self) -> bool {
        self.directory.created()
    }

    /// Geometry of the region.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Detach from the region. Other processes keep their mappings.
    pub fn shutdown(self) {
        drop(self);
    }

    #[inline]
    fn counters(&self) -> &Counters {
        // Safety: the header lives at the start of the mapped key region
        unsafe { self.header.as_ref() }.counters()
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        tracing::info!(backend = self.backend.name(), "detaching storage");
        for segment in self.directory.segments_mut().iter_mut().rev() {
            self.backend.detach_segment(segment);
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("backend", &self.backend.name())
            .field("geometry", &self.geometry)
            .field("max_value_size", &self.max_value_size)
            .finish()
    }
}

/// Check a backend's directory against the geometry it was asked for and
/// return the key region base.
fn check_directory(
    directory: &SegmentDirectory,
    geometry: &Geometry,
    backend: &str,
) -> StorageResult<NonNull<u8>> {
    if directory.key_region().size() != geometry.key_region_size
        || directory.value_segments().len() != geometry.plan.count
    {
        return Err(StorageError::allocation(format!(
            "backend {} returned an unexpected directory",
            backend
        )));
    }

    NonNull::new(directory.key_region().as_ptr())
        .ok_or_else(|| StorageError::allocation("key region is null"))
}

fn expiry(ttl: u64, now: u64) -> u64 {
    if ttl == 0 { 0 } else { now.saturating_add(ttl) }
}

/// Builder for [`Storage`].
///
/// # Example
///
/// ```no_run
/// use shmcache::{HeapBackend, Storage};
///
/// let storage = Storage::builder()
///     .hashtable_power(16)
///     .total_size(64 * 1024 * 1024)
///     .backend(HeapBackend::new())
///     .build()
///     .expect("failed to create storage");
/// ```
pub struct StorageBuilder {
    key_region_size: usize,
    total_size: usize,
    value_region_size: Option<usize>,
    hashtable_power: Option<u8>,
    min_segment_size: usize,
    max_value_size: usize,
    full_checksum_threshold: usize,
    backend: Option<Box<dyn SegmentBackend>>,
}

impl Default for StorageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBuilder {
    /// Create a new builder with default settings.
    ///
    /// Defaults:
    /// - Key region: 4MB, total: 68MB
    /// - Segments: at least 4MB each
    /// - Values: up to 1MB
    /// - Backend: anonymous shared mapping
    pub fn new() -> Self {
        let config = Config::default();
        Self {
            key_region_size: config.key_region_size,
            total_size: config.total_size,
            value_region_size: None,
            hashtable_power: None,
            min_segment_size: config.min_segment_size,
            max_value_size: config.max_value_size,
            full_checksum_threshold: DEFAULT_FULL_CHECKSUM_THRESHOLD,
            backend: None,
        }
    }

    /// Set the key region size. Ignored when a hashtable power is set.
    pub fn key_region_size(mut self, bytes: usize) -> Self {
        self.key_region_size = bytes;
        self
    }

    /// Set the size of key and value regions together.
    pub fn total_size(mut self, bytes: usize) -> Self {
        self.total_size = bytes;
        self
    }

    /// Size the value region directly instead of through `total_size`.
    pub fn value_region_size(mut self, bytes: usize) -> Self {
        self.value_region_size = Some(bytes);
        self
    }

    /// Set the table size to 2^power slots.
    pub fn hashtable_power(mut self, power: u8) -> Self {
        self.hashtable_power = Some(power);
        self
    }

    /// Set the smallest value segment size.
    pub fn min_segment_size(mut self, bytes: usize) -> Self {
        self.min_segment_size = bytes;
        self
    }

    /// Set the largest accepted value. Capped at 2^24 - 1 bytes.
    pub fn max_value_size(mut self, bytes: usize) -> Self {
        self.max_value_size = bytes;
        self
    }

    /// Set the payload length below which checksums cover every byte.
    pub fn full_checksum_threshold(mut self, bytes: usize) -> Self {
        self.full_checksum_threshold = bytes;
        self
    }

    /// Set the segment backend (default: anonymous shared mapping).
    pub fn backend(mut self, backend: impl SegmentBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    /// Map the region and build the handle.
    pub fn build(self) -> StorageResult<Storage> {
        if self.min_segment_size == 0 {
            return Err(StorageError::Config(
                "min_segment_size must be non-zero".to_string(),
            ));
        }
        if self.max_value_size == 0 {
            return Err(StorageError::Config(
                "max_value_size must be non-zero".to_string(),
            ));
        }
        let threshold = u32::try_from(self.full_checksum_threshold)
            .ok()
            .filter(|&t| t > 0)
            .ok_or_else(|| {
                StorageError::Config(format!(
                    "full_checksum_threshold ({}) must be between 1 and {}",
                    self.full_checksum_threshold,
                    u32::MAX
                ))
            })?;

        let geometry = match self.value_region_size {
            Some(value) => Geometry::with_value_region(
                self.key_region_size,
                value,
                self.hashtable_power,
                self.min_segment_size,
            )?,
            None => Geometry::new(
                self.key_region_size,
                self.total_size,
                self.hashtable_power,
                self.min_segment_size,
            )?,
        };

        let backend = self
            .backend
            .unwrap_or_else(|| Box::new(AnonymousBackend::default()));

        let directory = backend.create_segments(
            geometry.key_region_size,
            geometry.value_region_size,
            self.min_segment_size,
        )?;

        let base = match check_directory(&directory, &geometry, backend.name()) {
            Ok(base) => base,
            Err(e) => {
                // An uninitialized region would fail every later attach
                if directory.created() {
                    drop(directory);
                    backend.discard();
                }
                return Err(e);
            }
        };

        // Safety: the key region is mapped, page aligned, and at least
        // SLOTS_OFFSET bytes plus the slot array
        let header = unsafe { Header::at(base) };
        if directory.created() {
            header.initialize(&geometry, threshold);
        } else {
            header.validate(&geometry, threshold)?;
        }

        // Safety: geometry sized the key region for `slots_num` slots behind
        // the cursor table
        let table = unsafe { KeyTable::from_raw(layout::slots(base), geometry.slots_num) };

        let segments = directory.value_segments().iter().filter_map(|segment| {
            Some((NonNull::new(segment.as_ptr())?, segment.size() as u32))
        });
        // Safety: segments are disjoint ranges of the mapping, 8-byte
        // aligned, and each has a cursor in the table
        let arena = unsafe { ValueArena::from_raw(segments, layout::cursors(base)) };

        tracing::info!(
            backend = backend.name(),
            created = directory.created(),
            slots = geometry.slots_num,
            segments = geometry.plan.count,
            segment_size = geometry.plan.segment_size,
            total_size = geometry.total_size(),
            "storage ready"
        );

        Ok(Storage {
            table,
            arena,
            guard: IntegrityGuard::new(threshold as usize),
            header: NonNull::from(header),
            geometry,
            max_value_size: self.max_value_size.min(MAX_VALUE_LEN),
            backend,
            directory,
        })
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::backend::{MappedRegion, page_size};

    const NOW: u64 = 1_000_000;

    fn storage() -> Storage {
        Storage::builder()
            .hashtable_power(10)
            .value_region_size(64 * page_size())
            .min_segment_size(16 * page_size())
            .backend(HeapBackend::new())
            .build()
            .expect("heap storage")
    }

    #[test]
    fn test_builder_geometry() {
        let storage = storage();
        let info = storage.info();
        assert_eq!(info.backend, "heap");
        assert_eq!(info.slots_num, 1024);
        assert_eq!(info.segments_num, 4);
        assert_eq!(info.segment_size, 16 * page_size());
        assert_eq!(info.value_region_size, 64 * page_size());
        assert_eq!(info.slot_size, 96);
        assert_eq!(info.slots_used, 0);
        assert!(storage.is_creator());
    }

    #[test]
    fn test_update_then_find() {
        let storage = storage();
        storage.update(b"key", b"value", 42, 0, false, NOW).unwrap();

        let item = storage.find(b"key", NOW).expect("hit");
        assert_eq!(item.value, b"value");
        assert_eq!(item.size(), 5);
        assert_eq!(item.flag, 42);
        assert!(storage.exists(b"key", NOW));

        let stats = storage.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.miss, 0);
    }

    #[test]
    fn test_empty_value() {
        let storage = storage();
        storage.update(b"key", b"", 0, 0, false, NOW).unwrap();
        assert_eq!(storage.find(b"key", NOW).unwrap().value, b"");
    }

    #[test]
    fn test_invalid_keys() {
        let storage = storage();
        let long = [b'k'; 49];

        assert!(matches!(
            storage.update(b"", b"v", 0, 0, false, NOW),
            Err(StorageError::InvalidKey)
        ));
        assert!(matches!(
            storage.update(&long, b"v", 0, 0, false, NOW),
            Err(StorageError::InvalidKey)
        ));
        assert!(matches!(
            storage.delete(&long, 0, NOW),
            Err(StorageError::InvalidKey)
        ));
        assert!(storage.find(&long, NOW).is_none());
        assert!(storage.find(b"", NOW).is_none());

        // Not counted as lookups
        assert_eq!(storage.stats(), StatsSnapshot::default());

        // 48 bytes is fine
        storage.update(&long[..48], b"v", 0, 0, false, NOW).unwrap();
        assert!(storage.find(&long[..48], NOW).is_some());
    }

    #[test]
    fn test_value_too_large() {
        let storage = Storage::builder()
            .hashtable_power(4)
            .value_region_size(page_size())
            .max_value_size(1 << 30)
            .backend(HeapBackend::new())
            .build()
            .unwrap();

        // Larger than the only segment
        let value = vec![0u8; page_size()];
        assert!(matches!(
            storage.update(b"big", &value, 0, 0, false, NOW),
            Err(StorageError::ValueTooLarge)
        ));
        assert_eq!(storage.stats().fails, 1);
        assert!(storage.find(b"big", NOW).is_none());
    }

    #[test]
    fn test_value_over_configured_max() {
        let storage = Storage::builder()
            .hashtable_power(4)
            .value_region_size(16 * page_size())
            .max_value_size(100)
            .backend(HeapBackend::new())
            .build()
            .unwrap();

        storage.update(b"ok", &[1u8; 100], 0, 0, false, NOW).unwrap();
        assert!(matches!(
            storage.update(b"big", &[1u8; 101], 0, 0, false, NOW),
            Err(StorageError::ValueTooLarge)
        ));
        assert_eq!(storage.stats().fails, 1);
    }

    #[test]
    fn test_max_value_size_capped_at_length_field() {
        let storage = Storage::builder()
            .hashtable_power(4)
            .value_region_size(page_size())
            .max_value_size(usize::MAX)
            .backend(HeapBackend::new())
            .build()
            .unwrap();
        assert_eq!(storage.info().max_value_size, MAX_VALUE_LEN);
    }

    #[test]
    fn test_value_length_limit() {
        // One segment with room for a 2^24 byte value
        let storage = Storage::builder()
            .hashtable_power(4)
            .value_region_size(2 << 24)
            .min_segment_size(2 << 24)
            .max_value_size(usize::MAX)
            .backend(HeapBackend::new())
            .build()
            .unwrap();
        assert_eq!(storage.geometry().plan.count, 1);

        let value = vec![3u8; MAX_VALUE_LEN + 1];
        assert!(matches!(
            storage.update(b"big", &value, 0, 0, false, NOW),
            Err(StorageError::ValueTooLarge)
        ));
        assert_eq!(storage.stats().fails, 1);
        assert!(storage.find(b"big", NOW).is_none());

        storage
            .update(b"big", &value[..MAX_VALUE_LEN], 0, 0, false, NOW)
            .unwrap();
        assert_eq!(storage.find(b"big", NOW).unwrap().size(), MAX_VALUE_LEN);
    }

    /// Splits the value region differently from what the builder expects.
    struct Resplitting(NamedBackend);

    impl SegmentBackend for Resplitting {
        fn name(&self) -> &'static str {
            "resplitting"
        }

        fn map(&self, size: usize) -> StorageResult<MappedRegion> {
            self.0.map(size)
        }

        fn create_segments(
            &self,
            key_size: usize,
            value_size: usize,
            _min_segment_size: usize,
        ) -> StorageResult<SegmentDirectory> {
            self.0.create_segments(key_size, value_size, usize::MAX)
        }

        fn discard(&self) {
            self.0.discard()
        }
    }

    fn build_with(backend: impl SegmentBackend + 'static) -> StorageResult<Storage> {
        Storage::builder()
            .hashtable_power(4)
            .value_region_size(4 * page_size())
            .min_segment_size(page_size())
            .backend(backend)
            .build()
    }

    #[test]
    fn test_failed_create_removes_named_segment() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("cache");

        assert!(build_with(Resplitting(NamedBackend::new(&path))).is_err());
        assert!(!path.exists());

        // The name is free for a working create
        let storage = build_with(NamedBackend::new(&path)).expect("create");
        assert!(storage.is_creator());

        // A failed attach leaves the creator's segment alone
        assert!(build_with(Resplitting(NamedBackend::new(&path))).is_err());
        assert!(path.exists());
        storage.update(b"key", b"value", 0, 0, false, NOW).unwrap();
        assert!(build_with(NamedBackend::new(&path)).unwrap().exists(b"key", NOW));
    }

    #[test]
    fn test_cas_changes_on_write() {
        let storage = storage();
        storage.update(b"key", b"v1", 0, 0, false, NOW).unwrap();
        let first = storage.find(b"key", NOW).unwrap().cas;
        assert_eq!(storage.find(b"key", NOW).unwrap().cas, first);

        storage.update(b"key", b"v2", 0, 0, false, NOW).unwrap();
        let second = storage.find(b"key", NOW).unwrap().cas;
        assert_ne!(first, second);
    }

    #[test]
    fn test_builder_rejects_bad_settings() {
        assert!(matches!(
            Storage::builder()
                .full_checksum_threshold(0)
                .backend(HeapBackend::new())
                .build(),
            Err(StorageError::Config(_))
        ));
        assert!(matches!(
            Storage::builder()
                .min_segment_size(0)
                .backend(HeapBackend::new())
                .build(),
            Err(StorageError::Config(_))
        ));
        assert!(matches!(
            Storage::builder()
                .key_region_size(4096 * 1024)
                .total_size(4096 * 1024)
                .backend(HeapBackend::new())
                .build(),
            Err(StorageError::Allocation { .. })
        ));
    }

    #[test]
    fn test_from_config_heap() {
        let config = Config::parse(
            r#"
            backend = "heap"
            hashtable_power = 8
            total_size = "8MB"
            min_segment_size = "1MB"
            full_checksum_threshold = 64
            "#,
        )
        .unwrap();

        let storage = Storage::from_config(&config).unwrap();
        let info = storage.info();
        assert_eq!(storage.backend_name(), "heap");
        assert_eq!(info.slots_num, 256);
        assert_eq!(info.full_checksum_threshold, 64);
        assert!(info.segments_num >= 4);
    }

    #[test]
    fn test_startup_anonymous() {
        let storage = Storage::startup(1024 * 1024, 9 * 1024 * 1024).unwrap();
        assert_eq!(storage.backend_name(), "mmap");
        storage.update(b"key", b"value", 0, 0, false, NOW).unwrap();
        assert_eq!(storage.find(b"key", NOW).unwrap().value, b"value");
        storage.shutdown();
    }

    #[test]
    fn test_unix_time_is_recent() {
        // 2020-01-01
        assert!(unix_time() > 1_577_836_800);
    }
}
