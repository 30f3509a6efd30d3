//! Shared memory key-value cache.
//!
//! A fixed-size cache meant to be mapped by several processes at once (the
//! workers of one host, for example) with no locking between them. Keys live
//! in a direct-mapped slot table, values in ring-allocated segments, and
//! every read is checked against a checksum instead of being protected by a
//! lock. Under contention the cache prefers a miss to waiting.
//!
//! # Architecture
//!
//! ```text
//! +------------------------------------------------------------------+
//! |                            Storage                               |
//! |                                                                  |
//! |  key region                         value region                 |
//! |  +--------+---------+-----------+   +-----------+-----------+    |
//! |  | header | cursors | KeyTable  |   | segment 1 | segment N |    |
//! |  | stats  |         | (slots)   |   |  (ring)   |  (ring)   |    |
//! |  +--------+---------+-----------+   +-----------+-----------+    |
//! |        ^                  |               ^                      |
//! |        |     slot points at record        |                      |
//! |        |                  +---------------+                      |
//! |  IntegrityGuard: TTL, key, length and checksum checked on read   |
//! +------------------------------------------------------------------+
//!                     mapped by a SegmentBackend
//!             (anonymous mmap, named /dev/shm file, heap)
//! ```
//!
//! - A key maps to exactly one slot. A write for a colliding key evicts the
//!   occupant.
//! - Every write allocates a fresh record. Segments wrap around and silently
//!   overwrite old records.
//! - A slot whose record was overwritten, or whose TTL passed, reads as a
//!   miss.
//!
//! # Example
//!
//! ```no_run
//! use shmcache::{Storage, unix_time};
//!
//! let storage = Storage::startup(4 * 1024 * 1024, 68 * 1024 * 1024)?;
//! let now = unix_time();
//!
//! storage.update(b"key", b"value", 0, 60, false, now)?;
//!
//! if let Some(item) = storage.find(b"key", now) {
//!     println!("value: {:?}, flag: {}", item.value, item.flag);
//! }
//! # Ok::<(), shmcache::StorageError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod backend;
pub mod config;
pub mod dump;
pub mod error;
pub mod integrity;
pub mod layout;
pub mod logging;
pub mod registry;
pub mod slot;
pub mod stats;
pub mod storage;
pub mod sync;
pub mod table;

pub use backend::{
    AnonymousBackend, HeapBackend, MappedRegion, NamedBackend, Segment, SegmentBackend,
    SegmentDirectory, page_size,
};
pub use config::{BackendKind, Config, HugepageSize, LogFormat, LoggingConfig};
pub use dump::{Dump, SlotInfo};
pub use error::{StorageError, StorageResult};
pub use integrity::IntegrityGuard;
pub use layout::Geometry;
pub use slot::{MAX_KEY_LEN, MAX_VALUE_LEN};
pub use stats::{StatsSnapshot, StorageInfo};
pub use storage::{Item, Storage, StorageBuilder, unix_time};
pub use table::hash_key;
