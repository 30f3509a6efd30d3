//! Process-wide storage handle.
//!
//! Bindings that need one shared handle per process start it here once and
//! look it up from anywhere. The engine itself never touches the registry,
//! so tests and tools can still run several independent [`Storage`]s.

use crate::config::Config;
use crate::error::StorageResult;
use crate::storage::Storage;
use parking_lot::Mutex;
use std::sync::Arc;

static STORAGE: Mutex<Option<Arc<Storage>>> = parking_lot::const_mutex(None);

/// Start the process-wide storage.
///
/// If a handle is already registered it is returned unchanged and `config`
/// is ignored.
pub fn startup(config: &Config) -> StorageResult<Arc<Storage>> {
    let mut slot = STORAGE.lock();

    if let Some(storage) = slot.as_ref() {
        tracing::debug!("storage already started, reusing handle");
        return Ok(storage.clone());
    }

    let storage = Arc::new(Storage::from_config(config)?);
    *slot = Some(storage.clone());
    Ok(storage)
}

/// The registered handle, if any.
pub fn handle() -> Option<Arc<Storage>> {
    STORAGE.lock().clone()
}

/// Drop the registered handle.
///
/// The region is detached once the last outstanding clone of the handle is
/// dropped. Returns whether a handle was registered.
pub fn shutdown() -> bool {
    STORAGE.lock().take().is_some()
}
