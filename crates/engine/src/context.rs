use std::sync::Arc;

use w3sync_core::Clock;
use w3sync_storage::SyncStore;

use crate::local::LocalStore;
use crate::lock::LockRegistry;
use crate::registry::MappingRegistry;
use crate::vault::VaultClient;

/// Shared handles every handler works against.
pub struct SyncContext {
    pub platform: String,
    pub registry: Arc<MappingRegistry>,
    pub store: Arc<dyn SyncStore>,
    pub locks: Arc<LockRegistry>,
    pub vault: Arc<VaultClient>,
    pub local: Arc<dyn LocalStore>,
    /// Wall-clock time for tombstones and dead letters.
    pub wall_clock: Arc<dyn Clock>,
}

impl SyncContext {
    pub fn now_ms(&self) -> i64 {
        self.wall_clock.now_ms() as i64
    }
}
