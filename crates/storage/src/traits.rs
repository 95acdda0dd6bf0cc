use w3sync_core::{GlobalId, LocalId, PayloadHash, Row, W3Id};

use crate::error::StorageError;

/// One row of `id_mappings`: a local record paired with its vault record.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMapping {
    pub local_id: LocalId,
    pub global_id: GlobalId,
    pub entity_type: String,
    pub platform: String,
    pub created_at: i64,
    pub updated_at: i64,
    /// Hash of the last global payload written for this record.
    pub fingerprint: Option<PayloadHash>,
    pub tombstoned_at: Option<i64>,
}

impl SyncMapping {
    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMapping {
    pub local_id: LocalId,
    pub global_id: GlobalId,
    pub entity_type: String,
}

impl NewMapping {
    pub fn new(local_id: LocalId, global_id: GlobalId, entity_type: impl Into<String>) -> Self {
        Self {
            local_id,
            global_id,
            entity_type: entity_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    /// The local id already had a mapping in this entity type; the existing
    /// global id is returned and nothing was written.
    AlreadyMapped(GlobalId),
}

/// Durable bidirectional id map, scoped to one platform.
///
/// Local ids are only unique within their table, so every lookup by local id
/// also names the entity type. Global ids are unique per platform.
///
/// Every method takes `&self`; implementations serialize access internally
/// so one store can be shared by the watcher, the webhook handler and the
/// update workers.
pub trait MappingStore: Send + Sync {
    fn get_global_id(
        &self,
        local_id: &LocalId,
        entity_type: &str,
    ) -> Result<Option<GlobalId>, StorageError>;
    fn get_local_id(&self, global_id: &GlobalId) -> Result<Option<LocalId>, StorageError>;
    fn get_mapping(
        &self,
        local_id: &LocalId,
        entity_type: &str,
    ) -> Result<Option<SyncMapping>, StorageError>;
    fn get_mapping_by_global(&self, global_id: &GlobalId)
        -> Result<Option<SyncMapping>, StorageError>;

    /// Idempotent: a second call for a local id already mapped in the same
    /// entity type is a no-op.
    fn store_mapping(&self, mapping: &NewMapping) -> Result<StoreOutcome, StorageError>;

    fn set_fingerprint(
        &self,
        global_id: &GlobalId,
        fingerprint: PayloadHash,
    ) -> Result<(), StorageError>;

    /// Marks the mapping for a deleted local record. Returns false when no
    /// mapping existed.
    fn tombstone(
        &self,
        local_id: &LocalId,
        entity_type: &str,
        at_ms: i64,
    ) -> Result<bool, StorageError>;

    /// Deletes tombstones older than `older_than_ms`. Returns how many went.
    fn purge_tombstones(&self, older_than_ms: i64) -> Result<usize, StorageError>;

    fn delete_mapping(&self, local_id: &LocalId, entity_type: &str)
        -> Result<bool, StorageError>;
    fn all_mappings(&self) -> Result<Vec<SyncMapping>, StorageError>;
}

/// A vault update that could not be delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Assigned by the store; ignored on push.
    pub id: i64,
    pub global_id: GlobalId,
    pub w3id: W3Id,
    pub schema_id: String,
    pub payload: Row,
    pub acl: Vec<String>,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: i64,
}

pub trait DeadLetterStore: Send + Sync {
    fn push_dead_letter(&self, letter: &DeadLetter) -> Result<i64, StorageError>;
    fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError>;
    fn remove_dead_letter(&self, id: i64) -> Result<bool, StorageError>;
    /// Drops every letter for `global_id`; used once a newer update lands.
    fn remove_dead_letters_for(&self, global_id: &GlobalId) -> Result<usize, StorageError>;
}

/// Everything the engine persists.
pub trait SyncStore: MappingStore + DeadLetterStore {}

impl<T: MappingStore + DeadLetterStore> SyncStore for T {}
