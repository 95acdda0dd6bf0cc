use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use w3sync_core::{GlobalId, LocalId, PayloadHash, Row, W3Id};

use crate::error::StorageError;
use crate::traits::{
    DeadLetter, DeadLetterStore, MappingStore, NewMapping, StoreOutcome, SyncMapping,
};

const NOW_MS: &str = "CAST(unixepoch('now','subsec') * 1000 AS INTEGER)";

const MAPPING_COLUMNS: &str =
    "local_id, global_id, entity_type, platform, created_at, updated_at, fingerprint, tombstoned_at";

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

/// SQLite-backed mapping store for a single platform.
pub struct SqliteMappingStore {
    conn: Mutex<Connection>,
    platform: String,
}

impl SqliteMappingStore {
    pub fn open(path: impl AsRef<Path>, platform: impl Into<String>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        let platform = platform.into();
        debug!(path = %path.display(), %platform, "opened mapping store");
        Ok(Self {
            conn: Mutex::new(conn),
            platform,
        })
    }

    pub fn open_in_memory(platform: impl Into<String>) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            platform: platform.into(),
        })
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn query_mapping(
        &self,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<SyncMapping>, StorageError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {MAPPING_COLUMNS} FROM id_mappings WHERE {filter} LIMIT 1");
        let raw = conn.query_row(&sql, params, read_mapping).optional()?;
        raw.map(MappingRow::into_mapping).transpose()
    }
}

struct MappingRow {
    local_id: String,
    global_id: String,
    entity_type: String,
    platform: String,
    created_at: i64,
    updated_at: i64,
    fingerprint: Option<Vec<u8>>,
    tombstoned_at: Option<i64>,
}

impl MappingRow {
    fn into_mapping(self) -> Result<SyncMapping, StorageError> {
        let fingerprint = self
            .fingerprint
            .map(|bytes| to_array::<32>(bytes, "fingerprint").map(PayloadHash::from_bytes))
            .transpose()?;
        Ok(SyncMapping {
            local_id: LocalId::new(self.local_id),
            global_id: GlobalId::new(self.global_id),
            entity_type: self.entity_type,
            platform: self.platform,
            created_at: self.created_at,
            updated_at: self.updated_at,
            fingerprint,
            tombstoned_at: self.tombstoned_at,
        })
    }
}

fn read_mapping(row: &rusqlite::Row) -> rusqlite::Result<MappingRow> {
    Ok(MappingRow {
        local_id: row.get(0)?,
        global_id: row.get(1)?,
        entity_type: row.get(2)?,
        platform: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        fingerprint: row.get(6)?,
        tombstoned_at: row.get(7)?,
    })
}

impl MappingStore for SqliteMappingStore {
    fn get_global_id(
        &self,
        local_id: &LocalId,
        entity_type: &str,
    ) -> Result<Option<GlobalId>, StorageError> {
        let conn = self.conn()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT global_id FROM id_mappings WHERE local_id = ?1 AND entity_type = ?2 AND platform = ?3",
                rusqlite::params![local_id.as_str(), entity_type, self.platform],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.map(GlobalId::new))
    }

    fn get_local_id(&self, global_id: &GlobalId) -> Result<Option<LocalId>, StorageError> {
        let conn = self.conn()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT local_id FROM id_mappings WHERE global_id = ?1 AND platform = ?2",
                rusqlite::params![global_id.as_str(), self.platform],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.map(LocalId::new))
    }

    fn get_mapping(
        &self,
        local_id: &LocalId,
        entity_type: &str,
    ) -> Result<Option<SyncMapping>, StorageError> {
        self.query_mapping(
            "local_id = ?1 AND entity_type = ?2 AND platform = ?3",
            rusqlite::params![local_id.as_str(), entity_type, self.platform],
        )
    }

    fn get_mapping_by_global(
        &self,
        global_id: &GlobalId,
    ) -> Result<Option<SyncMapping>, StorageError> {
        self.query_mapping(
            "global_id = ?1 AND platform = ?2",
            rusqlite::params![global_id.as_str(), self.platform],
        )
    }

    fn store_mapping(&self, mapping: &NewMapping) -> Result<StoreOutcome, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT global_id FROM id_mappings WHERE local_id = ?1 AND entity_type = ?2 AND platform = ?3",
                rusqlite::params![mapping.local_id.as_str(), mapping.entity_type, self.platform],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(global_id) = existing {
            return Ok(StoreOutcome::AlreadyMapped(GlobalId::new(global_id)));
        }

        let result = tx.execute(
            "INSERT INTO id_mappings (global_id, local_id, entity_type, platform) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                mapping.global_id.as_str(),
                mapping.local_id.as_str(),
                mapping.entity_type,
                self.platform,
            ],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StorageError::ConstraintViolation(format!(
                    "global id {} is already mapped on {}",
                    mapping.global_id, self.platform
                )));
            }
            Err(e) => return Err(StorageError::Sqlite(e)),
        }
        tx.commit()?;

        debug!(
            local_id = %mapping.local_id,
            global_id = %mapping.global_id,
            entity_type = %mapping.entity_type,
            "stored mapping"
        );
        Ok(StoreOutcome::Inserted)
    }

    fn set_fingerprint(
        &self,
        global_id: &GlobalId,
        fingerprint: PayloadHash,
    ) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE id_mappings SET fingerprint = ?1, updated_at = {NOW_MS} WHERE global_id = ?2 AND platform = ?3"
            ),
            rusqlite::params![
                fingerprint.as_bytes().as_slice(),
                global_id.as_str(),
                self.platform,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("mapping for {global_id}")));
        }
        Ok(())
    }

    fn tombstone(
        &self,
        local_id: &LocalId,
        entity_type: &str,
        at_ms: i64,
    ) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE id_mappings SET tombstoned_at = COALESCE(tombstoned_at, ?1), updated_at = {NOW_MS} WHERE local_id = ?2 AND entity_type = ?3 AND platform = ?4"
            ),
            rusqlite::params![at_ms, local_id.as_str(), entity_type, self.platform],
        )?;
        Ok(changed > 0)
    }

    fn purge_tombstones(&self, older_than_ms: i64) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let purged = conn.execute(
            "DELETE FROM id_mappings WHERE platform = ?1 AND tombstoned_at IS NOT NULL AND tombstoned_at < ?2",
            rusqlite::params![self.platform, older_than_ms],
        )?;
        if purged > 0 {
            debug!(purged, "purged tombstoned mappings");
        }
        Ok(purged)
    }

    fn delete_mapping(&self, local_id: &LocalId, entity_type: &str) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM id_mappings WHERE local_id = ?1 AND entity_type = ?2 AND platform = ?3",
            rusqlite::params![local_id.as_str(), entity_type, self.platform],
        )?;
        Ok(changed > 0)
    }

    fn all_mappings(&self) -> Result<Vec<SyncMapping>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MAPPING_COLUMNS} FROM id_mappings WHERE platform = ?1 ORDER BY created_at, local_id"
        ))?;
        let rows = stmt.query_map(rusqlite::params![self.platform], read_mapping)?;

        let mut mappings = Vec::new();
        for row in rows {
            mappings.push(row?.into_mapping()?);
        }
        Ok(mappings)
    }
}

#[derive(Serialize, Deserialize)]
struct DeadLetterBody {
    payload: Row,
    acl: Vec<String>,
}

impl DeadLetterStore for SqliteMappingStore {
    fn push_dead_letter(&self, letter: &DeadLetter) -> Result<i64, StorageError> {
        let body = rmp_serde::to_vec_named(&DeadLetterBody {
            payload: letter.payload.clone(),
            acl: letter.acl.clone(),
        })
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO dead_letters (global_id, w3id, schema_id, body, attempts, last_error, failed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                letter.global_id.as_str(),
                letter.w3id.as_str(),
                letter.schema_id,
                body,
                letter.attempts,
                letter.last_error,
                letter.failed_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, global_id, w3id, schema_id, body, attempts, last_error, failed_at FROM dead_letters ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let global_id: String = row.get(1)?;
            let w3id: String = row.get(2)?;
            let schema_id: String = row.get(3)?;
            let body: Vec<u8> = row.get(4)?;
            let attempts: u32 = row.get(5)?;
            let last_error: String = row.get(6)?;
            let failed_at: i64 = row.get(7)?;
            Ok((id, global_id, w3id, schema_id, body, attempts, last_error, failed_at))
        })?;

        let mut letters = Vec::new();
        for row in rows {
            let (id, global_id, w3id, schema_id, body, attempts, last_error, failed_at) = row?;
            let body: DeadLetterBody = rmp_serde::from_slice(&body)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            letters.push(DeadLetter {
                id,
                global_id: GlobalId::new(global_id),
                w3id: W3Id::new(w3id),
                schema_id,
                payload: body.payload,
                acl: body.acl,
                attempts,
                last_error,
                failed_at,
            });
        }
        Ok(letters)
    }

    fn remove_dead_letter(&self, id: i64) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM dead_letters WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    fn remove_dead_letters_for(&self, global_id: &GlobalId) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM dead_letters WHERE global_id = ?1",
            [global_id.as_str()],
        )?;
        Ok(removed)
    }
}
