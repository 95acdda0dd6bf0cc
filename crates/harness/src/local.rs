use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use w3sync_core::{LocalId, Row};
use w3sync_engine::local::row_id;
use w3sync_engine::{ChangeKind, LocalEvent, LocalStore, LocalStoreError};

type Listener = Arc<dyn Fn(LocalEvent) + Send + Sync>;

/// A to-many relation materialized through a junction table when a row is
/// fetched: `field` lists `child_field` of every `junction` row whose
/// `parent_field` equals the row id.
#[derive(Debug, Clone)]
pub struct Relation {
    pub table: String,
    pub field: String,
    pub junction: String,
    pub parent_field: String,
    pub child_field: String,
}

/// In-memory platform database. Every write, whether from the application
/// or from the engine, is reported to the listener, like a database
/// subscriber would.
#[derive(Default)]
pub struct MemoryLocalStore {
    tables: Mutex<HashMap<String, BTreeMap<String, Row>>>,
    relations: Vec<Relation>,
    listener: Mutex<Option<Listener>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relations(relations: Vec<Relation>) -> Self {
        Self {
            relations,
            ..Self::default()
        }
    }

    pub fn set_listener(&self, listener: impl Fn(LocalEvent) + Send + Sync + 'static) {
        *self.lock_listener() = Some(Arc::new(listener));
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<String, Row>>> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, event: LocalEvent) {
        let listener = self.lock_listener().clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }

    /// An application write: inserts or replaces the row keyed by its `id`.
    pub fn write(&self, table: &str, row: Row) -> ChangeKind {
        let Some(id) = row_id(&row) else {
            panic!("rows written to {table} need an id");
        };
        let existed = self
            .tables()
            .entry(table.to_string())
            .or_default()
            .insert(id.into_string(), row.clone())
            .is_some();
        let kind = if existed {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        self.emit(LocalEvent::new(table, kind, row));
        kind
    }

    /// Stores a row without reporting it, like data that predates the engine.
    pub fn insert_silently(&self, table: &str, row: Row) {
        let Some(id) = row_id(&row) else {
            panic!("rows written to {table} need an id");
        };
        self.tables()
            .entry(table.to_string())
            .or_default()
            .insert(id.into_string(), row);
    }

    pub fn delete(&self, table: &str, id: &str) -> Option<Row> {
        let removed = self
            .tables()
            .get_mut(table)
            .and_then(|rows| rows.remove(id))?;
        self.emit(LocalEvent::new(table, ChangeKind::Delete, removed.clone()));
        Some(removed)
    }

    pub fn get(&self, table: &str, id: &str) -> Option<Row> {
        self.tables().get(table).and_then(|rows| rows.get(id)).cloned()
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn with_relations_loaded(&self, table: &str, id: &str, mut row: Row) -> Row {
        let tables = self.tables();
        for relation in self.relations.iter().filter(|r| r.table == table) {
            let children: Vec<Value> = tables
                .get(&relation.junction)
                .into_iter()
                .flat_map(|rows| rows.values())
                .filter(|link| link.get(&relation.parent_field).and_then(Value::as_str) == Some(id))
                .filter_map(|link| link.get(&relation.child_field).cloned())
                .collect();
            row.insert(relation.field.clone(), Value::Array(children));
        }
        row
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn fetch(&self, table: &str, id: &LocalId) -> Result<Option<Row>, LocalStoreError> {
        let Some(row) = self.get(table, id.as_str()) else {
            return Ok(None);
        };
        Ok(Some(self.with_relations_loaded(table, id.as_str(), row)))
    }

    async fn insert(&self, table: &str, mut data: Row) -> Result<LocalId, LocalStoreError> {
        let id = LocalId::generate();
        data.insert("id".to_string(), Value::String(id.to_string()));
        self.tables()
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), data.clone());
        self.emit(LocalEvent::new(table, ChangeKind::Insert, data));
        Ok(id)
    }

    async fn update(&self, table: &str, id: &LocalId, data: Row) -> Result<(), LocalStoreError> {
        let updated = {
            let mut tables = self.tables();
            let Some(row) = tables.get_mut(table).and_then(|rows| rows.get_mut(id.as_str())) else {
                return Err(format!("{table}({id}) does not exist").into());
            };
            for (field, value) in data {
                row.insert(field, value);
            }
            row.clone()
        };
        self.emit(LocalEvent::new(table, ChangeKind::Update, updated));
        Ok(())
    }
}
