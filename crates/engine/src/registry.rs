use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};
use w3sync_core::MappingDocument;

use crate::error::EngineError;

/// Mapping documents indexed by local table and by schema id. Built once at
/// startup; every document is validated before the registry exists.
#[derive(Debug, Clone, Default)]
pub struct MappingRegistry {
    by_table: HashMap<String, Arc<MappingDocument>>,
    table_by_schema: HashMap<String, String>,
}

impl MappingRegistry {
    pub fn from_documents(
        documents: impl IntoIterator<Item = MappingDocument>,
    ) -> Result<Self, EngineError> {
        let mut registry = Self::default();
        for document in documents {
            registry.insert(document)?;
        }
        Ok(registry)
    }

    /// Loads every `*.json` file in `dir`. Other files are ignored.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, EngineError> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut registry = Self::default();
        for path in paths {
            let bytes = std::fs::read(&path)?;
            let document = MappingDocument::from_json(&bytes).map_err(|e| {
                EngineError::InvalidMapping(format!("{}: {e}", path.display()))
            })?;
            debug!(path = %path.display(), table = %document.table_name, "loaded mapping document");
            registry.insert(document)?;
        }
        info!(dir = %dir.display(), tables = registry.len(), "mapping registry ready");
        Ok(registry)
    }

    fn insert(&mut self, document: MappingDocument) -> Result<(), EngineError> {
        document
            .validate()
            .map_err(|e| EngineError::InvalidMapping(e.to_string()))?;
        if self.by_table.contains_key(&document.table_name) {
            return Err(EngineError::InvalidMapping(format!(
                "table {} has more than one document",
                document.table_name
            )));
        }
        if let Some(other) = self.table_by_schema.get(&document.schema_id) {
            return Err(EngineError::InvalidMapping(format!(
                "schema {} is used by both {other} and {}",
                document.schema_id, document.table_name
            )));
        }
        self.table_by_schema
            .insert(document.schema_id.clone(), document.table_name.clone());
        self.by_table
            .insert(document.table_name.clone(), Arc::new(document));
        Ok(())
    }

    pub fn by_table(&self, table: &str) -> Option<Arc<MappingDocument>> {
        self.by_table.get(table).cloned()
    }

    pub fn by_schema(&self, schema_id: &str) -> Option<Arc<MappingDocument>> {
        self.table_by_schema
            .get(schema_id)
            .and_then(|table| self.by_table(table))
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.by_table.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_table.is_empty()
    }
}
