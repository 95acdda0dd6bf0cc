use std::sync::{Arc, Weak};
use std::time::Duration;

use w3sync_core::{GlobalId, LocalId, MappingDocument, Row};
use w3sync_engine::{
    ChangeKind, EngineError, InboundOutcome, MappingRegistry, RetryPolicy, SyncEngine,
    SyncEngineBuilder,
};
use w3sync_storage::{NewMapping, SqliteMappingStore, SyncStore};

use crate::local::{MemoryLocalStore, Relation};
use crate::vault::FakeVault;

/// One platform under test: an engine over an in-memory mapping store and an
/// in-memory local database whose writes feed the engine's watcher.
pub struct TestPlatform {
    pub name: String,
    pub engine: Arc<SyncEngine>,
    pub local: Arc<MemoryLocalStore>,
}

impl TestPlatform {
    /// Short debounce and quick retries so paused-clock tests stay readable.
    pub fn new(
        name: &str,
        vault: &Arc<FakeVault>,
        documents: Vec<MappingDocument>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        Self::with(name, vault, documents, Vec::new(), |builder| builder)
    }

    pub fn with(
        name: &str,
        vault: &Arc<FakeVault>,
        documents: Vec<MappingDocument>,
        relations: Vec<Relation>,
        configure: impl FnOnce(SyncEngineBuilder) -> SyncEngineBuilder,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let local = Arc::new(MemoryLocalStore::with_relations(relations));
        let store = SqliteMappingStore::open_in_memory(name)?;
        let builder = SyncEngine::builder(name)
            .registry(MappingRegistry::from_documents(documents)?)
            .store(Arc::new(store))
            .transport(vault.transport(name))
            .local_store(local.clone())
            .debounce(Duration::from_millis(100))
            .retry_policy(RetryPolicy::new(
                4,
                Duration::from_millis(100),
                Duration::from_millis(400),
            ));
        let engine = Arc::new(configure(builder).build()?);

        let watcher: Weak<SyncEngine> = Arc::downgrade(&engine);
        local.set_listener(move |event| {
            if let Some(engine) = watcher.upgrade() {
                if let Err(err) = engine.notify(event) {
                    tracing::warn!(error = %err, "watcher rejected local event");
                }
            }
        });

        Ok(Self {
            name: name.to_string(),
            engine,
            local,
        })
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        self.engine.store()
    }

    /// An application write. Syncs after the debounce window.
    pub fn write(&self, table: &str, row: Row) -> ChangeKind {
        self.local.write(table, row)
    }

    /// A row that exists locally and is already mapped, as after an earlier
    /// sync. Nothing is sent to the vault.
    pub fn seed(&self, table: &str, row: Row, global_id: &str) -> Result<(), EngineError> {
        let Some(local_id) = w3sync_engine::local::row_id(&row) else {
            return Err(EngineError::InvalidMapping(format!("seed row for {table} has no id")));
        };
        self.local.insert_silently(table, row);
        self.store().store_mapping(&NewMapping::new(
            local_id,
            GlobalId::new(global_id),
            table,
        ))?;
        Ok(())
    }

    pub fn global_id(&self, table: &str, local_id: &str) -> Result<Option<GlobalId>, EngineError> {
        Ok(self.store().get_global_id(&LocalId::new(local_id), table)?)
    }

    pub fn local_id(&self, global_id: &str) -> Result<Option<LocalId>, EngineError> {
        Ok(self.store().get_local_id(&GlobalId::new(global_id))?)
    }

    pub async fn apply(
        &self,
        payload: w3sync_core::WebhookPayload,
    ) -> Result<InboundOutcome, EngineError> {
        self.engine.apply_remote(payload).await
    }

    /// Lets debounced changes fire and queued updates finish.
    pub async fn settle(&self) {
        self.engine.flush().await;
    }
}
