pub mod config;
pub mod context;
pub mod error;
pub mod inbound;
mod inflight;
pub mod local;
pub mod lock;
pub mod logging;
pub mod mapper;
pub mod outbound;
pub mod registry;
pub mod updates;
pub mod vault;
pub mod watcher;

pub use config::EngineConfig;
pub use error::{EngineError, LocalStoreError};
pub use inbound::{InboundOutcome, SkipReason};
pub use local::LocalStore;
pub use lock::{LockRegistry, TokioClock};
pub use outbound::ChangeRequest;
pub use registry::MappingRegistry;
pub use vault::{HttpTransport, RetryPolicy, VaultClient, VaultError, VaultTransport};
pub use watcher::{ChangeKind, JunctionRule, LocalEvent};

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use w3sync_core::{ChangeEnvelope, Clock, EnvelopeInput, PayloadHash, SystemClock, WebhookPayload};
use w3sync_storage::{SqliteMappingStore, SyncStore};

use crate::context::SyncContext;
use crate::inbound::InboundHandler;
use crate::outbound::OutboundHandler;
use crate::updates::UpdateDispatcher;
use crate::watcher::ChangeWatcher;

const DEFAULT_UPDATE_WORKERS: usize = 4;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One platform's sync engine: outbound handling, inbound webhooks, change
/// capture and background updates over shared stores.
pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    outbound: Arc<OutboundHandler>,
    inbound: InboundHandler,
    watcher: ChangeWatcher,
    updates: Arc<UpdateDispatcher>,
    tombstone_retention: Duration,
}

impl SyncEngine {
    pub fn builder(platform: impl Into<String>) -> SyncEngineBuilder {
        SyncEngineBuilder::new(platform)
    }

    /// Production wiring: documents from `schemas_path`, SQLite at `db_path`,
    /// HTTP transport to the registry. Must run inside a tokio runtime.
    pub fn from_config(
        config: &EngineConfig,
        local: Arc<dyn LocalStore>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let registry = MappingRegistry::load_dir(&config.schemas_path)?;
        let store = SqliteMappingStore::open(&config.db_path, config.platform.clone())?;
        let transport = HttpTransport::new(
            config.registry_url.clone(),
            config.platform.clone(),
            config.request_timeout(),
        )?;

        Self::builder(config.platform.clone())
            .registry(registry)
            .store(Arc::new(store))
            .transport(Arc::new(transport))
            .local_store(local)
            .lock_ttl(config.lock_ttl())
            .debounce(config.debounce())
            .retry_policy(config.retry_policy())
            .update_workers(config.update_workers)
            .update_queue_capacity(config.update_queue_capacity)
            .tombstone_retention(Duration::from_millis(config.tombstone_retention_ms))
            .build()
    }

    pub fn platform(&self) -> &str {
        &self.ctx.platform
    }

    pub fn registry(&self) -> &MappingRegistry {
        &self.ctx.registry
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.ctx.store
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.ctx.locks
    }

    pub fn vault(&self) -> &Arc<VaultClient> {
        &self.ctx.vault
    }

    /// Outbound entry point for a changed local row.
    pub async fn handle_change(
        &self,
        request: ChangeRequest,
    ) -> Result<Option<ChangeEnvelope>, EngineError> {
        self.outbound.handle_change(request).await
    }

    /// Inbound entry point for a vault webhook.
    pub async fn apply_remote(
        &self,
        payload: WebhookPayload,
    ) -> Result<InboundOutcome, EngineError> {
        self.inbound.apply(payload).await
    }

    /// Feeds a local write to the change watcher.
    pub fn notify(&self, event: LocalEvent) -> Result<(), EngineError> {
        self.watcher.notify(event)
    }

    /// Local changes still inside their debounce window.
    pub fn pending_changes(&self) -> usize {
        self.watcher.pending()
    }

    /// Updates queued or being sent.
    pub fn queued_updates(&self) -> usize {
        self.updates.in_flight()
    }

    /// Waits for debounced changes to fire and for queued updates to finish.
    pub async fn flush(&self) {
        self.watcher.flush().await;
        self.updates.flush().await;
    }

    /// Removes mappings tombstoned longer ago than the retention window, and
    /// expired locks.
    pub fn purge_tombstones(&self) -> Result<usize, EngineError> {
        let retention = i64::try_from(self.tombstone_retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.ctx.now_ms().saturating_sub(retention);
        let purged = self.ctx.store.purge_tombstones(cutoff)?;
        self.ctx.locks.purge_expired();
        if purged > 0 {
            info!(purged, "tombstoned mappings purged");
        }
        Ok(purged)
    }

    /// Re-queues every dead letter. Letters that fail again come back.
    pub fn replay_dead_letters(&self) -> Result<usize, EngineError> {
        let letters = self.ctx.store.dead_letters()?;
        let mut replayed = 0;
        for letter in letters {
            if !self.ctx.store.remove_dead_letter(letter.id)? {
                continue;
            }
            let input = EnvelopeInput::new(letter.schema_id, letter.payload, letter.acl);
            let fingerprint = PayloadHash::of(&input.payload);
            self.updates
                .enqueue(letter.global_id, letter.w3id, input, fingerprint);
            replayed += 1;
        }
        if replayed > 0 {
            info!(replayed, "dead letters re-queued");
        }
        Ok(replayed)
    }
}

pub struct SyncEngineBuilder {
    platform: String,
    registry: Option<MappingRegistry>,
    store: Option<Arc<dyn SyncStore>>,
    transport: Option<Arc<dyn VaultTransport>>,
    local: Option<Arc<dyn LocalStore>>,
    clock: Option<Arc<dyn Clock>>,
    wall_clock: Arc<dyn Clock>,
    lock_ttl: Duration,
    debounce: Duration,
    retry: RetryPolicy,
    update_workers: usize,
    update_queue_capacity: usize,
    tombstone_retention: Duration,
    junctions: Vec<JunctionRule>,
}

impl SyncEngineBuilder {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            registry: None,
            store: None,
            transport: None,
            local: None,
            clock: None,
            wall_clock: Arc::new(SystemClock),
            lock_ttl: lock::DEFAULT_LOCK_TTL,
            debounce: watcher::DEFAULT_DEBOUNCE,
            retry: RetryPolicy::default(),
            update_workers: DEFAULT_UPDATE_WORKERS,
            update_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tombstone_retention: DEFAULT_TOMBSTONE_RETENTION,
            junctions: Vec::new(),
        }
    }

    pub fn registry(mut self, registry: MappingRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(mut self, store: Arc<dyn SyncStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn VaultTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn local_store(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    /// Clock measuring lock lifetimes. Defaults to tokio's clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn wall_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.wall_clock = clock;
        self
    }

    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn update_workers(mut self, workers: usize) -> Self {
        self.update_workers = workers;
        self
    }

    pub fn update_queue_capacity(mut self, capacity: usize) -> Self {
        self.update_queue_capacity = capacity;
        self
    }

    pub fn tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    pub fn junction(mut self, rule: JunctionRule) -> Self {
        self.junctions.push(rule);
        self
    }

    /// Spawns the update workers, so it must be called inside a tokio runtime.
    pub fn build(self) -> Result<SyncEngine, EngineError> {
        let missing = |what: &str| EngineError::Config(format!("sync engine needs a {what}"));
        let registry = self.registry.ok_or_else(|| missing("mapping registry"))?;
        let store = self.store.ok_or_else(|| missing("mapping store"))?;
        let transport = self.transport.ok_or_else(|| missing("vault transport"))?;
        let local = self.local.ok_or_else(|| missing("local store"))?;
        if self.platform.trim().is_empty() {
            return Err(EngineError::Config("platform must be set".into()));
        }
        if registry.is_empty() {
            warn!(platform = %self.platform, "no mapping documents, nothing will sync");
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock::new()));
        let vault = Arc::new(VaultClient::new(transport, self.retry));
        let ctx = Arc::new(SyncContext {
            platform: self.platform,
            registry: Arc::new(registry),
            store,
            locks: Arc::new(LockRegistry::new(self.lock_ttl, clock)),
            vault: vault.clone(),
            local,
            wall_clock: self.wall_clock.clone(),
        });

        let updates = Arc::new(UpdateDispatcher::spawn(
            vault,
            ctx.store.clone(),
            self.wall_clock,
            self.update_workers,
            self.update_queue_capacity,
        ));
        let outbound = Arc::new(OutboundHandler::new(ctx.clone(), updates.clone()));
        let inbound = InboundHandler::new(ctx.clone(), updates.clone());
        let watcher =
            ChangeWatcher::new(ctx.clone(), outbound.clone(), self.debounce, self.junctions);

        info!(
            platform = %ctx.platform,
            tables = ctx.registry.len(),
            workers = self.update_workers,
            "sync engine ready"
        );
        Ok(SyncEngine {
            ctx,
            outbound,
            inbound,
            watcher,
            updates,
            tombstone_retention: self.tombstone_retention,
        })
    }
}
