//! Background delivery of vault updates.
//!
//! Jobs are routed to a fixed set of worker shards by global id, so updates
//! to one record leave in the order they were queued. Each job carries a
//! [`Version`]; a worker drops any job older than the newest version queued
//! for the same record. Failures end up in the dead-letter table.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

use w3sync_core::{Clock, EnvelopeInput, GlobalId, PayloadHash, Version, VersionClock, W3Id};
use w3sync_storage::{DeadLetter, SyncStore};

use crate::inflight::InFlight;
use crate::vault::{VaultClient, VaultError};

#[derive(Debug, Clone)]
pub struct UpdateJob {
    pub global_id: GlobalId,
    pub w3id: W3Id,
    pub input: EnvelopeInput,
    pub fingerprint: PayloadHash,
    pub version: Version,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    version: Version,
    fingerprint: PayloadHash,
}

struct DispatcherInner {
    vault: Arc<VaultClient>,
    store: Arc<dyn SyncStore>,
    wall_clock: Arc<dyn Clock>,
    versions: Mutex<VersionClock>,
    pending: Mutex<HashMap<GlobalId, Pending>>,
    in_flight: InFlight,
}

pub struct UpdateDispatcher {
    inner: Arc<DispatcherInner>,
    shards: Vec<mpsc::Sender<UpdateJob>>,
}

impl UpdateDispatcher {
    /// Spawns `workers` shard tasks sharing `capacity` queue slots. Must be
    /// called inside a tokio runtime.
    pub fn spawn(
        vault: Arc<VaultClient>,
        store: Arc<dyn SyncStore>,
        wall_clock: Arc<dyn Clock>,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let workers = workers.max(1);
        let per_shard = (capacity / workers).max(1);
        let inner = Arc::new(DispatcherInner {
            vault,
            store,
            wall_clock,
            versions: Mutex::new(VersionClock::new()),
            pending: Mutex::new(HashMap::new()),
            in_flight: InFlight::default(),
        });

        let mut shards = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(per_shard);
            tokio::spawn(run_shard(inner.clone(), shard, rx));
            shards.push(tx);
        }
        Self { inner, shards }
    }

    fn shard_for(&self, global_id: &GlobalId) -> usize {
        let mut hasher = DefaultHasher::new();
        global_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Fingerprint of the newest update still waiting for `global_id`.
    pub fn pending_fingerprint(&self, global_id: &GlobalId) -> Option<PayloadHash> {
        self.inner
            .pending()
            .get(global_id)
            .map(|pending| pending.fingerprint)
    }

    /// Drops the fingerprint remembered for `global_id` after the vault was
    /// seen holding a different payload. Queued jobs are still sent.
    pub fn forget_pending(&self, global_id: &GlobalId) -> bool {
        self.inner.pending().remove(global_id).is_some()
    }

    /// Queues an update without waiting for it. A full shard sends the job
    /// straight to the dead-letter table.
    pub fn enqueue(
        &self,
        global_id: GlobalId,
        w3id: W3Id,
        input: EnvelopeInput,
        fingerprint: PayloadHash,
    ) -> Version {
        let version = {
            let mut versions = self
                .inner
                .versions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            versions.tick(self.inner.wall_clock.now_ms())
        };
        self.inner.pending().insert(
            global_id.clone(),
            Pending {
                version,
                fingerprint,
            },
        );

        let shard = self.shard_for(&global_id);
        let job = UpdateJob {
            global_id,
            w3id,
            input,
            fingerprint,
            version,
        };
        self.inner.in_flight.start();
        match self.shards[shard].try_send(job) {
            Ok(()) => {
                debug!(shard, ?version, "update queued");
            }
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => {
                warn!(global_id = %job.global_id, shard, "update queue full");
                self.inner.clear_pending(&job);
                self.inner.dead_letter(&job, 0, "update queue full");
                self.inner.in_flight.finish();
            }
        }
        version
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.count()
    }

    /// Waits until every queued job has been sent or dead-lettered.
    pub async fn flush(&self) {
        self.inner.in_flight.wait_idle().await;
    }
}

async fn run_shard(inner: Arc<DispatcherInner>, shard: usize, mut rx: mpsc::Receiver<UpdateJob>) {
    while let Some(job) = rx.recv().await {
        inner.process(job).await;
        inner.in_flight.finish();
    }
    debug!(shard, "update shard stopped");
}

impl DispatcherInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<GlobalId, Pending>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_superseded(&self, job: &UpdateJob) -> bool {
        self.pending()
            .get(&job.global_id)
            .is_some_and(|pending| pending.version > job.version)
    }

    fn clear_pending(&self, job: &UpdateJob) {
        let mut pending = self.pending();
        if pending
            .get(&job.global_id)
            .is_some_and(|p| p.version == job.version)
        {
            pending.remove(&job.global_id);
        }
    }

    async fn process(&self, job: UpdateJob) {
        if self.is_superseded(&job) {
            debug!(global_id = %job.global_id, version = ?job.version, "update superseded");
            return;
        }

        let result = self
            .vault
            .update_meta_envelope_by_id(&job.w3id, &job.global_id, &job.input)
            .await;
        self.clear_pending(&job);

        match result {
            Ok(()) => {
                debug!(global_id = %job.global_id, w3id = %job.w3id, "update delivered");
                if let Err(err) = self.store.set_fingerprint(&job.global_id, job.fingerprint) {
                    warn!(global_id = %job.global_id, error = %err, "could not record fingerprint");
                }
                match self.store.remove_dead_letters_for(&job.global_id) {
                    Ok(0) => {}
                    Ok(cleared) => {
                        debug!(global_id = %job.global_id, cleared, "older dead letters cleared")
                    }
                    Err(err) => warn!(
                        global_id = %job.global_id,
                        error = %err,
                        "could not clear dead letters"
                    ),
                }
            }
            Err(err) => {
                let attempts = match &err {
                    VaultError::Exhausted { attempts, .. } => *attempts,
                    _ => 1,
                };
                self.dead_letter(&job, attempts, &err.to_string());
            }
        }
    }

    fn dead_letter(&self, job: &UpdateJob, attempts: u32, reason: &str) {
        error!(
            global_id = %job.global_id,
            w3id = %job.w3id,
            attempts,
            reason,
            "update dead-lettered"
        );
        let letter = DeadLetter {
            id: 0,
            global_id: job.global_id.clone(),
            w3id: job.w3id.clone(),
            schema_id: job.input.ontology.clone(),
            payload: job.input.payload.clone(),
            acl: job.input.acl.clone(),
            attempts,
            last_error: reason.to_string(),
            failed_at: self.wall_clock.now_ms() as i64,
        };
        if let Err(err) = self.store.push_dead_letter(&letter) {
            error!(global_id = %job.global_id, error = %err, "could not persist dead letter");
        }
    }
}
