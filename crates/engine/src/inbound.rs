use std::sync::Arc;

use tracing::{debug, info};

use w3sync_core::reference::TableRef;
use w3sync_core::{LocalId, PayloadHash, WebhookPayload};
use w3sync_storage::{NewMapping, StoreOutcome};

use crate::context::SyncContext;
use crate::error::EngineError;
use crate::mapper;
use crate::updates::UpdateDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The global id is already being handled; most likely the echo of this
    /// platform's own write.
    Locked,
    /// The local row was deleted; it is not brought back.
    Tombstoned,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    Created {
        local_id: LocalId,
        unresolved: Vec<TableRef>,
    },
    Updated {
        local_id: LocalId,
        unresolved: Vec<TableRef>,
    },
    Skipped(SkipReason),
}

impl InboundOutcome {
    pub fn local_id(&self) -> Option<&LocalId> {
        match self {
            Self::Created { local_id, .. } | Self::Updated { local_id, .. } => Some(local_id),
            Self::Skipped(_) => None,
        }
    }
}

pub struct InboundHandler {
    ctx: Arc<SyncContext>,
    updates: Arc<UpdateDispatcher>,
}

impl InboundHandler {
    pub fn new(ctx: Arc<SyncContext>, updates: Arc<UpdateDispatcher>) -> Self {
        Self { ctx, updates }
    }

    /// Applies a vault change to the local store.
    ///
    /// An unknown schema is an error (the webhook caller answers 500). Lock
    /// contention and tombstones are reported as skips.
    ///
    /// The applied payload becomes the record's fingerprint, so a later local
    /// edit is compared against what the vault holds now.
    pub async fn apply(&self, payload: WebhookPayload) -> Result<InboundOutcome, EngineError> {
        let ctx = &self.ctx;
        let mapping = ctx
            .registry
            .by_schema(&payload.schema_id)
            .ok_or_else(|| EngineError::UnknownSchema(payload.schema_id.clone()))?;
        let table = mapping.table_name.as_str();
        let global_id = &payload.id;

        if !ctx.locks.try_acquire(global_id) {
            debug!(%table, %global_id, "global id locked, webhook skipped");
            return Ok(InboundOutcome::Skipped(SkipReason::Locked));
        }

        let projection = mapper::from_global(&payload.data, &mapping, &*ctx.store)?;
        let fingerprint = PayloadHash::of(&payload.data);

        match ctx.store.get_mapping_by_global(global_id)? {
            Some(existing) if existing.is_tombstoned() => {
                debug!(
                    %table,
                    %global_id,
                    local_id = %existing.local_id,
                    "local row deleted, webhook skipped"
                );
                Ok(InboundOutcome::Skipped(SkipReason::Tombstoned))
            }
            Some(existing) => {
                let local_id = existing.local_id;
                // Lock before writing so the resulting local event is ignored.
                ctx.locks.acquire(&local_id);
                ctx.local
                    .update(table, &local_id, projection.data)
                    .await
                    .map_err(EngineError::LocalStore)?;
                ctx.store.set_fingerprint(global_id, fingerprint)?;
                if self.updates.forget_pending(global_id) {
                    debug!(%table, %global_id, "queued update no longer matches the vault");
                }
                info!(
                    %table,
                    %global_id,
                    %local_id,
                    w3id = %payload.w3id,
                    "applied remote update"
                );
                Ok(InboundOutcome::Updated {
                    local_id,
                    unresolved: projection.unresolved,
                })
            }
            None => {
                let local_id = ctx
                    .local
                    .insert(table, projection.data)
                    .await
                    .map_err(EngineError::LocalStore)?;
                let outcome = ctx.store.store_mapping(&NewMapping::new(
                    local_id.clone(),
                    global_id.clone(),
                    table,
                ))?;
                match outcome {
                    StoreOutcome::Inserted => ctx.store.set_fingerprint(global_id, fingerprint)?,
                    StoreOutcome::AlreadyMapped(other) => {
                        debug!(%local_id, %other, "inserted row already had a mapping")
                    }
                }
                ctx.locks.acquire(&local_id);
                info!(
                    %table,
                    %global_id,
                    %local_id,
                    w3id = %payload.w3id,
                    "created local row from vault"
                );
                Ok(InboundOutcome::Created {
                    local_id,
                    unresolved: projection.unresolved,
                })
            }
        }
    }
}
