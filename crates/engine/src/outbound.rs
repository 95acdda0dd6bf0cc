use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use w3sync_core::reference::VaultReference;
use w3sync_core::{
    ChangeEnvelope, EnvelopeInput, GlobalId, LocalId, MappingDocument, PayloadHash, Row, W3Id,
};
use w3sync_storage::{NewMapping, StoreOutcome};

use crate::context::SyncContext;
use crate::error::EngineError;
use crate::local::row_id;
use crate::mapper;
use crate::updates::UpdateDispatcher;

/// A local row that changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRequest {
    pub table_name: String,
    pub data: Row,
    /// Identities to share a newly created record with. When `None`, the
    /// document's participant path is used.
    pub participants: Option<Vec<W3Id>>,
}

impl ChangeRequest {
    pub fn new(table_name: impl Into<String>, data: Row) -> Self {
        Self {
            table_name: table_name.into(),
            data,
            participants: None,
        }
    }

    pub fn with_participants(mut self, participants: Vec<W3Id>) -> Self {
        self.participants = Some(participants);
        self
    }
}

type CreateGate = Arc<tokio::sync::Mutex<()>>;
type GateKey = (String, LocalId);

pub struct OutboundHandler {
    ctx: Arc<SyncContext>,
    updates: Arc<UpdateDispatcher>,
    creating: Mutex<HashMap<GateKey, CreateGate>>,
}

impl OutboundHandler {
    pub fn new(ctx: Arc<SyncContext>, updates: Arc<UpdateDispatcher>) -> Self {
        Self {
            ctx,
            updates,
            creating: Mutex::new(HashMap::new()),
        }
    }

    /// Propagates a local change. Returns what was (or will be) written to the
    /// vault, or `None` when nothing was synced: unmapped table, missing id,
    /// locked record or no resolvable owner.
    ///
    /// Updates are queued and this returns at once. A first sync waits for
    /// the vault to assign an id.
    pub async fn handle_change(
        &self,
        request: ChangeRequest,
    ) -> Result<Option<ChangeEnvelope>, EngineError> {
        let Some(mapping) = self.ctx.registry.by_table(&request.table_name) else {
            debug!(table = %request.table_name, "no mapping document, change ignored");
            return Ok(None);
        };
        let Some(local_id) = row_id(&request.data) else {
            warn!(table = %request.table_name, "changed row has no id");
            return Ok(None);
        };

        let table = mapping.table_name.as_str();
        if let Some(global_id) = self.ctx.store.get_global_id(&local_id, table)? {
            return self.update(&mapping, &local_id, global_id, &request);
        }

        let key = (mapping.table_name.clone(), local_id.clone());
        let gate = self.create_gate(&key);
        let result = {
            let _creating = gate.lock().await;
            // Another task may have finished the create while we waited.
            match self.ctx.store.get_global_id(&local_id, table) {
                Ok(Some(global_id)) => self.update(&mapping, &local_id, global_id, &request),
                Ok(None) => self.create(&mapping, &local_id, &request).await,
                Err(err) => Err(err.into()),
            }
        };
        self.release_gate(&key, gate);
        result
    }

    fn create_gate(&self, key: &GateKey) -> CreateGate {
        let mut gates = self
            .creating
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        gates.entry(key.clone()).or_default().clone()
    }

    fn release_gate(&self, key: &GateKey, gate: CreateGate) {
        let mut gates = self
            .creating
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Two references left means only the map and this caller hold it.
        if Arc::strong_count(&gate) <= 2 {
            gates.remove(key);
        }
    }

    fn update(
        &self,
        mapping: &MappingDocument,
        local_id: &LocalId,
        global_id: GlobalId,
        request: &ChangeRequest,
    ) -> Result<Option<ChangeEnvelope>, EngineError> {
        if self.ctx.locks.contains(&global_id) {
            debug!(%local_id, %global_id, "record locked, echo skipped");
            return Ok(None);
        }

        let projection = mapper::to_global(&request.data, mapping, &*self.ctx.store)?;
        let Some(owner) = projection.owner_evault else {
            warn!(
                table = %mapping.table_name,
                %local_id,
                %global_id,
                "owner no longer resolvable, update skipped"
            );
            return Ok(None);
        };

        let fingerprint = PayloadHash::of(&projection.data);
        let last = match self.updates.pending_fingerprint(&global_id) {
            Some(pending) => Some(pending),
            None => self
                .ctx
                .store
                .get_mapping(local_id, &mapping.table_name)?
                .and_then(|m| m.fingerprint),
        };
        if last == Some(fingerprint) {
            debug!(%local_id, %global_id, "payload unchanged, no update queued");
        } else {
            let input = EnvelopeInput::new(
                mapping.schema_id.clone(),
                projection.data.clone(),
                mapping.acl.clone(),
            );
            self.updates
                .enqueue(global_id.clone(), owner.clone(), input, fingerprint);
        }

        Ok(Some(ChangeEnvelope {
            id: global_id,
            w3id: owner,
            data: projection.data,
            schema_id: mapping.schema_id.clone(),
        }))
    }

    async fn create(
        &self,
        mapping: &MappingDocument,
        local_id: &LocalId,
        request: &ChangeRequest,
    ) -> Result<Option<ChangeEnvelope>, EngineError> {
        let store = &*self.ctx.store;
        let projection = mapper::to_global(&request.data, mapping, store)?;
        let Some(owner) = projection.owner_evault else {
            info!(table = %mapping.table_name, %local_id, "no owner vault, record not synced");
            return Ok(None);
        };

        let input = EnvelopeInput::new(
            mapping.schema_id.clone(),
            projection.data.clone(),
            mapping.acl.clone(),
        );
        let global_id = self.ctx.vault.store_meta_envelope(&owner, &input).await?;
        // The vault will echo this write back as a webhook.
        self.ctx.locks.acquire(&global_id);

        let new_mapping = NewMapping::new(
            local_id.clone(),
            global_id.clone(),
            mapping.table_name.clone(),
        );
        if let StoreOutcome::AlreadyMapped(existing) = store.store_mapping(&new_mapping)? {
            warn!(%local_id, %existing, created = %global_id, "local id was mapped concurrently");
        }
        store.set_fingerprint(&global_id, PayloadHash::of(&projection.data))?;
        info!(
            table = %mapping.table_name,
            %local_id,
            %global_id,
            w3id = %owner,
            "record created in vault"
        );

        let participants = match &request.participants {
            Some(participants) => participants.clone(),
            None => mapper::resolve_participants(&request.data, mapping, store)?,
        };
        self.share(&owner, &global_id, participants).await;

        Ok(Some(ChangeEnvelope {
            id: global_id,
            w3id: owner,
            data: projection.data,
            schema_id: mapping.schema_id.clone(),
        }))
    }

    /// Stores a reference on every participant vault except the owner's.
    /// Failures are logged; the record itself already exists.
    async fn share(&self, owner: &W3Id, global_id: &GlobalId, participants: Vec<W3Id>) {
        let reference = VaultReference::new(owner.clone(), global_id.clone());
        let mut seen = vec![owner.normalized()];
        for participant in participants {
            let key = participant.normalized();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            match self.ctx.vault.store_reference(&reference, &participant).await {
                Ok(_) => debug!(%reference, %participant, "reference stored"),
                Err(err) => warn!(%reference, %participant, error = %err, "reference not stored"),
            }
        }
    }
}
