//! An in-memory stand-in for the registry and every vault behind it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::time::Instant;

use w3sync_core::{Envelope, EnvelopeInput, GlobalId, W3Id, WebhookPayload};
use w3sync_engine::vault::REFERENCE_ONTOLOGY;
use w3sync_engine::{VaultError, VaultTransport};

const ENDPOINT_PREFIX: &str = "memory://";
const ENDPOINT_SUFFIX: &str = "/graphql";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Resolve,
    Store,
    Update,
}

#[derive(Debug, Clone)]
pub struct VaultCall {
    pub kind: CallKind,
    pub platform: String,
    /// Identity for resolves, vault owner for writes.
    pub w3id: W3Id,
    pub ontology: Option<String>,
    pub id: Option<GlobalId>,
    pub at: Instant,
    pub succeeded: bool,
}

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub owner: W3Id,
    pub envelope: Envelope,
    /// Platform that last wrote the record.
    pub written_by: String,
}

/// A change the vault would announce to subscribed platforms.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub origin: String,
    pub payload: WebhookPayload,
}

struct FailurePlan {
    remaining: Option<usize>,
    error: VaultError,
}

#[derive(Default)]
struct VaultState {
    records: HashMap<GlobalId, StoredRecord>,
    order: Vec<GlobalId>,
    next_ids: VecDeque<GlobalId>,
    generated: u64,
    failures: HashMap<CallKind, FailurePlan>,
    calls: Vec<VaultCall>,
    webhooks: Vec<WebhookEvent>,
}

#[derive(Default)]
pub struct FakeVault {
    state: Mutex<VaultState>,
}

impl FakeVault {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, VaultState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// A transport for `platform`. Writes through it are attributed to that
    /// platform in the call log and in webhooks.
    pub fn transport(self: &Arc<Self>, platform: impl Into<String>) -> Arc<dyn VaultTransport> {
        Arc::new(PlatformTransport {
            vault: self.clone(),
            platform: platform.into(),
        })
    }

    /// Ids handed out by the next stores, in order. Afterwards ids are
    /// generated as `global-<n>`.
    pub fn queue_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state();
        state.next_ids.extend(ids.into_iter().map(GlobalId::new));
    }

    /// Fails the next `count` calls of `kind` with `error`.
    pub fn fail_next(&self, kind: CallKind, count: usize, error: VaultError) {
        self.state().failures.insert(
            kind,
            FailurePlan {
                remaining: Some(count),
                error,
            },
        );
    }

    pub fn fail_always(&self, kind: CallKind, error: VaultError) {
        self.state().failures.insert(
            kind,
            FailurePlan {
                remaining: None,
                error,
            },
        );
    }

    pub fn heal(&self) {
        self.state().failures.clear();
    }

    pub fn calls(&self) -> Vec<VaultCall> {
        self.state().calls.clone()
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<VaultCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn record(&self, id: &GlobalId) -> Option<StoredRecord> {
        self.state().records.get(id).cloned()
    }

    /// Records of `ontology` in creation order.
    pub fn records_of(&self, ontology: &str) -> Vec<StoredRecord> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|record| record.envelope.ontology == ontology)
            .cloned()
            .collect()
    }

    /// Reference records stored in `owner`'s vault.
    pub fn references_in(&self, owner: &W3Id) -> Vec<StoredRecord> {
        self.records_of(REFERENCE_ONTOLOGY)
            .into_iter()
            .filter(|record| record.owner.normalized() == owner.normalized())
            .collect()
    }

    pub fn take_webhooks(&self) -> Vec<WebhookEvent> {
        std::mem::take(&mut self.state().webhooks)
    }

    /// Seeds a record as if another platform had written it, and announces it.
    pub fn publish(&self, origin: &str, owner: W3Id, envelope: Envelope) -> WebhookPayload {
        let mut state = self.state();
        let payload = webhook_for(&owner, &envelope);
        state.order.push(envelope.id.clone());
        state.records.insert(
            envelope.id.clone(),
            StoredRecord {
                owner,
                envelope,
                written_by: origin.to_string(),
            },
        );
        state.webhooks.push(WebhookEvent {
            origin: origin.to_string(),
            payload: payload.clone(),
        });
        payload
    }

    fn injected_failure(state: &mut VaultState, kind: CallKind) -> Option<VaultError> {
        let plan = state.failures.get_mut(&kind)?;
        let fire = match plan.remaining.as_mut() {
            None => true,
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            Some(_) => false,
        };
        let error = plan.error.clone();
        if plan.remaining == Some(0) {
            state.failures.remove(&kind);
        }
        fire.then_some(error)
    }

    fn log(state: &mut VaultState, call: VaultCall) {
        state.calls.push(call);
    }
}

fn webhook_for(owner: &W3Id, envelope: &Envelope) -> WebhookPayload {
    WebhookPayload {
        schema_id: envelope.ontology.clone(),
        id: envelope.id.clone(),
        w3id: owner.clone(),
        data: envelope.payload.clone(),
    }
}

fn owner_of(endpoint: &str) -> Result<W3Id, VaultError> {
    endpoint
        .strip_prefix(ENDPOINT_PREFIX)
        .and_then(|rest| rest.strip_suffix(ENDPOINT_SUFFIX))
        .map(W3Id::new)
        .ok_or_else(|| VaultError::InvalidResponse(format!("unknown endpoint {endpoint}")))
}

struct PlatformTransport {
    vault: Arc<FakeVault>,
    platform: String,
}

impl PlatformTransport {
    fn call(
        &self,
        kind: CallKind,
        w3id: W3Id,
        ontology: Option<&str>,
        id: Option<GlobalId>,
    ) -> VaultCall {
        VaultCall {
            kind,
            platform: self.platform.clone(),
            w3id,
            ontology: ontology.map(str::to_string),
            id,
            at: Instant::now(),
            succeeded: false,
        }
    }
}

#[async_trait]
impl VaultTransport for PlatformTransport {
    async fn resolve(&self, w3id: &W3Id) -> Result<String, VaultError> {
        let mut state = self.vault.state();
        let mut call = self.call(CallKind::Resolve, w3id.clone(), None, None);
        if let Some(error) = FakeVault::injected_failure(&mut state, CallKind::Resolve) {
            FakeVault::log(&mut state, call);
            return Err(error);
        }
        call.succeeded = true;
        FakeVault::log(&mut state, call);
        Ok(format!("{ENDPOINT_PREFIX}{}{ENDPOINT_SUFFIX}", w3id.normalized()))
    }

    async fn store_meta_envelope(
        &self,
        endpoint: &str,
        input: &EnvelopeInput,
    ) -> Result<Envelope, VaultError> {
        let owner = owner_of(endpoint)?;
        let mut state = self.vault.state();
        let mut call = self.call(CallKind::Store, owner.clone(), Some(&input.ontology), None);
        if let Some(error) = FakeVault::injected_failure(&mut state, CallKind::Store) {
            FakeVault::log(&mut state, call);
            return Err(error);
        }

        let id = match state.next_ids.pop_front() {
            Some(id) => id,
            None => {
                state.generated += 1;
                GlobalId::new(format!("global-{}", state.generated))
            }
        };
        let envelope = Envelope {
            id: id.clone(),
            ontology: input.ontology.clone(),
            payload: input.payload.clone(),
            acl: input.acl.clone(),
        };
        if input.ontology != REFERENCE_ONTOLOGY {
            state.webhooks.push(WebhookEvent {
                origin: self.platform.clone(),
                payload: webhook_for(&owner, &envelope),
            });
        }
        state.order.push(id.clone());
        state.records.insert(
            id.clone(),
            StoredRecord {
                owner,
                envelope: envelope.clone(),
                written_by: self.platform.clone(),
            },
        );
        call.id = Some(id);
        call.succeeded = true;
        FakeVault::log(&mut state, call);
        Ok(envelope)
    }

    async fn update_meta_envelope_by_id(
        &self,
        endpoint: &str,
        id: &GlobalId,
        input: &EnvelopeInput,
    ) -> Result<(), VaultError> {
        let owner = owner_of(endpoint)?;
        let mut state = self.vault.state();
        let mut call = self.call(
            CallKind::Update,
            owner.clone(),
            Some(&input.ontology),
            Some(id.clone()),
        );
        if let Some(error) = FakeVault::injected_failure(&mut state, CallKind::Update) {
            FakeVault::log(&mut state, call);
            return Err(error);
        }

        let VaultState {
            records,
            calls,
            webhooks,
            ..
        } = &mut *state;
        let Some(record) = records.get_mut(id) else {
            calls.push(call);
            return Err(VaultError::Status {
                status: 404,
                message: format!("no meta envelope {id}"),
            });
        };
        record.envelope.payload = input.payload.clone();
        record.envelope.acl = input.acl.clone();
        record.written_by = self.platform.clone();
        webhooks.push(WebhookEvent {
            origin: self.platform.clone(),
            payload: webhook_for(&owner, &record.envelope),
        });
        call.succeeded = true;
        FakeVault::log(&mut state, call);
        Ok(())
    }
}
