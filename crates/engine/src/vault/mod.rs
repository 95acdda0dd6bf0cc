//! Vault access: endpoint resolution through the registry, envelope writes,
//! and bounded retry with exponential backoff.

mod http;

pub use http::HttpTransport;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use w3sync_core::reference::VaultReference;
use w3sync_core::{Envelope, EnvelopeInput, GlobalId, Row, W3Id};

pub const REFERENCE_ONTOLOGY: &str = "reference";
pub const REFERENCE_FIELD: &str = "_by_reference";

#[derive(Debug, Clone, Error)]
pub enum VaultError {
    #[error("vault returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("graphql error: {0}")]
    GraphQl(String),

    #[error("platform certification failed: {0}")]
    Certification(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<VaultError> },
}

impl VaultError {
    /// Auth failures, unknown identities and malformed responses will not
    /// fix themselves; everything else is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => !matches!(status, 401 | 403 | 404),
            Self::Transport(_) | Self::GraphQl(_) | Self::Certification(_) => true,
            Self::InvalidResponse(_) | Self::Exhausted { .. } => false,
        }
    }

    /// Whether the cached endpoint should be dropped and re-resolved.
    pub fn evicts_endpoint(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Wire operations against the registry and a resolved vault endpoint.
#[async_trait]
pub trait VaultTransport: Send + Sync {
    /// Returns the structured-query endpoint for `w3id`.
    async fn resolve(&self, w3id: &W3Id) -> Result<String, VaultError>;

    async fn store_meta_envelope(
        &self,
        endpoint: &str,
        input: &EnvelopeInput,
    ) -> Result<Envelope, VaultError>;

    async fn update_meta_envelope_by_id(
        &self,
        endpoint: &str,
        id: &GlobalId,
        input: &EnvelopeInput,
    ) -> Result<(), VaultError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(1), Duration::from_secs(15))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max_delay,
        }
    }

    /// Delay after the failed attempt `attempt` (zero-based):
    /// `min(base * 2^attempt, max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::from_millis(1);
        }
        let multiplier = 1u64 << attempt.min(16);
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(multiplier).max(1);
        if max_ms == 0 {
            Duration::from_millis(delay_ms)
        } else {
            Duration::from_millis(delay_ms.min(max_ms))
        }
    }
}

/// Envelope operations addressed by identity, with a per-identity endpoint
/// cache and retries.
pub struct VaultClient {
    transport: Arc<dyn VaultTransport>,
    endpoints: Mutex<HashMap<W3Id, String>>,
    retry: RetryPolicy,
}

impl VaultClient {
    pub fn new(transport: Arc<dyn VaultTransport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            endpoints: Mutex::new(HashMap::new()),
            retry,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn endpoints(&self) -> MutexGuard<'_, HashMap<W3Id, String>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cached_endpoint(&self, w3id: &W3Id) -> Option<String> {
        self.endpoints().get(w3id).cloned()
    }

    async fn endpoint(&self, w3id: &W3Id) -> Result<String, VaultError> {
        if let Some(endpoint) = self.cached_endpoint(w3id) {
            return Ok(endpoint);
        }
        let endpoint = self.transport.resolve(w3id).await?;
        debug!(%w3id, %endpoint, "resolved vault endpoint");
        self.endpoints().insert(w3id.clone(), endpoint.clone());
        Ok(endpoint)
    }

    fn evict(&self, w3id: &W3Id) {
        if self.endpoints().remove(w3id).is_some() {
            debug!(%w3id, "evicted cached vault endpoint");
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        w3id: &W3Id,
        operation: &'static str,
        call: F,
    ) -> Result<T, VaultError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, VaultError>>,
    {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let result = match self.endpoint(w3id).await {
                Ok(endpoint) => call(endpoint).await,
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.evicts_endpoint() {
                self.evict(w3id);
            }
            attempt += 1;
            if !err.is_retryable() {
                warn!(%w3id, operation, attempt, error = %err, "vault call failed permanently");
                return Err(err);
            }
            if attempt >= attempts {
                error!(%w3id, operation, attempts, error = %err, "vault call retries exhausted");
                return Err(VaultError::Exhausted {
                    attempts,
                    last: Box::new(err),
                });
            }
            let delay = self.retry.delay_for(attempt - 1);
            warn!(
                %w3id,
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "vault call failed, retrying"
            );
            sleep(delay).await;
        }
    }

    /// Creates a record in `w3id`'s vault and returns the id the vault assigned.
    pub async fn store_meta_envelope(
        &self,
        w3id: &W3Id,
        input: &EnvelopeInput,
    ) -> Result<GlobalId, VaultError> {
        let envelope = self
            .with_retry(w3id, "storeMetaEnvelope", |endpoint| async move {
                self.transport.store_meta_envelope(&endpoint, input).await
            })
            .await?;
        Ok(envelope.id)
    }

    pub async fn update_meta_envelope_by_id(
        &self,
        w3id: &W3Id,
        id: &GlobalId,
        input: &EnvelopeInput,
    ) -> Result<(), VaultError> {
        self.with_retry(w3id, "updateMetaEnvelopeById", |endpoint| async move {
            self.transport
                .update_meta_envelope_by_id(&endpoint, id, input)
                .await
        })
        .await
    }

    /// Makes `reference` discoverable from `target`'s vault.
    pub async fn store_reference(
        &self,
        reference: &VaultReference,
        target: &W3Id,
    ) -> Result<GlobalId, VaultError> {
        let input = reference_input(reference);
        self.store_meta_envelope(target, &input).await
    }
}

pub fn reference_input(reference: &VaultReference) -> EnvelopeInput {
    let mut payload = Row::new();
    payload.insert(
        REFERENCE_FIELD.to_string(),
        Value::String(reference.to_string()),
    );
    EnvelopeInput::new(REFERENCE_ONTOLOGY, payload, vec!["*".to_string()])
}
