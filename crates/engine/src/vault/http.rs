use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

use w3sync_core::{Envelope, EnvelopeInput, GlobalId, W3Id};

use super::{VaultError, VaultTransport};

const GRAPHQL_SUFFIX: &str = "/graphql";
const TOKEN_REFRESH_THRESHOLD_MS: i64 = 5 * 60 * 1000;
const DEFAULT_TOKEN_LIFETIME_MS: i64 = 60 * 60 * 1000;

const STORE_META_ENVELOPE: &str = r#"
mutation StoreMetaEnvelope($input: MetaEnvelopeInput!) {
  storeMetaEnvelope(input: $input) {
    metaEnvelope { id ontology parsed }
  }
}"#;

const UPDATE_META_ENVELOPE: &str = r#"
mutation UpdateMetaEnvelopeById($id: String!, $input: MetaEnvelopeInput!) {
  updateMetaEnvelopeById(id: $id, input: $input) {
    metaEnvelope { id ontology parsed }
  }
}"#;

#[derive(Deserialize)]
struct ResolveResponse {
    uri: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificationResponse {
    token: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaEnvelopePayload {
    meta_envelope: Envelope,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreData {
    store_meta_envelope: MetaEnvelopePayload,
}

struct PlatformToken {
    value: String,
    expires_at_ms: i64,
}

/// Registry and GraphQL transport over reqwest.
pub struct HttpTransport {
    http: reqwest::Client,
    registry_url: String,
    platform: String,
    token: Mutex<Option<PlatformToken>>,
}

impl HttpTransport {
    pub fn new(
        registry_url: impl Into<String>,
        platform: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, VaultError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            registry_url: registry_url.into(),
            platform: platform.into(),
            token: Mutex::new(None),
        })
    }

    fn registry_endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.registry_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Returns the cached platform token, certifying again when it is within
    /// five minutes of expiry.
    async fn platform_token(&self) -> Result<String, VaultError> {
        let mut cached = self.token.lock().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        if let Some(token) = cached.as_ref() {
            if token.expires_at_ms - now_ms > TOKEN_REFRESH_THRESHOLD_MS {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .post(self.registry_endpoint("platforms/certification"))
            .json(&json!({ "platform": self.platform }))
            .send()
            .await
            .map_err(|e| VaultError::Certification(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(VaultError::Certification(format!(
                "status {}",
                status.as_u16()
            )));
        }
        let body: CertificationResponse = response
            .json()
            .await
            .map_err(|e| VaultError::InvalidResponse(e.to_string()))?;

        let expires_at_ms = body
            .expires_at
            .unwrap_or(now_ms + DEFAULT_TOKEN_LIFETIME_MS);
        info!(platform = %self.platform, expires_at_ms, "platform certified");
        let value = body.token.clone();
        *cached = Some(PlatformToken {
            value: body.token,
            expires_at_ms,
        });
        Ok(value)
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &str,
        variables: Value,
    ) -> Result<T, VaultError> {
        let token = self.platform_token().await?;
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| VaultError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                // Force a fresh certification on the next call.
                *self.token.lock().await = None;
            }
            let message = response.text().await.unwrap_or_default();
            return Err(VaultError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body: GraphQlResponse<T> = response
            .json()
            .await
            .map_err(|e| VaultError::InvalidResponse(e.to_string()))?;
        if !body.errors.is_empty() {
            let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
            return Err(VaultError::GraphQl(messages.join("; ")));
        }
        body.data
            .ok_or_else(|| VaultError::InvalidResponse("response has no data".into()))
    }
}

#[async_trait]
impl VaultTransport for HttpTransport {
    async fn resolve(&self, w3id: &W3Id) -> Result<String, VaultError> {
        let response = self
            .http
            .get(self.registry_endpoint("resolve"))
            .query(&[("w3id", w3id.normalized())])
            .send()
            .await
            .map_err(|e| VaultError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(VaultError::Status {
                status: status.as_u16(),
                message,
            });
        }
        let body: ResolveResponse = response
            .json()
            .await
            .map_err(|e| VaultError::InvalidResponse(e.to_string()))?;
        if body.uri.is_empty() {
            return Err(VaultError::InvalidResponse(format!(
                "registry returned no uri for {w3id}"
            )));
        }
        let endpoint = format!("{}{GRAPHQL_SUFFIX}", body.uri.trim_end_matches('/'));
        debug!(%w3id, %endpoint, "registry resolved identity");
        Ok(endpoint)
    }

    async fn store_meta_envelope(
        &self,
        endpoint: &str,
        input: &EnvelopeInput,
    ) -> Result<Envelope, VaultError> {
        let data: StoreData = self
            .graphql(endpoint, STORE_META_ENVELOPE, json!({ "input": input }))
            .await?;
        Ok(data.store_meta_envelope.meta_envelope)
    }

    async fn update_meta_envelope_by_id(
        &self,
        endpoint: &str,
        id: &GlobalId,
        input: &EnvelopeInput,
    ) -> Result<(), VaultError> {
        let _: IgnoredAny = self
            .graphql(
                endpoint,
                UPDATE_META_ENVELOPE,
                json!({ "id": id, "input": input }),
            )
            .await?;
        Ok(())
    }
}
