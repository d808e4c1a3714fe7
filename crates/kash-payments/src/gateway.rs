//! Tranzak Collection API
//!
//! Creates hosted payment requests and reads their status. The client never
//! retries on its own; each call creates at most one provider-side resource.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use kash_core::{Clock, SystemClock};

use crate::config::{TranzakConfig, COLLECTIONS_ENDPOINT};
use crate::error::{PaymentError, Result};
use crate::token::{TokenCache, TranzakAuth};

/// Collection request sent to the provider
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRequest {
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub redirect_url: String,
    pub cancel_url: String,
    /// Passed through untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Provider answer to a collection request
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionCreated {
    pub request_id: String,
    pub payment_url: String,
    #[serde(default)]
    pub qr_code: Option<String>,
}

/// Provider-side state of a collection request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CollectionState {
    Pending,
    Successful,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStatus {
    pub request_id: String,
    pub status: CollectionState,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub amount: Option<serde_json::Number>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Payment provider (Strategy pattern)
///
/// `TranzakClient` talks to the real API; tests substitute fakes.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_request(&self, request: &CollectionRequest) -> Result<CollectionCreated>;

    async fn get_payment_status(&self, request_id: &str) -> Result<CollectionStatus>;

    /// Provider name
    fn name(&self) -> &str;
}

/// Tranzak API client
pub struct TranzakClient {
    http: reqwest::Client,
    collections_url: Url,
    tokens: TokenCache,
}

impl TranzakClient {
    /// Create a client with its own token cache on the wall clock
    pub fn new(config: &TranzakConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &TranzakConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PaymentError::Config(format!("HTTP client: {e}")))?;

        let collections_url = Url::parse(&format!("{}{}", config.api_url, COLLECTIONS_ENDPOINT))
            .map_err(|e| PaymentError::Config(format!("TRANZAK_API_URL: {e}")))?;

        let auth = Arc::new(TranzakAuth::new(http.clone(), config));
        Ok(Self {
            http,
            collections_url,
            tokens: TokenCache::with_ratio(auth, clock, config.token_cache_ratio),
        })
    }

    /// Token cache backing this client
    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    /// `{collections}/{request_id}` with the id as one escaped path segment
    fn status_url(&self, request_id: &str) -> Result<Url> {
        let mut url = self.collections_url.clone();
        url.path_segments_mut()
            .map_err(|()| PaymentError::Config(format!("collections URL has no path: {}", self.collections_url)))?
            .pop_if_empty()
            .push(request_id);
        Ok(url)
    }

    /// A 401 means the cached token is no longer accepted
    async fn note_rejection(&self, status: StatusCode) {
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!("Tranzak rejected cached token, clearing cache");
            self.tokens.clear().await;
        }
    }
}

#[async_trait]
impl PaymentGateway for TranzakClient {
    async fn create_payment_request(&self, request: &CollectionRequest) -> Result<CollectionCreated> {
        let token = self.tokens.get_token().await?;

        let response = self
            .http
            .post(self.collections_url.clone())
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(|e| PaymentError::PaymentRequest(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            self.note_rejection(status).await;
            let message = provider_message(response, "Failed to create payment request").await;
            tracing::error!(status = %status, message = %message, "Tranzak collection request failed");
            return Err(PaymentError::PaymentRequest(message));
        }

        let created: CollectionCreated = response
            .json()
            .await
            .map_err(|e| PaymentError::PaymentRequest(format!("invalid provider response: {e}")))?;

        tracing::info!(
            request_id = %created.request_id,
            amount = request.amount,
            currency = %request.currency,
            "Created Tranzak payment request"
        );
        Ok(created)
    }

    async fn get_payment_status(&self, request_id: &str) -> Result<CollectionStatus> {
        let url = self.status_url(request_id)?;
        let token = self.tokens.get_token().await?;

        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| PaymentError::PaymentStatus(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            self.note_rejection(status).await;
            let message = provider_message(response, "Failed to get payment status").await;
            tracing::warn!(request_id = %request_id, status = %status, message = %message, "Tranzak status query failed");
            return Err(PaymentError::PaymentStatus(message));
        }

        response
            .json()
            .await
            .map_err(|e| PaymentError::PaymentStatus(format!("malformed status response: {e}")))
    }

    fn name(&self) -> &str {
        "tranzak"
    }
}

#[derive(Deserialize)]
struct ProviderError {
    message: Option<String>,
}

/// Provider's `message` field from an error body, or `fallback`
pub(crate) async fn provider_message(response: reqwest::Response, fallback: &str) -> String {
    response
        .json::<ProviderError>()
        .await
        .ok()
        .and_then(|body| body.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
