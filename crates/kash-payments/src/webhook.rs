//! Tranzak Webhook Payloads
//!
//! Parsing and signature verification for settlement notifications. The
//! signature is checked on the raw body before anything is deserialized.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use kash_core::PaymentStatus;

use crate::error::{PaymentError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw body
pub const SIGNATURE_HEADER: &str = "x-tranzak-signature";

/// Terminal outcome reported by the provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SettlementKind {
    Successful,
    Failed,
}

impl SettlementKind {
    /// Payment status this outcome settles to
    pub fn payment_status(self) -> PaymentStatus {
        match self {
            SettlementKind::Successful => PaymentStatus::Completed,
            SettlementKind::Failed => PaymentStatus::Failed,
        }
    }
}

/// Settlement notification body
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementEvent {
    pub event: SettlementKind,
    pub request_id: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub amount: Option<serde_json::Number>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl SettlementEvent {
    /// Parse a verified body, keeping the raw JSON for audit
    pub fn parse(body: &[u8]) -> Result<(Self, serde_json::Value)> {
        let raw: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| PaymentError::WebhookParse(e.to_string()))?;
        let event = serde_json::from_value(raw.clone())
            .map_err(|e| PaymentError::WebhookParse(e.to_string()))?;
        Ok((event, raw))
    }
}

/// HMAC gate in front of the reconciler
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier").finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// Check `signature` (hex, optionally `sha256=`-prefixed) against `body`
    pub fn verify(&self, body: &[u8], signature: &str) -> Result<()> {
        let hex_sig = signature.trim();
        let hex_sig = hex_sig.strip_prefix("sha256=").unwrap_or(hex_sig);
        let provided = hex::decode(hex_sig)
            .map_err(|_| PaymentError::WebhookSignature("signature is not hex".into()))?;

        let mut mac = self.mac()?;
        mac.update(body);
        // verify_slice compares in constant time
        mac.verify_slice(&provided)
            .map_err(|_| PaymentError::WebhookSignature("signature mismatch".into()))
    }

    /// Hex signature for `body`; what the provider is expected to send
    pub fn sign(&self, body: &[u8]) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| PaymentError::Config("invalid webhook secret".into()))
    }
}
