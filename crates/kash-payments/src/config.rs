//! Tranzak Configuration

use std::time::Duration;

use crate::error::{PaymentError, Result};

pub const SANDBOX_URL: &str = "https://sandbox.dsapi.tranzak.me";
pub const PRODUCTION_URL: &str = "https://dsapi.tranzak.me";

pub const AUTH_ENDPOINT: &str = "/v1/auth/token";
pub const COLLECTIONS_ENDPOINT: &str = "/v1/requests/collections";

/// Validity window the provider gives a collection request
pub const PAYMENT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Extra wait past [`PAYMENT_TIMEOUT`] before the sweep cancels a pending
/// payment, so a settlement paid at the deadline can still land
pub const SWEEP_GRACE: Duration = Duration::from_secs(5 * 60);

/// Minutes a provisioning claim blocks other attempts before it counts as
/// abandoned
pub const PROVISIONING_LEASE_MINUTES: i64 = 5;

/// Fraction of the declared token lifetime a cached token is reused for
pub const TOKEN_CACHE_RATIO: f64 = 0.75;

/// Provider and redirect settings
#[derive(Clone, Debug)]
pub struct TranzakConfig {
    /// API base URL (sandbox or production)
    pub api_url: String,

    pub app_id: String,

    pub app_key: String,

    /// Public URL of the portal, used to build redirect URLs
    pub app_url: String,

    /// Product name used in payment descriptions
    pub product_name: String,

    pub currency: String,

    pub token_cache_ratio: f64,

    /// HTTP timeout for provider calls
    pub timeout: Duration,
}

impl TranzakConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (environment, test fixtures)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let app_id = lookup("TRANZAK_APP_ID")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PaymentError::Config("TRANZAK_APP_ID not set".into()))?;
        let app_key = lookup("TRANZAK_APP_KEY")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PaymentError::Config("TRANZAK_APP_KEY not set".into()))?;

        let api_url = lookup("TRANZAK_API_URL").unwrap_or_else(|| SANDBOX_URL.into());
        let app_url = lookup("APP_URL").unwrap_or_else(|| "http://localhost:3000".into());

        let config = Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            app_id,
            app_key,
            app_url: app_url.trim_end_matches('/').to_string(),
            product_name: lookup("PRODUCT_NAME").unwrap_or_else(|| "KAMER KASH PME".into()),
            currency: kash_core::DEFAULT_CURRENCY.into(),
            token_cache_ratio: TOKEN_CACHE_RATIO,
            timeout: Duration::from_secs(30),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.token_cache_ratio > 0.0 && self.token_cache_ratio < 1.0) {
            return Err(PaymentError::Config(format!(
                "token cache ratio must be within (0, 1), got {}",
                self.token_cache_ratio
            )));
        }
        if !self.api_url.starts_with("http") {
            return Err(PaymentError::Config(format!("invalid TRANZAK_API_URL: {}", self.api_url)));
        }
        Ok(())
    }

    pub fn success_url(&self) -> String {
        format!("{}/payment/success", self.app_url)
    }

    pub fn failure_url(&self) -> String {
        format!("{}/payment/failure", self.app_url)
    }
}

/// Webhook secret from `TRANZAK_WEBHOOK_SECRET`
pub fn webhook_secret_from_env() -> Result<String> {
    std::env::var("TRANZAK_WEBHOOK_SECRET")
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PaymentError::Config("TRANZAK_WEBHOOK_SECRET not set".into()))
}
