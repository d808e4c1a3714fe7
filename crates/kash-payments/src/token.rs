//! Provider Token Cache
//!
//! Every call to the Tranzak API carries a bearer token obtained by
//! exchanging the app id and app key. Tokens are reused for 3/4 of their
//! declared lifetime so that a request started just before the cached expiry
//! still finishes with a valid token.
//!
//! Concurrent callers that find the cache empty or expired coalesce on a
//! single refresh: one of them authenticates, the others wait and reuse its
//! token.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use kash_core::Clock;

use crate::config::{TranzakConfig, AUTH_ENDPOINT};
use crate::error::{PaymentError, Result};

/// Token exchange response
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub access_token: String,

    /// Lifetime in seconds
    pub expires_in: i64,
}

/// Something that can mint a fresh provider token
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken>;
}

/// Credential exchange against `POST {apiBase}/v1/auth/token`
pub struct TranzakAuth {
    http: reqwest::Client,
    url: String,
    app_id: String,
    app_key: String,
}

impl TranzakAuth {
    pub fn new(http: reqwest::Client, config: &TranzakConfig) -> Self {
        Self {
            http,
            url: format!("{}{}", config.api_url, AUTH_ENDPOINT),
            app_id: config.app_id.clone(),
            app_key: config.app_key.clone(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthRequest<'a> {
    app_id: &'a str,
    app_key: &'a str,
}

#[async_trait]
impl TokenSource for TranzakAuth {
    async fn fetch_token(&self) -> Result<AccessToken> {
        let response = self
            .http
            .post(&self.url)
            .json(&AuthRequest {
                app_id: &self.app_id,
                app_key: &self.app_key,
            })
            .send()
            .await
            .map_err(|e| PaymentError::Authentication(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let message = crate::gateway::provider_message(response, "Failed to authenticate with Tranzak").await;
            tracing::warn!(status = %status, message = %message, "Tranzak token exchange rejected");
            return Err(PaymentError::Authentication(message));
        }

        response
            .json::<AccessToken>()
            .await
            .map_err(|e| PaymentError::Authentication(format!("invalid token response: {e}")))
    }
}

#[derive(Clone, Debug)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Shared bearer-token cache with single-flight refresh
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    clock: Arc<dyn Clock>,
    ratio: f64,
    cached: RwLock<Option<CachedToken>>,
    refresh: Mutex<()>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>, clock: Arc<dyn Clock>) -> Self {
        Self::with_ratio(source, clock, crate::config::TOKEN_CACHE_RATIO)
    }

    pub fn with_ratio(source: Arc<dyn TokenSource>, clock: Arc<dyn Clock>, ratio: f64) -> Self {
        Self {
            source,
            clock,
            ratio,
            cached: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Return a valid token, authenticating at most once per expiry
    pub async fn get_token(&self) -> Result<String> {
        if let Some(token) = self.fresh().await {
            return Ok(token);
        }

        let _refresh = self.refresh.lock().await;

        // Someone else may have refreshed while we waited for the guard
        if let Some(token) = self.fresh().await {
            return Ok(token);
        }

        let issued_at = self.clock.now();
        let fetched = self.source.fetch_token().await.inspect_err(|e| {
            tracing::error!(error = %e, "Tranzak authentication failed");
        })?;

        let expires_at = issued_at
            .checked_add_signed(self.cache_lifetime(fetched.expires_in))
            .ok_or_else(|| {
                PaymentError::Authentication(format!("unusable token lifetime: expiresIn={}", fetched.expires_in))
            })?;
        *self.cached.write().await = Some(CachedToken {
            token: fetched.access_token.clone(),
            expires_at,
        });

        tracing::debug!(expires_at = %expires_at, "Cached Tranzak access token");
        Ok(fetched.access_token)
    }

    /// Drop the cached token; the next call re-authenticates
    pub async fn clear(&self) {
        *self.cached.write().await = None;
    }

    async fn fresh(&self) -> Option<String> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|c| self.clock.now() < c.expires_at)
            .map(|c| c.token.clone())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn cache_lifetime(&self, expires_in_secs: i64) -> Duration {
        let millis = (expires_in_secs.max(0) as f64 * 1000.0 * self.ratio) as i64;
        Duration::milliseconds(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kash_core::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        expires_in: i64,
        fail: bool,
    }

    impl CountingSource {
        fn new(expires_in: i64) -> Self {
            Self { calls: AtomicUsize::new(0), expires_in, fail: false }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch_token(&self) -> Result<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            // Widen the race window for concurrent callers
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.fail {
                return Err(PaymentError::Authentication("invalid app key".into()));
            }
            Ok(AccessToken {
                access_token: format!("token-{n}"),
                expires_in: self.expires_in,
            })
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_token_reused_within_window() {
        let clock = Arc::new(ManualClock::new(start()));
        let source = Arc::new(CountingSource::new(3600));
        let cache = TokenCache::new(source.clone(), clock.clone());

        let first = cache.get_token().await.unwrap();
        clock.advance(Duration::minutes(44));
        let second = cache.get_token().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_at_three_quarters() {
        let clock = Arc::new(ManualClock::new(start()));
        let source = Arc::new(CountingSource::new(3600));
        let cache = TokenCache::new(source.clone(), clock.clone());

        cache.get_token().await.unwrap();
        // 3/4 of an hour: the cached entry is no longer used
        clock.advance(Duration::minutes(45));
        let refreshed = cache.get_token().await.unwrap();

        assert_eq!(refreshed, "token-2");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_single_flight() {
        let clock = Arc::new(ManualClock::new(start()));
        let source = Arc::new(CountingSource::new(3600));
        let cache = Arc::new(TokenCache::new(source.clone(), clock.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_token().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-1");
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_after_expiry_is_single_flight() {
        let clock = Arc::new(ManualClock::new(start()));
        let source = Arc::new(CountingSource::new(3600));
        let cache = Arc::new(TokenCache::new(source.clone(), clock.clone()));

        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        clock.advance(Duration::minutes(46));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_token().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-2");
        }
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_absurd_lifetime_is_an_authentication_error() {
        let clock = Arc::new(ManualClock::new(start()));
        let source = Arc::new(CountingSource::new(i64::MAX / 1000));
        let cache = TokenCache::new(source.clone(), clock);

        let err = cache.get_token().await.unwrap_err();
        assert!(matches!(err, PaymentError::Authentication(_)));
        assert!(cache.fresh().await.is_none());
    }

    #[tokio::test]
    async fn test_clear_forces_reauthentication() {
        let clock = Arc::new(ManualClock::new(start()));
        let source = Arc::new(CountingSource::new(3600));
        let cache = TokenCache::new(source.clone(), clock);

        cache.get_token().await.unwrap();
        cache.clear().await;
        assert_eq!(cache.get_token().await.unwrap(), "token-2");
    }

    #[tokio::test]
    async fn test_failure_leaves_cache_empty() {
        let clock = Arc::new(ManualClock::new(start()));
        let source = Arc::new(CountingSource { fail: true, ..CountingSource::new(3600) });
        let cache = TokenCache::new(source.clone(), clock);

        let err = cache.get_token().await.unwrap_err();
        assert!(matches!(err, PaymentError::Authentication(_)));
        assert!(cache.get_token().await.is_err());
        assert_eq!(source.calls(), 2);
    }
}
