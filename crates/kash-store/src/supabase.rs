//! Supabase Store
//!
//! [`BillingStore`] over Supabase's PostgREST endpoint (`{url}/rest/v1`).
//! Every call is one HTTP request on one table; the guarded payment status
//! write is a filtered PATCH that only matches while the row is `pending`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use kash_core::{
    BillingStore, Clock, License, LicenseKey, LicenseKeyGenerator, LicenseStore, NewLicense,
    NewPayment, NewSubscription, Payment, PaymentStatus, PaymentStatusUpdate, PaymentStore, Plan,
    PlanStore, Result, StatusChange, StoreError, Subscription, SubscriptionRenewal,
    SubscriptionStore, SystemClock,
};

/// Supabase connection settings
#[derive(Clone)]
pub struct SupabaseConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`
    pub url: String,

    /// Service-role key; bypasses row level security
    pub service_key: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl std::fmt::Debug for SupabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseConfig")
            .field("url", &self.url)
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

impl SupabaseConfig {
    /// `SUPABASE_URL` and `SUPABASE_SERVICE_ROLE_KEY`; `None` when either is unset
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let url = lookup("SUPABASE_URL").filter(|v| !v.is_empty())?;
        let service_key = lookup("SUPABASE_SERVICE_ROLE_KEY").filter(|v| !v.is_empty())?;
        let timeout_secs = lookup("SUPABASE_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(15);

        Some(Self {
            url: url.trim_end_matches('/').to_string(),
            service_key,
            timeout_secs,
        })
    }
}

/// PostgREST-backed billing store
pub struct SupabaseStore {
    http: reqwest::Client,
    rest_url: String,
    clock: Arc<dyn Clock>,
}

type Query<'a> = [(&'a str, String)];

impl SupabaseStore {
    pub fn new(config: &SupabaseConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// `clock` stamps `updated_at`; row creation times come from the database
    pub fn with_clock(config: &SupabaseConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.service_key)
            .map_err(|_| StoreError::Backend("service key is not a valid header value".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.service_key))
            .map_err(|_| StoreError::Backend("service key is not a valid header value".into()))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(backend)?;

        Ok(Self {
            http,
            rest_url: format!("{}/rest/v1", config.url),
            clock,
        })
    }

    async fn select<T: DeserializeOwned>(&self, table: &str, query: &Query<'_>) -> Result<Vec<T>> {
        let response = self
            .http
            .get(format!("{}/{table}", self.rest_url))
            .query(&[("select", "*")])
            .query(query)
            .send()
            .await
            .map_err(backend)?;
        rows(response, table).await
    }

    async fn select_first<T: DeserializeOwned>(&self, table: &str, query: &Query<'_>) -> Result<Option<T>> {
        Ok(self.select(table, query).await?.into_iter().next())
    }

    async fn insert<T: DeserializeOwned, B: Serialize + Sync>(&self, table: &str, body: &B) -> Result<T> {
        let response = self
            .http
            .post(format!("{}/{table}", self.rest_url))
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await
            .map_err(backend)?;
        let inserted: Vec<T> = rows(response, table).await?;
        inserted
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend(format!("insert into {table} returned no row")))
    }

    /// PATCH every row matching `filters`; returns the updated rows
    async fn update<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        table: &str,
        filters: &Query<'_>,
        body: &B,
    ) -> Result<Vec<T>> {
        let response = self
            .http
            .patch(format!("{}/{table}", self.rest_url))
            .header("Prefer", "return=representation")
            .query(filters)
            .json(body)
            .send()
            .await
            .map_err(backend)?;
        rows(response, table).await
    }

    async fn update_one<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        table: &str,
        id: Uuid,
        body: &B,
    ) -> Result<T> {
        self.update(table, &[("id", eq(id))], body)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("{table} {id}")))
    }
}

fn backend(e: reqwest::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

async fn rows<T: DeserializeOwned>(response: reqwest::Response, table: &str) -> Result<T> {
    let status = response.status();
    let body = response.bytes().await.map_err(backend)?;
    if !status.is_success() {
        let detail = String::from_utf8_lossy(&body);
        tracing::warn!(table, status = %status, detail = %detail, "PostgREST request failed");
        return Err(StoreError::Backend(format!("{table}: {status} {detail}")));
    }
    Ok(serde_json::from_slice(&body)?)
}

#[derive(Serialize)]
struct PaymentInsert<'a> {
    #[serde(flatten)]
    payment: &'a NewPayment,
    status: PaymentStatus,
}

#[derive(Serialize)]
struct Stamped<'a, B> {
    #[serde(flatten)]
    body: &'a B,
    updated_at: DateTime<Utc>,
}

#[async_trait]
impl PaymentStore for SupabaseStore {
    async fn create_payment(&self, payment: NewPayment) -> Result<Payment> {
        self.insert(
            "payments",
            &PaymentInsert {
                payment: &payment,
                status: PaymentStatus::Pending,
            },
        )
        .await
    }

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>> {
        self.select_first("payments", &[("id", eq(id))]).await
    }

    async fn get_payment_by_request_id(&self, request_id: &str) -> Result<Option<Payment>> {
        self.select_first("payments", &[("tranzak_request_id", eq(request_id))]).await
    }

    async fn list_payments_by_user(&self, user_id: Uuid) -> Result<Vec<Payment>> {
        self.select("payments", &[("user_id", eq(user_id)), ("order", "created_at.desc".into())])
            .await
    }

    async fn update_payment_status(&self, id: Uuid, update: PaymentStatusUpdate) -> Result<StatusChange> {
        let patch = Stamped {
            body: &update,
            updated_at: self.clock.now(),
        };
        let filters = [("id", eq(id)), ("status", eq(PaymentStatus::Pending.as_str()))];

        if let Some(applied) = self.update::<Payment, _>("payments", &filters, &patch).await?.into_iter().next() {
            return Ok(StatusChange::Applied(applied));
        }

        // No pending row matched: the payment is gone or already settled
        let current = self
            .get_payment(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("payment {id}")))?;
        StatusChange::classify(&current, update.status).ok_or_else(|| {
            StoreError::Backend(format!("guarded update on pending payment {id} matched no row"))
        })
    }

    async fn update_payment_method(&self, id: Uuid, payment_method: &str) -> Result<Payment> {
        let patch = Stamped {
            body: &serde_json::json!({ "payment_method": payment_method }),
            updated_at: self.clock.now(),
        };
        self.update_one("payments", id, &patch).await
    }

    async fn link_subscription(&self, id: Uuid, subscription_id: Uuid) -> Result<()> {
        let patch = Stamped {
            body: &serde_json::json!({ "subscription_id": subscription_id }),
            updated_at: self.clock.now(),
        };
        self.update_one::<Payment, _>("payments", id, &patch).await.map(|_| ())
    }

    async fn list_stale_pending(&self, created_before: DateTime<Utc>) -> Result<Vec<Payment>> {
        self.select(
            "payments",
            &[
                ("status", eq(PaymentStatus::Pending.as_str())),
                ("created_at", format!("lt.{}", timestamp(created_before))),
                ("order", "created_at.asc".into()),
            ],
        )
        .await
    }

    async fn claim_provisioning(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        let patch = Stamped {
            body: &serde_json::json!({ "provisioning_claimed_at": now }),
            updated_at: self.clock.now(),
        };
        let filters = [
            ("id", eq(id)),
            ("status", eq(PaymentStatus::Completed.as_str())),
            ("plan_id", "not.is.null".into()),
            ("provisioned_at", "is.null".into()),
            (
                "or",
                format!(
                    "(provisioning_claimed_at.is.null,provisioning_claimed_at.lt.{})",
                    timestamp(stale_before)
                ),
            ),
        ];
        Ok(self.update::<Payment, _>("payments", &filters, &patch).await?.into_iter().next())
    }

    async fn mark_provisioned(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let patch = Stamped {
            body: &serde_json::json!({ "provisioned_at": at, "provisioning_claimed_at": null }),
            updated_at: self.clock.now(),
        };
        self.update_one::<Payment, _>("payments", id, &patch).await.map(|_| ())
    }

    async fn release_provisioning(&self, id: Uuid) -> Result<()> {
        let patch = Stamped {
            body: &serde_json::json!({ "provisioning_claimed_at": null }),
            updated_at: self.clock.now(),
        };
        self.update_one::<Payment, _>("payments", id, &patch).await.map(|_| ())
    }

    async fn list_unprovisioned(&self, completed_before: DateTime<Utc>) -> Result<Vec<Payment>> {
        self.select(
            "payments",
            &[
                ("status", eq(PaymentStatus::Completed.as_str())),
                ("plan_id", "not.is.null".into()),
                ("provisioned_at", "is.null".into()),
                ("completed_at", format!("lt.{}", timestamp(completed_before))),
                ("order", "completed_at.asc".into()),
            ],
        )
        .await
    }
}

#[async_trait]
impl SubscriptionStore for SupabaseStore {
    async fn find_active_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        self.select_first(
            "subscriptions",
            &[
                ("user_id", eq(user_id)),
                ("status", eq("active")),
                ("order", "created_at.desc".into()),
                ("limit", "1".into()),
            ],
        )
        .await
    }

    async fn current_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        self.select_first(
            "subscriptions",
            &[
                ("user_id", eq(user_id)),
                ("order", "created_at.desc".into()),
                ("limit", "1".into()),
            ],
        )
        .await
    }

    async fn insert_subscription(&self, subscription: NewSubscription) -> Result<Subscription> {
        self.insert("subscriptions", &subscription).await
    }

    async fn extend_subscription(&self, id: Uuid, renewal: SubscriptionRenewal) -> Result<Subscription> {
        let patch = Stamped {
            body: &renewal,
            updated_at: self.clock.now(),
        };
        self.update_one("subscriptions", id, &patch).await
    }
}

#[async_trait]
impl LicenseStore for SupabaseStore {
    async fn find_active_license(&self, user_id: Uuid) -> Result<Option<License>> {
        self.select_first(
            "licenses",
            &[
                ("user_id", eq(user_id)),
                ("is_active", eq(true)),
                ("order", "created_at.desc".into()),
                ("limit", "1".into()),
            ],
        )
        .await
    }

    async fn get_license_by_key(&self, key: &LicenseKey) -> Result<Option<License>> {
        self.select_first("licenses", &[("license_key", eq(key))]).await
    }

    async fn insert_license(&self, license: NewLicense) -> Result<License> {
        self.insert("licenses", &license).await
    }

    async fn renew_license(&self, id: Uuid, expires_at: DateTime<Utc>) -> Result<License> {
        let patch = serde_json::json!({ "expires_at": expires_at, "is_active": true });
        self.update_one("licenses", id, &patch).await
    }
}

#[async_trait]
impl PlanStore for SupabaseStore {
    async fn get_plan(&self, id: Uuid) -> Result<Option<Plan>> {
        self.select_first("plans", &[("id", eq(id))]).await
    }

    async fn get_plan_by_name(&self, name: &str) -> Result<Option<Plan>> {
        self.select_first("plans", &[("name", eq(name)), ("is_active", eq(true))]).await
    }

    async fn list_active_plans(&self) -> Result<Vec<Plan>> {
        self.select("plans", &[("is_active", eq(true)), ("order", "price.asc".into())])
            .await
    }
}

#[async_trait]
impl LicenseKeyGenerator for SupabaseStore {
    /// Calls the `generate_license_key` database function
    async fn generate_license_key(&self) -> Result<LicenseKey> {
        let response = self
            .http
            .post(format!("{}/rpc/generate_license_key", self.rest_url))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(backend)?;
        let key: String = rows(response, "rpc/generate_license_key").await?;
        Ok(LicenseKey::from_string(key))
    }
}

impl BillingStore for SupabaseStore {
    fn backend(&self) -> &'static str {
        "supabase"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{RawQuery, State},
        http::HeaderMap as AxumHeaders,
        routing::{get, post},
        Json, Router,
    };
    use chrono::TimeZone;
    use kash_core::ManualClock;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct PostgRest {
        stored_status: Arc<Mutex<String>>,
        claimed: Arc<Mutex<bool>>,
        queries: Arc<Mutex<Vec<String>>>,
    }

    fn payment_row(status: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "7d7c5a3e-2b1f-4c8e-9a6d-1f2e3d4c5b6a",
            "user_id": "0b9e8f7a-6c5d-4e3f-8a1b-2c3d4e5f6a7b",
            "plan_id": null,
            "amount": 20000,
            "currency": "XAF",
            "tranzak_request_id": "REQ1",
            "status": status,
            "created_at": "2026-10-16T09:00:00Z",
            "updated_at": "2026-10-16T09:00:00Z",
        })
    }

    async fn read(State(db): State<PostgRest>, headers: AxumHeaders, RawQuery(q): RawQuery) -> Json<serde_json::Value> {
        assert_eq!(headers["apikey"], "service-key");
        assert_eq!(headers["authorization"], "Bearer service-key");
        db.queries.lock().unwrap().push(q.unwrap_or_default());
        let status = db.stored_status.lock().unwrap().clone();
        Json(serde_json::json!([payment_row(&status)]))
    }

    async fn patch(
        State(db): State<PostgRest>,
        RawQuery(q): RawQuery,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        let q = q.unwrap_or_default();
        db.queries.lock().unwrap().push(q.clone());
        if q.contains("provisioned_at=is.null") {
            let mut claimed = db.claimed.lock().unwrap();
            if *claimed {
                return Json(serde_json::json!([]));
            }
            *claimed = body["provisioning_claimed_at"].is_string();
            return Json(serde_json::json!([payment_row("completed")]));
        }
        if body.get("provisioning_claimed_at").is_some_and(serde_json::Value::is_null) {
            *db.claimed.lock().unwrap() = false;
            return Json(serde_json::json!([payment_row("completed")]));
        }
        let mut stored = db.stored_status.lock().unwrap();
        if q.contains("status=eq.pending") && *stored != "pending" {
            return Json(serde_json::json!([]));
        }
        let status = body["status"].as_str().unwrap_or("pending").to_string();
        *stored = status.clone();
        Json(serde_json::json!([payment_row(&status)]))
    }

    async fn license_key() -> Json<serde_json::Value> {
        Json(serde_json::json!("abcd-1234-ef56-7890"))
    }

    async fn store_against(db: PostgRest) -> SupabaseStore {
        let app = Router::new()
            .route("/rest/v1/payments", get(read).patch(patch))
            .route("/rest/v1/rpc/generate_license_key", post(license_key))
            .with_state(db);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let config = SupabaseConfig {
            url: format!("http://{addr}"),
            service_key: "service-key".into(),
            timeout_secs: 5,
        };
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 9, 5, 0).unwrap());
        SupabaseStore::with_clock(&config, Arc::new(clock)).unwrap()
    }

    #[test]
    fn test_config_requires_both_values() {
        let lookup = |key: &str| match key {
            "SUPABASE_URL" => Some("https://xyz.supabase.co/".to_string()),
            _ => None,
        };
        assert!(SupabaseConfig::from_lookup(lookup).is_none());

        let config = SupabaseConfig::from_lookup(|key: &str| match key {
            "SUPABASE_URL" => Some("https://xyz.supabase.co/".to_string()),
            "SUPABASE_SERVICE_ROLE_KEY" => Some("secret".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.url, "https://xyz.supabase.co");
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn test_timestamp_filter_format() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap();
        assert_eq!(timestamp(at), "2026-10-16T09:00:00.000000Z");
        assert_eq!(eq(true), "eq.true");
    }

    #[tokio::test]
    async fn test_guarded_update_applies_once() {
        let db = PostgRest {
            stored_status: Arc::new(Mutex::new("pending".into())),
            ..PostgRest::default()
        };
        let store = store_against(db.clone()).await;
        let id: Uuid = "7d7c5a3e-2b1f-4c8e-9a6d-1f2e3d4c5b6a".parse().unwrap();

        let first = store
            .update_payment_status(id, PaymentStatusUpdate::status(PaymentStatus::Completed))
            .await
            .unwrap();
        assert!(matches!(first, StatusChange::Applied(ref p) if p.status == PaymentStatus::Completed));

        let replay = store
            .update_payment_status(id, PaymentStatusUpdate::status(PaymentStatus::Completed))
            .await
            .unwrap();
        assert!(matches!(replay, StatusChange::Unchanged(_)));

        let conflict = store
            .update_payment_status(id, PaymentStatusUpdate::status(PaymentStatus::Failed))
            .await
            .unwrap();
        assert!(matches!(conflict, StatusChange::Rejected(_)));

        let queries = db.queries.lock().unwrap();
        assert!(queries[0].contains(&format!("id=eq.{id}")));
        assert!(queries[0].contains("status=eq.pending"));
    }

    #[tokio::test]
    async fn test_provisioning_claim_is_a_filtered_patch() {
        let db = PostgRest::default();
        let store = store_against(db.clone()).await;
        let id: Uuid = "7d7c5a3e-2b1f-4c8e-9a6d-1f2e3d4c5b6a".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 9, 5, 0).unwrap();
        let stale_before = Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap();

        assert!(store.claim_provisioning(id, now, stale_before).await.unwrap().is_some());
        assert!(store.claim_provisioning(id, now, stale_before).await.unwrap().is_none());
        store.release_provisioning(id).await.unwrap();
        assert!(store.claim_provisioning(id, now, stale_before).await.unwrap().is_some());

        let queries = db.queries.lock().unwrap();
        let claim = &queries[0];
        assert!(claim.contains(&format!("id=eq.{id}")));
        assert!(claim.contains("status=eq.completed"));
        assert!(claim.contains("provisioned_at=is.null"));
        assert!(claim.contains("or=%28provisioning_claimed_at.is.null%2Cprovisioning_claimed_at.lt.2026-10-16T09%3A00%3A00.000000Z%29"));
    }

    #[tokio::test]
    async fn test_license_key_rpc_normalizes() {
        let store = store_against(PostgRest::default()).await;
        let key = store.generate_license_key().await.unwrap();
        assert_eq!(key.as_str(), "ABCD-1234-EF56-7890");
    }
}
