//! HTTP Handlers

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use kash_core::{
    BillingStore, License, LicenseKey, LicenseStore, LicenseVerification, Payment, Plan, PlanStore,
    Subscription, SubscriptionStore,
};
use kash_payments::{
    CheckoutFlow, NextStep, PaymentError, PaymentOutcome, SettlementEvent, SyncReport,
    SIGNATURE_HEADER,
};

use crate::state::AppState;

/// Header set by the upstream auth layer
pub const USER_ID_HEADER: &str = "x-user-id";

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub store: &'static str,
    pub payments_configured: bool,
    pub webhook_configured: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type Rejection = (StatusCode, Json<ErrorResponse>);

fn reject(status: StatusCode, error: &str, code: &str) -> Rejection {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct CreatePaymentRequest {
    #[serde(default)]
    pub plan: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatePaymentResponse {
    #[serde(flatten)]
    pub step: NextStep,
    pub route: String,
}

#[derive(Debug, Serialize)]
pub struct OutcomeResponse {
    #[serde(flatten)]
    pub outcome: PaymentOutcome,
    pub route: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription: Option<Subscription>,
    /// Active and not past its end date
    pub current: bool,
}

#[derive(Debug, Serialize)]
pub struct LicenseResponse {
    pub license: Option<License>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyLicenseRequest {
    pub license_key: String,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub success: bool,
    pub message: &'static str,
}

// ============================================================================
// Extractors
// ============================================================================

/// Authenticated caller, from the `x-user-id` header
pub struct Caller(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(Caller)
            .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "Authentication required", "UNAUTHORIZED"))
    }
}

fn checkout(state: &AppState) -> Result<&Arc<CheckoutFlow>, PaymentError> {
    state
        .checkout
        .as_ref()
        .ok_or_else(|| PaymentError::Config("Tranzak credentials not configured".into()))
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        store: state.store.backend(),
        payments_configured: state.checkout.is_some(),
        webhook_configured: state.webhook.is_some(),
    })
}

/// Active plans, cheapest first
pub async fn list_plans(State(state): State<AppState>) -> Result<Json<Vec<Plan>>, PaymentError> {
    Ok(Json(state.store.list_active_plans().await?))
}

/// Start checkout after signup
pub async fn create_payment(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(payload): Json<CreatePaymentRequest>,
) -> Result<Json<CreatePaymentResponse>, PaymentError> {
    let step = checkout(&state)?
        .start_after_signup(user_id, payload.plan.as_deref())
        .await;
    let route = step.route();
    Ok(Json(CreatePaymentResponse { step, route }))
}

/// Payment history for the caller
pub async fn list_payments(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> Result<Json<Vec<Payment>>, PaymentError> {
    Ok(Json(checkout(&state)?.payments_for_user(user_id).await?))
}

pub async fn get_payment(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>, PaymentError> {
    Ok(Json(checkout(&state)?.payment_for(user_id, id).await?))
}

/// Poll Tranzak and converge the local record
pub async fn sync_payment(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncReport>, PaymentError> {
    Ok(Json(checkout(&state)?.sync(user_id, id).await?))
}

/// Return page read-back; never trusts redirect parameters
pub async fn payment_outcome(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<OutcomeResponse>, PaymentError> {
    let outcome = checkout(&state)?.outcome(user_id, id).await?;
    let route = outcome.route();
    Ok(Json(OutcomeResponse { outcome, route }))
}

pub async fn current_subscription(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> Result<Json<SubscriptionResponse>, PaymentError> {
    let subscription = state.store.current_subscription(user_id).await?;
    let current = subscription
        .as_ref()
        .is_some_and(|s| s.is_current(state.clock.now()));
    Ok(Json(SubscriptionResponse { subscription, current }))
}

pub async fn current_license(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> Result<Json<LicenseResponse>, PaymentError> {
    Ok(Json(LicenseResponse {
        license: state.store.find_active_license(user_id).await?,
    }))
}

/// Verify license key
pub async fn verify_license(
    State(state): State<AppState>,
    Json(payload): Json<VerifyLicenseRequest>,
) -> Json<LicenseVerification> {
    let key = LicenseKey::from_string(payload.license_key);

    match state.store.get_license_by_key(&key).await {
        Ok(Some(license)) => Json(LicenseVerification::check(&license, state.clock.now())),
        Ok(None) => Json(LicenseVerification::invalid("License not found or invalid")),
        Err(e) => {
            tracing::warn!(error = %e, "License lookup failed");
            Json(LicenseVerification::invalid("License could not be verified"))
        }
    }
}

/// Tranzak webhook handler
///
/// The signature is checked on the raw body before anything is parsed.
pub async fn tranzak_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, (StatusCode, Json<serde_json::Value>)> {
    let error = |status: StatusCode, body: serde_json::Value| (status, Json(body));

    let verifier = state.webhook.as_ref().ok_or_else(|| {
        error(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({"error": "Webhook not configured", "code": "PAYMENTS_DISABLED"}),
        )
    })?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Tranzak webhook without signature");
            error(
                StatusCode::BAD_REQUEST,
                serde_json::json!({"error": "Missing signature", "code": "MISSING_SIGNATURE"}),
            )
        })?;

    verifier.verify(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Tranzak webhook signature failed");
        error(
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": "Invalid signature", "code": e.code()}),
        )
    })?;

    let (event, raw) = SettlementEvent::parse(&body).map_err(|e| {
        tracing::warn!(error = %e, "Tranzak webhook payload rejected");
        error(
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": "Invalid payload", "code": e.code()}),
        )
    })?;

    match state.reconciler.reconcile(&event, raw).await {
        Ok(_) => Ok(Json(WebhookAck {
            success: true,
            message: "Webhook processed successfully",
        })),
        Err(PaymentError::NotFound(what)) => {
            tracing::error!(request_id = %event.request_id, what = %what, "Payment not found for settlement");
            Err(error(
                StatusCode::NOT_FOUND,
                serde_json::json!({"error": "Payment not found"}),
            ))
        }
        Err(e) => {
            tracing::error!(request_id = %event.request_id, error = %e, "Webhook processing error");
            Err(error(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"error": "Internal server error", "message": e.to_string()}),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{body::Body, http::Request, Router};
    use chrono::{TimeZone, Utc};
    use kash_core::testing::{Fault, FlakyStore};
    use kash_core::{Clock, ManualClock, MemoryStore};
    use kash_payments::{
        CollectionCreated, CollectionRequest, CollectionState, CollectionStatus, PaymentGateway,
        Reconciler, TranzakConfig, WebhookVerifier,
    };
    use tower::ServiceExt;

    const SECRET: &str = "whsec_test";

    struct StubGateway;

    #[async_trait]
    impl PaymentGateway for StubGateway {
        async fn create_payment_request(
            &self,
            _request: &CollectionRequest,
        ) -> kash_payments::Result<CollectionCreated> {
            Ok(CollectionCreated {
                request_id: "REQ1".into(),
                payment_url: "https://pay.tranzak.me/REQ1".into(),
                qr_code: None,
            })
        }

        async fn get_payment_status(&self, request_id: &str) -> kash_payments::Result<CollectionStatus> {
            Ok(CollectionStatus {
                request_id: request_id.into(),
                status: CollectionState::Pending,
                transaction_id: None,
                amount: None,
                currency: None,
                payment_method: None,
                metadata: None,
            })
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    fn app(with_payments: bool) -> (Router, Arc<MemoryStore>) {
        let clock: Arc<dyn Clock> =
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()));
        let memory = Arc::new(MemoryStore::seeded(clock.clone()));
        (app_over(memory.clone(), clock, with_payments), memory)
    }

    /// Payments enabled over a store with injectable failures
    fn flaky_app() -> (Router, Arc<FlakyStore>) {
        let clock: Arc<dyn Clock> =
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()));
        let flaky = Arc::new(FlakyStore::new(Arc::new(MemoryStore::seeded(clock.clone()))));
        (app_over(flaky.clone(), clock, true), flaky)
    }

    fn app_over(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>, with_payments: bool) -> Router {
        let reconciler = Arc::new(Reconciler::new(store.clone(), clock.clone()));

        let checkout = with_payments.then(|| {
            let config = TranzakConfig::from_lookup(|key: &str| match key {
                "TRANZAK_APP_ID" | "TRANZAK_APP_KEY" => Some("test".into()),
                _ => None,
            })
            .unwrap();
            Arc::new(CheckoutFlow::new(
                Arc::new(StubGateway),
                store.clone(),
                reconciler.clone(),
                config,
            ))
        });

        let state = AppState {
            store,
            clock,
            reconciler,
            checkout,
            webhook: with_payments.then(|| WebhookVerifier::new(SECRET)),
        };
        crate::router(state)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn as_user(method: &str, uri: &str, user: Uuid, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_ID_HEADER, user.to_string())
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn webhook(body: &serde_json::Value, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/webhook/tranzak");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn signed(body: &serde_json::Value) -> Option<String> {
        Some(WebhookVerifier::new(SECRET).sign(body.to_string().as_bytes()).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_configuration() {
        let (app, _) = app(false);
        let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");
        assert_eq!(body["payments_configured"], false);
    }

    #[tokio::test]
    async fn test_payment_routes_require_caller() {
        let (app, _) = app(true);
        let (status, body) = send(&app, Request::get("/api/payments").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_payments_disabled_without_credentials() {
        let (app, _) = app(false);
        let request = as_user("POST", "/api/payments", Uuid::new_v4(), serde_json::json!({"plan": "plus"}));
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "PAYMENTS_DISABLED");

        let (status, _) = send(&app, webhook(&serde_json::json!({}), None)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_webhook_rejects_missing_and_bad_signatures() {
        let (app, store) = app(true);
        let user = Uuid::new_v4();
        send(&app, as_user("POST", "/api/payments", user, serde_json::json!({"plan": "plus"}))).await;

        let body = serde_json::json!({"event": "SUCCESSFUL", "requestId": "REQ1"});
        let (status, reply) = send(&app, webhook(&body, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply["code"], "MISSING_SIGNATURE");

        let (status, reply) = send(&app, webhook(&body, Some("00ff".into()))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply["code"], "INVALID_SIGNATURE");

        assert!(store.current_subscription(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_webhook_unknown_request_is_not_found() {
        let (app, _) = app(true);
        let body = serde_json::json!({"event": "SUCCESSFUL", "requestId": "NOPE"});
        let (status, reply) = send(&app, webhook(&body, signed(&body))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(reply["error"], "Payment not found");
    }

    #[tokio::test]
    async fn test_checkout_to_outcome() {
        let (app, store) = app(true);
        let user = Uuid::new_v4();

        let (status, started) =
            send(&app, as_user("POST", "/api/payments", user, serde_json::json!({"plan": "plus"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(started["next"], "pay");
        assert_eq!(started["payment_url"], "https://pay.tranzak.me/REQ1");
        let payment_id = started["payment_id"].as_str().unwrap().to_string();
        assert_eq!(started["route"], format!("/payment/{payment_id}"));

        let outcome_uri = format!("/api/payments/{payment_id}/outcome");
        let (_, pending) = send(&app, as_user("GET", &outcome_uri, user, serde_json::Value::Null)).await;
        assert_eq!(pending["outcome"], "pending");

        let (status, _) = send(&app, as_user("GET", &outcome_uri, Uuid::new_v4(), serde_json::Value::Null)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let body = serde_json::json!({
            "event": "SUCCESSFUL",
            "requestId": "REQ1",
            "transactionId": "TX1",
            "status": "SUCCESSFUL",
            "paymentMethod": "mtn",
        });
        let (status, ack) = send(&app, webhook(&body, signed(&body))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["success"], true);

        // Redelivery is acknowledged without side effects
        let (status, _) = send(&app, webhook(&body, signed(&body))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(store.subscriptions_for(user).await.len(), 1);

        let (_, done) = send(&app, as_user("GET", &outcome_uri, user, serde_json::Value::Null)).await;
        assert_eq!(done["outcome"], "succeeded");
        assert_eq!(done["route"], "/payment/success");
        assert_eq!(done["subscription"]["plan_name"], "plus");

        let (_, sub) = send(&app, as_user("GET", "/api/subscription", user, serde_json::Value::Null)).await;
        assert_eq!(sub["current"], true);

        let (_, license) = send(&app, as_user("GET", "/api/license", user, serde_json::Value::Null)).await;
        let key = license["license"]["license_key"].as_str().unwrap().to_lowercase();

        let verify = Request::post("/api/license/verify")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"license_key": key}).to_string()))
            .unwrap();
        let (_, verification) = send(&app, verify).await;
        assert_eq!(verification["valid"], true);
    }

    #[tokio::test]
    async fn test_signup_without_plan_goes_to_dashboard() {
        let (app, _) = app(true);
        let (status, body) =
            send(&app, as_user("POST", "/api/payments", Uuid::new_v4(), serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["next"], "dashboard");
        assert_eq!(body["route"], "/dashboard");
    }

    #[tokio::test]
    async fn test_plans_listed_cheapest_first() {
        let (app, _) = app(false);
        let (status, body) = send(&app, Request::get("/api/plans").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<_> = body.as_array().unwrap().iter().map(|p| p["name"].clone()).collect();
        assert_eq!(names, ["start", "plus", "pro"]);
    }

    fn settled(request_id: &str) -> serde_json::Value {
        serde_json::json!({
            "event": "SUCCESSFUL",
            "requestId": request_id,
            "transactionId": "TX1",
            "status": "SUCCESSFUL",
            "paymentMethod": "orange",
        })
    }

    #[tokio::test]
    async fn test_webhook_store_failure_is_a_server_error() {
        let (app, flaky) = flaky_app();
        let user = Uuid::new_v4();
        send(&app, as_user("POST", "/api/payments", user, serde_json::json!({"plan": "plus"}))).await;
        let body = settled("REQ1");

        flaky.fail(Fault::StatusWrite, 1);
        let (status, reply) = send(&app, webhook(&body, signed(&body))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(reply["error"], "Internal server error");
        assert!(reply["message"].as_str().unwrap().contains("transient 503"));

        flaky.fail(Fault::PaymentLookup, 1);
        let (status, _) = send(&app, webhook(&body, signed(&body))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(flaky.inner().subscriptions_for(user).await.is_empty());

        // The provider retries after a 500 and the settlement goes through
        let (status, _) = send(&app, webhook(&body, signed(&body))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(flaky.inner().subscriptions_for(user).await.len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_provisioning_failure_is_acknowledged_and_retried() {
        let (app, flaky) = flaky_app();
        let user = Uuid::new_v4();
        let (_, started) =
            send(&app, as_user("POST", "/api/payments", user, serde_json::json!({"plan": "plus"}))).await;
        let payment_id = started["payment_id"].as_str().unwrap().to_string();
        let body = settled("REQ1");

        flaky.fail(Fault::GenerateLicenseKey, 1);
        let (status, ack) = send(&app, webhook(&body, signed(&body))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["success"], true);

        let memory = flaky.inner();
        assert_eq!(memory.subscriptions_for(user).await.len(), 1);
        assert!(memory.licenses_for(user).await.is_empty());

        let payment_uri = format!("/api/payments/{payment_id}");
        let (_, payment) = send(&app, as_user("GET", &payment_uri, user, serde_json::Value::Null)).await;
        assert_eq!(payment["status"], "completed");
        assert!(payment["provisioned_at"].is_null());

        // Redelivery finishes the license step
        let (status, _) = send(&app, webhook(&body, signed(&body))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(memory.subscriptions_for(user).await.len(), 1);
        assert_eq!(memory.licenses_for(user).await.len(), 1);

        let (_, payment) = send(&app, as_user("GET", &payment_uri, user, serde_json::Value::Null)).await;
        assert!(payment["provisioned_at"].is_string());
    }
}
