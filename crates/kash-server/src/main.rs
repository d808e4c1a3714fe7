//! Kamer Kash Billing Server
//!
//! Axum-based server for plan checkout, subscription and license reads,
//! and the Tranzak settlement webhook.

mod handlers;
mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kash_core::{BillingStore, Clock, MemoryStore, SystemClock};
use kash_payments::{
    webhook_secret_from_env, CheckoutFlow, PaymentSweeper, Reconciler, TranzakClient,
    TranzakConfig, WebhookVerifier,
};
use kash_store::{SupabaseConfig, SupabaseStore};

use crate::handlers::{
    create_payment, current_license, current_subscription, get_payment, health_check,
    list_payments, list_plans, payment_outcome, sync_payment, tranzak_webhook, verify_license,
};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Initialize store
    let store: Arc<dyn BillingStore> = match SupabaseConfig::from_env() {
        Some(config) => {
            tracing::info!(url = %config.url, "✓ Using Supabase store");
            Arc::new(SupabaseStore::with_clock(&config, clock.clone())?)
        }
        None => {
            tracing::warn!("⚠ Supabase not configured - using in-memory store");
            tracing::warn!("  Set SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY in .env");
            Arc::new(MemoryStore::seeded(clock.clone()))
        }
    };

    let reconciler = Arc::new(Reconciler::new(store.clone(), clock.clone()));

    // Initialize payments
    let checkout = match TranzakConfig::from_env() {
        Ok(config) => {
            let gateway = Arc::new(TranzakClient::with_clock(&config, clock.clone())?);
            tracing::info!(api_url = %config.api_url, "✓ Tranzak configured");
            Some(Arc::new(CheckoutFlow::new(
                gateway,
                store.clone(),
                reconciler.clone(),
                config,
            )))
        }
        Err(e) => {
            tracing::warn!(reason = %e, "⚠ Tranzak not configured - payments disabled");
            tracing::warn!("  Set TRANZAK_APP_ID and TRANZAK_APP_KEY in .env");
            None
        }
    };

    let webhook = match webhook_secret_from_env() {
        Ok(secret) => Some(WebhookVerifier::new(secret)),
        Err(_) => {
            tracing::warn!("⚠ TRANZAK_WEBHOOK_SECRET not set - webhook disabled");
            None
        }
    };

    // Optional stale payment sweep
    if let Some(secs) = std::env::var("PAYMENT_SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
    {
        let sweeper = Arc::new(PaymentSweeper::new(store.clone(), clock.clone(), reconciler.clone())?);
        sweeper.spawn(Duration::from_secs(secs));
    }

    // Build application state
    let state = AppState {
        store,
        clock,
        reconciler,
        checkout,
        webhook,
    };

    let app = router(state);

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 kash-server running on http://{}", addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                      - Health check");
    tracing::info!("  GET  /api/plans                   - Active plans");
    tracing::info!("  POST /api/payments                - Start checkout");
    tracing::info!("  GET  /api/payments                - Payment history");
    tracing::info!("  GET  /api/payments/{{id}}           - Payment detail");
    tracing::info!("  POST /api/payments/{{id}}/sync      - Poll Tranzak");
    tracing::info!("  GET  /api/payments/{{id}}/outcome   - Return page read-back");
    tracing::info!("  GET  /api/subscription            - Current subscription");
    tracing::info!("  GET  /api/license                 - Active license");
    tracing::info!("  POST /api/license/verify          - Verify license key");
    tracing::info!("  POST /webhook/tranzak             - Tranzak webhook");
    tracing::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Routes, CORS and request tracing
pub(crate) fn router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & catalog
        .route("/health", get(health_check))
        .route("/api/plans", get(list_plans))
        // Payments
        .route("/api/payments", get(list_payments).post(create_payment))
        .route("/api/payments/{id}", get(get_payment))
        .route("/api/payments/{id}/sync", post(sync_payment))
        .route("/api/payments/{id}/outcome", get(payment_outcome))
        // Subscription & license
        .route("/api/subscription", get(current_subscription))
        .route("/api/license", get(current_license))
        .route("/api/license/verify", post(verify_license))
        // Provider webhook
        .route("/webhook/tranzak", post(tranzak_webhook))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
