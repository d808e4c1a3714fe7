//! Application State

use std::sync::Arc;

use kash_core::{BillingStore, Clock};
use kash_payments::{CheckoutFlow, Reconciler, WebhookVerifier};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Billing store (Supabase or in-memory)
    pub store: Arc<dyn BillingStore>,

    pub clock: Arc<dyn Clock>,

    /// Settlement reconciler; needs only the store
    pub reconciler: Arc<Reconciler>,

    /// Checkout flow (optional - None if Tranzak credentials are missing)
    pub checkout: Option<Arc<CheckoutFlow>>,

    /// Webhook signature gate (optional - None if no secret is configured)
    pub webhook: Option<WebhookVerifier>,
}
