//! # kash-payments
//!
//! Tranzak mobile-money payments and subscription provisioning for Kamer Kash.
//!
//! ## Hosted Collection Flow
//!
//! The customer pays on Tranzak's hosted page (MTN Mobile Money, Orange
//! Money). The portal never sees card or wallet details.
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌─────────────┐
//! │   Signup /  │────▶│  Tranzak Hosted │────▶│   Portal    │
//! │   Pricing   │     │  Payment Page   │     │ /payment/.. │
//! └─────────────┘     └─────────────────┘     └─────────────┘
//!        │                     │                     ▲
//!        │ pending Payment     │ webhook             │ read-back
//!        ▼                     ▼                     │
//! ┌──────────────────────────────────────────────────┴──┐
//! │  Store: payments ─▶ subscriptions ─▶ licenses       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! 1. [`CheckoutFlow::start`] asks the gateway for a collection request and
//!    records a `pending` payment keyed by the provider request id.
//! 2. Tranzak posts a settlement to the webhook. [`WebhookVerifier`] checks
//!    the HMAC, then [`Reconciler::reconcile`] settles the payment and, for a
//!    completed payment not yet provisioned, starts or extends the
//!    subscription and issues or renews the license. A failed provisioning
//!    attempt is retried by the next delivery, sync or sweep.
//! 3. The return page calls [`CheckoutFlow::outcome`], which reads the stored
//!    status. [`CheckoutFlow::sync`] polls the provider when a webhook is late.
//!
//! Access tokens are cached by [`TokenCache`] for 75% of their declared
//! lifetime.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kash_payments::{CheckoutFlow, Reconciler, TranzakClient, TranzakConfig};
//!
//! let config = TranzakConfig::from_env()?;
//! let gateway = Arc::new(TranzakClient::new(&config)?);
//! let reconciler = Arc::new(Reconciler::new(store.clone(), clock.clone()));
//! let checkout = CheckoutFlow::new(gateway, store, reconciler, config);
//!
//! match checkout.start_after_signup(user_id, Some("plus")).await {
//!     NextStep::Pay { payment_url, .. } => { /* redirect to payment_url */ }
//!     NextStep::Dashboard { notice } => { /* /dashboard */ }
//! }
//! ```

mod checkout;
mod config;
mod error;
mod gateway;
mod reconcile;
mod sweep;
mod token;
mod webhook;

pub use checkout::{CheckoutFlow, NextStep, PaymentOutcome, SyncReport};
pub use config::{
    webhook_secret_from_env, TranzakConfig, AUTH_ENDPOINT, COLLECTIONS_ENDPOINT, PAYMENT_TIMEOUT,
    PRODUCTION_URL, PROVISIONING_LEASE_MINUTES, SANDBOX_URL, SWEEP_GRACE, TOKEN_CACHE_RATIO,
};
pub use error::{PaymentError, Result};
pub use gateway::{
    CollectionCreated, CollectionRequest, CollectionState, CollectionStatus, PaymentGateway,
    TranzakClient,
};
pub use reconcile::{Provisioning, ReconcileReport, Reconciler, Transition, Upsert};
pub use sweep::{PaymentSweeper, SweepReport};
pub use token::{AccessToken, TokenCache, TokenSource, TranzakAuth};
pub use webhook::{SettlementEvent, SettlementKind, WebhookVerifier, SIGNATURE_HEADER};
