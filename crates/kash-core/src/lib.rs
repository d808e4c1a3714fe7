//! # kash-core
//!
//! Billing domain model and persistence seams for the Kamer Kash customer
//! portal.
//!
//! ## Entities
//!
//! ```text
//! ┌──────────┐ funds  ┌──────────────┐        ┌──────────┐
//! │ Payment  │───────▶│ Subscription │        │ License  │
//! │ pending→ │        │ one active   │        │ one key  │
//! │ terminal │        │ per user     │        │ per user │
//! └──────────┘        └──────────────┘        └──────────┘
//!       │ plan_id            │ plan_id
//!       ▼                    ▼
//!   ┌──────────────────────────┐
//!   │           Plan           │
//!   └──────────────────────────┘
//! ```
//!
//! The store traits in [`store`] are the only way the payment flow touches
//! persistence. [`MemoryStore`] backs development and tests; the hosted
//! database lives behind `kash-store`. The `test-util` feature adds
//! `testing::FlakyStore` for fault injection.

pub mod clock;
pub mod error;
pub mod license;
pub mod memory;
pub mod payment;
pub mod plan;
pub mod store;
pub mod subscription;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use clock::{add_billing_period, Clock, ManualClock, SystemClock};
pub use error::{Result, StoreError};
pub use license::{License, LicenseKey, LicenseVerification, NewLicense};
pub use memory::MemoryStore;
pub use payment::{
    normalize_payment_method, NewPayment, Payment, PaymentStatus, PaymentStatusUpdate,
    StatusChange, DEFAULT_CURRENCY,
};
pub use plan::Plan;
pub use store::{
    BillingStore, LicenseKeyGenerator, LicenseStore, PaymentStore, PlanStore, SubscriptionStore,
};
pub use subscription::{NewSubscription, Subscription, SubscriptionRenewal, SubscriptionStatus};
