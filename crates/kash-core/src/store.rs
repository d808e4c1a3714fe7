//! Store Abstractions
//!
//! Every persistent read or write the billing flow makes goes through these
//! traits. Calls are single-row and there is no cross-table transaction, so
//! callers order their writes so that a crash between two of them leaves a
//! state the next event can still converge from.
//!
//! Implementations:
//! - [`MemoryStore`](crate::memory::MemoryStore) for development and tests
//! - `SupabaseStore` in `kash-store` for the hosted database

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::license::{License, LicenseKey, NewLicense};
use crate::payment::{NewPayment, Payment, PaymentStatusUpdate, StatusChange};
use crate::plan::Plan;
use crate::subscription::{NewSubscription, Subscription, SubscriptionRenewal};

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Insert a `pending` payment
    async fn create_payment(&self, payment: NewPayment) -> Result<Payment>;

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>>;

    async fn get_payment_by_request_id(&self, request_id: &str) -> Result<Option<Payment>>;

    /// Newest first
    async fn list_payments_by_user(&self, user_id: Uuid) -> Result<Vec<Payment>>;

    /// Settle a payment.
    ///
    /// Writes only if the row is still `pending` (compare-and-set). A row
    /// already in the requested state yields [`StatusChange::Unchanged`], a
    /// row in another terminal state yields [`StatusChange::Rejected`].
    async fn update_payment_status(&self, id: Uuid, update: PaymentStatusUpdate) -> Result<StatusChange>;

    async fn update_payment_method(&self, id: Uuid, payment_method: &str) -> Result<Payment>;

    /// Stamp the subscription a payment funded
    async fn link_subscription(&self, id: Uuid, subscription_id: Uuid) -> Result<()>;

    /// Pending payments created strictly before `created_before`
    async fn list_stale_pending(&self, created_before: DateTime<Utc>) -> Result<Vec<Payment>>;

    /// Take the provisioning claim on a payment (compare-and-set).
    ///
    /// Succeeds only while [`Payment::can_claim_provisioning`] holds for
    /// `stale_before`, stamping `provisioning_claimed_at = now`. Returns the
    /// claimed row, or `None` when another attempt holds the claim or the
    /// payment needs no provisioning.
    async fn claim_provisioning(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Payment>>;

    /// Stamp `provisioned_at` and drop the claim
    async fn mark_provisioned(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Drop the claim without marking; the next attempt may start at once
    async fn release_provisioning(&self, id: Uuid) -> Result<()>;

    /// Completed payments for a plan, settled before `completed_before`,
    /// that were never provisioned
    async fn list_unprovisioned(&self, completed_before: DateTime<Utc>) -> Result<Vec<Payment>>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Most recently created subscription with status `active`
    async fn find_active_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>>;

    /// Most recently created subscription, any status
    async fn current_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>>;

    async fn insert_subscription(&self, subscription: NewSubscription) -> Result<Subscription>;

    async fn extend_subscription(&self, id: Uuid, renewal: SubscriptionRenewal) -> Result<Subscription>;
}

#[async_trait]
pub trait LicenseStore: Send + Sync {
    async fn find_active_license(&self, user_id: Uuid) -> Result<Option<License>>;

    async fn get_license_by_key(&self, key: &LicenseKey) -> Result<Option<License>>;

    async fn insert_license(&self, license: NewLicense) -> Result<License>;

    /// Move `expires_at` and force `is_active`; the key is untouched
    async fn renew_license(&self, id: Uuid, expires_at: DateTime<Utc>) -> Result<License>;
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn get_plan(&self, id: Uuid) -> Result<Option<Plan>>;

    /// Active plans only
    async fn get_plan_by_name(&self, name: &str) -> Result<Option<Plan>>;

    /// Active plans, cheapest first
    async fn list_active_plans(&self) -> Result<Vec<Plan>>;
}

/// Server-side license key minting
#[async_trait]
pub trait LicenseKeyGenerator: Send + Sync {
    async fn generate_license_key(&self) -> Result<LicenseKey>;
}

/// Everything the billing flow needs from persistence
pub trait BillingStore:
    PaymentStore + SubscriptionStore + LicenseStore + PlanStore + LicenseKeyGenerator
{
    /// Backend name for health output
    fn backend(&self) -> &'static str;
}
