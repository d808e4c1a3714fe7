//! Fault injection for tests (`test-util` feature)
//!
//! [`FlakyStore`] wraps a [`MemoryStore`] and fails chosen calls a fixed
//! number of times with a retryable [`StoreError::Backend`], then behaves
//! like the inner store again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::license::{License, LicenseKey, NewLicense};
use crate::memory::MemoryStore;
use crate::payment::{NewPayment, Payment, PaymentStatusUpdate, StatusChange};
use crate::plan::Plan;
use crate::store::{
    BillingStore, LicenseKeyGenerator, LicenseStore, PaymentStore, PlanStore, SubscriptionStore,
};
use crate::subscription::{NewSubscription, Subscription, SubscriptionRenewal};

/// Store call that can be made to fail
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fault {
    PaymentLookup,
    StatusWrite,
    ClaimProvisioning,
    InsertSubscription,
    ExtendSubscription,
    LinkSubscription,
    InsertLicense,
    GenerateLicenseKey,
}

/// [`MemoryStore`] with injectable transient failures
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    faults: Mutex<HashMap<Fault, usize>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    /// Fail the next `times` calls of `fault`
    pub fn fail(&self, fault: Fault, times: usize) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fault, times);
    }

    fn trip(&self, fault: Fault) -> Result<()> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        match faults.get_mut(&fault) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(StoreError::Backend(format!("transient 503 on {fault:?}")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PaymentStore for FlakyStore {
    async fn create_payment(&self, payment: NewPayment) -> Result<Payment> {
        self.inner.create_payment(payment).await
    }

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>> {
        self.inner.get_payment(id).await
    }

    async fn get_payment_by_request_id(&self, request_id: &str) -> Result<Option<Payment>> {
        self.trip(Fault::PaymentLookup)?;
        self.inner.get_payment_by_request_id(request_id).await
    }

    async fn list_payments_by_user(&self, user_id: Uuid) -> Result<Vec<Payment>> {
        self.inner.list_payments_by_user(user_id).await
    }

    async fn update_payment_status(&self, id: Uuid, update: PaymentStatusUpdate) -> Result<StatusChange> {
        self.trip(Fault::StatusWrite)?;
        self.inner.update_payment_status(id, update).await
    }

    async fn update_payment_method(&self, id: Uuid, payment_method: &str) -> Result<Payment> {
        self.inner.update_payment_method(id, payment_method).await
    }

    async fn link_subscription(&self, id: Uuid, subscription_id: Uuid) -> Result<()> {
        self.trip(Fault::LinkSubscription)?;
        self.inner.link_subscription(id, subscription_id).await
    }

    async fn list_stale_pending(&self, created_before: DateTime<Utc>) -> Result<Vec<Payment>> {
        self.inner.list_stale_pending(created_before).await
    }

    async fn claim_provisioning(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        self.trip(Fault::ClaimProvisioning)?;
        self.inner.claim_provisioning(id, now, stale_before).await
    }

    async fn mark_provisioned(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.inner.mark_provisioned(id, at).await
    }

    async fn release_provisioning(&self, id: Uuid) -> Result<()> {
        self.inner.release_provisioning(id).await
    }

    async fn list_unprovisioned(&self, completed_before: DateTime<Utc>) -> Result<Vec<Payment>> {
        self.inner.list_unprovisioned(completed_before).await
    }
}

#[async_trait]
impl SubscriptionStore for FlakyStore {
    async fn find_active_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        self.inner.find_active_subscription(user_id).await
    }

    async fn current_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        self.inner.current_subscription(user_id).await
    }

    async fn insert_subscription(&self, subscription: NewSubscription) -> Result<Subscription> {
        self.trip(Fault::InsertSubscription)?;
        self.inner.insert_subscription(subscription).await
    }

    async fn extend_subscription(&self, id: Uuid, renewal: SubscriptionRenewal) -> Result<Subscription> {
        self.trip(Fault::ExtendSubscription)?;
        self.inner.extend_subscription(id, renewal).await
    }
}

#[async_trait]
impl LicenseStore for FlakyStore {
    async fn find_active_license(&self, user_id: Uuid) -> Result<Option<License>> {
        self.inner.find_active_license(user_id).await
    }

    async fn get_license_by_key(&self, key: &LicenseKey) -> Result<Option<License>> {
        self.inner.get_license_by_key(key).await
    }

    async fn insert_license(&self, license: NewLicense) -> Result<License> {
        self.trip(Fault::InsertLicense)?;
        self.inner.insert_license(license).await
    }

    async fn renew_license(&self, id: Uuid, expires_at: DateTime<Utc>) -> Result<License> {
        self.inner.renew_license(id, expires_at).await
    }
}

#[async_trait]
impl PlanStore for FlakyStore {
    async fn get_plan(&self, id: Uuid) -> Result<Option<Plan>> {
        self.inner.get_plan(id).await
    }

    async fn get_plan_by_name(&self, name: &str) -> Result<Option<Plan>> {
        self.inner.get_plan_by_name(name).await
    }

    async fn list_active_plans(&self) -> Result<Vec<Plan>> {
        self.inner.list_active_plans().await
    }
}

#[async_trait]
impl LicenseKeyGenerator for FlakyStore {
    async fn generate_license_key(&self) -> Result<LicenseKey> {
        self.trip(Fault::GenerateLicenseKey)?;
        self.inner.generate_license_key().await
    }
}

impl BillingStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky-memory"
    }
}
