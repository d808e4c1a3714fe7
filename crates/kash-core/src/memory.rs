//! In-memory billing store (for development and tests)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StoreError};
use crate::license::{License, LicenseKey, NewLicense};
use crate::payment::{NewPayment, Payment, PaymentStatus, PaymentStatusUpdate, StatusChange};
use crate::plan::Plan;
use crate::store::{
    BillingStore, LicenseKeyGenerator, LicenseStore, PaymentStore, PlanStore, SubscriptionStore,
};
use crate::subscription::{NewSubscription, Subscription, SubscriptionRenewal, SubscriptionStatus};

#[derive(Default)]
struct Tables {
    payments: HashMap<Uuid, Payment>,
    /// Insertion order is creation order
    subscriptions: Vec<Subscription>,
    licenses: Vec<License>,
    plans: Vec<Plan>,
}

/// In-memory store
pub struct MemoryStore {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store on the wall clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
        }
    }

    /// Store pre-loaded with [`Plan::catalog`]
    pub fn seeded(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(Tables {
                plans: Plan::catalog(),
                ..Tables::default()
            }),
            clock,
        }
    }

    pub async fn add_plan(&self, plan: Plan) {
        self.tables.write().await.plans.push(plan);
    }

    /// Every subscription row for a user, oldest first
    pub async fn subscriptions_for(&self, user_id: Uuid) -> Vec<Subscription> {
        let tables = self.tables.read().await;
        tables.subscriptions.iter().filter(|s| s.user_id == user_id).cloned().collect()
    }

    /// Every license row for a user, oldest first
    pub async fn licenses_for(&self, user_id: Uuid) -> Vec<License> {
        let tables = self.tables.read().await;
        tables.licenses.iter().filter(|l| l.user_id == user_id).cloned().collect()
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn create_payment(&self, payment: NewPayment) -> Result<Payment> {
        let mut tables = self.tables.write().await;

        if tables
            .payments
            .values()
            .any(|p| p.request_id.as_deref() == Some(payment.request_id.as_str()))
        {
            return Err(StoreError::Backend(format!(
                "duplicate tranzak_request_id {}",
                payment.request_id
            )));
        }

        let now = self.clock.now();
        let row = Payment {
            id: Uuid::new_v4(),
            subscription_id: None,
            user_id: payment.user_id,
            plan_id: payment.plan_id,
            amount: payment.amount,
            currency: payment.currency,
            request_id: Some(payment.request_id),
            transaction_id: None,
            payment_url: Some(payment.payment_url),
            qr_code: payment.qr_code,
            status: PaymentStatus::Pending,
            payment_method: None,
            metadata: payment.metadata,
            webhook_data: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            provisioned_at: None,
            provisioning_claimed_at: None,
        };
        tables.payments.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>> {
        Ok(self.tables.read().await.payments.get(&id).cloned())
    }

    async fn get_payment_by_request_id(&self, request_id: &str) -> Result<Option<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .values()
            .find(|p| p.request_id.as_deref() == Some(request_id))
            .cloned())
    }

    async fn list_payments_by_user(&self, user_id: Uuid) -> Result<Vec<Payment>> {
        let tables = self.tables.read().await;
        let mut payments: Vec<Payment> = tables
            .payments
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }

    async fn update_payment_status(&self, id: Uuid, update: PaymentStatusUpdate) -> Result<StatusChange> {
        let mut tables = self.tables.write().await;
        let now = self.clock.now();

        let payment = tables
            .payments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {id}")))?;

        if let Some(refused) = StatusChange::classify(payment, update.status) {
            tracing::debug!(
                payment_id = %id,
                current = %payment.status,
                requested = %update.status,
                "Guarded status write refused"
            );
            return Ok(refused);
        }

        payment.status = update.status;
        if update.transaction_id.is_some() {
            payment.transaction_id = update.transaction_id;
        }
        if update.payment_method.is_some() {
            payment.payment_method = update.payment_method;
        }
        if update.webhook_data.is_some() {
            payment.webhook_data = update.webhook_data;
        }
        if update.completed_at.is_some() {
            payment.completed_at = update.completed_at;
        }
        payment.updated_at = now;

        Ok(StatusChange::Applied(payment.clone()))
    }

    async fn update_payment_method(&self, id: Uuid, payment_method: &str) -> Result<Payment> {
        let mut tables = self.tables.write().await;
        let now = self.clock.now();
        let payment = tables
            .payments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {id}")))?;
        payment.payment_method = Some(payment_method.to_string());
        payment.updated_at = now;
        Ok(payment.clone())
    }

    async fn link_subscription(&self, id: Uuid, subscription_id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        let now = self.clock.now();
        let payment = tables
            .payments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {id}")))?;
        payment.subscription_id = Some(subscription_id);
        payment.updated_at = now;
        Ok(())
    }

    async fn list_stale_pending(&self, created_before: DateTime<Utc>) -> Result<Vec<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Pending && p.created_at < created_before)
            .cloned()
            .collect())
    }

    async fn claim_provisioning(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        let mut tables = self.tables.write().await;
        let payment = tables
            .payments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {id}")))?;

        if !payment.can_claim_provisioning(stale_before) {
            tracing::debug!(
                payment_id = %id,
                claimed_at = ?payment.provisioning_claimed_at,
                provisioned_at = ?payment.provisioned_at,
                "Provisioning claim refused"
            );
            return Ok(None);
        }

        payment.provisioning_claimed_at = Some(now);
        payment.updated_at = self.clock.now();
        Ok(Some(payment.clone()))
    }

    async fn mark_provisioned(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let now = self.clock.now();
        let payment = tables
            .payments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {id}")))?;
        payment.provisioned_at = Some(at);
        payment.provisioning_claimed_at = None;
        payment.updated_at = now;
        Ok(())
    }

    async fn release_provisioning(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        let now = self.clock.now();
        let payment = tables
            .payments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {id}")))?;
        payment.provisioning_claimed_at = None;
        payment.updated_at = now;
        Ok(())
    }

    async fn list_unprovisioned(&self, completed_before: DateTime<Utc>) -> Result<Vec<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .values()
            .filter(|p| p.needs_provisioning() && p.completed_at.is_some_and(|at| at < completed_before))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn find_active_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        let tables = self.tables.read().await;
        Ok(tables
            .subscriptions
            .iter()
            .rev()
            .find(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
            .cloned())
    }

    async fn current_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        let tables = self.tables.read().await;
        Ok(tables.subscriptions.iter().rev().find(|s| s.user_id == user_id).cloned())
    }

    async fn insert_subscription(&self, subscription: NewSubscription) -> Result<Subscription> {
        let mut tables = self.tables.write().await;
        let now = self.clock.now();
        let row = Subscription {
            id: Uuid::new_v4(),
            user_id: subscription.user_id,
            plan_id: Some(subscription.plan_id),
            plan_name: Some(subscription.plan_name),
            status: subscription.status,
            start_date: Some(subscription.start_date),
            end_date: Some(subscription.end_date),
            amount: subscription.amount,
            currency: subscription.currency,
            max_users: Some(subscription.max_users),
            payment_method: subscription.payment_method,
            created_at: now,
            updated_at: now,
        };
        tables.subscriptions.push(row.clone());
        Ok(row)
    }

    async fn extend_subscription(&self, id: Uuid, renewal: SubscriptionRenewal) -> Result<Subscription> {
        let mut tables = self.tables.write().await;
        let now = self.clock.now();
        let row = tables
            .subscriptions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {id}")))?;
        row.end_date = Some(renewal.end_date);
        row.plan_id = Some(renewal.plan_id);
        row.plan_name = Some(renewal.plan_name);
        row.max_users = Some(renewal.max_users);
        row.amount = renewal.amount;
        row.status = renewal.status;
        row.updated_at = now;
        Ok(row.clone())
    }
}

#[async_trait]
impl LicenseStore for MemoryStore {
    async fn find_active_license(&self, user_id: Uuid) -> Result<Option<License>> {
        let tables = self.tables.read().await;
        Ok(tables
            .licenses
            .iter()
            .rev()
            .find(|l| l.user_id == user_id && l.is_active)
            .cloned())
    }

    async fn get_license_by_key(&self, key: &LicenseKey) -> Result<Option<License>> {
        let tables = self.tables.read().await;
        Ok(tables.licenses.iter().find(|l| &l.license_key == key).cloned())
    }

    async fn insert_license(&self, license: NewLicense) -> Result<License> {
        let mut tables = self.tables.write().await;

        if tables.licenses.iter().any(|l| l.license_key == license.license_key) {
            return Err(StoreError::Backend(format!(
                "duplicate license_key {}",
                license.license_key
            )));
        }

        let row = License {
            id: Uuid::new_v4(),
            user_id: license.user_id,
            license_key: license.license_key,
            device_fingerprint: None,
            activated_at: None,
            expires_at: Some(license.expires_at),
            is_active: license.is_active,
            created_at: self.clock.now(),
        };
        tables.licenses.push(row.clone());
        Ok(row)
    }

    async fn renew_license(&self, id: Uuid, expires_at: DateTime<Utc>) -> Result<License> {
        let mut tables = self.tables.write().await;
        let row = tables
            .licenses
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("license {id}")))?;
        row.expires_at = Some(expires_at);
        row.is_active = true;
        Ok(row.clone())
    }
}

#[async_trait]
impl PlanStore for MemoryStore {
    async fn get_plan(&self, id: Uuid) -> Result<Option<Plan>> {
        let tables = self.tables.read().await;
        Ok(tables.plans.iter().find(|p| p.id == id).cloned())
    }

    async fn get_plan_by_name(&self, name: &str) -> Result<Option<Plan>> {
        let tables = self.tables.read().await;
        Ok(tables
            .plans
            .iter()
            .find(|p| p.is_active && p.name == name)
            .cloned())
    }

    async fn list_active_plans(&self) -> Result<Vec<Plan>> {
        let tables = self.tables.read().await;
        let mut plans: Vec<Plan> = tables.plans.iter().filter(|p| p.is_active).cloned().collect();
        plans.sort_by_key(|p| p.price);
        Ok(plans)
    }
}

#[async_trait]
impl LicenseKeyGenerator for MemoryStore {
    async fn generate_license_key(&self) -> Result<LicenseKey> {
        Ok(LicenseKey::generate())
    }
}

impl BillingStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }
}
