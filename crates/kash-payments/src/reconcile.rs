//! Settlement Reconciliation
//!
//! Turns one provider settlement notification into the matching Payment,
//! Subscription and License state. Delivery is at-least-once, so the payment
//! status goes through a guarded write and provisioning through a separate
//! claim on the payment row.
//!
//! Write order:
//!
//! ```text
//! payment status ──▶ claim ──▶ subscription upsert ──▶ payment.subscription_id
//!                                │
//!                                └──▶ license upsert ──▶ provisioned_at
//! ```
//!
//! The payment write is the commit point. Provisioning failures are reported
//! and logged, never rolled back: the claim is released and the next delivery,
//! sync or sweep for a completed payment without `provisioned_at` runs the
//! steps again. Each step converges on the same rows when repeated, because
//! the billing period is anchored on the payment's `completed_at`.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use kash_core::{
    add_billing_period, normalize_payment_method, BillingStore, Clock, LicenseKey,
    LicenseKeyGenerator, LicenseStore, NewLicense, NewSubscription, Payment, PaymentStatus,
    PaymentStatusUpdate, PaymentStore, Plan, PlanStore, StatusChange, SubscriptionRenewal,
    SubscriptionStatus, SubscriptionStore, DEFAULT_CURRENCY,
};

use crate::config::PROVISIONING_LEASE_MINUTES;
use crate::error::{PaymentError, Result};
use crate::webhook::SettlementEvent;

/// How the status write landed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Payment left `pending` with this delivery
    Applied,
    /// Payment already had this status; redelivery
    Duplicate,
    /// Payment is terminal with another status; event ignored
    Conflict,
}

/// Whether a step created a row or updated the existing one
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Upsert {
    Created,
    Extended,
}

/// Subscription and license side effects of a settlement
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Provisioning {
    /// Nothing to provision (not completed, no plan, or already provisioned)
    NotRequired,

    /// Another attempt holds the provisioning claim
    InProgress,

    Completed {
        subscription_id: Uuid,
        subscription: Upsert,
        license_key: LicenseKey,
        license: Upsert,
        end_date: DateTime<Utc>,
    },

    /// At least one step failed; the payment status stays committed and the
    /// next attempt starts over
    Failed {
        subscription_id: Option<Uuid>,
        license_key: Option<LicenseKey>,
        errors: Vec<String>,
    },
}

/// Outcome of one settlement
#[derive(Clone, Debug, Serialize)]
pub struct ReconcileReport {
    pub payment: Payment,
    pub transition: Transition,
    pub provisioning: Provisioning,
}

/// Webhook reconciler
pub struct Reconciler {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Apply a settlement event.
    ///
    /// Errors only when the payment could not be found or its status could
    /// not be written; provisioning trouble is part of the report.
    pub async fn reconcile(
        &self,
        event: &SettlementEvent,
        raw: serde_json::Value,
    ) -> Result<ReconcileReport> {
        tracing::info!(
            event = ?event.event,
            request_id = %event.request_id,
            transaction_id = ?event.transaction_id,
            status = %event.status,
            "Tranzak settlement received"
        );

        let payment = self
            .store
            .get_payment_by_request_id(&event.request_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment for request {}", event.request_id)))?;

        let now = self.clock.now();
        let target = event.event.payment_status();

        let update = PaymentStatusUpdate {
            status: target,
            transaction_id: event.transaction_id.clone(),
            payment_method: event.payment_method.as_deref().map(normalize_payment_method),
            webhook_data: Some(raw),
            completed_at: (target == PaymentStatus::Completed).then_some(now),
        };

        let (payment, transition) = match self.store.update_payment_status(payment.id, update).await? {
            StatusChange::Applied(p) => (p, Transition::Applied),
            StatusChange::Unchanged(p) => {
                tracing::info!(
                    payment_id = %p.id,
                    request_id = %event.request_id,
                    status = %p.status,
                    provisioned = p.provisioned_at.is_some(),
                    "Duplicate settlement, already applied"
                );
                (p, Transition::Duplicate)
            }
            StatusChange::Rejected(p) => {
                tracing::warn!(
                    payment_id = %p.id,
                    request_id = %event.request_id,
                    current = %p.status,
                    requested = %target,
                    "Settlement conflicts with terminal payment status, ignoring"
                );
                (p, Transition::Conflict)
            }
        };

        let provisioning = self.provision_payment(&payment).await;

        Ok(ReconcileReport {
            payment,
            transition,
            provisioning,
        })
    }

    /// Provision a completed payment that has not been provisioned yet.
    ///
    /// Safe to call for any payment and from concurrent callers: only the
    /// holder of the provisioning claim runs the steps.
    pub async fn provision_payment(&self, payment: &Payment) -> Provisioning {
        let Some(plan_id) = payment.plan_id.filter(|_| payment.needs_provisioning()) else {
            return Provisioning::NotRequired;
        };

        let now = self.clock.now();
        let stale_before = now - Duration::minutes(PROVISIONING_LEASE_MINUTES);
        let claimed = match self.store.claim_provisioning(payment.id, now, stale_before).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                tracing::debug!(payment_id = %payment.id, "Provisioning claimed elsewhere or already done");
                return Provisioning::InProgress;
            }
            Err(e) => return Self::provisioning_failed(payment, format!("provisioning claim: {e}")),
        };

        let provisioning = self.provision(&claimed, plan_id, now).await;

        let finished = match &provisioning {
            Provisioning::Completed { .. } => self.store.mark_provisioned(claimed.id, now).await,
            _ => self.store.release_provisioning(claimed.id).await,
        };
        if let Err(e) = finished {
            // The claim lapses after the lease; the steps are safe to repeat
            tracing::warn!(payment_id = %claimed.id, error = %e, "Could not close provisioning claim");
        }

        provisioning
    }

    async fn provision(&self, payment: &Payment, plan_id: Uuid, now: DateTime<Utc>) -> Provisioning {
        let plan = match self.store.get_plan(plan_id).await {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                return Self::provisioning_failed(payment, format!("plan {plan_id} not found"));
            }
            Err(e) => {
                return Self::provisioning_failed(payment, format!("plan lookup: {e}"));
            }
        };

        // Anchored on settlement so a retry lands on the same dates
        let settled_at = payment.completed_at.unwrap_or(now);
        let end_date = add_billing_period(settled_at);
        let mut errors = Vec::new();

        let subscription = self
            .upsert_subscription(payment, &plan, settled_at, end_date)
            .await
            .map_err(|e| errors.push(format!("subscription: {e}")))
            .ok();

        let license = self
            .upsert_license(payment.user_id, end_date)
            .await
            .map_err(|e| errors.push(format!("license: {e}")))
            .ok();

        match (subscription, license) {
            (Some((subscription_id, subscription)), Some((license_key, license))) => {
                tracing::info!(
                    payment_id = %payment.id,
                    user_id = %payment.user_id,
                    plan = %plan.name,
                    subscription_id = %subscription_id,
                    subscription = ?subscription,
                    license = ?license,
                    end_date = %end_date,
                    "Provisioned subscription and license"
                );
                Provisioning::Completed {
                    subscription_id,
                    subscription,
                    license_key,
                    license,
                    end_date,
                }
            }
            (subscription, license) => {
                tracing::error!(
                    payment_id = %payment.id,
                    user_id = %payment.user_id,
                    errors = ?errors,
                    "Provisioning incomplete after settled payment"
                );
                Provisioning::Failed {
                    subscription_id: subscription.map(|(id, _)| id),
                    license_key: license.map(|(key, _)| key),
                    errors,
                }
            }
        }
    }

    fn provisioning_failed(payment: &Payment, error: String) -> Provisioning {
        let error = PaymentError::Provisioning(error);
        tracing::error!(
            payment_id = %payment.id,
            user_id = %payment.user_id,
            error = %error,
            "Provisioning aborted after settled payment"
        );
        Provisioning::Failed {
            subscription_id: None,
            license_key: None,
            errors: vec![error.to_string()],
        }
    }

    /// Extend the active subscription or start one, then link the payment
    async fn upsert_subscription(
        &self,
        payment: &Payment,
        plan: &Plan,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Result<(Uuid, Upsert)> {
        let upsert = match self.store.find_active_subscription(payment.user_id).await? {
            Some(existing) => {
                // Renewal restarts the period at settlement, not at the old end_date
                self.store
                    .extend_subscription(
                        existing.id,
                        SubscriptionRenewal {
                            end_date,
                            plan_id: plan.id,
                            plan_name: plan.name.clone(),
                            max_users: plan.max_users,
                            amount: payment.amount,
                            status: SubscriptionStatus::Active,
                        },
                    )
                    .await?;
                Upsert::Extended
            }
            None => {
                let currency = if payment.currency.is_empty() {
                    DEFAULT_CURRENCY.to_string()
                } else {
                    payment.currency.clone()
                };
                self.store
                    .insert_subscription(NewSubscription {
                        user_id: payment.user_id,
                        plan_id: plan.id,
                        plan_name: plan.name.clone(),
                        max_users: plan.max_users,
                        status: SubscriptionStatus::Active,
                        start_date,
                        end_date,
                        amount: payment.amount,
                        currency,
                        payment_method: payment.payment_method.clone(),
                    })
                    .await?;
                Upsert::Created
            }
        };

        let current = self
            .store
            .find_active_subscription(payment.user_id)
            .await?
            .ok_or_else(|| PaymentError::Provisioning("active subscription vanished after upsert".into()))?;
        self.store.link_subscription(payment.id, current.id).await?;

        Ok((current.id, upsert))
    }

    /// Renew the user's active license or mint the first one
    async fn upsert_license(&self, user_id: Uuid, expires_at: DateTime<Utc>) -> Result<(LicenseKey, Upsert)> {
        if let Some(existing) = self.store.find_active_license(user_id).await? {
            let renewed = self.store.renew_license(existing.id, expires_at).await?;
            return Ok((renewed.license_key, Upsert::Extended));
        }

        let license_key = self.store.generate_license_key().await?;
        let license = self
            .store
            .insert_license(NewLicense {
                user_id,
                license_key,
                expires_at,
                is_active: true,
            })
            .await?;
        Ok((license.license_key, Upsert::Created))
    }
}
