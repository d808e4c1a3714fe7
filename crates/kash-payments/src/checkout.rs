//! Checkout Flow
//!
//! The user-facing side of a payment: start a hosted collection for a plan,
//! hand the payment URL to the caller, and later read back what the webhook
//! (or a status poll) settled. Nothing here trusts redirect parameters; the
//! stored Payment is the only source of truth for the outcome.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use kash_core::{
    BillingStore, License, LicenseStore, NewPayment, Payment, PaymentStatus, PaymentStatusUpdate,
    PaymentStore, Plan, PlanStore, StatusChange, Subscription, SubscriptionStore,
};

use crate::config::TranzakConfig;
use crate::error::{PaymentError, Result};
use crate::gateway::{CollectionRequest, CollectionState, CollectionStatus, PaymentGateway};
use crate::reconcile::{Provisioning, Reconciler, Transition};
use crate::webhook::{SettlementEvent, SettlementKind};

/// Where the client goes after signing up
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "next", rename_all = "snake_case")]
pub enum NextStep {
    /// Open the hosted payment page
    Pay { payment_id: Uuid, payment_url: String },
    /// Skip payment; the account exists and can subscribe later
    Dashboard { notice: Option<String> },
}

impl NextStep {
    /// Portal route for this step
    pub fn route(&self) -> String {
        match self {
            NextStep::Pay { payment_id, .. } => format!("/payment/{payment_id}"),
            NextStep::Dashboard { .. } => "/dashboard".to_string(),
        }
    }
}

/// What the return page shows for a payment
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// Not settled yet; the client can go back to the payment page
    Pending { payment_url: Option<String> },
    Succeeded {
        subscription: Option<Subscription>,
        license: Option<License>,
    },
    Failed,
    Cancelled,
}

impl PaymentOutcome {
    /// Portal route for this outcome; `None` while the payment is pending
    pub fn route(&self) -> Option<&'static str> {
        match self {
            PaymentOutcome::Pending { .. } => None,
            PaymentOutcome::Succeeded { .. } => Some("/payment/success"),
            PaymentOutcome::Failed | PaymentOutcome::Cancelled => Some("/payment/failure"),
        }
    }
}

/// Result of polling the provider for one payment
#[derive(Clone, Debug, Serialize)]
pub struct SyncReport {
    pub payment: Payment,
    pub provider_status: CollectionState,
    /// How the local status write landed, if one was attempted
    pub transition: Option<Transition>,
    /// Provisioning run by this sync, for settled payments
    pub provisioning: Option<Provisioning>,
}

/// Client payment flow
pub struct CheckoutFlow {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn BillingStore>,
    reconciler: Arc<Reconciler>,
    config: TranzakConfig,
}

impl CheckoutFlow {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn BillingStore>,
        reconciler: Arc<Reconciler>,
        config: TranzakConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            reconciler,
            config,
        }
    }

    /// Active plans, cheapest first
    pub async fn plans(&self) -> Result<Vec<Plan>> {
        Ok(self.store.list_active_plans().await?)
    }

    /// Create a hosted collection for `plan_name` and record it as pending
    pub async fn start(&self, user_id: Uuid, plan_name: &str) -> Result<Payment> {
        let plan = self
            .store
            .get_plan_by_name(plan_name)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("plan {plan_name}")))?;

        let request = CollectionRequest {
            amount: plan.price,
            currency: self.config.currency.clone(),
            description: format!("Subscription {} - {}", plan.display_name, self.config.product_name),
            redirect_url: self.config.success_url(),
            cancel_url: self.config.failure_url(),
            metadata: Some(serde_json::json!({
                "plan_id": plan.id,
                "plan_name": plan.name,
            })),
        };

        let created = self.gateway.create_payment_request(&request).await?;

        let payment = self
            .store
            .create_payment(NewPayment {
                user_id,
                plan_id: Some(plan.id),
                amount: plan.price,
                currency: self.config.currency.clone(),
                request_id: created.request_id,
                payment_url: created.payment_url,
                qr_code: created.qr_code,
                metadata: Some(serde_json::json!({ "plan_name": plan.name })),
            })
            .await?;

        tracing::info!(
            payment_id = %payment.id,
            user_id = %user_id,
            plan = %plan.name,
            amount = plan.price,
            request_id = ?payment.request_id,
            gateway = self.gateway.name(),
            "Payment request created"
        );

        Ok(payment)
    }

    /// Post-signup step. Never fails: the account already exists, so any
    /// payment trouble sends the user to the dashboard instead.
    pub async fn start_after_signup(&self, user_id: Uuid, plan_name: Option<&str>) -> NextStep {
        let Some(plan_name) = plan_name.filter(|p| !p.is_empty()) else {
            return NextStep::Dashboard { notice: None };
        };

        match self.start(user_id, plan_name).await {
            Ok(payment) => match payment.payment_url {
                Some(payment_url) => NextStep::Pay {
                    payment_id: payment.id,
                    payment_url,
                },
                None => NextStep::Dashboard { notice: None },
            },
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    plan = plan_name,
                    error = %e,
                    "Could not start payment after signup"
                );
                NextStep::Dashboard {
                    notice: Some(
                        "Your account was created, but the payment could not be started. \
                         You can subscribe from your dashboard."
                            .to_string(),
                    ),
                }
            }
        }
    }

    /// Read a payment on behalf of its owner
    pub async fn payment_for(&self, user_id: Uuid, payment_id: Uuid) -> Result<Payment> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment {payment_id}")))?;

        if !payment.is_owned_by(user_id) {
            return Err(PaymentError::Forbidden(format!("payment {payment_id}")));
        }
        Ok(payment)
    }

    /// Payment history, newest first
    pub async fn payments_for_user(&self, user_id: Uuid) -> Result<Vec<Payment>> {
        Ok(self.store.list_payments_by_user(user_id).await?)
    }

    /// Return-page read-back from the store
    pub async fn outcome(&self, user_id: Uuid, payment_id: Uuid) -> Result<PaymentOutcome> {
        let payment = self.payment_for(user_id, payment_id).await?;

        Ok(match payment.status {
            PaymentStatus::Pending => PaymentOutcome::Pending {
                payment_url: payment.payment_url,
            },
            PaymentStatus::Completed => PaymentOutcome::Succeeded {
                subscription: self.store.current_subscription(user_id).await?,
                license: self.store.find_active_license(user_id).await?,
            },
            PaymentStatus::Failed => PaymentOutcome::Failed,
            PaymentStatus::Cancelled => PaymentOutcome::Cancelled,
        })
    }

    /// Poll the provider and converge the local record.
    ///
    /// Settled states go through the reconciler exactly like a webhook, so
    /// a lost notification still provisions, a failed provisioning attempt
    /// is retried, and a late notification stays a no-op.
    pub async fn sync(&self, user_id: Uuid, payment_id: Uuid) -> Result<SyncReport> {
        let payment = self.payment_for(user_id, payment_id).await?;
        let request_id = payment
            .request_id
            .clone()
            .ok_or_else(|| PaymentError::NotFound(format!("provider request for payment {payment_id}")))?;

        let status = self.gateway.get_payment_status(&request_id).await?;
        let provider_status = status.status;

        let (payment, transition, provisioning) = match provider_status {
            CollectionState::Pending => (payment, None, None),
            CollectionState::Successful | CollectionState::Failed => {
                let (event, raw) = settlement_from_status(&request_id, status)?;
                let report = self.reconciler.reconcile(&event, raw).await?;
                (report.payment, Some(report.transition), Some(report.provisioning))
            }
            CollectionState::Cancelled => {
                let change = self
                    .store
                    .update_payment_status(payment.id, PaymentStatusUpdate::status(PaymentStatus::Cancelled))
                    .await?;
                let transition = match &change {
                    StatusChange::Applied(_) => Transition::Applied,
                    StatusChange::Unchanged(_) => Transition::Duplicate,
                    StatusChange::Rejected(_) => Transition::Conflict,
                };
                (change.into_payment(), Some(transition), None)
            }
        };

        tracing::debug!(
            payment_id = %payment.id,
            request_id = %request_id,
            provider_status = ?provider_status,
            status = %payment.status,
            "Payment synced with provider"
        );

        Ok(SyncReport {
            payment,
            provider_status,
            transition,
            provisioning,
        })
    }
}

/// Shape a polled status like the webhook body the provider would have sent
fn settlement_from_status(
    request_id: &str,
    status: CollectionStatus,
) -> Result<(SettlementEvent, serde_json::Value)> {
    let raw = serde_json::to_value(&status).map_err(|e| PaymentError::WebhookParse(e.to_string()))?;
    let event = match status.status {
        CollectionState::Successful => SettlementKind::Successful,
        _ => SettlementKind::Failed,
    };
    let settlement = SettlementEvent {
        event,
        request_id: request_id.to_string(),
        transaction_id: status.transaction_id,
        status: raw
            .get("status")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        amount: status.amount,
        currency: status.currency,
        payment_method: status.payment_method,
        metadata: status.metadata,
    };
    Ok((settlement, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::CollectionCreated;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use kash_core::testing::{Fault, FlakyStore};
    use kash_core::{ManualClock, MemoryStore, SubscriptionStatus};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeGateway {
        fail: bool,
        created: Mutex<Vec<CollectionRequest>>,
        states: Mutex<HashMap<String, CollectionState>>,
    }

    impl FakeGateway {
        fn settle(&self, request_id: &str, state: CollectionState) {
            self.states.lock().unwrap().insert(request_id.to_string(), state);
        }
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn create_payment_request(&self, request: &CollectionRequest) -> Result<CollectionCreated> {
            if self.fail {
                return Err(PaymentError::PaymentRequest("provider unavailable".into()));
            }
            let mut created = self.created.lock().unwrap();
            created.push(request.clone());
            let request_id = format!("REQ{}", created.len());
            Ok(CollectionCreated {
                payment_url: format!("https://pay.tranzak.me/{request_id}"),
                request_id,
                qr_code: Some("qr".into()),
            })
        }

        async fn get_payment_status(&self, request_id: &str) -> Result<CollectionStatus> {
            let state = self
                .states
                .lock()
                .unwrap()
                .get(request_id)
                .copied()
                .unwrap_or(CollectionState::Pending);
            Ok(CollectionStatus {
                request_id: request_id.to_string(),
                status: state,
                transaction_id: Some("TX9".into()),
                amount: None,
                currency: Some("XAF".into()),
                payment_method: Some("orange".into()),
                metadata: None,
            })
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    fn config() -> TranzakConfig {
        TranzakConfig::from_lookup(|key: &str| match key {
            "TRANZAK_APP_ID" => Some("app".into()),
            "TRANZAK_APP_KEY" => Some("key".into()),
            "APP_URL" => Some("https://portal.example".into()),
            _ => None,
        })
        .unwrap()
    }

    fn flow(gateway: Arc<FakeGateway>) -> (CheckoutFlow, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::seeded(clock.clone()));
        let reconciler = Arc::new(Reconciler::new(store.clone(), clock));
        (CheckoutFlow::new(gateway, store.clone(), reconciler, config()), store)
    }

    #[tokio::test]
    async fn test_start_records_pending_payment() {
        let gateway = Arc::new(FakeGateway::default());
        let (flow, store) = flow(gateway.clone());
        let user = Uuid::new_v4();

        let payment = flow.start(user, "plus").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.amount, 20_000);
        assert_eq!(payment.request_id.as_deref(), Some("REQ1"));
        assert_eq!(payment.metadata, Some(serde_json::json!({"plan_name": "plus"})));
        assert!(store.get_payment_by_request_id("REQ1").await.unwrap().is_some());

        let sent = gateway.created.lock().unwrap()[0].clone();
        assert_eq!(sent.currency, "XAF");
        assert_eq!(sent.description, "Subscription PME PLUS - KAMER KASH PME");
        assert_eq!(sent.redirect_url, "https://portal.example/payment/success");
        assert_eq!(sent.cancel_url, "https://portal.example/payment/failure");
        assert_eq!(sent.metadata.unwrap()["plan_name"], "plus");
    }

    #[tokio::test]
    async fn test_unknown_plan_is_not_found() {
        let (flow, _) = flow(Arc::new(FakeGateway::default()));
        let err = flow.start(Uuid::new_v4(), "enterprise").await.unwrap_err();
        assert!(matches!(err, PaymentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_signup_falls_back_to_dashboard() {
        let gateway = Arc::new(FakeGateway {
            fail: true,
            ..FakeGateway::default()
        });
        let (flow, store) = flow(gateway);
        let user = Uuid::new_v4();

        let next = flow.start_after_signup(user, Some("plus")).await;
        assert!(matches!(next, NextStep::Dashboard { notice: Some(_) }));
        assert_eq!(next.route(), "/dashboard");
        assert!(store.list_payments_by_user(user).await.unwrap().is_empty());

        let next = flow.start_after_signup(user, None).await;
        assert_eq!(next, NextStep::Dashboard { notice: None });
    }

    #[tokio::test]
    async fn test_signup_routes_to_payment_page() {
        let (flow, _) = flow(Arc::new(FakeGateway::default()));
        let next = flow.start_after_signup(Uuid::new_v4(), Some("start")).await;
        let NextStep::Pay { payment_id, ref payment_url } = next else {
            panic!("expected pay step, got {next:?}");
        };
        assert_eq!(payment_url, "https://pay.tranzak.me/REQ1");
        assert_eq!(next.route(), format!("/payment/{payment_id}"));
    }

    #[tokio::test]
    async fn test_other_users_payment_is_forbidden() {
        let (flow, _) = flow(Arc::new(FakeGateway::default()));
        let payment = flow.start(Uuid::new_v4(), "plus").await.unwrap();
        let err = flow.payment_for(Uuid::new_v4(), payment.id).await.unwrap_err();
        assert!(matches!(err, PaymentError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_sync_converges_lost_webhook() {
        let gateway = Arc::new(FakeGateway::default());
        let (flow, store) = flow(gateway.clone());
        let user = Uuid::new_v4();
        let payment = flow.start(user, "plus").await.unwrap();

        let pending = flow.sync(user, payment.id).await.unwrap();
        assert_eq!(pending.provider_status, CollectionState::Pending);
        assert!(pending.transition.is_none());
        assert!(matches!(flow.outcome(user, payment.id).await.unwrap(), PaymentOutcome::Pending { .. }));

        gateway.settle("REQ1", CollectionState::Successful);
        let synced = flow.sync(user, payment.id).await.unwrap();
        assert_eq!(synced.transition, Some(Transition::Applied));
        assert_eq!(synced.payment.status, PaymentStatus::Completed);
        assert_eq!(synced.payment.payment_method.as_deref(), Some("mobile_money_orange"));

        let again = flow.sync(user, payment.id).await.unwrap();
        assert_eq!(again.transition, Some(Transition::Duplicate));
        assert_eq!(store.subscriptions_for(user).await.len(), 1);

        let outcome = flow.outcome(user, payment.id).await.unwrap();
        assert_eq!(outcome.route(), Some("/payment/success"));
        let PaymentOutcome::Succeeded { subscription, license } = outcome else {
            panic!("expected success");
        };
        assert_eq!(subscription.unwrap().status, SubscriptionStatus::Active);
        assert!(license.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_sync_cancelled_collection() {
        let gateway = Arc::new(FakeGateway::default());
        let (flow, _) = flow(gateway.clone());
        let user = Uuid::new_v4();
        let payment = flow.start(user, "pro").await.unwrap();

        gateway.settle("REQ1", CollectionState::Cancelled);
        let synced = flow.sync(user, payment.id).await.unwrap();
        assert_eq!(synced.payment.status, PaymentStatus::Cancelled);

        let outcome = flow.outcome(user, payment.id).await.unwrap();
        assert!(matches!(outcome, PaymentOutcome::Cancelled));
        assert_eq!(outcome.route(), Some("/payment/failure"));
    }

    #[tokio::test]
    async fn test_sync_retries_failed_provisioning() {
        let gateway = Arc::new(FakeGateway::default());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::seeded(clock.clone()));
        let flaky = Arc::new(FlakyStore::new(store.clone()));
        let reconciler = Arc::new(Reconciler::new(flaky.clone(), clock));
        let flow = CheckoutFlow::new(gateway.clone(), flaky.clone(), reconciler, config());
        let user = Uuid::new_v4();
        let payment = flow.start(user, "plus").await.unwrap();

        gateway.settle("REQ1", CollectionState::Successful);
        flaky.fail(Fault::LinkSubscription, 1);
        let first = flow.sync(user, payment.id).await.unwrap();
        assert_eq!(first.payment.status, PaymentStatus::Completed);
        assert!(matches!(first.provisioning, Some(Provisioning::Failed { .. })));
        assert!(store.get_payment(payment.id).await.unwrap().unwrap().subscription_id.is_none());

        let retried = flow.sync(user, payment.id).await.unwrap();
        assert_eq!(retried.transition, Some(Transition::Duplicate));
        assert!(matches!(retried.provisioning, Some(Provisioning::Completed { .. })));

        let stored = store.get_payment(payment.id).await.unwrap().unwrap();
        assert!(stored.provisioned_at.is_some());
        assert_eq!(stored.subscription_id, Some(store.subscriptions_for(user).await[0].id));
        assert_eq!(store.subscriptions_for(user).await.len(), 1);
    }
}
