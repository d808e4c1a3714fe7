//! Payment Records
//!
//! A payment is one attempt to pay for a plan through the mobile-money
//! provider. It is created `pending` as soon as the provider hands back a
//! request id and is settled exactly once afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default settlement currency (CFA franc)
pub const DEFAULT_CURRENCY: &str = "XAF";

/// Payment lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// Only `pending` may move, and only into a terminal state
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(self, PaymentStatus::Pending) && next.is_terminal()
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,

    /// Subscription this payment funded, stamped after provisioning
    #[serde(default)]
    pub subscription_id: Option<Uuid>,

    pub user_id: Uuid,

    #[serde(default)]
    pub plan_id: Option<Uuid>,

    /// Minor units of `currency`
    pub amount: i64,

    pub currency: String,

    /// Provider-issued collection request id
    #[serde(rename = "tranzak_request_id", default)]
    pub request_id: Option<String>,

    /// Provider transaction id, known after settlement
    #[serde(rename = "tranzak_transaction_id", default)]
    pub transaction_id: Option<String>,

    #[serde(default)]
    pub payment_url: Option<String>,

    #[serde(default)]
    pub qr_code: Option<String>,

    pub status: PaymentStatus,

    /// Canonical method tag (`mobile_money_mtn`, `mobile_money_orange`, ...)
    #[serde(default)]
    pub payment_method: Option<String>,

    #[serde(default)]
    pub metadata: Option<serde_json::Value>,

    /// Raw settlement payload kept for audit
    #[serde(default)]
    pub webhook_data: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Set once the subscription and license for this payment are in place
    #[serde(default)]
    pub provisioned_at: Option<DateTime<Utc>>,

    /// Start of the current provisioning attempt, cleared when it ends
    #[serde(default)]
    pub provisioning_claimed_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Belongs to `user_id`
    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.user_id == user_id
    }

    /// Completed for a plan but not yet provisioned
    pub fn needs_provisioning(&self) -> bool {
        self.status == PaymentStatus::Completed && self.plan_id.is_some() && self.provisioned_at.is_none()
    }

    /// Open for a new provisioning attempt: needs one and no claim taken at
    /// or after `stale_before` is outstanding
    pub fn can_claim_provisioning(&self, stale_before: DateTime<Utc>) -> bool {
        self.needs_provisioning() && self.provisioning_claimed_at.is_none_or(|at| at < stale_before)
    }
}

/// Insert payload for a freshly created provider request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewPayment {
    pub user_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub amount: i64,
    pub currency: String,
    #[serde(rename = "tranzak_request_id")]
    pub request_id: String,
    pub payment_url: String,
    pub qr_code: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Settlement write applied to a pending payment
#[derive(Clone, Debug, Serialize)]
pub struct PaymentStatusUpdate {
    pub status: PaymentStatus,

    #[serde(rename = "tranzak_transaction_id", skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_data: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentStatusUpdate {
    /// Bare status change with no provider data
    pub fn status(status: PaymentStatus) -> Self {
        Self {
            status,
            transaction_id: None,
            payment_method: None,
            webhook_data: None,
            completed_at: None,
        }
    }
}

/// Result of a guarded status write
#[derive(Clone, Debug)]
pub enum StatusChange {
    /// Payment was pending and now carries the new status
    Applied(Payment),

    /// Payment already had the requested status (replayed settlement)
    Unchanged(Payment),

    /// Payment is terminal with a different status; nothing written
    Rejected(Payment),
}

impl StatusChange {
    /// Classify a write against the row as it was read
    pub fn classify(current: &Payment, requested: PaymentStatus) -> Option<Self> {
        if current.status.can_transition_to(requested) {
            None
        } else if current.status == requested {
            Some(StatusChange::Unchanged(current.clone()))
        } else {
            Some(StatusChange::Rejected(current.clone()))
        }
    }

    pub fn payment(&self) -> &Payment {
        match self {
            StatusChange::Applied(p) | StatusChange::Unchanged(p) | StatusChange::Rejected(p) => p,
        }
    }

    pub fn into_payment(self) -> Payment {
        match self {
            StatusChange::Applied(p) | StatusChange::Unchanged(p) | StatusChange::Rejected(p) => p,
        }
    }
}

/// Canonical payment-method tag for a provider-reported method name
pub fn normalize_payment_method(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if lower.contains("mtn") {
        "mobile_money_mtn".into()
    } else if lower.contains("orange") {
        "mobile_money_orange".into()
    } else {
        raw.to_string()
    }
}
