//! Subscriptions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
    Pending,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Pending => "pending",
        }
    }
}

/// A subscription row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub plan_id: Option<Uuid>,
    #[serde(default)]
    pub plan_name: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub max_users: Option<i32>,
    #[serde(default)]
    pub payment_method: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Active and not past its end date.
    ///
    /// Expiry is read lazily; nothing flips `status` to `expired` in the
    /// background.
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.end_date.is_none_or(|end| now < end)
    }
}

/// Insert payload for a first subscription
#[derive(Clone, Debug, Serialize)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub plan_name: String,
    pub max_users: i32,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub amount: i64,
    pub currency: String,
    pub payment_method: Option<String>,
}

/// Update applied to the active subscription on renewal
#[derive(Clone, Debug, Serialize)]
pub struct SubscriptionRenewal {
    pub end_date: DateTime<Utc>,
    pub plan_id: Uuid,
    pub plan_name: String,
    pub max_users: i32,
    pub amount: i64,
    pub status: SubscriptionStatus,
}
