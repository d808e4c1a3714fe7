//! Subscription Plans

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A plan row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,

    /// Stable slug (`start`, `plus`, `pro`)
    pub name: String,

    pub display_name: String,

    /// Monthly price in XAF
    pub price: i64,

    pub max_users: i32,

    #[serde(default)]
    pub features: Vec<String>,

    pub is_active: bool,
}

impl Plan {
    fn seeded(name: &str, display_name: &str, price: i64, max_users: i32, features: &[&str]) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            display_name: display_name.into(),
            price,
            max_users,
            features: features.iter().map(|f| (*f).to_string()).collect(),
            is_active: true,
        }
    }

    /// Default catalog, used to seed development stores
    pub fn catalog() -> Vec<Self> {
        vec![
            Self::seeded(
                "start",
                "PME START",
                10_000,
                3,
                &["All core features", "WhatsApp support", "1 company"],
            ),
            Self::seeded(
                "plus",
                "PME PLUS",
                20_000,
                10,
                &["All core features", "Multiple points of sale", "Advanced export", "Priority support"],
            ),
            Self::seeded(
                "pro",
                "PME PRO",
                35_000,
                20,
                &[
                    "All core features",
                    "Multiple points of sale",
                    "API access",
                    "Customizations",
                    "Dedicated phone support",
                ],
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_pricing() {
        let catalog = Plan::catalog();
        let plus = catalog.iter().find(|p| p.name == "plus").unwrap();
        assert_eq!(plus.price, 20_000);
        assert_eq!(plus.max_users, 10);
        assert!(catalog.windows(2).all(|w| w[0].price < w[1].price));
    }
}
