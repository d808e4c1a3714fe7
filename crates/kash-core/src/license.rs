//! License Keys
//!
//! One active license per user. A renewal pushes `expires_at` forward on the
//! existing row; the key itself is only minted on first issuance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// License key (formatted: XXXX-XXXX-XXXX-XXXX)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LicenseKey(String);

impl LicenseKey {
    /// Generate a new license key
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4();
        let hex = id.simple().to_string().to_uppercase();
        Self(format!(
            "{}-{}-{}-{}",
            &hex[0..4],
            &hex[4..8],
            &hex[8..12],
            &hex[12..16]
        ))
    }

    /// Parse from string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into().trim().to_uppercase())
    }

    /// Get the key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LicenseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A license row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct License {
    pub id: Uuid,

    pub user_id: Uuid,

    pub license_key: LicenseKey,

    /// Set by the desktop client on first activation
    #[serde(default)]
    pub device_fingerprint: Option<String>,

    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    pub is_active: bool,

    pub created_at: DateTime<Utc>,
}

impl License {
    /// Check if license is valid (active and not expired)
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }

        if let Some(expires) = self.expires_at {
            if now > expires {
                return false;
            }
        }

        true
    }
}

/// Insert payload for a first-issued license
#[derive(Clone, Debug, Serialize)]
pub struct NewLicense {
    pub user_id: Uuid,
    pub license_key: LicenseKey,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

/// License verification result
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LicenseVerification {
    pub valid: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub activated: bool,
    pub message: Option<String>,
}

impl LicenseVerification {
    pub fn check(license: &License, now: DateTime<Utc>) -> Self {
        if license.is_valid(now) {
            Self {
                valid: true,
                expires_at: license.expires_at,
                activated: license.device_fingerprint.is_some(),
                message: None,
            }
        } else {
            Self {
                valid: false,
                expires_at: license.expires_at,
                activated: license.device_fingerprint.is_some(),
                message: Some("License is expired or inactive".into()),
            }
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            expires_at: None,
            activated: false,
            message: Some(message.into()),
        }
    }
}
