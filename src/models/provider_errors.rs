use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum ProviderErrorType {
    InvalidApiKey,
    InsufficientQuota,
    ModelNotFound,
    PermissionDenied,
    AccountSuspended,
    PaymentRequired,
    NetworkError,
    Timeout,
    RateLimit,
    InternalError,
}

impl ProviderErrorType {
    /// Errors that by their nature indicate the credential itself is
    /// unusable, independent of the tracker's disable policy table.
    pub fn is_inherently_fatal(self) -> bool {
        matches!(
            self,
            ProviderErrorType::InvalidApiKey
                | ProviderErrorType::InsufficientQuota
                | ProviderErrorType::PermissionDenied
                | ProviderErrorType::AccountSuspended
                | ProviderErrorType::PaymentRequired
        )
    }
}

/// A single observed error (spec.md §3 `ProviderErrorRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderErrorRecord {
    pub credential_id: String,
    pub provider_id: String,
    pub error_type: ProviderErrorType,
    pub is_fatal: bool,
    pub http_status_code: Option<u16>,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Per-credential, per-error-type rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAggregate {
    pub error_type: ProviderErrorType,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_message: String,
    pub last_status_code: Option<u16>,
    pub disabled_at: Option<DateTime<Utc>>,
}

/// Policy row consulted by `shouldDisable` (spec.md §4.G).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DisablePolicyRule {
    pub disable_immediately: bool,
    pub required_occurrences: u32,
    pub time_window_secs: u64,
}

pub fn default_disable_policy(error_type: ProviderErrorType) -> DisablePolicyRule {
    use ProviderErrorType::*;
    match error_type {
        InvalidApiKey | AccountSuspended | PaymentRequired => DisablePolicyRule {
            disable_immediately: true,
            required_occurrences: 1,
            time_window_secs: 0,
        },
        InsufficientQuota | PermissionDenied => DisablePolicyRule {
            disable_immediately: true,
            required_occurrences: 1,
            time_window_secs: 0,
        },
        ModelNotFound => DisablePolicyRule {
            disable_immediately: false,
            required_occurrences: 10,
            time_window_secs: 3600,
        },
        RateLimit | Timeout | NetworkError => DisablePolicyRule {
            disable_immediately: false,
            required_occurrences: 20,
            time_window_secs: 900,
        },
        InternalError => DisablePolicyRule {
            disable_immediately: false,
            required_occurrences: 15,
            time_window_secs: 1800,
        },
    }
}

/// An operator-managed API key for a provider (spec.md §3
/// `ProviderCredential`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCredential {
    pub id: String,
    pub provider_id: String,
    pub is_primary: bool,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSummary {
    pub provider_id: String,
    pub total_errors: u64,
    pub fatal_errors: u64,
    pub warnings: u64,
    pub disabled_credential_ids: Vec<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}
