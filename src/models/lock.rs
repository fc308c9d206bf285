use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A held lock (spec.md §3 `DistributedLock`).
///
/// `lock_value` is the fencing token: release/extend only succeed when
/// the caller presents the same value the backend issued at
/// acquisition time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedLock {
    pub key: String,
    pub lock_value: String,
    pub expires_at: DateTime<Utc>,
}

impl DistributedLock {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}
