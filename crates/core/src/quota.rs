//! Per-user quota records.

use serde::{Deserialize, Serialize};

fn default_active() -> u32 {
    1
}
fn default_hourly() -> u32 {
    10
}
fn default_api_minute() -> u32 {
    120
}
fn default_api_hour() -> u32 {
    3600
}

/// Limits applied to one user. Rows are optional; absent users get the
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Concurrent invocations in pending or in_progress.
    #[serde(default = "default_active")]
    pub max_active_invocations: u32,

    /// Invocations created per sliding hour.
    #[serde(default = "default_hourly")]
    pub max_invocations_per_hour: u32,

    /// API requests per sliding minute.
    #[serde(default = "default_api_minute")]
    pub max_api_requests_per_minute: u32,

    /// API requests per sliding hour.
    #[serde(default = "default_api_hour")]
    pub max_api_requests_per_hour: u32,
}

impl Default for QuotaRecord {
    fn default() -> Self {
        Self {
            max_active_invocations: default_active(),
            max_invocations_per_hour: default_hourly(),
            max_api_requests_per_minute: default_api_minute(),
            max_api_requests_per_hour: default_api_hour(),
        }
    }
}
