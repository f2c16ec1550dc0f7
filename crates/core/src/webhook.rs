//! Webhook subscriptions, delivery records, and the outbound deny list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Minimum webhook secret length. Secrets sign every outbound body and
/// authenticate every inbound callback, so short ones are rejected outright.
pub const MIN_SECRET_LEN: usize = 128;

/// Subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    PendingVerification,
    Active,
    Disabled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::PendingVerification => "pending_verification",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_verification" => Some(SubscriptionStatus::PendingVerification),
            "active" => Some(SubscriptionStatus::Active),
            "disabled" => Some(SubscriptionStatus::Disabled),
            _ => None,
        }
    }
}

/// A registered webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,

    /// Internal UUID of the owning user.
    pub owner: Uuid,

    pub url: String,

    /// Event names this subscription receives.
    #[serde(default)]
    pub events: Vec<String>,

    /// HMAC signing secret. Never serialized into API responses; the
    /// gateway strips it before returning subscription objects.
    pub secret: String,

    pub status: SubscriptionStatus,

    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// Validate url scheme and secret length for a new subscription.
    pub fn validate(url: &str, secret: &str) -> Result<(), ValidationError> {
        if !url.starts_with("https://") {
            return Err(ValidationError::InsecureUrl);
        }
        if secret.len() < MIN_SECRET_LEN {
            return Err(ValidationError::SecretTooShort { min: MIN_SECRET_LEN });
        }
        Ok(())
    }
}

/// How a deny-list pattern is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// Shell-style `*` wildcard match against the host string.
    Glob,
    /// CIDR match against resolved addresses.
    Cidr,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Glob => "glob",
            PatternType::Cidr => "cidr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "glob" => Some(PatternType::Glob),
            "cidr" => Some(PatternType::Cidr),
            _ => None,
        }
    }
}

/// One forbidden outbound target pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlDenyEntry {
    pub pattern: String,
    pub pattern_type: PatternType,
    pub description: String,
}

impl UrlDenyEntry {
    pub fn glob(pattern: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            pattern_type: PatternType::Glob,
            description: description.into(),
        }
    }

    pub fn cidr(pattern: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            pattern_type: PatternType::Cidr,
            description: description.into(),
        }
    }
}

/// The default outbound deny seed: loopback, RFC 1918, link-local, cloud
/// metadata, Kubernetes service names, broadcast and null addresses.
pub fn default_deny_seed() -> Vec<UrlDenyEntry> {
    vec![
        UrlDenyEntry::glob("localhost", "Loopback host"),
        UrlDenyEntry::cidr("127.0.0.0/8", "IPv4 loopback"),
        UrlDenyEntry::cidr("::1/128", "IPv6 loopback"),
        UrlDenyEntry::cidr("10.0.0.0/8", "RFC 1918 private"),
        UrlDenyEntry::cidr("172.16.0.0/12", "RFC 1918 private"),
        UrlDenyEntry::cidr("192.168.0.0/16", "RFC 1918 private"),
        UrlDenyEntry::cidr("169.254.0.0/16", "IPv4 link-local and cloud metadata"),
        UrlDenyEntry::cidr("fe80::/10", "IPv6 link-local"),
        UrlDenyEntry::cidr("fc00::/7", "IPv6 unique local"),
        UrlDenyEntry::glob("metadata.google.internal", "GCP metadata service"),
        UrlDenyEntry::glob("kubernetes.default.svc*", "Kubernetes API service"),
        UrlDenyEntry::glob("*.svc.cluster.local", "Kubernetes cluster services"),
        UrlDenyEntry::cidr("255.255.255.255/32", "Broadcast"),
        UrlDenyEntry::cidr("0.0.0.0/32", "Null address"),
    ]
}

/// Stored record of one delivery's final disposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event: String,
    pub target_url: String,

    /// "delivered", "failed", or "ssrf_blocked".
    pub status: String,

    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_secret() -> String {
        "s".repeat(MIN_SECRET_LEN)
    }

    #[test]
    fn https_required() {
        assert!(WebhookSubscription::validate("http://example.com/hook", &long_secret()).is_err());
        assert!(WebhookSubscription::validate("https://example.com/hook", &long_secret()).is_ok());
    }

    #[test]
    fn short_secret_rejected() {
        let err = WebhookSubscription::validate("https://example.com/hook", "short").unwrap_err();
        assert!(matches!(err, ValidationError::SecretTooShort { min } if min == MIN_SECRET_LEN));
    }

    #[test]
    fn status_roundtrip() {
        for s in [
            SubscriptionStatus::PendingVerification,
            SubscriptionStatus::Active,
            SubscriptionStatus::Disabled,
        ] {
            assert_eq!(SubscriptionStatus::parse(s.as_str()), Some(s));
        }
    }
}
