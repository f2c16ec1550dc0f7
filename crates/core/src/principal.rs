//! Principals and roles.
//!
//! A `Principal` is resolved once per request from a verified bearer token
//! plus an `Administrators` group lookup. It lives for that request only and
//! is never persisted.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Access role on a threat model, ordered weakest to strongest.
///
/// The derived `Ord` gives `Reader < Writer < Owner`, which the
/// authorization engine relies on when taking the maximum of matching
/// grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Writer,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reader" => Some(Role::Reader),
            "writer" => Some(Role::Writer),
            "owner" => Some(Role::Owner),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated actor, valid for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Stable internal identifier for the user.
    pub internal_uuid: Uuid,

    /// Identity provider that authenticated this principal (e.g. "oidc_google").
    pub provider: String,

    /// The user's identifier at the provider.
    pub provider_user_id: String,

    /// Email claim from the token.
    pub email: String,

    /// Display name, if the token carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Group names asserted by the identity provider.
    #[serde(default)]
    pub groups: Vec<String>,

    /// Whether the principal is a member of the built-in Administrators
    /// group. Looked up per request, never taken from the token.
    pub is_administrator: bool,
}

impl Principal {
    /// True if the principal's IdP asserted membership in `group`.
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering() {
        assert!(Role::Reader < Role::Writer);
        assert!(Role::Writer < Role::Owner);
        assert_eq!(Role::Owner.max(Role::Reader), Role::Owner);
    }

    #[test]
    fn role_roundtrip() {
        for role in [Role::Reader, Role::Writer, Role::Owner] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("admin"), None);
    }

    #[test]
    fn role_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Writer).unwrap(), "\"writer\"");
    }
}
