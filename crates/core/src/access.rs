//! Access grants, groups, and memberships.
//!
//! Grants bind a subject (user or group) to a role on a threat model. Group
//! grants are scoped to the identity provider that asserted the group; the
//! `Everyone` pseudo-group (provider `*`) is the only cross-provider match.

use crate::model::ThreatModel;
use crate::principal::{Principal, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provider value reserved for the `Everyone` pseudo-group.
pub const WILDCARD_PROVIDER: &str = "*";

/// Pseudo-group matching every authenticated principal regardless of IdP.
pub const EVERYONE_GROUP: &str = "Everyone";

/// Built-in group whose members hold administrator capability.
pub const ADMINISTRATORS_GROUP: &str = "Administrators";

/// What a grant's subject refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    User,
    Group,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::User => "user",
            SubjectType::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(SubjectType::User),
            "group" => Some(SubjectType::Group),
            _ => None,
        }
    }
}

/// A role binding on a threat model.
///
/// Unique per `(threat_model_id, subject, subject_type, idp)`. For user
/// subjects the `idp` is `None` and ignored during matching; for group
/// subjects it must name the provider that asserts the group, and a grant
/// never matches a principal from a different provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessGrant {
    pub threat_model_id: Uuid,

    /// User UUID, user email, or group name depending on `subject_type`.
    pub subject: String,

    pub subject_type: SubjectType,

    /// Identity provider scope for group subjects; `Some("*")` for the
    /// Everyone pseudo-group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idp: Option<String>,

    pub role: Role,
}

impl AccessGrant {
    pub fn user(threat_model_id: Uuid, subject: impl Into<String>, role: Role) -> Self {
        Self {
            threat_model_id,
            subject: subject.into(),
            subject_type: SubjectType::User,
            idp: None,
            role,
        }
    }

    pub fn group(threat_model_id: Uuid, group: impl Into<String>, idp: impl Into<String>, role: Role) -> Self {
        Self {
            threat_model_id,
            subject: group.into(),
            subject_type: SubjectType::Group,
            idp: Some(idp.into()),
            role,
        }
    }
}

/// A named group asserted by one identity provider.
///
/// Unique per `(provider, group_name)`. The reserved `Everyone` group uses
/// the wildcard provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub provider: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn is_everyone(&self) -> bool {
        self.name == EVERYONE_GROUP && self.provider == WILDCARD_PROVIDER
    }

    pub fn is_administrators(&self) -> bool {
        self.name == ADMINISTRATORS_GROUP
    }
}

/// Membership of a user in a group. At most one row per
/// `(group, user, subject_type)`; bootstrap deduplicates before the unique
/// index is installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub subject_type: SubjectType,
}

/// Pure grant evaluation: the maximum role among
/// - user grants matching the principal's UUID or email (idp ignored),
/// - group grants whose idp equals the principal's provider and whose
///   subject is among the principal's groups,
/// - `Everyone` pseudo-group grants (wildcard idp, matches every
///   authenticated principal),
/// - implicit ownership of the threat model.
///
/// Both the authorization engine and the store's in-transaction re-check
/// evaluate through this one function.
pub fn effective_role(
    principal: &Principal,
    model: &ThreatModel,
    grants: &[AccessGrant],
) -> Option<Role> {
    let mut effective: Option<Role> = None;
    let mut bump = |role: Role| {
        effective = Some(effective.map_or(role, |e| e.max(role)));
    };

    if model.owner == principal.internal_uuid || model.owner_email == principal.email {
        bump(Role::Owner);
    }

    let uuid_str = principal.internal_uuid.to_string();
    for grant in grants {
        match grant.subject_type {
            SubjectType::User => {
                if grant.subject == uuid_str || grant.subject == principal.email {
                    bump(grant.role);
                }
            }
            SubjectType::Group => {
                let is_everyone = grant.subject == EVERYONE_GROUP
                    && grant.idp.as_deref() == Some(WILDCARD_PROVIDER);
                if is_everyone {
                    bump(grant.role);
                    continue;
                }
                // Provider isolation: a grant from a different IdP never
                // contributes, even on a group name match.
                if grant.idp.as_deref() == Some(principal.provider.as_str())
                    && principal.in_group(&grant.subject)
                {
                    bump(grant.role);
                }
            }
        }
    }

    effective
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_grant_carries_idp() {
        let g = AccessGrant::group(Uuid::new_v4(), "security-team", "saml_okta", Role::Writer);
        assert_eq!(g.subject_type, SubjectType::Group);
        assert_eq!(g.idp.as_deref(), Some("saml_okta"));
    }

    #[test]
    fn user_grant_has_no_idp() {
        let g = AccessGrant::user(Uuid::new_v4(), "alice@example.com", Role::Reader);
        assert!(g.idp.is_none());
    }

    #[test]
    fn everyone_detection() {
        let g = Group {
            id: Uuid::new_v4(),
            provider: WILDCARD_PROVIDER.into(),
            name: EVERYONE_GROUP.into(),
            created_at: Utc::now(),
        };
        assert!(g.is_everyone());
        assert!(!g.is_administrators());
    }

    fn principal(provider: &str, groups: &[&str]) -> Principal {
        Principal {
            internal_uuid: Uuid::new_v4(),
            provider: provider.into(),
            provider_user_id: "puid".into(),
            email: "alice@example.com".into(),
            name: None,
            groups: groups.iter().map(|s| s.to_string()).collect(),
            is_administrator: false,
        }
    }

    fn model() -> ThreatModel {
        ThreatModel::new(Uuid::new_v4(), "owner@example.com", "tm", "STRIDE")
    }

    #[test]
    fn owner_is_implicit() {
        let p = principal("oidc_google", &[]);
        let mut m = model();
        m.owner = p.internal_uuid;
        assert_eq!(effective_role(&p, &m, &[]), Some(Role::Owner));
    }

    #[test]
    fn owner_email_matches_too() {
        let p = principal("oidc_google", &[]);
        let mut m = model();
        m.owner_email = "alice@example.com".into();
        assert_eq!(effective_role(&p, &m, &[]), Some(Role::Owner));
    }

    #[test]
    fn user_grant_by_email_ignores_idp() {
        let p = principal("saml_okta", &[]);
        let m = model();
        let grants = [AccessGrant::user(m.id, "alice@example.com", Role::Writer)];
        assert_eq!(effective_role(&p, &m, &grants), Some(Role::Writer));

        // Same decision from any provider.
        let p2 = principal("oidc_google", &[]);
        assert_eq!(effective_role(&p2, &m, &grants), Some(Role::Writer));
    }

    #[test]
    fn group_grant_requires_matching_provider() {
        let m = model();
        let grants = [AccessGrant::group(m.id, "security-team", "saml_okta", Role::Writer)];

        let okta = principal("saml_okta", &["security-team"]);
        assert_eq!(effective_role(&okta, &m, &grants), Some(Role::Writer));

        // Same group name from a different provider never matches.
        let azure = principal("saml_azure", &["security-team"]);
        assert_eq!(effective_role(&azure, &m, &grants), None);
    }

    #[test]
    fn everyone_matches_across_providers() {
        let m = model();
        let grants = [AccessGrant::group(m.id, EVERYONE_GROUP, WILDCARD_PROVIDER, Role::Reader)];
        assert_eq!(
            effective_role(&principal("saml_okta", &[]), &m, &grants),
            Some(Role::Reader)
        );
        assert_eq!(
            effective_role(&principal("oidc_google", &[]), &m, &grants),
            Some(Role::Reader)
        );
    }

    #[test]
    fn effective_role_is_maximum() {
        let p = principal("saml_okta", &["security-team"]);
        let m = model();
        let grants = [
            AccessGrant::group(m.id, EVERYONE_GROUP, WILDCARD_PROVIDER, Role::Reader),
            AccessGrant::group(m.id, "security-team", "saml_okta", Role::Writer),
            AccessGrant::user(m.id, "alice@example.com", Role::Reader),
        ];
        assert_eq!(effective_role(&p, &m, &grants), Some(Role::Writer));
    }

    #[test]
    fn provider_swap_zeroes_group_contributions_only() {
        let m = model();
        let grants = [
            AccessGrant::user(m.id, "alice@example.com", Role::Reader),
            AccessGrant::group(m.id, "security-team", "saml_okta", Role::Owner),
        ];
        let p = principal("saml_okta", &["security-team"]);
        assert_eq!(effective_role(&p, &m, &grants), Some(Role::Owner));

        let mut swapped = p.clone();
        swapped.provider = "saml_azure".into();
        // User grant survives, group grant is zeroed.
        assert_eq!(effective_role(&swapped, &m, &grants), Some(Role::Reader));
    }
}
