//! The authorization engine.
//!
//! `decide` computes a principal's effective role on a threat model and
//! compares it to the required role. Group grants are isolated to the
//! identity provider that asserted the group; the `Everyone` pseudo-group
//! is the single cross-provider exception. Administrators bypass the grant
//! computation entirely.

use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

use tmhub_core::error::AuthzError;
use tmhub_core::principal::{Principal, Role};
use tmhub_core::store::Store;

pub use tmhub_core::access::effective_role;

/// Grant-based access decisions backed by the canonical store.
pub struct AuthzEngine {
    store: Arc<dyn Store>,
}

impl AuthzEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Allow iff the principal's effective role on the threat model is at
    /// least `required`.
    ///
    /// Deny surfaces follow the probing rule: a principal with no read
    /// access sees `NotFound` (identical to a missing resource); one with
    /// read access but an insufficient role sees `Forbidden`.
    pub async fn decide(
        &self,
        principal: &Principal,
        threat_model_id: Uuid,
        required: Role,
    ) -> Result<(), AuthzError> {
        if principal.is_administrator {
            return Ok(());
        }

        let model = self
            .store
            .get_threat_model(threat_model_id)
            .await
            .map_err(|_| AuthzError::NotFound)?
            .ok_or(AuthzError::NotFound)?;
        let grants = self
            .store
            .grants_for(threat_model_id)
            .await
            .map_err(|_| AuthzError::NotFound)?;

        match effective_role(principal, &model, &grants) {
            Some(role) if role >= required => Ok(()),
            Some(role) => {
                trace!(%threat_model_id, have = %role, need = %required, "Denied: insufficient role");
                Err(AuthzError::Forbidden)
            }
            None => Err(AuthzError::NotFound),
        }
    }

    /// The principal's effective role, or `None` when nothing matches.
    pub async fn role_on(
        &self,
        principal: &Principal,
        threat_model_id: Uuid,
    ) -> Result<Option<Role>, AuthzError> {
        if principal.is_administrator {
            return Ok(Some(Role::Owner));
        }
        let Some(model) = self
            .store
            .get_threat_model(threat_model_id)
            .await
            .map_err(|_| AuthzError::NotFound)?
        else {
            return Ok(None);
        };
        let grants = self
            .store
            .grants_for(threat_model_id)
            .await
            .map_err(|_| AuthzError::NotFound)?;
        Ok(effective_role(principal, &model, &grants))
    }
}
