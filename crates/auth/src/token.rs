//! Bearer token verification.
//!
//! Tokens are HS256 JWTs with a fixed claim set issued by the external
//! authentication service. Verification checks signature and expiry;
//! administrator capability is looked up from group membership on every
//! request, never trusted from the token.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use tmhub_core::error::{AuthError, StoreError};
use tmhub_core::principal::Principal;
use tmhub_core::store::Store;

/// The claim set carried by every bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Internal user UUID, issued by the auth service at first login.
    pub sub: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Identity provider identifier, e.g. "oidc_google" or "saml_okta".
    pub idp: String,
    /// Group names asserted by the provider.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Expiry, epoch seconds.
    pub exp: i64,
    /// Issued-at, epoch seconds.
    pub iat: i64,
}

/// Verifies bearer tokens against the shared HS256 secret.
pub struct TokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.validate_exp = true;
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify signature and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                kind => {
                    debug!(error = ?kind, "Token rejected");
                    AuthError::InvalidToken(e.to_string())
                }
            })
    }

    /// Issue a token for the given claims. Used by tests and by the seed
    /// tooling; production tokens come from the auth service.
    pub fn issue(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

/// Build the per-request [`Principal`] from verified claims.
///
/// The administrator flag is resolved from the Administrators group here,
/// so membership changes take effect on the next request without token
/// reissue.
pub async fn resolve_principal(claims: &Claims, store: &dyn Store) -> Result<Principal, ResolveError> {
    let internal_uuid = Uuid::parse_str(&claims.sub)
        .map_err(|_| ResolveError::Auth(AuthError::InvalidToken("sub is not a UUID".into())))?;
    let is_administrator = store
        .is_administrator(internal_uuid)
        .await
        .map_err(ResolveError::Store)?;
    Ok(Principal {
        internal_uuid,
        provider: claims.idp.clone(),
        provider_user_id: claims.sub.clone(),
        email: claims.email.clone(),
        name: claims.name.clone(),
        groups: claims.groups.clone(),
        is_administrator,
    })
}

/// Principal resolution failures: bad claims or a store outage.
#[derive(Debug)]
pub enum ResolveError {
    Auth(AuthError),
    Store(StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn claims(exp_offset: i64) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            sub: Uuid::new_v4().to_string(),
            email: "alice@example.com".into(),
            name: Some("Alice".into()),
            idp: "oidc_google".into(),
            groups: vec!["security-team".into()],
            exp: now + exp_offset,
            iat: now,
        }
    }

    #[test]
    fn roundtrip_verifies() {
        let v = TokenVerifier::new("secret", 0);
        let token = v.issue(&claims(3600)).unwrap();
        let got = v.verify(&token).unwrap();
        assert_eq!(got.email, "alice@example.com");
        assert_eq!(got.groups, vec!["security-team"]);
    }

    #[test]
    fn wrong_secret_rejected() {
        let issuer = TokenVerifier::new("secret-a", 0);
        let verifier = TokenVerifier::new("secret-b", 0);
        let token = issuer.issue(&claims(3600)).unwrap();
        assert!(matches!(verifier.verify(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn expired_token_rejected() {
        let v = TokenVerifier::new("secret", 0);
        let token = v.issue(&claims(-3600)).unwrap();
        assert!(matches!(v.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn garbage_rejected() {
        let v = TokenVerifier::new("secret", 0);
        assert!(v.verify("not.a.jwt").is_err());
    }
}
