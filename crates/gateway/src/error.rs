//! HTTP error mapping.
//!
//! Every domain error maps to exactly one status code at this edge;
//! nothing below the gateway knows about HTTP. Internal failures return a
//! generic 500 body and never leak details.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use tracing::error;

use tmhub_core::error::{AddonError, AuthzError, Error, QuotaError, StoreError, ValidationError};

/// Gateway-edge error wrapper.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

macro_rules! from_domain_error {
    ($($ty:ty),+) => {$(
        impl From<$ty> for ApiError {
            fn from(e: $ty) -> Self {
                Self(Error::from(e))
            }
        }
    )+};
}

from_domain_error!(
    tmhub_core::error::AuthError,
    AuthzError,
    AddonError,
    QuotaError,
    StoreError,
    ValidationError,
    tmhub_core::error::CollabError,
    serde_json::Error
);

impl From<tmhub_auth::token::ResolveError> for ApiError {
    fn from(e: tmhub_auth::token::ResolveError) -> Self {
        match e {
            tmhub_auth::token::ResolveError::Auth(a) => Self(Error::Auth(a)),
            tmhub_auth::token::ResolveError::Store(s) => Self(Error::Store(s)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message, retry_after) = classify(&self.0);
        let mut response =
            (status, Json(json!({ "error": kind, "message": message }))).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn classify(error: &Error) -> (StatusCode, &'static str, String, Option<u64>) {
    match error {
        Error::Auth(e) => (StatusCode::UNAUTHORIZED, "not_authenticated", e.to_string(), None),

        Error::Authz(AuthzError::Forbidden) => {
            (StatusCode::FORBIDDEN, "forbidden", "Insufficient role".into(), None)
        }
        // Read-denied and missing are deliberately indistinguishable.
        Error::Authz(AuthzError::NotFound) | Error::Store(StoreError::NotFound) => {
            (StatusCode::NOT_FOUND, "not_found", "Resource not found".into(), None)
        }

        Error::Validation(ValidationError::PatchFailed(reason)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "patch_failed",
            reason.clone(),
            None,
        ),
        Error::Validation(e) => (StatusCode::BAD_REQUEST, "validation", e.to_string(), None),

        Error::Addon(e) => match e {
            AddonError::PayloadTooLarge { .. } => {
                (StatusCode::BAD_REQUEST, "validation", e.to_string(), None)
            }
            AddonError::UnknownInvocation => {
                (StatusCode::NOT_FOUND, "not_found", e.to_string(), None)
            }
            AddonError::SignatureMismatch => {
                (StatusCode::UNAUTHORIZED, "not_authenticated", e.to_string(), None)
            }
            AddonError::InvalidTransition { .. } | AddonError::DeletionBlocked { .. } => {
                (StatusCode::CONFLICT, "conflict", e.to_string(), None)
            }
        },

        Error::Quota(e) => {
            let retry = match e {
                QuotaError::HourlyLimit { retry_after_secs, .. }
                | QuotaError::ApiLimit { retry_after_secs } => *retry_after_secs,
                QuotaError::ActiveLimit { .. } => 60,
            };
            (StatusCode::TOO_MANY_REQUESTS, "quota_exceeded", e.to_string(), Some(retry))
        }

        Error::Store(StoreError::Duplicate(what)) => (
            StatusCode::CONFLICT,
            "conflict",
            format!("Already exists: {what}"),
            None,
        ),

        other => {
            error!(error = %other, "Internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "Internal server error".into(),
                None,
            )
        }
    }
}
