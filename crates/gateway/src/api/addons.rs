//! Add-on and invocation handlers.
//!
//! Creating and deleting add-ons is administrator-only; invoking one is
//! open to any authenticated user who can read the target threat model.
//! The status callback authenticates with the webhook HMAC instead of a
//! bearer token and therefore lives outside the auth middleware.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::Extension;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tmhub_addons::InvokeParams;
use tmhub_core::addon::{validate_icon, Addon, Invocation, InvocationStatus};
use tmhub_core::error::{AuthError, AuthzError, ValidationError};
use tmhub_core::principal::Principal;
use tmhub_core::store::Store as _;
use tmhub_delivery::worker::HEADER_SIGNATURE;

use crate::error::ApiError;
use crate::SharedState;

#[derive(Deserialize)]
pub struct CreateAddon {
    pub name: String,
    pub webhook_id: Uuid,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub object_types: Vec<String>,
    #[serde(default)]
    pub threat_model_scope: Option<Uuid>,
}

/// 202 body for `POST /addons/{id}/invoke`.
#[derive(Serialize)]
pub struct InvocationAccepted {
    pub invocation_id: Uuid,
    pub status: InvocationStatus,
    pub created_at: DateTime<Utc>,
}

pub async fn create(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateAddon>,
) -> Result<(StatusCode, Json<Addon>), ApiError> {
    require_admin(&principal)?;

    if body.name.trim().is_empty() {
        return Err(ValidationError::field("name", "must not be empty").into());
    }
    if let Some(icon) = &body.icon {
        validate_icon(icon)?;
    }
    // The webhook must exist and carry a usable signing secret.
    state
        .store
        .get_webhook(body.webhook_id)
        .await?
        .ok_or_else(|| ValidationError::field("webhook_id", "unknown webhook"))?;

    let addon = Addon {
        id: Uuid::new_v4(),
        name: body.name,
        webhook_id: body.webhook_id,
        description: body.description,
        icon: body.icon,
        object_types: body.object_types,
        threat_model_scope: body.threat_model_scope,
        created_at: Utc::now(),
    };
    state.store.create_addon(&addon).await?;
    Ok((StatusCode::CREATED, Json(addon)))
}

pub async fn list(State(state): State<SharedState>) -> Result<Json<Vec<Addon>>, ApiError> {
    Ok(Json(state.store.list_addons().await?))
}

pub async fn fetch(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Addon>, ApiError> {
    let addon = state.store.get_addon(id).await?.ok_or(AuthzError::NotFound)?;
    Ok(Json(addon))
}

pub async fn remove(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    require_admin(&principal)?;
    state.store.get_addon(id).await?.ok_or(AuthzError::NotFound)?;
    state.dispatcher.delete_addon(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn invoke(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(params): Json<InvokeParams>,
) -> Result<(StatusCode, Json<InvocationAccepted>), ApiError> {
    let invocation = state.dispatcher.invoke(id, &principal, params).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(InvocationAccepted {
            invocation_id: invocation.id,
            status: invocation.status,
            created_at: invocation.created_at,
        }),
    ))
}

pub async fn list_invocations(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<Invocation>>, ApiError> {
    Ok(Json(state.dispatcher.list_invocations(&principal).await?))
}

pub async fn fetch_invocation(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<Invocation>, ApiError> {
    let invocation = state
        .dispatcher
        .get_invocation(id)
        .await?
        .ok_or(AuthzError::NotFound)?;
    if invocation.invoked_by != principal.internal_uuid && !principal.is_administrator {
        return Err(AuthzError::NotFound.into());
    }
    Ok(Json(invocation))
}

/// `POST /invocations/{id}/status` — HMAC-authenticated callback from the
/// external add-on service. No bearer token; the signature over the raw
/// body is the credential.
pub async fn invocation_callback(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Invocation>, ApiError> {
    let signature = headers
        .get(HEADER_SIGNATURE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AuthError::InvalidToken("missing webhook signature".into()))?;
    let invocation = state.dispatcher.callback(id, &body, signature).await?;
    Ok(Json(invocation))
}

fn require_admin(principal: &Principal) -> Result<(), ApiError> {
    if principal.is_administrator {
        Ok(())
    } else {
        Err(AuthzError::Forbidden.into())
    }
}
