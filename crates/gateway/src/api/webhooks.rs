//! Webhook subscription handlers.
//!
//! Subscriptions start in `pending_verification`; a successful test
//! delivery round (consumed by the reconciler) activates them. The
//! signing secret is write-only: it never appears in API responses.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::Extension;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tmhub_core::delivery::{DeliveryKind, DeliveryRequest};
use tmhub_core::error::{AuthzError, Error, ValidationError};
use tmhub_core::principal::Principal;
use tmhub_core::store::Store as _;
use tmhub_core::webhook::{DeliveryRecord, SubscriptionStatus, WebhookSubscription};

use crate::error::ApiError;
use crate::SharedState;

#[derive(Deserialize)]
pub struct CreateSubscription {
    pub url: String,
    #[serde(default)]
    pub events: Vec<String>,
    pub secret: String,
}

#[derive(Deserialize)]
pub struct UpdateSubscription {
    #[serde(default)]
    pub events: Option<Vec<String>>,
    /// Only "disabled" is accepted here. Activation is reserved to the
    /// server: a subscription becomes active when a verification test
    /// delivery succeeds, never by client request.
    #[serde(default)]
    pub status: Option<String>,
}

/// Subscription view without the secret.
#[derive(Serialize)]
pub struct SubscriptionDto {
    pub id: Uuid,
    pub owner: Uuid,
    pub url: String,
    pub events: Vec<String>,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
}

impl From<WebhookSubscription> for SubscriptionDto {
    fn from(w: WebhookSubscription) -> Self {
        Self {
            id: w.id,
            owner: w.owner,
            url: w.url,
            events: w.events,
            status: w.status,
            created_at: w.created_at,
        }
    }
}

pub async fn create(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateSubscription>,
) -> Result<(StatusCode, Json<SubscriptionDto>), ApiError> {
    WebhookSubscription::validate(&body.url, &body.secret)?;
    let webhook = WebhookSubscription {
        id: Uuid::new_v4(),
        owner: principal.internal_uuid,
        url: body.url,
        events: body.events,
        secret: body.secret,
        status: SubscriptionStatus::PendingVerification,
        created_at: Utc::now(),
    };
    state.store.create_webhook(&webhook).await?;
    Ok((StatusCode::CREATED, Json(webhook.into())))
}

pub async fn list(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<SubscriptionDto>>, ApiError> {
    let webhooks = state.store.list_webhooks(principal.internal_uuid).await?;
    Ok(Json(webhooks.into_iter().map(Into::into).collect()))
}

pub async fn fetch(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubscriptionDto>, ApiError> {
    let webhook = owned_webhook(&state, &principal, id).await?;
    Ok(Json(webhook.into()))
}

pub async fn update(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateSubscription>,
) -> Result<Json<SubscriptionDto>, ApiError> {
    let mut webhook = owned_webhook(&state, &principal, id).await?;

    if let Some(status) = &body.status {
        // Clients may only disable. Accepting "active" here would skip
        // the verification round the reconciler gates activation on.
        webhook.status = match status.as_str() {
            "disabled" => SubscriptionStatus::Disabled,
            _ => {
                return Err(ValidationError::field(
                    "status",
                    "only 'disabled' may be set; activation requires a successful verification test",
                )
                .into());
            }
        };
    }
    if let Some(events) = body.events {
        webhook.events = events;
    }
    state.store.update_webhook_checked(&principal, &webhook).await?;
    Ok(Json(webhook.into()))
}

pub async fn remove(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_webhook_checked(&principal, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Enqueue a verification delivery; the subscription activates when the
/// target answers 2xx.
pub async fn test(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let webhook = owned_webhook(&state, &principal, id).await?;
    let body = serde_json::json!({
        "event_type": "webhook.test",
        "webhook_id": webhook.id,
        "timestamp": Utc::now().to_rfc3339(),
    })
    .to_string();
    let request = DeliveryRequest::new(
        webhook.id,
        webhook.url.clone(),
        "webhook.test",
        body,
        webhook.secret.clone(),
        DeliveryKind::SubscriptionTest,
    );
    state.queue.enqueue(request).await.map_err(Error::Delivery)?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn deliveries(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<DeliveryRecord>>, ApiError> {
    Ok(Json(state.store.list_deliveries(principal.internal_uuid).await?))
}

/// Load a webhook the principal owns; anyone else sees 404.
async fn owned_webhook(
    state: &SharedState,
    principal: &Principal,
    id: Uuid,
) -> Result<WebhookSubscription, ApiError> {
    let webhook = state.store.get_webhook(id).await?.ok_or(AuthzError::NotFound)?;
    if webhook.owner != principal.internal_uuid && !principal.is_administrator {
        return Err(AuthzError::NotFound.into());
    }
    Ok(webhook)
}
