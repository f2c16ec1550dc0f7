//! Typed sub-entity and metadata handlers.
//!
//! Threats, assets, documents, repositories, and notes share one storage
//! shape; the path segment picks the kind. PATCH applies RFC 6902 JSON
//! Patch to the entity payload and fails with 422 when an operation
//! cannot be applied.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::Extension;
use serde::Deserialize;
use uuid::Uuid;

use tmhub_core::error::{AuthzError, ValidationError};
use tmhub_core::model::{EntityKind, SubEntity};
use tmhub_core::principal::{Principal, Role};
use tmhub_core::store::{Mutation, Store as _};

use crate::error::ApiError;
use crate::SharedState;

/// Map a plural path segment to its entity kind.
fn kind_from_path(segment: &str) -> Result<EntityKind, ApiError> {
    match segment {
        "threats" => Ok(EntityKind::Threat),
        "assets" => Ok(EntityKind::Asset),
        "documents" => Ok(EntityKind::Document),
        "repositories" => Ok(EntityKind::Repository),
        "notes" => Ok(EntityKind::Note),
        _ => Err(AuthzError::NotFound.into()),
    }
}

pub async fn create(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path((id, kind)): Path<(Uuid, String)>,
    Json(data): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<SubEntity>), ApiError> {
    let kind = kind_from_path(&kind)?;
    state.authz.decide(&principal, id, Role::Writer).await?;
    let entity = SubEntity::new(id, kind, data);
    state
        .store
        .mutate_checked(&principal, id, Role::Writer, Mutation::CreateEntities(vec![entity.clone()]))
        .await?;
    Ok((StatusCode::CREATED, Json(entity)))
}

pub async fn list(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path((id, kind)): Path<(Uuid, String)>,
) -> Result<Json<Vec<SubEntity>>, ApiError> {
    let kind = kind_from_path(&kind)?;
    state.authz.decide(&principal, id, Role::Reader).await?;
    Ok(Json(state.store.entities_for(id, kind).await?))
}

pub async fn fetch(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path((id, kind, entity_id)): Path<(Uuid, String, Uuid)>,
) -> Result<Json<SubEntity>, ApiError> {
    let kind = kind_from_path(&kind)?;
    state.authz.decide(&principal, id, Role::Reader).await?;
    Ok(Json(entity_in_model(&state, id, kind, entity_id).await?))
}

pub async fn replace(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path((id, kind, entity_id)): Path<(Uuid, String, Uuid)>,
    Json(data): Json<serde_json::Value>,
) -> Result<Json<SubEntity>, ApiError> {
    let kind = kind_from_path(&kind)?;
    state.authz.decide(&principal, id, Role::Writer).await?;
    let mut entity = entity_in_model(&state, id, kind, entity_id).await?;
    entity.data = data;
    state
        .store
        .mutate_checked(&principal, id, Role::Writer, Mutation::UpdateEntities(vec![entity.clone()]))
        .await?;
    Ok(Json(entity))
}

pub async fn remove(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path((id, kind, entity_id)): Path<(Uuid, String, Uuid)>,
) -> Result<StatusCode, ApiError> {
    let kind = kind_from_path(&kind)?;
    state.authz.decide(&principal, id, Role::Writer).await?;
    // Scoped to the threat model and kind in SQL; a foreign entity id
    // reads as missing.
    state
        .store
        .mutate_checked(&principal, id, Role::Writer, Mutation::DeleteEntity { entity_id, kind })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// RFC 6902 PATCH against the entity payload.
pub async fn patch_entity(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path((id, kind, entity_id)): Path<(Uuid, String, Uuid)>,
    Json(patch): Json<json_patch::Patch>,
) -> Result<Json<SubEntity>, ApiError> {
    let kind = kind_from_path(&kind)?;
    state.authz.decide(&principal, id, Role::Writer).await?;
    let mut entity = entity_in_model(&state, id, kind, entity_id).await?;

    json_patch::patch(&mut entity.data, &patch)
        .map_err(|e| ValidationError::PatchFailed(e.to_string()))?;
    state
        .store
        .mutate_checked(&principal, id, Role::Writer, Mutation::UpdateEntities(vec![entity.clone()]))
        .await?;
    Ok(Json(entity))
}

pub async fn bulk_create(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path((id, kind)): Path<(Uuid, String)>,
    Json(items): Json<Vec<serde_json::Value>>,
) -> Result<(StatusCode, Json<Vec<SubEntity>>), ApiError> {
    let kind = kind_from_path(&kind)?;
    state.authz.decide(&principal, id, Role::Writer).await?;
    let created: Vec<SubEntity> = items.into_iter().map(|data| SubEntity::new(id, kind, data)).collect();
    state
        .store
        .mutate_checked(&principal, id, Role::Writer, Mutation::CreateEntities(created.clone()))
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// One targeted patch within a bulk PATCH request.
#[derive(Deserialize)]
pub struct BulkPatchItem {
    pub id: Uuid,
    pub patch: json_patch::Patch,
}

/// Apply RFC 6902 patches to several entities at once. All patches are
/// validated against current payloads before anything is written, so a
/// failing operation leaves the collection untouched.
pub async fn bulk_patch(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path((id, kind)): Path<(Uuid, String)>,
    Json(items): Json<Vec<BulkPatchItem>>,
) -> Result<Json<Vec<SubEntity>>, ApiError> {
    let kind = kind_from_path(&kind)?;
    state.authz.decide(&principal, id, Role::Writer).await?;

    let mut patched = Vec::with_capacity(items.len());
    for item in &items {
        let mut entity = entity_in_model(&state, id, kind, item.id).await?;
        json_patch::patch(&mut entity.data, &item.patch)
            .map_err(|e| ValidationError::PatchFailed(format!("{}: {e}", item.id)))?;
        patched.push(entity);
    }
    state
        .store
        .mutate_checked(&principal, id, Role::Writer, Mutation::UpdateEntities(patched.clone()))
        .await?;
    Ok(Json(patched))
}

/// Replace the whole collection of one kind.
pub async fn bulk_replace(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path((id, kind)): Path<(Uuid, String)>,
    Json(items): Json<Vec<serde_json::Value>>,
) -> Result<Json<Vec<SubEntity>>, ApiError> {
    let kind = kind_from_path(&kind)?;
    state.authz.decide(&principal, id, Role::Writer).await?;

    let created: Vec<SubEntity> = items.into_iter().map(|data| SubEntity::new(id, kind, data)).collect();
    // Drop-and-recreate happens in one transaction; a failure part way
    // through leaves the previous collection intact.
    state
        .store
        .mutate_checked(
            &principal,
            id,
            Role::Writer,
            Mutation::ReplaceEntities { kind, entities: created.clone() },
        )
        .await?;
    Ok(Json(created))
}

// --- Metadata ---

#[derive(Deserialize)]
pub struct MetadataValue {
    pub value: String,
}

pub async fn list_metadata(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authz.decide(&principal, id, Role::Reader).await?;
    let pairs = state.store.get_metadata(id).await?;
    let map: serde_json::Map<String, serde_json::Value> =
        pairs.into_iter().map(|(k, v)| (k, v.into())).collect();
    Ok(Json(map.into()))
}

pub async fn put_metadata(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path((id, key)): Path<(Uuid, String)>,
    Json(body): Json<MetadataValue>,
) -> Result<StatusCode, ApiError> {
    state.authz.decide(&principal, id, Role::Writer).await?;
    state
        .store
        .mutate_checked(&principal, id, Role::Writer, Mutation::SetMetadata { key, value: body.value })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_metadata(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path((id, key)): Path<(Uuid, String)>,
) -> Result<StatusCode, ApiError> {
    state.authz.decide(&principal, id, Role::Writer).await?;
    state
        .store
        .mutate_checked(&principal, id, Role::Writer, Mutation::DeleteMetadata { key })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn entity_in_model(
    state: &SharedState,
    threat_model_id: Uuid,
    kind: EntityKind,
    entity_id: Uuid,
) -> Result<SubEntity, ApiError> {
    let entity = state.store.get_entity(entity_id).await?.ok_or(AuthzError::NotFound)?;
    if entity.threat_model_id != threat_model_id || entity.kind != kind {
        return Err(AuthzError::NotFound.into());
    }
    Ok(entity)
}
