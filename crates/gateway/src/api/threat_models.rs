//! Threat model, grant, and diagram handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::Extension;
use serde::Deserialize;
use uuid::Uuid;

use tmhub_core::access::{effective_role, AccessGrant, SubjectType};
use tmhub_core::error::{AuthzError, ValidationError};
use tmhub_core::model::{Diagram, ThreatModel};
use tmhub_core::principal::{Principal, Role};
use tmhub_core::store::{Mutation, Store as _};

use crate::error::ApiError;
use crate::SharedState;

#[derive(Deserialize)]
pub struct CreateThreatModel {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_framework")]
    pub framework: String,
}

fn default_framework() -> String {
    "STRIDE".into()
}

#[derive(Deserialize)]
pub struct UpdateThreatModel {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub framework: String,
}

#[derive(Deserialize)]
pub struct GrantBody {
    pub subject: String,
    pub subject_type: String,
    #[serde(default)]
    pub idp: Option<String>,
    pub role: String,
}

#[derive(Deserialize)]
pub struct GrantSelector {
    pub subject: String,
    pub subject_type: String,
    #[serde(default)]
    pub idp: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateDiagram {
    pub name: String,
    #[serde(default = "default_diagram_type")]
    pub diagram_type: String,
}

fn default_diagram_type() -> String {
    "data_flow".into()
}

pub async fn create(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateThreatModel>,
) -> Result<(StatusCode, Json<ThreatModel>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ValidationError::field("name", "must not be empty").into());
    }
    let mut model = ThreatModel::new(principal.internal_uuid, &principal.email, body.name, body.framework);
    model.description = body.description;
    state.store.create_threat_model(&model).await?;
    Ok((StatusCode::CREATED, Json(model)))
}

/// List every threat model the principal can read.
pub async fn list(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<ThreatModel>>, ApiError> {
    let mut visible = Vec::new();
    for model in state.store.list_threat_models().await? {
        if principal.is_administrator {
            visible.push(model);
            continue;
        }
        let grants = state.store.grants_for(model.id).await?;
        if effective_role(&principal, &model, &grants).is_some() {
            visible.push(model);
        }
    }
    Ok(Json(visible))
}

pub async fn fetch(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<ThreatModel>, ApiError> {
    state.authz.decide(&principal, id, Role::Reader).await?;
    let model = state.store.get_threat_model(id).await?.ok_or(AuthzError::NotFound)?;
    Ok(Json(model))
}

pub async fn update(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateThreatModel>,
) -> Result<Json<ThreatModel>, ApiError> {
    state.authz.decide(&principal, id, Role::Writer).await?;
    let mut model = state.store.get_threat_model(id).await?.ok_or(AuthzError::NotFound)?;
    model.name = body.name;
    model.description = body.description;
    model.framework = body.framework;
    state
        .store
        .mutate_checked(&principal, id, Role::Writer, Mutation::UpdateThreatModel(model.clone()))
        .await?;
    Ok(Json(model))
}

pub async fn remove(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.authz.decide(&principal, id, Role::Owner).await?;
    state
        .store
        .mutate_checked(&principal, id, Role::Owner, Mutation::DeleteThreatModel)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Grants ---

pub async fn list_grants(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AccessGrant>>, ApiError> {
    state.authz.decide(&principal, id, Role::Owner).await?;
    Ok(Json(state.store.grants_for(id).await?))
}

pub async fn put_grant(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(body): Json<GrantBody>,
) -> Result<(StatusCode, Json<AccessGrant>), ApiError> {
    state.authz.decide(&principal, id, Role::Owner).await?;

    let subject_type = SubjectType::parse(&body.subject_type)
        .ok_or_else(|| ValidationError::field("subject_type", "must be 'user' or 'group'"))?;
    let role = Role::parse(&body.role)
        .ok_or_else(|| ValidationError::field("role", "must be reader, writer, or owner"))?;
    if subject_type == SubjectType::Group && body.idp.is_none() {
        return Err(ValidationError::field("idp", "required for group grants").into());
    }

    let grant = AccessGrant {
        threat_model_id: id,
        subject: body.subject,
        subject_type,
        idp: body.idp,
        role,
    };
    state
        .store
        .mutate_checked(&principal, id, Role::Owner, Mutation::PutGrant(grant.clone()))
        .await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

pub async fn delete_grant(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    axum::extract::Query(selector): axum::extract::Query<GrantSelector>,
) -> Result<StatusCode, ApiError> {
    state.authz.decide(&principal, id, Role::Owner).await?;
    let subject_type = SubjectType::parse(&selector.subject_type)
        .ok_or_else(|| ValidationError::field("subject_type", "must be 'user' or 'group'"))?;
    state
        .store
        .mutate_checked(
            &principal,
            id,
            Role::Owner,
            Mutation::DeleteGrant {
                subject: selector.subject,
                subject_type,
                idp: selector.idp,
            },
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Diagrams ---

pub async fn create_diagram(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(body): Json<CreateDiagram>,
) -> Result<(StatusCode, Json<Diagram>), ApiError> {
    state.authz.decide(&principal, id, Role::Writer).await?;
    let diagram = Diagram::new(id, body.name, body.diagram_type);
    state
        .store
        .mutate_checked(&principal, id, Role::Writer, Mutation::CreateDiagram(diagram.clone()))
        .await?;
    Ok((StatusCode::CREATED, Json(diagram)))
}

pub async fn list_diagrams(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Diagram>>, ApiError> {
    state.authz.decide(&principal, id, Role::Reader).await?;
    Ok(Json(state.store.diagrams_for(id).await?))
}

pub async fn fetch_diagram(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path((id, diagram_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Diagram>, ApiError> {
    state.authz.decide(&principal, id, Role::Reader).await?;
    let diagram = diagram_in_model(&state, id, diagram_id).await?;
    Ok(Json(diagram))
}

pub async fn remove_diagram(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path((id, diagram_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.authz.decide(&principal, id, Role::Writer).await?;
    // The delete is scoped to the threat model in SQL; a diagram id from
    // another model reads as missing.
    state
        .store
        .mutate_checked(&principal, id, Role::Writer, Mutation::DeleteDiagram(diagram_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Load a diagram, treating one that belongs to another threat model as
/// absent.
pub(crate) async fn diagram_in_model(
    state: &SharedState,
    threat_model_id: Uuid,
    diagram_id: Uuid,
) -> Result<Diagram, ApiError> {
    let diagram = state.store.get_diagram(diagram_id).await?.ok_or(AuthzError::NotFound)?;
    if diagram.threat_model_id != threat_model_id {
        return Err(AuthzError::NotFound.into());
    }
    Ok(diagram)
}
