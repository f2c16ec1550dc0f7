//! HTTP and WebSocket gateway for tmhub.
//!
//! Every request is authenticated from its bearer token, resolved to a
//! [`Principal`] (including the per-request administrator lookup), and
//! rate limited with sliding minute and hour windows before it reaches a
//! handler. The HMAC-authenticated invocation callback and the WebSocket
//! upgrade live outside the bearer middleware and do their own checks.
//!
//! Built on Axum for high performance async HTTP.

pub mod api;
pub mod error;
pub mod ratelimit;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use tmhub_addons::AddonDispatcher;
use tmhub_auth::{resolve_principal, AuthzEngine, TokenVerifier};
use tmhub_collab::HubRegistry;
use tmhub_config::AppConfig;
use tmhub_core::error::AuthError;
use tmhub_core::principal::Principal;
use tmhub_core::quota::QuotaRecord;
use tmhub_core::store::{EphemeralStore, Store};
use tmhub_delivery::DeliveryQueue;

use crate::error::ApiError;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub ephemeral: Arc<dyn EphemeralStore>,
    pub verifier: TokenVerifier,
    pub authz: Arc<AuthzEngine>,
    pub dispatcher: Arc<AddonDispatcher>,
    pub hubs: Arc<HubRegistry>,
    pub queue: DeliveryQueue,
    /// API rate limits applied to users without a quota row.
    pub default_quota: QuotaRecord,
}

pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    /// Default quota derived from the config's limit section.
    pub fn default_quota_from(config: &AppConfig) -> QuotaRecord {
        QuotaRecord {
            max_api_requests_per_minute: config.limits.api_requests_per_minute,
            max_api_requests_per_hour: config.limits.api_requests_per_hour,
            ..QuotaRecord::default()
        }
    }
}

/// Build the full gateway router.
///
/// Security layers applied to the bearer-authenticated surface:
/// - token verification + principal resolution (admin lookup per request)
/// - sliding-window rate limiting with `X-RateLimit-*` headers
/// - request body size limit
/// - CORS restricted to configured origins
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let authed = Router::new()
        .route("/me", get(me_handler))
        // Threat models and grants
        .route("/threat_models", post(api::threat_models::create).get(api::threat_models::list))
        .route(
            "/threat_models/{id}",
            get(api::threat_models::fetch)
                .put(api::threat_models::update)
                .delete(api::threat_models::remove),
        )
        .route(
            "/threat_models/{id}/grants",
            get(api::threat_models::list_grants)
                .post(api::threat_models::put_grant)
                .delete(api::threat_models::delete_grant),
        )
        // Diagrams
        .route(
            "/threat_models/{id}/diagrams",
            post(api::threat_models::create_diagram).get(api::threat_models::list_diagrams),
        )
        .route(
            "/threat_models/{id}/diagrams/{diagram_id}",
            get(api::threat_models::fetch_diagram).delete(api::threat_models::remove_diagram),
        )
        // Metadata
        .route("/threat_models/{id}/metadata", get(api::entities::list_metadata))
        .route(
            "/threat_models/{id}/metadata/{key}",
            put(api::entities::put_metadata).delete(api::entities::delete_metadata),
        )
        // Typed sub-entities (threats, assets, documents, repositories, notes)
        .route(
            "/threat_models/{id}/{kind}",
            post(api::entities::create).get(api::entities::list),
        )
        .route(
            "/threat_models/{id}/{kind}/bulk",
            post(api::entities::bulk_create)
                .put(api::entities::bulk_replace)
                .patch(api::entities::bulk_patch),
        )
        .route(
            "/threat_models/{id}/{kind}/{entity_id}",
            get(api::entities::fetch)
                .put(api::entities::replace)
                .patch(api::entities::patch_entity)
                .delete(api::entities::remove),
        )
        // Webhook subscriptions
        .route(
            "/webhooks/subscriptions",
            post(api::webhooks::create).get(api::webhooks::list),
        )
        .route(
            "/webhooks/subscriptions/{id}",
            get(api::webhooks::fetch).put(api::webhooks::update).delete(api::webhooks::remove),
        )
        .route("/webhooks/subscriptions/{id}/test", post(api::webhooks::test))
        .route("/webhooks/deliveries", get(api::webhooks::deliveries))
        // Add-ons and invocations
        .route("/addons", post(api::addons::create).get(api::addons::list))
        .route("/addons/{id}", get(api::addons::fetch).delete(api::addons::remove))
        .route("/addons/{id}/invoke", post(api::addons::invoke))
        .route("/invocations", get(api::addons::list_invocations))
        .route("/invocations/{id}", get(api::addons::fetch_invocation))
        .layer(middleware::from_fn_with_state(state.clone(), ratelimit::middleware))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let cors = build_cors(&state.config);

    Router::new()
        .route("/health", get(health_handler))
        // HMAC-authenticated, no bearer token.
        .route("/invocations/{id}/status", post(api::addons::invocation_callback))
        // Token is carried in a query parameter; the handler authenticates.
        .route("/ws/diagrams/{diagram_id}", get(api::ws::diagram_ws))
        .merge(authed)
        .layer(DefaultBodyLimit::max(state.config.server.max_body_bytes))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn build_cors(config: &AppConfig) -> CorsLayer {
    let mut origins: Vec<axum::http::HeaderValue> = Vec::new();
    for origin in &config.server.allowed_origins {
        if let Ok(value) = origin.parse() {
            origins.push(value);
        }
    }
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(3600))
}

/// Start the gateway HTTP server.
pub async fn serve(state: SharedState) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let app = build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}

/// Authentication middleware for the bearer-token surface.
///
/// Verifies the token, resolves the principal (including the
/// administrator lookup), and stores it as a request extension.
async fn auth_middleware(
    State(state): State<SharedState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingToken)?;

    let claims = state.verifier.verify(token)?;
    let principal = resolve_principal(&claims, state.store.as_ref()).await?;

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

/// `GET /me` — the resolved principal for the presented token.
async fn me_handler(
    axum::Extension(principal): axum::Extension<Principal>,
) -> Json<Principal> {
    Json(principal)
}
