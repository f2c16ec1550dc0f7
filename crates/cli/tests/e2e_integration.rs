//! End-to-end integration tests for the tmhub server.
//!
//! These tests exercise the full pipeline through the gateway router:
//! token verification, principal resolution, authorization, quota
//! enforcement, and the add-on invocation flow with its signed callback.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use tower::ServiceExt;
use uuid::Uuid;

use tmhub_addons::AddonDispatcher;
use tmhub_auth::{AuthzEngine, Claims, TokenVerifier};
use tmhub_collab::HubRegistry;
use tmhub_config::AppConfig;
use tmhub_core::access::{ADMINISTRATORS_GROUP, WILDCARD_PROVIDER};
use tmhub_core::store::Store;
use tmhub_delivery::sign;
use tmhub_delivery::DeliveryQueue;
use tmhub_gateway::{build_router, GatewayState, SharedState};
use tmhub_store::{InMemoryEphemeral, SqliteStore};

const SECRET: &str = "e2e-secret";

// ── Harness ──────────────────────────────────────────────────────────────

struct Harness {
    state: SharedState,
    app: axum::Router,
}

async fn harness() -> Harness {
    let mut config = AppConfig::default();
    config.auth.jwt_secret = SECRET.into();

    let store: Arc<SqliteStore> = Arc::new(SqliteStore::new(":memory:").await.unwrap());
    store.seed_deny_list().await.unwrap();
    let ephemeral = Arc::new(InMemoryEphemeral::new());
    let authz = Arc::new(AuthzEngine::new(store.clone()));
    let (queue, mut jobs) = DeliveryQueue::channel(64);
    tokio::spawn(async move { while jobs.recv().await.is_some() {} });

    let dispatcher = Arc::new(AddonDispatcher::new(
        store.clone(),
        ephemeral.clone(),
        authz.clone(),
        queue.clone(),
        "https://tmhub.test",
    ));
    let hubs = Arc::new(HubRegistry::new(store.clone()));
    let default_quota = GatewayState::default_quota_from(&config);

    let state = Arc::new(GatewayState {
        config,
        store,
        ephemeral,
        verifier: TokenVerifier::new(SECRET, 0),
        authz,
        dispatcher,
        hubs,
        queue,
        default_quota,
    });
    let app = build_router(state.clone());
    Harness { state, app }
}

fn token(state: &GatewayState, sub: Uuid, email: &str, idp: &str, groups: &[&str]) -> String {
    let now = Utc::now().timestamp();
    state
        .verifier
        .issue(&Claims {
            sub: sub.to_string(),
            email: email.into(),
            name: None,
            idp: idp.into(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            exp: now + 3600,
            iat: now,
        })
        .unwrap()
}

async fn request(
    h: &Harness,
    method: &str,
    uri: &str,
    bearer: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = h.app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

async fn make_admin(state: &GatewayState, user: Uuid) {
    let admins = state
        .store
        .ensure_group(WILDCARD_PROVIDER, ADMINISTRATORS_GROUP)
        .await
        .unwrap();
    state.store.add_membership(admins.id, user).await.unwrap();
}

// ── Threat model lifecycle ───────────────────────────────────────────────

#[tokio::test]
async fn threat_model_crud_roundtrip() {
    let h = harness().await;
    let owner = Uuid::new_v4();
    let t = token(&h.state, owner, "owner@example.com", "oidc_google", &[]);

    let (status, created) = request(
        &h,
        "POST",
        "/threat_models",
        Some(&t),
        Some(serde_json::json!({"name": "Payment flow", "framework": "STRIDE"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let tm_id = created["id"].as_str().unwrap().to_string();

    let (status, fetched) = request(&h, "GET", &format!("/threat_models/{tm_id}"), Some(&t), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "Payment flow");

    let (status, _) = request(
        &h,
        "PUT",
        &format!("/threat_models/{tm_id}"),
        Some(&t),
        Some(serde_json::json!({"name": "Payments v2", "framework": "LINDDUN"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(&h, "DELETE", &format!("/threat_models/{tm_id}"), Some(&t), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = request(&h, "GET", &format!("/threat_models/{tm_id}"), Some(&t), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn read_denied_looks_missing_but_write_denied_is_forbidden() {
    let h = harness().await;
    let owner = Uuid::new_v4();
    let owner_token = token(&h.state, owner, "owner@example.com", "oidc_google", &[]);

    let (_, created) = request(
        &h,
        "POST",
        "/threat_models",
        Some(&owner_token),
        Some(serde_json::json!({"name": "Secret model"})),
    )
    .await;
    let tm_id = created["id"].as_str().unwrap().to_string();

    // A stranger cannot distinguish this model from a missing one.
    let stranger = token(&h.state, Uuid::new_v4(), "mallory@example.com", "oidc_google", &[]);
    let (status, _) = request(&h, "GET", &format!("/threat_models/{tm_id}"), Some(&stranger), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Grant reader to a group scoped to saml_okta.
    let (status, _) = request(
        &h,
        "POST",
        &format!("/threat_models/{tm_id}/grants"),
        Some(&owner_token),
        Some(serde_json::json!({
            "subject": "security-team", "subject_type": "group",
            "idp": "saml_okta", "role": "reader"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Same group name, same IdP: read works, write is 403.
    let okta_reader = token(&h.state, Uuid::new_v4(), "alice@example.com", "saml_okta", &["security-team"]);
    let (status, _) = request(&h, "GET", &format!("/threat_models/{tm_id}"), Some(&okta_reader), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request(
        &h,
        "PUT",
        &format!("/threat_models/{tm_id}"),
        Some(&okta_reader),
        Some(serde_json::json!({"name": "x", "framework": "STRIDE"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Same group name from a different provider: the grant never applies.
    let azure_reader = token(&h.state, Uuid::new_v4(), "bob@example.com", "saml_azure", &["security-team"]);
    let (status, _) = request(&h, "GET", &format!("/threat_models/{tm_id}"), Some(&azure_reader), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ── Sub-entities ─────────────────────────────────────────────────────────

#[tokio::test]
async fn entity_crud_and_json_patch() {
    let h = harness().await;
    let owner = Uuid::new_v4();
    let t = token(&h.state, owner, "owner@example.com", "oidc_google", &[]);

    let (_, created) = request(
        &h,
        "POST",
        "/threat_models",
        Some(&t),
        Some(serde_json::json!({"name": "tm"})),
    )
    .await;
    let tm_id = created["id"].as_str().unwrap().to_string();

    let (status, threat) = request(
        &h,
        "POST",
        &format!("/threat_models/{tm_id}/threats"),
        Some(&t),
        Some(serde_json::json!({"title": "SQL injection", "severity": "high"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let threat_id = threat["id"].as_str().unwrap().to_string();

    // RFC 6902 patch against the payload.
    let (status, patched) = request(
        &h,
        "PATCH",
        &format!("/threat_models/{tm_id}/threats/{threat_id}"),
        Some(&t),
        Some(serde_json::json!([
            {"op": "replace", "path": "/severity", "value": "critical"}
        ])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patched["data"]["severity"], "critical");

    // A failing test op surfaces as 422.
    let (status, _) = request(
        &h,
        "PATCH",
        &format!("/threat_models/{tm_id}/threats/{threat_id}"),
        Some(&t),
        Some(serde_json::json!([
            {"op": "test", "path": "/severity", "value": "low"}
        ])),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    // Unknown collection names are not found.
    let (status, _) = request(
        &h,
        "GET",
        &format!("/threat_models/{tm_id}/gadgets"),
        Some(&t),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn revoked_grant_is_seen_by_the_writing_transaction() {
    let h = harness().await;
    let owner = Uuid::new_v4();
    let owner_token = token(&h.state, owner, "owner@example.com", "oidc_google", &[]);
    let writer_token = token(&h.state, Uuid::new_v4(), "alice@example.com", "oidc_google", &[]);

    let (_, created) = request(
        &h,
        "POST",
        "/threat_models",
        Some(&owner_token),
        Some(serde_json::json!({"name": "tm"})),
    )
    .await;
    let tm_id = created["id"].as_str().unwrap().to_string();

    let (status, _) = request(
        &h,
        "POST",
        &format!("/threat_models/{tm_id}/grants"),
        Some(&owner_token),
        Some(serde_json::json!({
            "subject": "alice@example.com", "subject_type": "user", "role": "writer"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = request(
        &h,
        "POST",
        &format!("/threat_models/{tm_id}/threats"),
        Some(&writer_token),
        Some(serde_json::json!({"title": "spoofing"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Revoke, then write again: the mutation's in-transaction re-check
    // sees the revocation and the model reads as missing.
    let (status, _) = request(
        &h,
        "DELETE",
        &format!("/threat_models/{tm_id}/grants?subject=alice@example.com&subject_type=user"),
        Some(&owner_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = request(
        &h,
        "POST",
        &format!("/threat_models/{tm_id}/threats"),
        Some(&writer_token),
        Some(serde_json::json!({"title": "tampering"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ── Add-on invocation flow ───────────────────────────────────────────────

async fn setup_addon(h: &Harness, admin_token: &str, owner_token: &str) -> (String, String) {
    let (_, tm) = request(
        h,
        "POST",
        "/threat_models",
        Some(owner_token),
        Some(serde_json::json!({"name": "tm"})),
    )
    .await;
    let tm_id = tm["id"].as_str().unwrap().to_string();

    let (status, webhook) = request(
        h,
        "POST",
        "/webhooks/subscriptions",
        Some(admin_token),
        Some(serde_json::json!({
            "url": "https://addon.example.com/hook",
            "events": ["addon.invoked"],
            "secret": "s".repeat(128),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(webhook.get("secret").is_none(), "secret must not be exposed");

    let (status, addon) = request(
        h,
        "POST",
        "/addons",
        Some(admin_token),
        Some(serde_json::json!({
            "name": "scanner",
            "webhook_id": webhook["id"],
            "icon": "material-symbols:security",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    (addon["id"].as_str().unwrap().to_string(), tm_id)
}

#[tokio::test]
async fn subscription_activation_is_server_only() {
    let h = harness().await;
    let user = Uuid::new_v4();
    let t = token(&h.state, user, "user@example.com", "oidc_google", &[]);

    let (status, webhook) = request(
        &h,
        "POST",
        "/webhooks/subscriptions",
        Some(&t),
        Some(serde_json::json!({
            "url": "https://hooks.example.com/in",
            "secret": "s".repeat(128),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(webhook["status"], "pending_verification");
    let id = webhook["id"].as_str().unwrap().to_string();

    // Self-activation must be rejected; only a successful verification
    // delivery may activate a subscription.
    let (status, _) = request(
        &h,
        "PUT",
        &format!("/webhooks/subscriptions/{id}"),
        Some(&t),
        Some(serde_json::json!({"status": "active"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, updated) = request(
        &h,
        "PUT",
        &format!("/webhooks/subscriptions/{id}"),
        Some(&t),
        Some(serde_json::json!({"status": "disabled"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["status"], "disabled");
}

#[tokio::test]
async fn addon_create_requires_admin() {
    let h = harness().await;
    let user = Uuid::new_v4();
    let t = token(&h.state, user, "user@example.com", "oidc_google", &[]);

    let (status, _) = request(
        &h,
        "POST",
        "/addons",
        Some(&t),
        Some(serde_json::json!({"name": "x", "webhook_id": Uuid::new_v4()})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn invoke_then_signed_callbacks_then_conflict() {
    let h = harness().await;
    let admin = Uuid::new_v4();
    make_admin(&h.state, admin).await;
    let admin_token = token(&h.state, admin, "admin@example.com", "oidc_google", &[]);
    let owner = Uuid::new_v4();
    let owner_token = token(&h.state, owner, "owner@example.com", "oidc_google", &[]);

    let (addon_id, tm_id) = setup_addon(&h, &admin_token, &owner_token).await;

    let (status, accepted) = request(
        &h,
        "POST",
        &format!("/addons/{addon_id}/invoke"),
        Some(&owner_token),
        Some(serde_json::json!({"threat_model_id": tm_id, "payload": {"depth": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["status"], "pending");
    let invocation_id = accepted["invocation_id"].as_str().unwrap().to_string();

    // Signed progress callback (no bearer token).
    let secret = "s".repeat(128);
    let body = r#"{"status":"in_progress","status_percent":50}"#;
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/invocations/{invocation_id}/status"))
                .header("X-Webhook-Signature", sign::sign(&secret, body.as_bytes()))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Completion, then a backward transition attempt.
    let body = r#"{"status":"completed","status_percent":100}"#;
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/invocations/{invocation_id}/status"))
                .header("X-Webhook-Signature", sign::sign(&secret, body.as_bytes()))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = r#"{"status":"in_progress","status_percent":80}"#;
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/invocations/{invocation_id}/status"))
                .header("X-Webhook-Signature", sign::sign(&secret, body.as_bytes()))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // The invoker can read the final state.
    let (status, invocation) = request(
        &h,
        "GET",
        &format!("/invocations/{invocation_id}"),
        Some(&owner_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(invocation["status"], "completed");
}

#[tokio::test]
async fn callback_with_wrong_secret_is_rejected() {
    let h = harness().await;
    let admin = Uuid::new_v4();
    make_admin(&h.state, admin).await;
    let admin_token = token(&h.state, admin, "admin@example.com", "oidc_google", &[]);
    let owner = Uuid::new_v4();
    let owner_token = token(&h.state, owner, "owner@example.com", "oidc_google", &[]);
    let (addon_id, tm_id) = setup_addon(&h, &admin_token, &owner_token).await;

    let (_, accepted) = request(
        &h,
        "POST",
        &format!("/addons/{addon_id}/invoke"),
        Some(&owner_token),
        Some(serde_json::json!({"threat_model_id": tm_id})),
    )
    .await;
    let invocation_id = accepted["invocation_id"].as_str().unwrap().to_string();

    let body = r#"{"status":"completed","status_percent":100}"#;
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/invocations/{invocation_id}/status"))
                .header("X-Webhook-Signature", sign::sign("wrong", body.as_bytes()))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn active_quota_blocks_concurrent_invocations() {
    let h = harness().await;
    let admin = Uuid::new_v4();
    make_admin(&h.state, admin).await;
    let admin_token = token(&h.state, admin, "admin@example.com", "oidc_google", &[]);
    let owner = Uuid::new_v4();
    let owner_token = token(&h.state, owner, "owner@example.com", "oidc_google", &[]);
    let (addon_id, tm_id) = setup_addon(&h, &admin_token, &owner_token).await;

    let (status, _) = request(
        &h,
        "POST",
        &format!("/addons/{addon_id}/invoke"),
        Some(&owner_token),
        Some(serde_json::json!({"threat_model_id": tm_id})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // Default quota allows a single active invocation.
    let (status, body) = request(
        &h,
        "POST",
        &format!("/addons/{addon_id}/invoke"),
        Some(&owner_token),
        Some(serde_json::json!({"threat_model_id": tm_id})),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "quota_exceeded");
}
