//! The collaborative session WebSocket.
//!
//! The JWT is passed as a query parameter because WebSocket upgrade
//! requests are plain GETs and cannot carry an Authorization header
//! reliably across client environments. The token is validated and the
//! diagram authorized before the upgrade is accepted; invalid credentials
//! get a plain 401/404 without an upgrade attempt.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use tmhub_auth::resolve_principal;
use tmhub_collab::wire::ClientFrame;
use tmhub_core::principal::{Principal, Role};
use tmhub_core::store::Store as _;

use crate::SharedState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: String,
}

/// `GET /ws/diagrams/{diagram_id}?token=<bearer>` — upgrade into the
/// diagram's session hub.
pub async fn diagram_ws(
    ws: WebSocketUpgrade,
    Path(diagram_id): Path<Uuid>,
    Query(params): Query<WsParams>,
    State(state): State<SharedState>,
) -> Response {
    let claims = match state.verifier.verify(&params.token) {
        Ok(claims) => claims,
        Err(_) => return (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response(),
    };
    let principal = match resolve_principal(&claims, state.store.as_ref()).await {
        Ok(principal) => principal,
        Err(_) => return (StatusCode::UNAUTHORIZED, "Invalid token subject").into_response(),
    };

    // Resolve the diagram to its threat model and require read access;
    // denial is indistinguishable from a missing diagram.
    let diagram = match state.store.get_diagram(diagram_id).await {
        Ok(Some(diagram)) => diagram,
        Ok(None) => return (StatusCode::NOT_FOUND, "Not found").into_response(),
        Err(e) => {
            warn!(error = %e, "Diagram load failed during upgrade");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let role = match state.authz.role_on(&principal, diagram.threat_model_id).await {
        Ok(Some(role)) => role,
        Ok(None) | Err(_) => return (StatusCode::NOT_FOUND, "Not found").into_response(),
    };

    ws.on_upgrade(move |socket| run_session(socket, state, diagram_id, principal, role))
}

/// Pump frames between the socket and the diagram's hub until either side
/// goes away. The hub owns ordering; this task only transports.
async fn run_session(
    socket: WebSocket,
    state: SharedState,
    diagram_id: Uuid,
    principal: Principal,
    role: Role,
) {
    let participant = Uuid::new_v4();
    let (frames_tx, mut frames_rx) = mpsc::channel(state.config.collab.send_buffer);

    let hub = match state.hubs.attach(diagram_id, participant, role, frames_tx).await {
        Ok(hub) => hub,
        Err(e) => {
            warn!(diagram = %diagram_id, error = %e, "Hub attach failed");
            return;
        }
    };
    debug!(
        diagram = %diagram_id,
        participant = %participant,
        user = %principal.internal_uuid,
        role = %role,
        "Participant attached"
    );

    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval(std::time::Duration::from_secs(
        state.config.collab.ping_interval_secs,
    ));
    let max_missed = state.config.collab.max_missed_pongs;
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            outbound = frames_rx.recv() => {
                let Some(frame) = outbound else {
                    // Hub dropped this participant (slow consumer or hub
                    // shutdown); the session is over.
                    break;
                };
                let Ok(json) = serde_json::to_string(&frame) else { break };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => {
                                if hub.frame(participant, frame).await.is_err() {
                                    break;
                                }
                            }
                            // Ignore unparseable frames rather than kill
                            // the session.
                            Err(e) => debug!(participant = %participant, error = %e, "Bad frame ignored"),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => missed_pongs = 0,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            _ = ping.tick() => {
                if missed_pongs >= max_missed {
                    debug!(participant = %participant, "Missed pong limit reached");
                    break;
                }
                missed_pongs += 1;
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Dropped connections are an implicit detach.
    state.hubs.detach(diagram_id, participant).await;
    debug!(diagram = %diagram_id, participant = %participant, "Participant detached");
}
