//! `tmhub serve` — start the server.
//!
//! Wires the whole runtime: SQLite store, ephemeral store, delivery
//! worker pool with the database's deny list, the add-on dispatcher with
//! its outcome loop and timeout sweeper, the hub registry, and finally
//! the gateway.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use tmhub_addons::{spawn_outcome_loop, spawn_timeout_sweeper, AddonDispatcher};
use tmhub_auth::{AuthzEngine, TokenVerifier};
use tmhub_collab::HubRegistry;
use tmhub_config::AppConfig;
use tmhub_core::store::Store;
use tmhub_delivery::{DenyList, WorkerPool, WorkerSettings};
use tmhub_gateway::{GatewayState, SharedState};
use tmhub_store::{InMemoryEphemeral, SqliteStore};

pub async fn run(port_override: Option<u16>, host_override: Option<String>) -> anyhow::Result<()> {
    let mut config = AppConfig::load().map_err(|e| anyhow::anyhow!("config: {e}"))?;
    if let Some(port) = port_override {
        config.server.port = port;
    }
    if let Some(host) = host_override {
        config.server.host = host;
    }

    let state = build_state(config).await?;
    tmhub_gateway::serve(state)
        .await
        .map_err(|e| anyhow::anyhow!("gateway: {e}"))
}

/// Build the full application state and spawn the background tasks.
pub async fn build_state(config: AppConfig) -> anyhow::Result<SharedState> {
    let store: Arc<SqliteStore> = Arc::new(
        SqliteStore::new(&config.database.path)
            .await
            .map_err(|e| anyhow::anyhow!("store: {e}"))?,
    );
    store
        .seed_deny_list()
        .await
        .map_err(|e| anyhow::anyhow!("deny seed: {e}"))?;

    let ephemeral = Arc::new(InMemoryEphemeral::new());
    spawn_ephemeral_sweeper(ephemeral.clone());

    // Deny list is loaded once at startup and immutable until restart.
    let deny_entries = store
        .deny_entries()
        .await
        .map_err(|e| anyhow::anyhow!("deny list: {e}"))?;
    let deny = Arc::new(DenyList::compile(&deny_entries));
    info!(patterns = deny_entries.len(), "Outbound deny list loaded");

    let (outcome_tx, outcome_rx) = mpsc::channel(256);
    let queue = WorkerPool::spawn(
        WorkerSettings {
            workers: config.delivery.workers,
            timeout: Duration::from_secs(config.delivery.timeout_secs),
            queue_depth: config.delivery.queue_depth,
        },
        deny,
        outcome_tx,
    );

    let authz = Arc::new(AuthzEngine::new(store.clone()));
    let callback_base = config
        .server
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", config.server.host, config.server.port));
    let dispatcher = Arc::new(AddonDispatcher::new(
        store.clone(),
        ephemeral.clone(),
        authz.clone(),
        queue.clone(),
        callback_base,
    ));
    spawn_outcome_loop(dispatcher.clone(), store.clone(), outcome_rx);
    spawn_timeout_sweeper(dispatcher.clone());

    let hubs = Arc::new(HubRegistry::new(store.clone()));
    let verifier = TokenVerifier::new(&config.auth.jwt_secret, config.auth.leeway_secs);
    let default_quota = GatewayState::default_quota_from(&config);

    Ok(Arc::new(GatewayState {
        config,
        store,
        ephemeral,
        verifier,
        authz,
        dispatcher,
        hubs,
        queue,
        default_quota,
    }))
}

/// Drop expired ephemeral entries once a minute; everything else is
/// cleaned lazily on access.
fn spawn_ephemeral_sweeper(ephemeral: Arc<InMemoryEphemeral>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let dropped = ephemeral.sweep();
            if dropped > 0 {
                tracing::debug!(dropped, "Ephemeral sweep");
            }
        }
    });
}
