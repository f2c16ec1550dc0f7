//! Delivery outcome reconciliation.
//!
//! Consumes terminal outcomes from the worker pool: records the delivery,
//! activates subscriptions after a successful test round, and drives
//! add-on invocations through auto-complete, the async arm, or failure. A
//! companion sweeper fails async invocations that stop reporting.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tmhub_core::delivery::{DeliveryDisposition, DeliveryKind, DeliveryOutcome};
use tmhub_core::store::Store;
use tmhub_core::webhook::{DeliveryRecord, SubscriptionStatus};

use crate::dispatcher::AddonDispatcher;

/// How often the timeout sweeper scans for quiet async invocations.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Consume outcomes until the worker pool closes the channel.
pub fn spawn_outcome_loop(
    dispatcher: Arc<AddonDispatcher>,
    store: Arc<dyn Store>,
    mut outcomes: mpsc::Receiver<DeliveryOutcome>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(outcome) = outcomes.recv().await {
            handle_outcome(&dispatcher, store.as_ref(), outcome).await;
        }
        debug!("Outcome loop stopped");
    })
}

/// Periodically fail in-progress invocations whose last status update is
/// older than the callback window.
pub fn spawn_timeout_sweeper(dispatcher: Arc<AddonDispatcher>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match dispatcher.fail_stale_invocations().await {
                Ok(0) => {}
                Ok(n) => info!(count = n, "Timed out quiet invocations"),
                Err(e) => warn!(error = %e, "Timeout sweep failed"),
            }
        }
    })
}

/// Apply one delivery outcome.
pub async fn handle_outcome(dispatcher: &AddonDispatcher, store: &dyn Store, outcome: DeliveryOutcome) {
    record(store, &outcome).await;

    match (&outcome.kind, &outcome.disposition) {
        (DeliveryKind::SubscriptionTest, DeliveryDisposition::Delivered { .. }) => {
            if let Err(e) = store.set_webhook_status(outcome.webhook_id, SubscriptionStatus::Active).await {
                warn!(webhook = %outcome.webhook_id, error = %e, "Could not activate subscription");
            } else {
                info!(webhook = %outcome.webhook_id, "Subscription verified and activated");
            }
        }
        (DeliveryKind::Subscription | DeliveryKind::SubscriptionTest, _) => {}

        (DeliveryKind::AddonInvocation { invocation_id, .. }, disposition) => {
            apply_invocation_outcome(dispatcher, *invocation_id, disposition).await;
        }
    }
}

async fn apply_invocation_outcome(
    dispatcher: &AddonDispatcher,
    invocation_id: Uuid,
    disposition: &DeliveryDisposition,
) {
    let result = match disposition {
        DeliveryDisposition::Delivered { callback_async: false, .. } => {
            dispatcher.complete_invocation(invocation_id).await.map(|_| ())
        }
        DeliveryDisposition::Delivered { callback_async: true, .. } => {
            dispatcher.mark_async_in_progress(invocation_id).await.map(|_| ())
        }
        DeliveryDisposition::SsrfBlocked { pattern } => dispatcher
            .fail_invocation(invocation_id, format!("delivery blocked by deny list ({pattern})"))
            .await
            .map(|_| ()),
        DeliveryDisposition::Failed { last_error, .. } => {
            dispatcher.fail_invocation(invocation_id, last_error.clone()).await.map(|_| ())
        }
    };
    if let Err(e) = result {
        // A signed callback can legitimately reach a terminal state first.
        debug!(invocation = %invocation_id, error = %e, "Invocation outcome not applied");
    }
}

async fn record(store: &dyn Store, outcome: &DeliveryOutcome) {
    let now = Utc::now();
    let (status, attempts, last_error) = match &outcome.disposition {
        DeliveryDisposition::Delivered { attempts, .. } => ("delivered", *attempts, None),
        DeliveryDisposition::SsrfBlocked { pattern } => {
            ("ssrf_blocked", 0, Some(format!("deny list: {pattern}")))
        }
        DeliveryDisposition::Failed { attempts, last_error } => {
            ("failed", *attempts, Some(last_error.clone()))
        }
    };
    let event = match &outcome.kind {
        DeliveryKind::AddonInvocation { .. } => "addon.invoked",
        DeliveryKind::SubscriptionTest => "webhook.test",
        DeliveryKind::Subscription => "subscription",
    };
    let record = DeliveryRecord {
        id: outcome.request_id,
        webhook_id: outcome.webhook_id,
        event: event.into(),
        target_url: outcome.target_url.clone(),
        status: status.into(),
        attempts,
        last_error,
        created_at: now,
        completed_at: now,
    };
    if let Err(e) = store.record_delivery(&record).await {
        warn!(delivery = %outcome.request_id, error = %e, "Could not record delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmhub_auth::AuthzEngine;
    use tmhub_core::access::AccessGrant;
    use tmhub_core::addon::{Addon, Invocation, InvocationStatus};
    use tmhub_core::model::ThreatModel;
    use tmhub_core::principal::{Principal, Role};
    use tmhub_core::webhook::WebhookSubscription;
    use tmhub_delivery::DeliveryQueue;
    use tmhub_store::{InMemoryEphemeral, SqliteStore};

    struct Fixture {
        dispatcher: Arc<AddonDispatcher>,
        store: Arc<SqliteStore>,
        webhook_id: Uuid,
        invocation: Invocation,
        // Keeps the stub delivery queue open so enqueues succeed.
        _jobs: tokio::sync::mpsc::Receiver<tmhub_core::delivery::DeliveryRequest>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::new(":memory:").await.unwrap());
        let ephemeral = Arc::new(InMemoryEphemeral::new());
        let authz = Arc::new(AuthzEngine::new(store.clone()));
        let (queue, jobs) = DeliveryQueue::channel(32);

        let principal = Principal {
            internal_uuid: Uuid::new_v4(),
            provider: "oidc_google".into(),
            provider_user_id: "alice".into(),
            email: "alice@example.com".into(),
            name: None,
            groups: vec![],
            is_administrator: false,
        };
        let model = ThreatModel::new(principal.internal_uuid, &principal.email, "tm", "STRIDE");
        store.create_threat_model(&model).await.unwrap();
        store
            .put_grant(&AccessGrant::user(model.id, &principal.email, Role::Reader))
            .await
            .unwrap();

        let webhook = WebhookSubscription {
            id: Uuid::new_v4(),
            owner: principal.internal_uuid,
            url: "https://addon.example.com/hook".into(),
            events: vec!["addon.invoked".into()],
            secret: "s".repeat(128),
            status: SubscriptionStatus::PendingVerification,
            created_at: Utc::now(),
        };
        store.create_webhook(&webhook).await.unwrap();
        let addon = Addon {
            id: Uuid::new_v4(),
            name: "scanner".into(),
            webhook_id: webhook.id,
            description: None,
            icon: None,
            object_types: vec![],
            threat_model_scope: None,
            created_at: Utc::now(),
        };
        store.create_addon(&addon).await.unwrap();

        let dispatcher = Arc::new(AddonDispatcher::new(
            store.clone(),
            ephemeral,
            authz,
            queue,
            "https://tmhub.example.com",
        ));
        let invocation = dispatcher
            .invoke(
                addon.id,
                &principal,
                crate::dispatcher::InvokeParams {
                    threat_model_id: model.id,
                    object_type: None,
                    object_id: None,
                    payload: serde_json::json!({}),
                },
            )
            .await
            .unwrap();

        Fixture { dispatcher, store, webhook_id: webhook.id, invocation, _jobs: jobs }
    }

    fn outcome(f: &Fixture, disposition: DeliveryDisposition) -> DeliveryOutcome {
        DeliveryOutcome {
            request_id: Uuid::new_v4(),
            webhook_id: f.webhook_id,
            target_url: "https://addon.example.com/hook".into(),
            kind: DeliveryKind::AddonInvocation {
                invocation_id: f.invocation.id,
                addon_id: f.invocation.addon_id,
            },
            disposition,
        }
    }

    #[tokio::test]
    async fn sync_delivery_auto_completes() {
        let f = fixture().await;
        handle_outcome(
            &f.dispatcher,
            f.store.as_ref(),
            outcome(&f, DeliveryDisposition::Delivered { status: 200, callback_async: false, attempts: 1 }),
        )
        .await;

        let inv = f.dispatcher.get_invocation(f.invocation.id).await.unwrap().unwrap();
        assert_eq!(inv.status, InvocationStatus::Completed);
        assert_eq!(inv.status_percent, 100);
    }

    #[tokio::test]
    async fn async_delivery_arms_in_progress() {
        let f = fixture().await;
        handle_outcome(
            &f.dispatcher,
            f.store.as_ref(),
            outcome(&f, DeliveryDisposition::Delivered { status: 202, callback_async: true, attempts: 1 }),
        )
        .await;

        let inv = f.dispatcher.get_invocation(f.invocation.id).await.unwrap().unwrap();
        assert_eq!(inv.status, InvocationStatus::InProgress);
        assert_eq!(inv.status_percent, 0);
    }

    #[tokio::test]
    async fn ssrf_block_fails_with_deny_message() {
        let f = fixture().await;
        handle_outcome(
            &f.dispatcher,
            f.store.as_ref(),
            outcome(&f, DeliveryDisposition::SsrfBlocked { pattern: "169.254.0.0/16".into() }),
        )
        .await;

        let inv = f.dispatcher.get_invocation(f.invocation.id).await.unwrap().unwrap();
        assert_eq!(inv.status, InvocationStatus::Failed);
        assert!(inv.status_message.unwrap().contains("deny list"));
    }

    #[tokio::test]
    async fn exhausted_delivery_fails_with_last_error() {
        let f = fixture().await;
        handle_outcome(
            &f.dispatcher,
            f.store.as_ref(),
            outcome(&f, DeliveryDisposition::Failed { attempts: 5, last_error: "target responded 503".into() }),
        )
        .await;

        let inv = f.dispatcher.get_invocation(f.invocation.id).await.unwrap().unwrap();
        assert_eq!(inv.status, InvocationStatus::Failed);
        assert_eq!(inv.status_message.as_deref(), Some("target responded 503"));

        // The delivery record is persisted for the deliveries listing.
        let records = f.store.list_deliveries(inv.invoked_by).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "failed");
        assert_eq!(records[0].attempts, 5);
    }

    #[tokio::test]
    async fn subscription_test_success_activates() {
        let f = fixture().await;
        let test_outcome = DeliveryOutcome {
            request_id: Uuid::new_v4(),
            webhook_id: f.webhook_id,
            target_url: "https://addon.example.com/hook".into(),
            kind: DeliveryKind::SubscriptionTest,
            disposition: DeliveryDisposition::Delivered { status: 200, callback_async: false, attempts: 1 },
        };
        handle_outcome(&f.dispatcher, f.store.as_ref(), test_outcome).await;

        let webhook = f.store.get_webhook(f.webhook_id).await.unwrap().unwrap();
        assert_eq!(webhook.status, SubscriptionStatus::Active);
    }
}
