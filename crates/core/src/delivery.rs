//! Delivery jobs and outcomes.
//!
//! These value objects flow between the add-on dispatcher, the subscription
//! test endpoint, and the delivery worker pool over channels; the worker
//! crate owns the retry loop and SSRF enforcement.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a delivery is on behalf of. The worker attaches invocation headers
/// for add-on jobs and routes the outcome back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryKind {
    /// Plain subscription event delivery.
    Subscription,
    /// Verification round for `POST /webhooks/subscriptions/{id}/test`.
    SubscriptionTest,
    /// Add-on invocation fan-out; carries the invocation and add-on ids
    /// for the `X-Invocation-Id` / `X-Addon-Id` headers.
    AddonInvocation { invocation_id: Uuid, addon_id: Uuid },
}

/// One outbound delivery job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub target_url: String,

    /// Event name carried in `X-Webhook-Event`.
    pub event: String,

    /// Raw JSON body; signed exactly as transmitted.
    pub body: String,

    /// HMAC signing secret of the webhook.
    pub secret: String,

    pub kind: DeliveryKind,
}

impl DeliveryRequest {
    pub fn new(
        webhook_id: Uuid,
        target_url: impl Into<String>,
        event: impl Into<String>,
        body: impl Into<String>,
        secret: impl Into<String>,
        kind: DeliveryKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            webhook_id,
            target_url: target_url.into(),
            event: event.into(),
            body: body.into(),
            secret: secret.into(),
            kind,
        }
    }
}

/// Terminal disposition of a delivery, reported once per job.
#[derive(Debug, Clone)]
pub enum DeliveryDisposition {
    /// A 2xx response. `callback_async` is true when the target answered
    /// with `X-TMI-Callback: async`.
    Delivered { status: u16, callback_async: bool, attempts: u32 },
    /// Target matched the deny list; no network I/O was performed.
    SsrfBlocked { pattern: String },
    /// All attempts failed (or a fatal 410 was returned).
    Failed { attempts: u32, last_error: String },
}

/// Outcome event sent back from the worker pool.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub request_id: Uuid,
    pub webhook_id: Uuid,
    pub target_url: String,
    pub kind: DeliveryKind,
    pub disposition: DeliveryDisposition,
}

impl DeliveryOutcome {
    /// True when the job ended with a 2xx from the target.
    pub fn is_delivered(&self) -> bool {
        matches!(self.disposition, DeliveryDisposition::Delivered { .. })
    }
}
