//! Invocation creation and callback reconciliation.
//!
//! Quota enforcement rides the ephemeral store: an active-invocation
//! counter per user and an atomic trim-count-insert sliding window for the
//! hourly limit. Invocation records themselves live under
//! `addon:invocation:{id}` with a 7-day TTL that callbacks refresh.
//! Status updates for one invocation are serialized through a per-id
//! lock.

use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tmhub_auth::AuthzEngine;
use tmhub_core::addon::{Invocation, InvocationStatus, CALLBACK_TIMEOUT_SECS, INVOCATION_TTL_SECS, MAX_PAYLOAD_BYTES};
use tmhub_core::delivery::{DeliveryKind, DeliveryRequest};
use tmhub_core::error::{AddonError, Error, QuotaError, ValidationError};
use tmhub_core::principal::{Principal, Role};
use tmhub_core::store::{EphemeralStore, Store};
use tmhub_delivery::{sign, DeliveryQueue};

/// Active-invocation markers expire after an hour in case a process dies
/// between increment and terminal decrement.
const ACTIVE_TTL_SECS: u64 = 3600;
const HOURLY_WINDOW_SECS: u64 = 3600;
/// Window key lives a minute past the window itself.
const HOURLY_TTL_SECS: u64 = HOURLY_WINDOW_SECS + 60;

fn invocation_key(id: Uuid) -> String {
    format!("addon:invocation:{id}")
}

fn active_key(user: Uuid) -> String {
    format!("addon:active:{user}")
}

fn hourly_key(user: Uuid) -> String {
    format!("addon:ratelimit:hour:{user}")
}

/// Caller-supplied invocation parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct InvokeParams {
    pub threat_model_id: Uuid,
    #[serde(default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub object_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Body of `POST /invocations/{id}/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackUpdate {
    pub status: InvocationStatus,
    pub status_percent: i64,
    #[serde(default)]
    pub status_message: Option<String>,
}

/// Creates invocations and applies status transitions.
pub struct AddonDispatcher {
    store: Arc<dyn Store>,
    ephemeral: Arc<dyn EphemeralStore>,
    authz: Arc<AuthzEngine>,
    queue: DeliveryQueue,
    /// Public base URL used to build callback URLs, e.g.
    /// `https://tmhub.example.com`.
    callback_base: String,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl AddonDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        ephemeral: Arc<dyn EphemeralStore>,
        authz: Arc<AuthzEngine>,
        queue: DeliveryQueue,
        callback_base: impl Into<String>,
    ) -> Self {
        Self {
            store,
            ephemeral,
            authz,
            queue,
            callback_base: callback_base.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create an invocation and enqueue its delivery.
    ///
    /// Quotas are enforced atomically per user: the active counter is
    /// incremented first and rolled back if any later step refuses, and
    /// the hourly window uses the store's atomic trim-count-insert.
    pub async fn invoke(
        &self,
        addon_id: Uuid,
        principal: &Principal,
        params: InvokeParams,
    ) -> Result<Invocation, Error> {
        let addon = self
            .store
            .get_addon(addon_id)
            .await?
            .ok_or(tmhub_core::error::AuthzError::NotFound)?;

        // A scoped add-on behaves as nonexistent outside its threat model.
        if let Some(scope) = addon.threat_model_scope {
            if scope != params.threat_model_id {
                return Err(tmhub_core::error::AuthzError::NotFound.into());
            }
        }
        if let Some(object_type) = &params.object_type {
            if !addon.object_types.is_empty() && !addon.object_types.contains(object_type) {
                return Err(ValidationError::field(
                    "object_type",
                    format!("add-on does not handle '{object_type}'"),
                )
                .into());
            }
        }

        self.authz
            .decide(principal, params.threat_model_id, Role::Reader)
            .await?;

        let payload_bytes = serde_json::to_vec(&params.payload)?;
        if payload_bytes.len() > MAX_PAYLOAD_BYTES {
            return Err(AddonError::PayloadTooLarge {
                size: payload_bytes.len(),
                max: MAX_PAYLOAD_BYTES,
            }
            .into());
        }

        let quota = self.store.quota_for(principal.internal_uuid).await?.unwrap_or_default();
        let user = principal.internal_uuid;

        let active = self.ephemeral.incr_ex(&active_key(user), ACTIVE_TTL_SECS).await?;
        if active > quota.max_active_invocations as i64 {
            self.ephemeral.decr(&active_key(user)).await?;
            return Err(QuotaError::ActiveLimit { max: quota.max_active_invocations }.into());
        }

        let window = self
            .ephemeral
            .window_add(
                &hourly_key(user),
                quota.max_invocations_per_hour,
                HOURLY_WINDOW_SECS,
                HOURLY_TTL_SECS,
            )
            .await?;
        if !window.allowed {
            self.ephemeral.decr(&active_key(user)).await?;
            let retry_after_secs = window
                .oldest_epoch
                .map(|oldest| (oldest + HOURLY_WINDOW_SECS as i64 - Utc::now().timestamp()).max(1) as u64)
                .unwrap_or(HOURLY_WINDOW_SECS);
            return Err(QuotaError::HourlyLimit {
                max: quota.max_invocations_per_hour,
                retry_after_secs,
            }
            .into());
        }

        let webhook = self
            .store
            .get_webhook(addon.webhook_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("add-on {addon_id} has no webhook")))?;

        let invocation = Invocation::new(
            addon.id,
            params.threat_model_id,
            user,
            params.object_type.clone(),
            params.object_id.clone(),
            params.payload.clone(),
        );
        self.save(&invocation).await?;

        let body = self.outbound_body(&invocation);
        let request = DeliveryRequest::new(
            webhook.id,
            webhook.url.clone(),
            "addon.invoked",
            body,
            webhook.secret.clone(),
            DeliveryKind::AddonInvocation { invocation_id: invocation.id, addon_id: addon.id },
        );
        self.queue.enqueue(request).await.map_err(Error::Delivery)?;

        info!(invocation = %invocation.id, addon = %addon.id, user = %user, "Invocation created");
        Ok(invocation)
    }

    /// Apply a signed callback update.
    ///
    /// The signature covers the raw body and is verified against the
    /// add-on's webhook secret in constant time.
    pub async fn callback(
        &self,
        invocation_id: Uuid,
        raw_body: &[u8],
        signature: &str,
    ) -> Result<Invocation, Error> {
        let lock = self.lock_for(invocation_id).await;
        let _guard = lock.lock().await;

        let invocation = self
            .load(invocation_id)
            .await?
            .ok_or(AddonError::UnknownInvocation)?;

        let webhook = match self.store.get_addon(invocation.addon_id).await? {
            Some(addon) => self
                .store
                .get_webhook(addon.webhook_id)
                .await?
                .ok_or_else(|| Error::Internal("invocation webhook missing".into()))?,
            None => return Err(Error::Internal("invocation add-on missing".into())),
        };

        if !sign::verify(&webhook.secret, raw_body, signature) {
            warn!(invocation = %invocation_id, "Callback signature mismatch");
            return Err(AddonError::SignatureMismatch.into());
        }

        let update: CallbackUpdate =
            serde_json::from_slice(raw_body).map_err(|e| ValidationError::field("body", e.to_string()))?;
        if !(0..=100).contains(&update.status_percent) {
            return Err(ValidationError::field("status_percent", "must be between 0 and 100").into());
        }

        self.apply_locked(invocation, update.status, update.status_percent as u8, update.status_message)
            .await
    }

    /// Apply a server-side transition (auto-complete, delivery failure,
    /// inactivity timeout). Same state machine as callbacks, no
    /// signature.
    pub async fn transition(
        &self,
        invocation_id: Uuid,
        to: InvocationStatus,
        percent: u8,
        message: Option<String>,
    ) -> Result<Invocation, Error> {
        let lock = self.lock_for(invocation_id).await;
        let _guard = lock.lock().await;
        let invocation = self
            .load(invocation_id)
            .await?
            .ok_or(AddonError::UnknownInvocation)?;
        self.apply_locked(invocation, to, percent, message).await
    }

    async fn apply_locked(
        &self,
        mut invocation: Invocation,
        to: InvocationStatus,
        percent: u8,
        message: Option<String>,
    ) -> Result<Invocation, Error> {
        if !invocation.status.can_transition(to) {
            return Err(AddonError::InvalidTransition {
                from: invocation.status.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        invocation.status = to;
        invocation.status_percent = percent;
        invocation.status_message = message;
        invocation.status_updated_at = Utc::now();
        self.save(&invocation).await?;

        if to.is_terminal() {
            self.ephemeral.decr(&active_key(invocation.invoked_by)).await?;
            self.locks.lock().await.remove(&invocation.id);
            debug!(invocation = %invocation.id, status = %to, "Invocation reached terminal state");
        }
        Ok(invocation)
    }

    /// Auto-complete after a synchronous 2xx delivery.
    pub async fn complete_invocation(&self, id: Uuid) -> Result<Invocation, Error> {
        self.transition(id, InvocationStatus::Completed, 100, None).await
    }

    /// Fail an invocation, preserving its last reported progress.
    pub async fn fail_invocation(&self, id: Uuid, message: impl Into<String>) -> Result<Invocation, Error> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let invocation = self.load(id).await?.ok_or(AddonError::UnknownInvocation)?;
        let percent = invocation.status_percent;
        self.apply_locked(invocation, InvocationStatus::Failed, percent, Some(message.into()))
            .await
    }

    /// Arm the async callback path: move a pending invocation to
    /// `in_progress, 0%`. A no-op when a callback has already advanced
    /// it.
    pub async fn mark_async_in_progress(&self, id: Uuid) -> Result<Invocation, Error> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let invocation = self.load(id).await?.ok_or(AddonError::UnknownInvocation)?;
        if invocation.status != InvocationStatus::Pending {
            return Ok(invocation);
        }
        self.apply_locked(invocation, InvocationStatus::InProgress, 0, None).await
    }

    pub async fn get_invocation(&self, id: Uuid) -> Result<Option<Invocation>, Error> {
        self.load(id).await
    }

    /// Invocations visible to the principal: their own, or all of them
    /// for administrators.
    pub async fn list_invocations(&self, principal: &Principal) -> Result<Vec<Invocation>, Error> {
        let mut invocations = self.all_invocations().await?;
        if !principal.is_administrator {
            invocations.retain(|i| i.invoked_by == principal.internal_uuid);
        }
        invocations.sort_by_key(|i| i.created_at);
        Ok(invocations)
    }

    /// Every live invocation record (reconciler and admin use).
    pub async fn all_invocations(&self) -> Result<Vec<Invocation>, Error> {
        let pairs = self.ephemeral.scan_prefix("addon:invocation:").await?;
        let mut out = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match serde_json::from_str::<Invocation>(&value) {
                Ok(inv) => out.push(inv),
                Err(e) => warn!(%key, error = %e, "Unreadable invocation record skipped"),
            }
        }
        Ok(out)
    }

    /// Delete an add-on, refusing while it has live invocations.
    pub async fn delete_addon(&self, addon_id: Uuid) -> Result<(), Error> {
        let active = self
            .all_invocations()
            .await?
            .into_iter()
            .filter(|i| i.addon_id == addon_id && i.status.is_active())
            .count();
        if active > 0 {
            return Err(AddonError::DeletionBlocked { active }.into());
        }
        self.store.delete_addon(addon_id).await?;
        Ok(())
    }

    /// The callback URL advertised to external services.
    pub fn callback_url(&self, invocation_id: Uuid) -> String {
        format!("{}/invocations/{invocation_id}/status", self.callback_base)
    }

    fn outbound_body(&self, invocation: &Invocation) -> String {
        let mut body = serde_json::Map::new();
        body.insert("event_type".into(), "addon.invoked".into());
        body.insert("invocation_id".into(), invocation.id.to_string().into());
        body.insert("addon_id".into(), invocation.addon_id.to_string().into());
        body.insert("threat_model_id".into(), invocation.threat_model_id.to_string().into());
        if let Some(object_type) = &invocation.object_type {
            body.insert("object_type".into(), object_type.clone().into());
        }
        if let Some(object_id) = &invocation.object_id {
            body.insert("object_id".into(), object_id.clone().into());
        }
        body.insert("timestamp".into(), invocation.created_at.to_rfc3339().into());
        body.insert("payload".into(), invocation.payload.clone());
        body.insert("callback_url".into(), self.callback_url(invocation.id).into());
        serde_json::Value::Object(body).to_string()
    }

    async fn load(&self, id: Uuid) -> Result<Option<Invocation>, Error> {
        match self.ephemeral.get(&invocation_key(id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, invocation: &Invocation) -> Result<(), Error> {
        self.ephemeral
            .set_ex(
                &invocation_key(invocation.id),
                &serde_json::to_string(invocation)?,
                INVOCATION_TTL_SECS,
            )
            .await?;
        Ok(())
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks.lock().await.entry(id).or_default().clone()
    }

    /// Fail async invocations with no status update in the last fifteen
    /// minutes. Returns how many were failed.
    pub async fn fail_stale_invocations(&self) -> Result<usize, Error> {
        let cutoff = Utc::now() - chrono::Duration::seconds(CALLBACK_TIMEOUT_SECS as i64);
        let mut failed = 0;
        for invocation in self.all_invocations().await? {
            if invocation.status == InvocationStatus::InProgress && invocation.status_updated_at < cutoff {
                match self
                    .transition(invocation.id, InvocationStatus::Failed, invocation.status_percent, Some("timeout".into()))
                    .await
                {
                    Ok(_) => failed += 1,
                    // A concurrent callback may have won the race.
                    Err(e) => debug!(invocation = %invocation.id, error = %e, "Stale-failure skipped"),
                }
            }
        }
        Ok(failed)
    }
}
