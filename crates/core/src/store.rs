//! Storage traits.
//!
//! `Store` is the canonical persistence boundary (threat models, grants,
//! groups, diagrams, webhooks, add-ons, quotas, deny list). `EphemeralStore`
//! is the TTL key-value boundary used for invocations and sliding-window
//! rate limiting. Implementations live in `tmhub-store`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::access::{AccessGrant, Group, SubjectType};
use crate::addon::Addon;
use crate::error::{Error, StoreError};
use crate::model::{Cell, Diagram, EntityKind, SubEntity, ThreatModel};
use crate::principal::{Principal, Role};
use crate::quota::QuotaRecord;
use crate::webhook::{DeliveryRecord, SubscriptionStatus, UrlDenyEntry, WebhookSubscription};

/// A write applied by [`Store::mutate_checked`] after the in-transaction
/// authorization re-check. The threat model id is the one the check ran
/// against; implementations scope entity and diagram statements to it in
/// SQL rather than trusting the caller's pre-reads.
#[derive(Debug, Clone)]
pub enum Mutation {
    UpdateThreatModel(ThreatModel),
    /// Cascade-deletes grants, diagrams, sub-entities, and metadata.
    DeleteThreatModel,
    PutGrant(AccessGrant),
    DeleteGrant {
        subject: String,
        subject_type: SubjectType,
        idp: Option<String>,
    },
    CreateDiagram(Diagram),
    DeleteDiagram(Uuid),
    CreateEntities(Vec<SubEntity>),
    UpdateEntities(Vec<SubEntity>),
    DeleteEntity {
        entity_id: Uuid,
        kind: EntityKind,
    },
    /// Drop every entity of `kind` and install `entities` in its place.
    ReplaceEntities {
        kind: EntityKind,
        entities: Vec<SubEntity>,
    },
    SetMetadata {
        key: String,
        value: String,
    },
    DeleteMetadata {
        key: String,
    },
}

/// Canonical persistence. Every mutating call is atomic: implementations
/// run each method inside a single transaction.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Threat models ---

    async fn create_threat_model(&self, model: &ThreatModel) -> Result<(), StoreError>;
    async fn get_threat_model(&self, id: Uuid) -> Result<Option<ThreatModel>, StoreError>;
    async fn update_threat_model(&self, model: &ThreatModel) -> Result<(), StoreError>;
    /// Cascade-deletes grants, diagrams, sub-entities, and metadata.
    async fn delete_threat_model(&self, id: Uuid) -> Result<(), StoreError>;
    async fn list_threat_models(&self) -> Result<Vec<ThreatModel>, StoreError>;

    /// Apply a mutation inside one transaction that first re-loads the
    /// threat model and its grants and re-checks the principal's
    /// effective role against `required`. A grant revoked between the
    /// gateway's dispatch check and this call is honored: the grants are
    /// re-read under the same transaction that writes, closing the
    /// check-then-write race.
    ///
    /// Deny surfaces match the authorization engine: no read access is
    /// `NotFound` (indistinguishable from a missing model), read access
    /// with an insufficient role is `Forbidden`.
    async fn mutate_checked(
        &self,
        principal: &Principal,
        threat_model_id: Uuid,
        required: Role,
        mutation: Mutation,
    ) -> Result<(), Error>;

    // --- Access grants ---

    async fn grants_for(&self, threat_model_id: Uuid) -> Result<Vec<AccessGrant>, StoreError>;
    /// Upserts on the `(threat_model, subject, subject_type, idp)` key.
    async fn put_grant(&self, grant: &AccessGrant) -> Result<(), StoreError>;
    async fn delete_grant(
        &self,
        threat_model_id: Uuid,
        subject: &str,
        subject_type: &str,
        idp: Option<&str>,
    ) -> Result<(), StoreError>;

    // --- Groups & memberships ---

    /// Finds or creates the `(provider, name)` group.
    async fn ensure_group(&self, provider: &str, name: &str) -> Result<Group, StoreError>;
    async fn find_group(&self, provider: &str, name: &str) -> Result<Option<Group>, StoreError>;
    async fn add_membership(&self, group_id: Uuid, user_id: Uuid) -> Result<(), StoreError>;
    async fn remove_membership(&self, group_id: Uuid, user_id: Uuid) -> Result<(), StoreError>;
    /// Membership lookup in the built-in Administrators group; consulted on
    /// every request so removals take effect immediately.
    async fn is_administrator(&self, user_id: Uuid) -> Result<bool, StoreError>;

    // --- Diagrams ---

    async fn create_diagram(&self, diagram: &Diagram) -> Result<(), StoreError>;
    async fn get_diagram(&self, id: Uuid) -> Result<Option<Diagram>, StoreError>;
    /// Writes back the hub's authoritative `(cells, update_vector)` pair.
    async fn save_diagram_state(
        &self,
        id: Uuid,
        cells: &std::collections::BTreeMap<String, Cell>,
        update_vector: u64,
    ) -> Result<(), StoreError>;
    async fn delete_diagram(&self, id: Uuid) -> Result<(), StoreError>;
    async fn diagrams_for(&self, threat_model_id: Uuid) -> Result<Vec<Diagram>, StoreError>;

    // --- Sub-entities (threats, assets, documents, repositories, notes) ---

    async fn create_entity(&self, entity: &SubEntity) -> Result<(), StoreError>;
    async fn get_entity(&self, id: Uuid) -> Result<Option<SubEntity>, StoreError>;
    async fn update_entity(&self, entity: &SubEntity) -> Result<(), StoreError>;
    async fn delete_entity(&self, id: Uuid) -> Result<(), StoreError>;
    async fn entities_for(
        &self,
        threat_model_id: Uuid,
        kind: EntityKind,
    ) -> Result<Vec<SubEntity>, StoreError>;

    // --- Threat model metadata (string key/value) ---

    async fn set_metadata(&self, threat_model_id: Uuid, key: &str, value: &str) -> Result<(), StoreError>;
    async fn get_metadata(&self, threat_model_id: Uuid) -> Result<Vec<(String, String)>, StoreError>;
    async fn delete_metadata(&self, threat_model_id: Uuid, key: &str) -> Result<(), StoreError>;

    // --- Webhook subscriptions & deliveries ---

    async fn create_webhook(&self, webhook: &WebhookSubscription) -> Result<(), StoreError>;
    async fn get_webhook(&self, id: Uuid) -> Result<Option<WebhookSubscription>, StoreError>;
    async fn list_webhooks(&self, owner: Uuid) -> Result<Vec<WebhookSubscription>, StoreError>;
    async fn set_webhook_status(&self, id: Uuid, status: SubscriptionStatus) -> Result<(), StoreError>;
    /// Rewrite url, events, and status iff the principal owns the row
    /// (or is an administrator); the ownership check and the write run
    /// in one transaction. Non-owners see `NotFound`. Owner and secret
    /// are immutable.
    async fn update_webhook_checked(
        &self,
        principal: &Principal,
        webhook: &WebhookSubscription,
    ) -> Result<(), Error>;
    /// Ownership-checked delete; cascades to add-ons referencing the
    /// webhook.
    async fn delete_webhook_checked(&self, principal: &Principal, id: Uuid) -> Result<(), Error>;
    /// Cascade-deletes add-ons referencing this webhook.
    async fn delete_webhook(&self, id: Uuid) -> Result<(), StoreError>;
    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError>;
    async fn list_deliveries(&self, owner: Uuid) -> Result<Vec<DeliveryRecord>, StoreError>;

    // --- Add-ons ---

    async fn create_addon(&self, addon: &Addon) -> Result<(), StoreError>;
    async fn get_addon(&self, id: Uuid) -> Result<Option<Addon>, StoreError>;
    async fn list_addons(&self) -> Result<Vec<Addon>, StoreError>;
    async fn delete_addon(&self, id: Uuid) -> Result<(), StoreError>;

    // --- Deny list & quotas ---

    async fn deny_entries(&self) -> Result<Vec<UrlDenyEntry>, StoreError>;
    async fn put_deny_entry(&self, entry: &UrlDenyEntry) -> Result<(), StoreError>;
    /// Per-user quota overrides; `None` means the caller's defaults apply.
    async fn quota_for(&self, user_id: Uuid) -> Result<Option<QuotaRecord>, StoreError>;
    async fn put_quota(&self, user_id: Uuid, quota: &QuotaRecord) -> Result<(), StoreError>;
}

/// Result of an atomic sliding-window insert attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowDecision {
    /// Whether the entry was inserted (count was below the limit).
    pub allowed: bool,

    /// Entries in the window after the operation (including the new entry
    /// when allowed).
    pub count: u64,

    /// Epoch seconds of the oldest entry still in the window, for
    /// `Retry-After` / `X-RateLimit-Reset` computation.
    pub oldest_epoch: Option<i64>,
}

/// TTL key-value store with sorted-set windows.
///
/// The window operation is the trim-count-insert sequence from the quota
/// design and MUST be atomic per key: two concurrent callers can never both
/// slip under the limit.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Refresh a key's TTL without touching the value. No-op when absent.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Atomic counter with TTL set on first increment.
    async fn incr_ex(&self, key: &str, ttl_secs: u64) -> Result<i64, StoreError>;
    /// Decrement, flooring at zero. Missing keys stay missing.
    async fn decr(&self, key: &str) -> Result<i64, StoreError>;

    /// Atomic trim-count-insert on a sorted set of epoch-second scores:
    /// drop scores older than `window_secs`, count the remainder, insert
    /// now iff under `limit`.
    async fn window_add(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
        ttl_secs: u64,
    ) -> Result<WindowDecision, StoreError>;

    /// All live keys with the given prefix and their values.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}
