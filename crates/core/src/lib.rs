//! # tmhub Core
//!
//! Domain types, traits, and error definitions for the tmhub collaborative
//! threat modeling server. This crate has **zero framework dependencies** —
//! it defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem boundary is defined as a trait here. Implementations live
//! in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod access;
pub mod addon;
pub mod delivery;
pub mod error;
pub mod model;
pub mod principal;
pub mod quota;
pub mod store;
pub mod webhook;

// Re-export key types at crate root for ergonomics
pub use access::{effective_role, AccessGrant, Group, GroupMembership, SubjectType, ADMINISTRATORS_GROUP, EVERYONE_GROUP, WILDCARD_PROVIDER};
pub use addon::{Addon, Invocation, InvocationStatus};
pub use delivery::{DeliveryKind, DeliveryOutcome, DeliveryRequest};
pub use error::{AddonError, AuthError, AuthzError, CollabError, DeliveryError, Error, QuotaError, Result, StoreError, ValidationError};
pub use model::{Cell, Diagram, EntityKind, SubEntity, ThreatModel};
pub use principal::{Principal, Role};
pub use quota::QuotaRecord;
pub use store::{EphemeralStore, Mutation, Store, WindowDecision};
pub use webhook::{default_deny_seed, DeliveryRecord, PatternType, SubscriptionStatus, UrlDenyEntry, WebhookSubscription};
