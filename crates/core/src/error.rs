//! Error types for the tmhub domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant; the gateway maps them
//! onto HTTP status codes at the edge.

use thiserror::Error;

/// The top-level error type for all tmhub operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Authentication (401) ---
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    // --- Authorization (403 / 404) ---
    #[error("Authorization error: {0}")]
    Authz(#[from] AuthzError),

    // --- Collaborative sessions ---
    #[error("Collaboration error: {0}")]
    Collab(#[from] CollabError),

    // --- Add-on invocations ---
    #[error("Add-on error: {0}")]
    Addon(#[from] AddonError),

    // --- Webhook delivery ---
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    // --- Persistence / ephemeral store ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Request validation (400) ---
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // --- Rate and quota limits (429) ---
    #[error("Quota exceeded: {0}")]
    Quota(#[from] QuotaError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid bearer token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    Expired,
}

/// Authorization decisions.
///
/// `NotFound` covers both a genuinely missing resource and a read-denied
/// one, so callers cannot probe for existence.
#[derive(Debug, Clone, Error)]
pub enum AuthzError {
    #[error("Insufficient role for this operation")]
    Forbidden,

    #[error("Resource not found")]
    NotFound,
}

#[derive(Debug, Clone, Error)]
pub enum CollabError {
    #[error("Diagram session closed")]
    HubClosed,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

#[derive(Debug, Clone, Error)]
pub enum AddonError {
    #[error("Payload is {size} bytes, maximum is {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invocation not found or expired")]
    UnknownInvocation,

    #[error("Callback signature mismatch")]
    SignatureMismatch,

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Add-on has {active} active invocation(s)")]
    DeletionBlocked { active: usize },
}

#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("Target blocked by deny list: {pattern}")]
    SsrfBlocked { pattern: String },

    #[error("Target URL is invalid: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Row not found")]
    NotFound,

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Ephemeral store error: {0}")]
    Ephemeral(String),
}

#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Field '{field}': {reason}")]
    Field { field: String, reason: String },

    #[error("Icon does not match an accepted lexical form")]
    InvalidIcon,

    #[error("Webhook secret must be at least {min} characters")]
    SecretTooShort { min: usize },

    #[error("URL scheme must be https")]
    InsecureUrl,

    #[error("JSON Patch failed: {0}")]
    PatchFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum QuotaError {
    #[error("Active invocation limit reached ({max})")]
    ActiveLimit { max: u32 },

    #[error("Hourly invocation limit reached ({max}/h), retry after {retry_after_secs}s")]
    HourlyLimit { max: u32, retry_after_secs: u64 },

    #[error("API rate limit exceeded, retry after {retry_after_secs}s")]
    ApiLimit { retry_after_secs: u64 },
}

impl ValidationError {
    /// Shorthand for a per-field validation failure.
    pub fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Field {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
