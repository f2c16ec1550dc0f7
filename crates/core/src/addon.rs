//! Add-ons and their invocations.
//!
//! An add-on delegates work to an external HTTPS endpoint through its
//! webhook. An invocation is one user-triggered execution; it lives in the
//! ephemeral store with a 7-day TTL and moves through a forward-only state
//! machine.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

use crate::error::ValidationError;

/// Maximum accepted icon length.
pub const MAX_ICON_LEN: usize = 60;

/// Maximum JSON-serialized invocation payload, in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 1024;

/// Invocation records expire after seven days.
pub const INVOCATION_TTL_SECS: u64 = 7 * 24 * 3600;

/// Async invocations without a callback within this window fail with
/// "timeout".
pub const CALLBACK_TIMEOUT_SECS: u64 = 15 * 60;

static MATERIAL_ICON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^material-symbols:[a-z]([a-z0-9_]*[a-z0-9])?$").expect("static pattern"));

static FONT_AWESOME_ICON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^fa-[a-z]([a-z]*[a-z])?(\-[a-z]+)? fa-([a-z]+)(-[a-z]+)*$").expect("static pattern"));

/// Validate an icon against the two accepted lexical forms.
pub fn validate_icon(icon: &str) -> Result<(), ValidationError> {
    if icon.len() > MAX_ICON_LEN {
        return Err(ValidationError::InvalidIcon);
    }
    if MATERIAL_ICON.is_match(icon) || FONT_AWESOME_ICON.is_match(icon) {
        Ok(())
    } else {
        Err(ValidationError::InvalidIcon)
    }
}

/// A registered add-on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Addon {
    pub id: Uuid,
    pub name: String,

    /// Webhook subscription used for outbound deliveries; deleting the
    /// webhook cascades to the add-on.
    pub webhook_id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Object types this add-on can be invoked against (e.g. "diagram",
    /// "threat"). Empty means the whole threat model only.
    #[serde(default)]
    pub object_types: Vec<String>,

    /// When set, the add-on is only invokable within this threat model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat_model_scope: Option<Uuid>,

    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Pending => "pending",
            InvocationStatus::InProgress => "in_progress",
            InvocationStatus::Completed => "completed",
            InvocationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InvocationStatus::Pending),
            "in_progress" => Some(InvocationStatus::InProgress),
            "completed" => Some(InvocationStatus::Completed),
            "failed" => Some(InvocationStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvocationStatus::Completed | InvocationStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Forward-only transition check. `in_progress -> in_progress` is legal
    /// so external services can report progress updates.
    pub fn can_transition(&self, to: InvocationStatus) -> bool {
        match (self, to) {
            (InvocationStatus::Pending, InvocationStatus::InProgress)
            | (InvocationStatus::Pending, InvocationStatus::Completed)
            | (InvocationStatus::Pending, InvocationStatus::Failed)
            | (InvocationStatus::InProgress, InvocationStatus::InProgress)
            | (InvocationStatus::InProgress, InvocationStatus::Completed)
            | (InvocationStatus::InProgress, InvocationStatus::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user-triggered execution of an add-on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub id: Uuid,
    pub addon_id: Uuid,
    pub threat_model_id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,

    /// Internal UUID of the invoking user.
    pub invoked_by: Uuid,

    /// Opaque payload forwarded to the add-on, at most
    /// [`MAX_PAYLOAD_BYTES`] when serialized.
    pub payload: serde_json::Value,

    pub status: InvocationStatus,

    /// Progress in percent, 0..=100.
    pub status_percent: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub status_updated_at: DateTime<Utc>,
}

impl Invocation {
    pub fn new(
        addon_id: Uuid,
        threat_model_id: Uuid,
        invoked_by: Uuid,
        object_type: Option<String>,
        object_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            addon_id,
            threat_model_id,
            object_type,
            object_id,
            invoked_by,
            payload,
            status: InvocationStatus::Pending,
            status_percent: 0,
            status_message: None,
            created_at: now,
            status_updated_at: now,
        }
    }
}
