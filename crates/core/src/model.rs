//! Threat model aggregates and diagrams.
//!
//! A `ThreatModel` is the root aggregate; it owns threats, assets, diagrams,
//! documents, repositories, and notes by reference, and is deleted as a
//! cascade. Diagram cells live in a flat id-keyed map — cells reference each
//! other by id only, so there are no pointer cycles in the in-memory model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The root aggregate for all threat modeling data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatModel {
    pub id: Uuid,

    /// Internal UUID of the owning user.
    pub owner: Uuid,

    /// Owner email, matched against user grants alongside the UUID.
    pub owner_email: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Methodology framework, e.g. "STRIDE" or "LINDDUN".
    pub framework: String,

    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ThreatModel {
    pub fn new(owner: Uuid, owner_email: impl Into<String>, name: impl Into<String>, framework: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner,
            owner_email: owner_email.into(),
            name: name.into(),
            description: None,
            framework: framework.into(),
            created_at: now,
            modified_at: now,
        }
    }
}

/// One diagram cell: a stable id plus opaque shape attributes.
///
/// The server never interprets the attributes; it only tracks which cell ids
/// an operation touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: String,

    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// A diagram owned by a threat model.
///
/// `update_vector` is a strictly monotonic per-diagram sequence, advanced by
/// exactly one per applied operation. The cell map is keyed by cell id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagram {
    pub id: Uuid,
    pub threat_model_id: Uuid,
    pub name: String,

    /// Diagram type, e.g. "data_flow".
    pub diagram_type: String,

    pub cells: BTreeMap<String, Cell>,
    pub update_vector: u64,

    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Diagram {
    pub fn new(threat_model_id: Uuid, name: impl Into<String>, diagram_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            threat_model_id,
            name: name.into(),
            diagram_type: diagram_type.into(),
            cells: BTreeMap::new(),
            update_vector: 0,
            created_at: now,
            modified_at: now,
        }
    }
}

/// Kinds of sub-entity a threat model owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Threat,
    Asset,
    Document,
    Repository,
    Note,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Threat => "threat",
            EntityKind::Asset => "asset",
            EntityKind::Document => "document",
            EntityKind::Repository => "repository",
            EntityKind::Note => "note",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "threat" => Some(EntityKind::Threat),
            "asset" => Some(EntityKind::Asset),
            "document" => Some(EntityKind::Document),
            "repository" => Some(EntityKind::Repository),
            "note" => Some(EntityKind::Note),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed sub-entity row under a threat model.
///
/// The payload is schemaless JSON; REST handlers expose it under typed
/// paths (`/threats`, `/assets`, …) but storage is uniform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubEntity {
    pub id: Uuid,
    pub threat_model_id: Uuid,
    pub kind: EntityKind,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl SubEntity {
    pub fn new(threat_model_id: Uuid, kind: EntityKind, data: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            threat_model_id,
            kind,
            data,
            created_at: now,
            modified_at: now,
        }
    }
}
