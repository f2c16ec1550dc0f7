//! WebSocket frame types.
//!
//! Frames are JSON objects discriminated by `message_type`. The first
//! frame a client ever receives on a new connection is `diagram_state`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use tmhub_core::model::Cell;

/// Per-cell mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellOpKind {
    Add,
    Update,
    Remove,
}

/// One cell mutation within an operation. `attributes` carries the full
/// cell content for `add` and `update`; `remove` only needs the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOperation {
    pub id: String,
    pub op: CellOpKind,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl CellOperation {
    pub fn add(id: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self { id: id.into(), op: CellOpKind::Add, attributes }
    }

    pub fn update(id: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self { id: id.into(), op: CellOpKind::Update, attributes }
    }

    pub fn remove(id: impl Into<String>) -> Self {
        Self { id: id.into(), op: CellOpKind::Remove, attributes: Map::new() }
    }
}

/// A batch of cell mutations, applied atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramOperation {
    pub cells: Vec<CellOperation>,
}

impl DiagramOperation {
    /// Every cell id this operation touches.
    pub fn referenced_ids(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|c| c.id.as_str())
    }
}

/// Frames accepted from clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ClientFrame {
    SyncStatusRequest,

    SyncRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        update_vector: Option<u64>,
    },

    DiagramOperationRequest {
        operation_id: String,
        base_vector: u64,
        operation: DiagramOperation,
    },
}

/// Rejection reasons for `operation_rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ConflictDetected,
    Unauthorized,
    InvalidOperation,
    RequiresResync,
}

/// Frames emitted to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Full authoritative state. Sent on attach, and in answer to a
    /// `sync_request` with a stale vector.
    DiagramState { cells: Vec<Cell>, update_vector: u64 },

    SyncStatusResponse { update_vector: u64 },

    /// Broadcast after a successful apply; totally ordered per hub.
    DiagramOperationEvent {
        operation_id: String,
        update_vector: u64,
        sequence_number: u64,
        operation: DiagramOperation,
    },

    /// Unicast to the requester whose operation was not applied.
    OperationRejected {
        operation_id: String,
        reason: RejectReason,
        update_vector: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        affected_cells: Vec<String>,
        requires_resync: bool,
    },
}
