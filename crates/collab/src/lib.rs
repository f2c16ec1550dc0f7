//! Collaborative diagram sessions.
//!
//! One [`hub::DiagramHub`] actor exists per diagram with at least one
//! attached WebSocket. The hub owns the authoritative `(cells,
//! update_vector)` pair and serializes every mutation through its inbound
//! channel, so cell state needs no locking. The [`registry::HubRegistry`]
//! creates hubs lazily on first attach and shuts them down when the last
//! participant leaves.

pub mod hub;
pub mod registry;
pub mod wire;

pub use hub::{HubHandle, ParticipantId};
pub use registry::HubRegistry;
pub use wire::{CellOpKind, CellOperation, ClientFrame, DiagramOperation, RejectReason, ServerFrame};
