//! The per-diagram session hub actor.
//!
//! A hub owns the authoritative `(cells, update_vector)` pair for one
//! diagram and consumes requests from a single inbound channel; every
//! mutation happens on the hub task, so the state needs no lock. Applied
//! operations are broadcast to all participants in a total order that
//! matches both `update_vector` and `sequence_number`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tmhub_core::error::CollabError;
use tmhub_core::model::{Cell, Diagram};
use tmhub_core::principal::Role;
use tmhub_core::store::Store;

use crate::wire::{CellOpKind, ClientFrame, DiagramOperation, RejectReason, ServerFrame};

/// Identifies one attached WebSocket within a hub.
pub type ParticipantId = Uuid;

/// How many applied operations the hub remembers for conflict checking.
/// A base vector older than this window forces a resync.
const MAX_HISTORY: usize = 512;

/// Inbound hub requests.
pub enum HubRequest {
    Attach {
        participant: ParticipantId,
        role: Role,
        frames: mpsc::Sender<ServerFrame>,
        done: oneshot::Sender<()>,
    },
    Detach {
        participant: ParticipantId,
    },
    Frame {
        participant: ParticipantId,
        frame: ClientFrame,
    },
    Shutdown,
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubRequest>,
}

impl HubHandle {
    /// Register a participant. The hub queues the initial `diagram_state`
    /// frame before this returns, so it precedes any broadcast.
    pub async fn attach(
        &self,
        participant: ParticipantId,
        role: Role,
        frames: mpsc::Sender<ServerFrame>,
    ) -> Result<(), CollabError> {
        let (done, ready) = oneshot::channel();
        self.tx
            .send(HubRequest::Attach { participant, role, frames, done })
            .await
            .map_err(|_| CollabError::HubClosed)?;
        ready.await.map_err(|_| CollabError::HubClosed)
    }

    pub async fn detach(&self, participant: ParticipantId) {
        let _ = self.tx.send(HubRequest::Detach { participant }).await;
    }

    /// Forward a client frame for processing.
    pub async fn frame(&self, participant: ParticipantId, frame: ClientFrame) -> Result<(), CollabError> {
        self.tx
            .send(HubRequest::Frame { participant, frame })
            .await
            .map_err(|_| CollabError::HubClosed)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(HubRequest::Shutdown).await;
    }
}

struct Participant {
    role: Role,
    frames: mpsc::Sender<ServerFrame>,
}

struct AppliedOp {
    update_vector: u64,
    cell_ids: HashSet<String>,
}

/// The actor state. Constructed from the persisted diagram on first
/// attach; destroyed when the last participant leaves.
pub struct DiagramHub {
    diagram_id: Uuid,
    cells: BTreeMap<String, Cell>,
    update_vector: u64,
    sequence: u64,
    history: VecDeque<AppliedOp>,
    participants: HashMap<ParticipantId, Participant>,
    store: Arc<dyn Store>,
}

impl DiagramHub {
    /// Spawn the hub task for a loaded diagram and return its handle.
    pub fn spawn(diagram: Diagram, store: Arc<dyn Store>) -> HubHandle {
        let (tx, rx) = mpsc::channel(256);
        let hub = DiagramHub {
            diagram_id: diagram.id,
            cells: diagram.cells,
            update_vector: diagram.update_vector,
            sequence: 0,
            history: VecDeque::new(),
            participants: HashMap::new(),
            store,
        };
        tokio::spawn(hub.run(rx));
        HubHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<HubRequest>) {
        debug!(diagram = %self.diagram_id, "Session hub started");
        while let Some(request) = rx.recv().await {
            match request {
                HubRequest::Attach { participant, role, frames, done } => {
                    self.handle_attach(participant, role, frames);
                    let _ = done.send(());
                }
                HubRequest::Detach { participant } => {
                    self.participants.remove(&participant);
                }
                HubRequest::Frame { participant, frame } => {
                    self.handle_frame(participant, frame).await;
                }
                HubRequest::Shutdown => break,
            }
        }
        info!(diagram = %self.diagram_id, "Session hub stopped");
    }

    fn handle_attach(&mut self, id: ParticipantId, role: Role, frames: mpsc::Sender<ServerFrame>) {
        let state = ServerFrame::DiagramState {
            cells: self.cells.values().cloned().collect(),
            update_vector: self.update_vector,
        };
        // The participant's buffer is fresh; a full queue here means it is
        // undersized, which is a configuration error, not a slow consumer.
        if frames.try_send(state).is_err() {
            warn!(participant = %id, "Could not queue initial state; participant dropped");
            return;
        }
        self.participants.insert(id, Participant { role, frames });
    }

    async fn handle_frame(&mut self, id: ParticipantId, frame: ClientFrame) {
        match frame {
            ClientFrame::SyncStatusRequest => {
                self.unicast(id, ServerFrame::SyncStatusResponse { update_vector: self.update_vector });
            }
            ClientFrame::SyncRequest { update_vector } => {
                if update_vector == Some(self.update_vector) {
                    self.unicast(id, ServerFrame::SyncStatusResponse { update_vector: self.update_vector });
                } else {
                    self.unicast(
                        id,
                        ServerFrame::DiagramState {
                            cells: self.cells.values().cloned().collect(),
                            update_vector: self.update_vector,
                        },
                    );
                }
            }
            ClientFrame::DiagramOperationRequest { operation_id, base_vector, operation } => {
                self.handle_operation(id, operation_id, base_vector, operation).await;
            }
        }
    }

    async fn handle_operation(
        &mut self,
        id: ParticipantId,
        operation_id: String,
        base_vector: u64,
        operation: DiagramOperation,
    ) {
        let Some(role) = self.participants.get(&id).map(|p| p.role) else {
            return;
        };
        if role < Role::Writer {
            self.reject(id, operation_id, RejectReason::Unauthorized, Vec::new(), false);
            return;
        }

        let current = self.update_vector;

        // A base vector ahead of the hub, or older than the retained
        // history, cannot be checked for conflicts.
        if base_vector > current {
            self.reject(id, operation_id, RejectReason::RequiresResync, Vec::new(), true);
            return;
        }
        let oldest_checkable = current - self.history.len() as u64;
        if base_vector < oldest_checkable {
            self.reject(id, operation_id, RejectReason::RequiresResync, Vec::new(), true);
            return;
        }

        // Conflict rule: at an equal vector the operation never conflicts;
        // behind the vector it conflicts iff it touches any cell touched
        // by an event in (base, current]. Disjoint operations are applied
        // as an implicit rebase.
        if base_vector < current {
            let referenced: HashSet<&str> = operation.referenced_ids().collect();
            let mut affected: Vec<String> = self
                .history
                .iter()
                .filter(|op| op.update_vector > base_vector)
                .flat_map(|op| op.cell_ids.iter())
                .filter(|touched| referenced.contains(touched.as_str()))
                .cloned()
                .collect();
            if !affected.is_empty() {
                affected.sort_unstable();
                affected.dedup();
                self.reject(id, operation_id, RejectReason::ConflictDetected, affected, true);
                return;
            }
        }

        // Validate against a scratch copy so a failing cell leaves no
        // partial mutation and no vector increment.
        let mut next = self.cells.clone();
        for cell_op in &operation.cells {
            let ok = match cell_op.op {
                CellOpKind::Add => next
                    .insert(
                        cell_op.id.clone(),
                        Cell { id: cell_op.id.clone(), attributes: cell_op.attributes.clone() },
                    )
                    .is_none(),
                CellOpKind::Update => match next.get_mut(&cell_op.id) {
                    Some(cell) => {
                        cell.attributes = cell_op.attributes.clone();
                        true
                    }
                    None => false,
                },
                CellOpKind::Remove => next.remove(&cell_op.id).is_some(),
            };
            if !ok {
                self.reject(
                    id,
                    operation_id,
                    RejectReason::InvalidOperation,
                    vec![cell_op.id.clone()],
                    true,
                );
                return;
            }
        }

        // Commit.
        self.cells = next;
        self.update_vector += 1;
        self.sequence += 1;
        self.history.push_back(AppliedOp {
            update_vector: self.update_vector,
            cell_ids: operation.referenced_ids().map(str::to_owned).collect(),
        });
        if self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }

        if let Err(e) = self
            .store
            .save_diagram_state(self.diagram_id, &self.cells, self.update_vector)
            .await
        {
            // The hub stays authoritative for the session; the next
            // successful save writes the full state again.
            warn!(diagram = %self.diagram_id, error = %e, "Diagram state save failed");
        }

        self.broadcast(ServerFrame::DiagramOperationEvent {
            operation_id,
            update_vector: self.update_vector,
            sequence_number: self.sequence,
            operation,
        });
    }

    fn reject(
        &mut self,
        id: ParticipantId,
        operation_id: String,
        reason: RejectReason,
        affected_cells: Vec<String>,
        requires_resync: bool,
    ) {
        self.unicast(
            id,
            ServerFrame::OperationRejected {
                operation_id,
                reason,
                update_vector: self.update_vector,
                affected_cells,
                requires_resync,
            },
        );
    }

    fn unicast(&mut self, id: ParticipantId, frame: ServerFrame) {
        let Some(sender) = self.participants.get(&id).map(|p| p.frames.clone()) else {
            return;
        };
        if let Err(e) = sender.try_send(frame) {
            self.drop_participant(id, &e);
        }
    }

    fn broadcast(&mut self, frame: ServerFrame) {
        let mut dead = Vec::new();
        for (id, participant) in &self.participants {
            if let Err(e) = participant.frames.try_send(frame.clone()) {
                dead.push((*id, matches!(e, mpsc::error::TrySendError::Full(_))));
            }
        }
        for (id, overflow) in dead {
            if overflow {
                warn!(participant = %id, "Send queue overflow; participant dropped");
            }
            self.participants.remove(&id);
        }
    }

    fn drop_participant(&mut self, id: ParticipantId, cause: &mpsc::error::TrySendError<ServerFrame>) {
        if matches!(cause, mpsc::error::TrySendError::Full(_)) {
            warn!(participant = %id, "Send queue overflow; participant dropped");
        }
        self.participants.remove(&id);
    }
}
