//! Lazy hub registry.
//!
//! Hubs are created on first attach and torn down when the last
//! participant detaches. The registry's lock only guards the map and the
//! per-hub participant counts; all diagram state lives inside the hub
//! actors.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use tmhub_core::error::CollabError;
use tmhub_core::principal::Role;
use tmhub_core::store::Store;

use crate::hub::{DiagramHub, HubHandle, ParticipantId};
use crate::wire::ServerFrame;

struct HubEntry {
    handle: HubHandle,
    participants: usize,
}

/// Creates, shares, and reaps session hubs.
pub struct HubRegistry {
    store: Arc<dyn Store>,
    hubs: Mutex<HashMap<Uuid, HubEntry>>,
}

impl HubRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, hubs: Mutex::new(HashMap::new()) }
    }

    /// Attach a participant to the diagram's hub, creating the hub from
    /// persisted state when it is not running.
    pub async fn attach(
        &self,
        diagram_id: Uuid,
        participant: ParticipantId,
        role: Role,
        frames: mpsc::Sender<ServerFrame>,
    ) -> Result<HubHandle, CollabError> {
        let mut hubs = self.hubs.lock().await;
        if !hubs.contains_key(&diagram_id) {
            let diagram = self
                .store
                .get_diagram(diagram_id)
                .await
                .map_err(|e| CollabError::InvalidOperation(e.to_string()))?
                .ok_or_else(|| CollabError::InvalidOperation("unknown diagram".into()))?;
            debug!(diagram = %diagram_id, "Creating session hub");
            let handle = DiagramHub::spawn(diagram, self.store.clone());
            hubs.insert(diagram_id, HubEntry { handle, participants: 0 });
        }

        let entry = hubs.get_mut(&diagram_id).expect("entry just ensured");
        entry.handle.attach(participant, role, frames).await?;
        entry.participants += 1;
        Ok(entry.handle.clone())
    }

    /// Detach a participant; the hub is shut down when it was the last.
    pub async fn detach(&self, diagram_id: Uuid, participant: ParticipantId) {
        let mut hubs = self.hubs.lock().await;
        if let Some(entry) = hubs.get_mut(&diagram_id) {
            entry.handle.detach(participant).await;
            entry.participants = entry.participants.saturating_sub(1);
            if entry.participants == 0 {
                debug!(diagram = %diagram_id, "Last participant left; reaping hub");
                entry.handle.shutdown().await;
                hubs.remove(&diagram_id);
            }
        }
    }

    /// Number of live hubs (test and introspection helper).
    pub async fn active_hubs(&self) -> usize {
        self.hubs.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmhub_core::model::Diagram;
    use tmhub_store::SqliteStore;

    async fn setup() -> (HubRegistry, Uuid) {
        let store = Arc::new(SqliteStore::new(":memory:").await.unwrap());
        let diagram = Diagram::new(Uuid::new_v4(), "flow", "data_flow");
        let id = diagram.id;
        store.create_diagram(&diagram).await.unwrap();
        (HubRegistry::new(store), id)
    }

    #[tokio::test]
    async fn hubs_are_lazy_and_reaped() {
        let (registry, diagram_id) = setup().await;
        assert_eq!(registry.active_hubs().await, 0);

        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);

        registry.attach(diagram_id, p1, Role::Writer, tx1).await.unwrap();
        registry.attach(diagram_id, p2, Role::Reader, tx2).await.unwrap();
        assert_eq!(registry.active_hubs().await, 1);

        registry.detach(diagram_id, p1).await;
        assert_eq!(registry.active_hubs().await, 1);

        registry.detach(diagram_id, p2).await;
        assert_eq!(registry.active_hubs().await, 0);
    }

    #[tokio::test]
    async fn unknown_diagram_cannot_attach() {
        let (registry, _) = setup().await;
        let (tx, _rx) = mpsc::channel(8);
        let result = registry.attach(Uuid::new_v4(), Uuid::new_v4(), Role::Reader, tx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reattach_after_reap_reloads_state() {
        let (registry, diagram_id) = setup().await;
        let p1 = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        registry.attach(diagram_id, p1, Role::Reader, tx).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), ServerFrame::DiagramState { .. }));
        registry.detach(diagram_id, p1).await;

        let (tx2, mut rx2) = mpsc::channel(8);
        registry.attach(diagram_id, p1, Role::Reader, tx2).await.unwrap();
        assert!(matches!(rx2.recv().await.unwrap(), ServerFrame::DiagramState { .. }));
        assert_eq!(registry.active_hubs().await, 1);
    }
}
