//! Load and save of live replica state.
//!
//! The gateway only knows how to turn stored bytes into a [`Replica`] and
//! back. When to save (autosave interval, last member leaving, shutdown) is
//! decided by the registry, which drives this gateway.

use easel_core::Replica;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::storage::{DocId, DocumentStore, StoreError};

/// Result of fetching a document from the store.
pub enum LoadOutcome {
    Loaded(Replica),
    /// Never saved. Starts empty.
    Missing,
    /// Store or decode failure. Starts empty, saving is still allowed.
    Failed(String),
}

impl LoadOutcome {
    pub fn into_replica(self) -> Replica {
        match self {
            LoadOutcome::Loaded(replica) => replica,
            LoadOutcome::Missing | LoadOutcome::Failed(_) => Replica::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceStats {
    pub loads: u64,
    pub saves: u64,
    pub failed_saves: u64,
}

pub struct PersistenceGateway {
    store: Arc<dyn DocumentStore>,
    loads: AtomicU64,
    saves: AtomicU64,
    failed_saves: AtomicU64,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            loads: AtomicU64::new(0),
            saves: AtomicU64::new(0),
            failed_saves: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Fetch and decode the latest state of `doc_id`.
    pub async fn fetch(&self, doc_id: &DocId) -> LoadOutcome {
        self.loads.fetch_add(1, Ordering::Relaxed);
        match self.store.load_state(doc_id).await {
            Ok(Some(state)) => match Replica::from_state(&state) {
                Ok(replica) => {
                    log::debug!("Loaded {doc_id}: {} shapes, {} bytes", replica.len(), state.len());
                    LoadOutcome::Loaded(replica)
                }
                Err(e) => {
                    log::warn!("Stored state of {doc_id} is undecodable, starting empty: {e}");
                    LoadOutcome::Failed(e.to_string())
                }
            },
            Ok(None) => {
                log::info!("No stored state for {doc_id}, starting empty");
                LoadOutcome::Missing
            }
            Err(e) => {
                log::warn!("Failed to load {doc_id}, starting empty: {e}");
                LoadOutcome::Failed(e.to_string())
            }
        }
    }

    /// Replica for `doc_id`, empty when absent or unreadable.
    pub async fn load(&self, doc_id: &DocId) -> Replica {
        self.fetch(doc_id).await.into_replica()
    }

    /// Upsert the full state. Safe to repeat.
    pub async fn save(&self, doc_id: &DocId, state: &[u8]) -> Result<(), StoreError> {
        match self.store.save_state(doc_id, state).await {
            Ok(()) => {
                self.saves.fetch_add(1, Ordering::Relaxed);
                log::debug!("Saved {doc_id} ({} bytes)", state.len());
                Ok(())
            }
            Err(e) => {
                self.failed_saves.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to save {doc_id}: {e}");
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            loads: self.loads.load(Ordering::Relaxed),
            saves: self.saves.load(Ordering::Relaxed),
            failed_saves: self.failed_saves.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use easel_core::{Shape, ShapeOp};

    fn gateway() -> (Arc<MemoryStore>, PersistenceGateway) {
        let store = Arc::new(MemoryStore::new());
        let gateway = PersistenceGateway::new(store.clone());
        (store, gateway)
    }

    #[tokio::test]
    async fn test_save_then_load_is_content_equal() {
        let (_, gateway) = gateway();
        let doc: DocId = "doc-1".into();
        let mut replica = Replica::new();
        replica.apply_op(&ShapeOp::Create { shape: Shape::rectangle(0.0, 0.0, 5.0, 5.0) }).unwrap();

        let state = replica.encode_state();
        gateway.save(&doc, &state).await.unwrap();
        gateway.save(&doc, &state).await.unwrap();

        assert_eq!(gateway.load(&doc).await.shapes(), replica.shapes());
        assert_eq!(gateway.stats().saves, 2);
    }

    #[tokio::test]
    async fn test_missing_document() {
        let (_, gateway) = gateway();
        assert!(matches!(gateway.fetch(&"nope".into()).await, LoadOutcome::Missing));
        assert!(gateway.load(&"nope".into()).await.is_empty());
    }

    #[tokio::test]
    async fn test_load_failures_start_empty() {
        let (store, gateway) = gateway();
        let doc: DocId = "bad".into();
        store.save_state(&doc, &[0xFF, 0xFE, 0xFD]).await.unwrap();
        assert!(matches!(gateway.fetch(&doc).await, LoadOutcome::Failed(_)));

        store.set_fail_loads(true);
        assert!(matches!(gateway.fetch(&doc).await, LoadOutcome::Failed(_)));
        assert!(gateway.load(&doc).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_save_counted() {
        let (store, gateway) = gateway();
        store.set_fail_saves(true);
        assert!(gateway.save(&"d".into(), b"x").await.is_err());
        assert_eq!(gateway.stats().failed_saves, 1);
        assert_eq!(gateway.stats().saves, 0);
    }
}
