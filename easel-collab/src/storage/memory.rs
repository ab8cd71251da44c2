//! In-process [`DocumentStore`] for tests and ephemeral servers.
//!
//! Besides holding data it counts saves and can be told to fail or stall,
//! which is how the persistence paths are exercised without a database.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{DocId, DocumentStore, StoreError, VersionId, VersionInfo, VersionRecord};

#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<DocId, Vec<u8>>>,
    versions: Mutex<Vec<(u64, VersionRecord)>>,
    next_seq: AtomicU64,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
    /// Artificial load latency in milliseconds.
    load_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save_state` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_load_delay(&self, delay: Duration) {
        self.load_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Saved state of `doc_id`, bypassing the trait.
    pub async fn state(&self, doc_id: &DocId) -> Option<Vec<u8>> {
        self.states.lock().await.get(doc_id).cloned()
    }
}

fn info(seq: u64, record: &VersionRecord) -> VersionInfo {
    VersionInfo {
        id: record.id,
        doc_id: record.doc_id.clone(),
        meta: record.meta.clone(),
        created_at: record.created_at,
        seq,
        size: record.state.len() as u64,
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load_state(&self, doc_id: &DocId) -> Result<Option<Vec<u8>>, StoreError> {
        let delay = self.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("load failure injected".into()));
        }
        Ok(self.states.lock().await.get(doc_id).cloned())
    }

    async fn save_state(&self, doc_id: &DocId, state: &[u8]) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("save failure injected".into()));
        }
        self.states.lock().await.insert(doc_id.clone(), state.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn append_version(&self, record: &VersionRecord) -> Result<VersionInfo, StoreError> {
        let mut versions = self.versions.lock().await;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        versions.push((seq, record.clone()));
        Ok(info(seq, record))
    }

    async fn list_versions(&self, doc_id: &DocId) -> Result<Vec<VersionInfo>, StoreError> {
        let versions = self.versions.lock().await;
        Ok(versions
            .iter()
            .filter(|(_, r)| &r.doc_id == doc_id)
            .map(|(seq, r)| info(*seq, r))
            .collect())
    }

    async fn get_version(&self, id: VersionId) -> Result<Option<VersionRecord>, StoreError> {
        let versions = self.versions.lock().await;
        Ok(versions.iter().find(|(_, r)| r.id == id).map(|(_, r)| r.clone()))
    }

    async fn delete_versions(&self, doc_id: &DocId, ids: &[VersionId]) -> Result<usize, StoreError> {
        let mut versions = self.versions.lock().await;
        let before = versions.len();
        versions.retain(|(_, r)| !(&r.doc_id == doc_id && ids.contains(&r.id)));
        Ok(before - versions.len())
    }
}
