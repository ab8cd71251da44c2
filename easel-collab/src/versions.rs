//! Bounded version history per document.
//!
//! A version is a full replica state captured at one instant. Each document
//! keeps at most [`MAX_VERSIONS`]; appending beyond the cap evicts the oldest
//! rows (strict FIFO by creation order). Ordinals (`#1` = oldest) are not
//! stored, they are recomputed from the sorted list every time it is read, so
//! they shift as old versions are evicted.

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::storage::{
    DocId, DocumentStore, SnapshotMeta, SnapshotTrigger, StoreError, VersionId, VersionInfo,
    VersionRecord,
};

pub const MAX_VERSIONS: usize = 50;

#[derive(Debug, Clone, Error)]
pub enum RestoreError {
    #[error("Unknown version {0}")]
    UnknownVersion(VersionId),
    #[error("Version {version} does not belong to document {document}")]
    WrongDocument { version: VersionId, document: DocId },
    #[error("Version {0} holds an undecodable state: {1}")]
    Corrupt(VersionId, String),
    #[error("Document {0} could not be loaded")]
    Unavailable(DocId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A listed version with its computed ordinal.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionSummary {
    pub id: VersionId,
    /// 1-based position in creation order.
    pub ordinal: usize,
    pub label: Option<String>,
    pub trigger: SnapshotTrigger,
    pub restored_from: Option<VersionId>,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

impl VersionSummary {
    /// The label, or the creation time when the version has none.
    pub fn display_label(&self) -> String {
        display_label(self.label.as_deref(), self.created_at)
    }
}

fn display_label(label: Option<&str>, created_at: DateTime<Utc>) -> String {
    match label {
        Some(label) => label.to_string(),
        None => created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

/// Label of the snapshot appended after restoring `record`.
pub fn restore_label(ordinal: usize, record: &VersionRecord) -> String {
    format!(
        "Restored from #{ordinal} ({})",
        display_label(record.meta.label.as_deref(), record.created_at)
    )
}

/// Sort ascending by creation time, insertion sequence breaking ties.
fn sort_by_creation(versions: &mut [VersionInfo]) {
    versions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
}

pub struct VersionStore {
    store: Arc<dyn DocumentStore>,
    max_versions: usize,
}

impl VersionStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_capacity(store, MAX_VERSIONS)
    }

    pub fn with_capacity(store: Arc<dyn DocumentStore>, max_versions: usize) -> Self {
        Self { store, max_versions: max_versions.max(1) }
    }

    /// Append a version of `doc_id` holding `state`, then evict past the cap.
    pub async fn create_snapshot(
        &self,
        doc_id: &DocId,
        state: &[u8],
        meta: SnapshotMeta,
    ) -> Result<VersionInfo, StoreError> {
        let record = VersionRecord::new(doc_id.clone(), meta, state.to_vec());
        let info = self.store.append_version(&record).await?;
        log::info!("Created {:?} version {} of {doc_id}", info.meta.trigger, info.id);

        if let Err(e) = self.prune(doc_id).await {
            // The row is in, the cap is restored by the next successful prune
            log::warn!("Failed to prune versions of {doc_id}: {e}");
        }
        Ok(info)
    }

    /// Delete the oldest versions beyond the cap. Returns how many went.
    pub async fn prune(&self, doc_id: &DocId) -> Result<usize, StoreError> {
        let mut versions = self.store.list_versions(doc_id).await?;
        if versions.len() <= self.max_versions {
            return Ok(0);
        }
        sort_by_creation(&mut versions);
        let excess = versions.len() - self.max_versions;
        let evicted: Vec<VersionId> = versions.iter().take(excess).map(|v| v.id).collect();
        let deleted = self.store.delete_versions(doc_id, &evicted).await?;
        log::debug!("Evicted {deleted} old versions of {doc_id}");
        Ok(deleted)
    }

    /// Summaries ordered oldest first, with ordinals.
    pub async fn list(&self, doc_id: &DocId) -> Result<Vec<VersionSummary>, StoreError> {
        let mut versions = self.store.list_versions(doc_id).await?;
        sort_by_creation(&mut versions);
        Ok(versions
            .into_iter()
            .enumerate()
            .map(|(i, v)| VersionSummary {
                id: v.id,
                ordinal: i + 1,
                label: v.meta.label,
                trigger: v.meta.trigger,
                restored_from: v.meta.restored_from,
                created_at: v.created_at,
                size: v.size,
            })
            .collect())
    }

    /// Load a version of `doc_id` for restoring, together with its ordinal.
    pub async fn fetch_for_restore(
        &self,
        doc_id: &DocId,
        version_id: VersionId,
    ) -> Result<(VersionRecord, usize), RestoreError> {
        let record = self
            .store
            .get_version(version_id)
            .await?
            .ok_or(RestoreError::UnknownVersion(version_id))?;
        if &record.doc_id != doc_id {
            return Err(RestoreError::WrongDocument { version: version_id, document: doc_id.clone() });
        }
        let ordinal = self
            .list(doc_id)
            .await?
            .iter()
            .position(|v| v.id == version_id)
            .map(|i| i + 1)
            .ok_or(RestoreError::UnknownVersion(version_id))?;
        Ok((record, ordinal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;

    fn store() -> VersionStore {
        VersionStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_retention_evicts_only_oldest() {
        let versions = store();
        let doc: DocId = "doc".into();
        let mut ids = Vec::new();
        for i in 0..=MAX_VERSIONS {
            let info = versions
                .create_snapshot(&doc, &[i as u8], SnapshotMeta::manual(Some(format!("v{i}"))))
                .await
                .unwrap();
            ids.push(info.id);
        }

        let listed = versions.list(&doc).await.unwrap();
        assert_eq!(listed.len(), MAX_VERSIONS);
        assert!(listed.iter().all(|v| v.id != ids[0]));
        assert_eq!(listed[0].id, ids[1]);
        assert_eq!(listed[0].ordinal, 1);
        assert_eq!(listed.last().unwrap().id, ids[MAX_VERSIONS]);
        assert_eq!(listed.last().unwrap().ordinal, MAX_VERSIONS);
    }

    #[tokio::test]
    async fn test_ordinals_shift_after_eviction() {
        let versions = VersionStore::with_capacity(Arc::new(MemoryStore::new()), 2);
        let doc: DocId = "doc".into();
        versions.create_snapshot(&doc, b"a", SnapshotMeta::interval()).await.unwrap();
        let b = versions.create_snapshot(&doc, b"b", SnapshotMeta::interval()).await.unwrap();
        assert_eq!(versions.fetch_for_restore(&doc, b.id).await.unwrap().1, 2);

        versions.create_snapshot(&doc, b"c", SnapshotMeta::interval()).await.unwrap();
        assert_eq!(versions.fetch_for_restore(&doc, b.id).await.unwrap().1, 1);
    }

    #[tokio::test]
    async fn test_restore_fetch_rejects_foreign_and_unknown() {
        let versions = store();
        let info = versions
            .create_snapshot(&"a".into(), b"x", SnapshotMeta::manual(None))
            .await
            .unwrap();

        assert!(matches!(
            versions.fetch_for_restore(&"b".into(), info.id).await,
            Err(RestoreError::WrongDocument { .. })
        ));
        assert!(matches!(
            versions.fetch_for_restore(&"a".into(), uuid::Uuid::new_v4()).await,
            Err(RestoreError::UnknownVersion(_))
        ));
    }

    #[test]
    fn test_restore_label() {
        let created_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let mut record = VersionRecord::new("d".into(), SnapshotMeta::manual(Some("v1".into())), vec![]);
        record.created_at = created_at;
        assert_eq!(restore_label(1, &record), "Restored from #1 (v1)");

        record.meta.label = None;
        assert_eq!(restore_label(3, &record), "Restored from #3 (2024-03-01T12:30:00Z)");
    }
}
