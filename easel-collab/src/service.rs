//! The service facade: one explicitly constructed value owning the room
//! registry, the persistence gateway, the version store and the identity
//! verifier.
//!
//! ```text
//! Client A ──┐                    ┌── Room (doc-1) ── Replica ── BroadcastGroup
//!             ├── gateway (auth) ──┤        │
//! Client B ──┘                    └── Room (doc-2)   ├── LockTable, presence
//!                                                    │
//!                                       PersistenceGateway ── DocumentStore
//!                                       VersionStore ─────────┘  (RocksDB / memory)
//! ```
//!
//! The same value serves sockets ([`SyncService::serve`]) and the
//! programmatic API used by the surrounding CRUD layer ([`SyncService::save`],
//! [`SyncService::restore`], [`SyncService::apply_edit`], ...).

use easel_core::{Replica, ReplicaError, Shape, ShapeId, ShapeOp};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::time::{timeout_at, Instant};

use crate::auth::{AuthError, IdentityVerifier};
use crate::gateway;
use crate::locks::{ConflictWarning, LockEntry, LockOwner};
use crate::persistence::{PersistenceGateway, PersistenceStats};
use crate::protocol::{ProtocolError, SyncMessage};
use crate::registry::{RegistryConfig, RoomRegistry};
use crate::room::{Room, RoomStats};
use crate::storage::{
    DocId, DocumentStore, MemoryStore, RocksStore, SnapshotMeta, StoreConfig, StoreError, VersionId,
    VersionInfo,
};
use crate::versions::{restore_label, RestoreError, VersionStore, VersionSummary, MAX_VERSIONS};

/// Errors surfaced by the service API.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Conflict(#[from] ConflictWarning),
    #[error(transparent)]
    Restore(#[from] RestoreError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error("No live room for document {0}")]
    RoomNotActive(DocId),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Ping period on every socket
    pub heartbeat_interval: Duration,
    /// Silence after which a socket is considered gone
    pub heartbeat_timeout: Duration,
    /// Upper bound on one identity verification
    pub auth_timeout: Duration,
    /// How long a joiner waits for the initial load of a room
    pub load_timeout: Duration,
    pub autosave_interval: Duration,
    /// Interval versions (None = only manual and restore versions)
    pub version_interval: Option<Duration>,
    /// Versions kept per document
    pub max_versions: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// How long shutdown waits for open sockets to leave their rooms
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(75),
            auth_timeout: Duration::from_secs(5),
            load_timeout: Duration::from_secs(5),
            autosave_interval: Duration::from_secs(30),
            version_interval: Some(Duration::from_secs(10 * 60)),
            max_versions: MAX_VERSIONS,
            storage_path: None,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, short timeouts, no background versions.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            auth_timeout: Duration::from_secs(1),
            load_timeout: Duration::from_secs(1),
            autosave_interval: Duration::from_secs(3600),
            version_interval: None,
            shutdown_grace: Duration::from_secs(2),
            ..Self::default()
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            broadcast_capacity: self.broadcast_capacity,
            load_timeout: self.load_timeout,
            autosave_interval: self.autosave_interval,
            version_interval: self.version_interval,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Sockets closed by the gateway (bad request or failed auth).
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rooms: Vec<RoomStats>,
    pub persistence: PersistenceStats,
}

#[derive(Default)]
pub(crate) struct ConnectionCounters {
    pub total: AtomicU64,
    pub active: AtomicU64,
    pub rejected: AtomicU64,
    pub messages: AtomicU64,
    pub bytes: AtomicU64,
    /// Woken when `active` drops to zero.
    drained: Notify,
}

impl ConnectionCounters {
    pub fn connection_closed(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Wait until no connection task is running, at most `grace`.
    async fn wait_drained(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let drained = self.drained.notified();
            if self.active.load(Ordering::Acquire) == 0 {
                return true;
            }
            if timeout_at(deadline, drained).await.is_err() {
                return self.active.load(Ordering::Acquire) == 0;
            }
        }
    }
}

/// Everything a connection task needs, cloned into it on accept.
#[derive(Clone)]
pub(crate) struct ServiceContext {
    pub config: ServerConfig,
    pub registry: Arc<RoomRegistry>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub counters: Arc<ConnectionCounters>,
    pub shutdown: watch::Receiver<bool>,
}

/// The sync service.
pub struct SyncService {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    verifier: Arc<dyn IdentityVerifier>,
    counters: Arc<ConnectionCounters>,
    shutdown: watch::Sender<bool>,
}

impl SyncService {
    pub fn new(config: ServerConfig, store: Arc<dyn DocumentStore>, verifier: Arc<dyn IdentityVerifier>) -> Self {
        let persistence = Arc::new(PersistenceGateway::new(Arc::clone(&store)));
        let versions = Arc::new(VersionStore::with_capacity(store, config.max_versions));
        let registry = Arc::new(RoomRegistry::new(persistence, versions, config.registry_config()));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry,
            verifier,
            counters: Arc::new(ConnectionCounters::default()),
            shutdown,
        }
    }

    /// Build with the store named by `config.storage_path`: RocksDB when
    /// set, in-memory otherwise.
    pub fn open(config: ServerConfig, verifier: Arc<dyn IdentityVerifier>) -> Result<Self, StoreError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => {
                log::info!("Opening document store at {}", path.display());
                Arc::new(RocksStore::open(StoreConfig { path: path.clone(), ..StoreConfig::default() })?)
            }
            None => {
                log::warn!("No storage path configured, documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(config, store, verifier))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    fn persistence(&self) -> &PersistenceGateway {
        self.registry.persistence()
    }

    fn context(&self) -> ServiceContext {
        ServiceContext {
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            verifier: Arc::clone(&self.verifier),
            counters: Arc::clone(&self.counters),
            shutdown: self.shutdown.subscribe(),
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Bind `bind_addr` and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown is signalled.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    self.counters.total.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(gateway::handle_socket(stream, addr, self.context()));
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    log::info!("Sync server stopped accepting connections");
                    return Ok(());
                }
            }
        }
    }

    /// Stop accepting, close every socket and flush every room.
    ///
    /// Sockets get `shutdown_grace` to leave their rooms first. A room whose
    /// last member leaves is flushed by that leave; the returned
    /// (saved, failed) counts the rooms still live afterwards.
    pub async fn shutdown(&self) -> (usize, usize) {
        self.shutdown.send_replace(true);
        if !self.counters.wait_drained(self.config.shutdown_grace).await {
            log::warn!(
                "{} sockets still open after {:?}, flushing anyway",
                self.counters.active.load(Ordering::Acquire),
                self.config.shutdown_grace
            );
        }
        let (saved, failed) = self.registry.shutdown().await;
        log::info!("Shutdown complete: {saved} rooms saved, {failed} failed");
        (saved, failed)
    }

    pub async fn stats(&self) -> ServerStats {
        let rooms = self.registry.stats().await;
        ServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected.load(Ordering::Relaxed),
            total_messages: self.counters.messages.load(Ordering::Relaxed),
            total_bytes: self.counters.bytes.load(Ordering::Relaxed),
            active_rooms: rooms.len(),
            rooms,
            persistence: self.persistence().stats(),
        }
    }

    // ─── Programmatic API ─────────────────────────────────────────────

    /// Pin the room of `doc_id`, run `f` on it, then unpin (which flushes
    /// and closes the room when nobody else is using it).
    async fn with_room<T, F, Fut>(&self, doc_id: &DocId, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(Arc<Room>) -> Fut,
        Fut: std::future::Future<Output = Result<T, SyncError>>,
    {
        let room = self.registry.pin(doc_id).await?;
        let result = f(Arc::clone(&room)).await;
        self.registry.unpin(&room).await;
        result
    }

    /// Save the live state of `doc_id` now.
    pub async fn save(&self, doc_id: &DocId) -> Result<(), SyncError> {
        let room = self
            .registry
            .get(doc_id)
            .await
            .ok_or_else(|| SyncError::RoomNotActive(doc_id.clone()))?;
        room.save(self.persistence()).await?;
        Ok(())
    }

    /// Current replica of `doc_id`: the live one when a room exists,
    /// otherwise the stored one (empty when never saved).
    pub async fn load(&self, doc_id: &DocId) -> Result<Replica, SyncError> {
        match self.registry.get(doc_id).await {
            Some(room) => Ok(Replica::from_state(&room.encode_state().await)?),
            None => Ok(self.persistence().load(doc_id).await),
        }
    }

    pub async fn shapes(&self, doc_id: &DocId) -> Result<BTreeMap<ShapeId, Shape>, SyncError> {
        match self.registry.get(doc_id).await {
            Some(room) => Ok(room.shapes().await),
            None => Ok(self.persistence().load(doc_id).await.shapes()),
        }
    }

    /// Apply one edit on behalf of `user_id` and broadcast it.
    ///
    /// Edits of an existing shape locked by another user are refused with
    /// [`SyncError::Conflict`].
    pub async fn apply_edit(&self, doc_id: &DocId, user_id: &str, op: ShapeOp) -> Result<(), SyncError> {
        self.with_room(doc_id, |room| async move { room.apply_op(user_id, &op).await })
            .await
    }

    /// Append a manual version holding the current state.
    pub async fn create_snapshot(&self, doc_id: &DocId, label: Option<String>) -> Result<VersionInfo, SyncError> {
        let versions = Arc::clone(self.registry.versions());
        self.with_room(doc_id, |room| async move {
            Ok::<_, SyncError>(room.snapshot_version(&versions, SnapshotMeta::manual(label)).await?)
        })
        .await
    }

    pub async fn list_versions(&self, doc_id: &DocId) -> Result<Vec<VersionSummary>, SyncError> {
        Ok(self.registry.versions().list(doc_id).await?)
    }

    /// Replace the live shapes of `doc_id` with those of `version_id`.
    ///
    /// The replacement deletes every shape missing from the version, so a
    /// client reconnecting with older state cannot bring them back. Connected
    /// members receive the change followed by `VersionRestored`. The result is
    /// saved and recorded as a new `Restore` version, which is returned.
    pub async fn restore(&self, doc_id: &DocId, version_id: VersionId) -> Result<VersionInfo, SyncError> {
        let versions = Arc::clone(self.registry.versions());
        let (record, ordinal) = versions.fetch_for_restore(doc_id, version_id).await?;
        let target = Replica::from_state(&record.state)
            .map_err(|e| RestoreError::Corrupt(version_id, e.to_string()))?;

        let room = self
            .registry
            .pin(doc_id)
            .await
            .map_err(|_| RestoreError::Unavailable(doc_id.clone()))?;
        let notice = SyncMessage::VersionRestored { version_id, ordinal };
        let result = async {
            let shapes = target.shapes().into_values();
            let state = room.restore(shapes.collect(), notice, self.persistence()).await?;
            let meta = SnapshotMeta::restore(version_id, restore_label(ordinal, &record));
            Ok::<_, SyncError>(versions.create_snapshot(doc_id, &state, meta).await?)
        }
        .await;
        self.registry.unpin(&room).await;

        if let Ok(info) = &result {
            log::info!("Restored {doc_id} to version #{ordinal} ({version_id}), recorded as {}", info.id);
        }
        result
    }

    /// Take an advisory lock for a programmatic caller. It stays until
    /// released explicitly.
    pub async fn acquire_lock(&self, doc_id: &DocId, shape_id: ShapeId, user_id: &str) -> Result<LockEntry, SyncError> {
        let room = self
            .registry
            .get(doc_id)
            .await
            .ok_or_else(|| SyncError::RoomNotActive(doc_id.clone()))?;
        Ok(room.acquire_lock(shape_id, LockOwner::user(user_id)).await?)
    }

    /// Release a lock. With `user_id`, a lock held by someone else is left
    /// alone and reported as a conflict. Returns whether a lock was dropped.
    pub async fn release_lock(
        &self,
        doc_id: &DocId,
        shape_id: &ShapeId,
        user_id: Option<&str>,
    ) -> Result<bool, SyncError> {
        let Some(room) = self.registry.get(doc_id).await else {
            return Ok(false);
        };
        Ok(room.release_lock(shape_id, user_id).await?.is_some())
    }

    /// Release every lock `user_id` holds in `doc_id`.
    pub async fn release_all_locks(&self, doc_id: &DocId, user_id: &str) -> Vec<ShapeId> {
        match self.registry.get(doc_id).await {
            Some(room) => room.release_user_locks(user_id).await,
            None => Vec::new(),
        }
    }
}
