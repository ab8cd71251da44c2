//! One live document: replica, lock table, awareness and members.
//!
//! Everything that mutates the replica, the lock table or the awareness table
//! goes through [`Room`] and happens under its state mutex, and the
//! resulting frame is broadcast before the mutex is released. Two frames from
//! the same connection therefore reach peers in the order they were sent, and
//! a session opened under the same mutex sees every change exactly once:
//! either in its handshake or on its receiver.
//!
//! Saves take the separate save lock first, so an autosave that encoded an
//! older state can never land after a restore's save.

use chrono::{DateTime, Utc};
use easel_core::{Replica, ReplicaError, Shape, ShapeId, ShapeOp};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Outbound};
use crate::locks::{ConflictWarning, LockEntry, LockOwner, LockTable};
use crate::persistence::{LoadOutcome, PersistenceGateway};
use crate::presence::{AwarenessState, PresenceTable};
use crate::protocol::{ChannelKind, ConnId, LockInfo, PeerInfo, SyncMessage};
use crate::service::SyncError;
use crate::storage::{DocId, SnapshotMeta, StoreError, VersionInfo};
use crate::versions::VersionStore;

/// A connected socket inside a room.
#[derive(Debug, Clone)]
pub struct Member {
    pub peer: PeerInfo,
    pub channel: ChannelKind,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn new(peer: PeerInfo, channel: ChannelKind) -> Self {
        Self { peer, channel, joined_at: Utc::now() }
    }
}

/// Progress of the initial load from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Pending,
    Loaded,
    /// Nothing stored yet.
    Missing,
    /// Load failed; the room runs on whatever was built since.
    Failed,
}

impl LoadStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, LoadStatus::Pending)
    }
}

/// Snapshot of one room for monitoring.
#[derive(Debug, Clone)]
pub struct RoomStats {
    pub doc_id: DocId,
    pub connections: usize,
    /// Distinct verified users.
    pub users: usize,
    pub shapes: usize,
    pub locks: usize,
    pub load_status: LoadStatus,
    pub dirty: bool,
    pub closing: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub broadcast: BroadcastStats,
}

struct RoomState {
    replica: Replica,
    locks: LockTable,
    presence: PresenceTable,
    /// Bumped on every replica change.
    revision: u64,
    saved_revision: u64,
    versioned_revision: u64,
}

pub struct Room {
    doc_id: DocId,
    state: Mutex<RoomState>,
    members: RwLock<HashMap<ConnId, Member>>,
    broadcast: BroadcastGroup,
    save_lock: Mutex<()>,
    load: watch::Sender<LoadStatus>,
    /// Programmatic users keeping the room resident without a socket.
    pins: AtomicUsize,
    /// Flushes started because the room went idle and not yet finished.
    flushes: AtomicUsize,
    last_activity_ms: AtomicI64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Room {
    pub fn new(doc_id: DocId, broadcast_capacity: usize) -> Self {
        let (load, _) = watch::channel(LoadStatus::Pending);
        Self {
            doc_id,
            state: Mutex::new(RoomState {
                replica: Replica::new(),
                locks: LockTable::new(),
                presence: PresenceTable::new(),
                revision: 0,
                saved_revision: 0,
                versioned_revision: 0,
            }),
            members: RwLock::new(HashMap::new()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            save_lock: Mutex::new(()),
            load,
            pins: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    fn touch(&self) {
        self.last_activity_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn broadcast(&self, origin: Option<ConnId>, msg: &SyncMessage) {
        if let Err(e) = self.broadcast.broadcast(origin, msg) {
            log::error!("Failed to broadcast {} in {}: {e}", msg.kind(), self.doc_id);
        }
    }

    pub(crate) fn record_dropped(&self, count: u64) {
        self.broadcast.record_dropped(count);
    }

    // ─── Membership ───────────────────────────────────────────────────

    pub(crate) async fn insert_member(&self, member: Member) {
        self.touch();
        self.members.write().await.insert(member.peer.conn_id, member);
    }

    pub(crate) async fn remove_member(&self, conn_id: &ConnId) -> Option<Member> {
        self.touch();
        self.members.write().await.remove(conn_id)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Distinct users, several tabs of one user count once.
    pub async fn user_count(&self) -> usize {
        let members = self.members.read().await;
        members.values().map(|m| m.peer.user_id.as_str()).collect::<HashSet<_>>().len()
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn unpin(&self) {
        let _ = self.pins.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// No sockets and no programmatic users.
    pub(crate) async fn is_idle(&self) -> bool {
        self.pins.load(Ordering::SeqCst) == 0 && self.members.read().await.is_empty()
    }

    pub(crate) fn begin_flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the number of idle flushes still running.
    pub(crate) fn end_flush(&self) -> usize {
        self.flushes.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    /// An idle flush is running; the room may be removed once it settles.
    pub fn is_closing(&self) -> bool {
        self.flushes.load(Ordering::SeqCst) > 0
    }

    pub(crate) async fn attach_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(handle);
    }

    pub(crate) async fn abort_tasks(&self) {
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
    }

    // ─── Load ─────────────────────────────────────────────────────────

    pub fn load_status(&self) -> LoadStatus {
        *self.load.borrow()
    }

    /// Wait until the initial load settles. Returns `false` on timeout.
    pub async fn wait_loaded(&self, timeout: Duration) -> bool {
        let mut rx = self.load.subscribe();
        let settled =
            matches!(tokio::time::timeout(timeout, rx.wait_for(|s| s.is_settled())).await, Ok(Ok(_)));
        settled
    }

    /// Install the result of the initial load.
    ///
    /// The stored state is merged into whatever the replica holds, so edits
    /// made by members who stopped waiting for a slow load are kept, and the
    /// merge is broadcast to them.
    pub(crate) async fn install_loaded(&self, outcome: LoadOutcome) {
        let mut st = self.state.lock().await;
        let status = match outcome {
            LoadOutcome::Loaded(loaded) => {
                let state = loaded.encode_state();
                match st.replica.apply_update(&state) {
                    Ok(()) => {
                        if st.revision > 0 {
                            // Merged into live edits, the union is not durable yet
                            st.revision += 1;
                        }
                        self.broadcast(None, &SyncMessage::Update { update: state });
                        LoadStatus::Loaded
                    }
                    Err(e) => {
                        log::warn!("Could not merge stored state of {}: {e}", self.doc_id);
                        LoadStatus::Failed
                    }
                }
            }
            LoadOutcome::Missing => LoadStatus::Missing,
            LoadOutcome::Failed(_) => LoadStatus::Failed,
        };
        self.load.send_replace(status);
        log::debug!("Room {} load settled: {status:?}", self.doc_id);
    }

    // ─── Sync protocol ────────────────────────────────────────────────

    /// Announce a new member, subscribe it and build its handshake frames.
    pub(crate) async fn open_session(
        &self,
        peer: &PeerInfo,
        channel: ChannelKind,
    ) -> (broadcast::Receiver<Outbound>, Vec<SyncMessage>) {
        let st = self.state.lock().await;
        self.broadcast(Some(peer.conn_id), &SyncMessage::PeerJoined { peer: peer.clone() });
        let rx = self.broadcast.subscribe();
        let mut frames = vec![SyncMessage::Welcome { peer: peer.clone() }];
        if channel.carries_replica() {
            frames.push(SyncMessage::SyncStep1 { state_vector: st.replica.state_vector() });
        }
        frames.push(SyncMessage::AwarenessSnapshot { peers: st.presence.snapshot() });
        frames.push(SyncMessage::LockSnapshot { locks: st.locks.snapshot() });
        (rx, frames)
    }

    /// Frames that bring a member who missed broadcasts back in step.
    pub(crate) async fn resync_frames(&self, channel: ChannelKind) -> Vec<SyncMessage> {
        let st = self.state.lock().await;
        let mut frames = Vec::with_capacity(3);
        if channel.carries_replica() {
            // Merging the full state is idempotent
            frames.push(SyncMessage::Update { update: st.replica.encode_state() });
        }
        frames.push(SyncMessage::AwarenessSnapshot { peers: st.presence.snapshot() });
        frames.push(SyncMessage::LockSnapshot { locks: st.locks.snapshot() });
        frames
    }

    /// Clear everything a departing member left behind.
    pub(crate) async fn close_session(&self, peer: &PeerInfo) {
        let mut st = self.state.lock().await;
        if st.presence.remove(&peer.conn_id).is_some() {
            self.broadcast(None, &SyncMessage::AwarenessRemoved { conn_id: peer.conn_id });
        }
        for shape_id in st.locks.release_session(peer.conn_id) {
            log::debug!("Released lock on {shape_id} held by {}", peer.user_id);
            self.broadcast(None, &SyncMessage::LockChanged { shape_id, owner: None });
        }
        self.broadcast(
            None,
            &SyncMessage::PeerLeft { conn_id: peer.conn_id, user_id: peer.user_id.clone() },
        );
    }

    /// Everything a peer with `state_vector` is missing.
    pub async fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        self.state.lock().await.replica.diff_since(state_vector)
    }

    /// Merge an update from `origin` and relay it to every other member.
    pub async fn apply_update(&self, origin: ConnId, update: Vec<u8>) -> Result<(), ReplicaError> {
        let mut st = self.state.lock().await;
        st.replica.apply_update(&update)?;
        st.revision += 1;
        self.touch();
        self.broadcast(Some(origin), &SyncMessage::Update { update });
        Ok(())
    }

    /// Apply an edit on behalf of `user_id`, honouring locks held by others.
    pub async fn apply_op(&self, user_id: &str, op: &ShapeOp) -> Result<(), SyncError> {
        let mut st = self.state.lock().await;
        if op.modifies_existing() {
            st.locks.check(op.target(), user_id)?;
        }
        let update = st.replica.apply_op(op)?;
        st.revision += 1;
        self.touch();
        self.broadcast(None, &SyncMessage::Update { update });
        Ok(())
    }

    pub async fn set_awareness(&self, peer: &PeerInfo, clock: u64, state: AwarenessState) {
        let mut st = self.state.lock().await;
        if let Some(entry) = st.presence.update(peer, clock, state) {
            self.broadcast(Some(peer.conn_id), &SyncMessage::AwarenessChanged { entry });
        }
    }

    pub async fn acquire_lock(&self, shape_id: ShapeId, owner: LockOwner) -> Result<LockEntry, ConflictWarning> {
        let mut st = self.state.lock().await;
        let entry = st.locks.acquire(shape_id, owner)?;
        self.broadcast(
            None,
            &SyncMessage::LockChanged { shape_id: entry.shape_id.clone(), owner: Some(entry.info()) },
        );
        Ok(entry)
    }

    /// Release a lock. With `user_id`, only that user's lock is released.
    pub async fn release_lock(
        &self,
        shape_id: &ShapeId,
        user_id: Option<&str>,
    ) -> Result<Option<LockEntry>, ConflictWarning> {
        let mut st = self.state.lock().await;
        let released = match user_id {
            Some(user_id) => st.locks.release_for(shape_id, user_id)?,
            None => st.locks.release(shape_id),
        };
        if released.is_some() {
            self.broadcast(None, &SyncMessage::LockChanged { shape_id: shape_id.clone(), owner: None });
        }
        Ok(released)
    }

    /// Drop every lock `user_id` holds, from any session.
    pub async fn release_user_locks(&self, user_id: &str) -> Vec<ShapeId> {
        let mut st = self.state.lock().await;
        let freed = st.locks.release_all(user_id);
        for shape_id in &freed {
            self.broadcast(None, &SyncMessage::LockChanged { shape_id: shape_id.clone(), owner: None });
        }
        freed
    }

    pub async fn locks(&self) -> Vec<LockInfo> {
        self.state.lock().await.locks.snapshot()
    }

    pub async fn shapes(&self) -> BTreeMap<ShapeId, Shape> {
        self.state.lock().await.replica.shapes()
    }

    pub async fn encode_state(&self) -> Vec<u8> {
        self.state.lock().await.replica.encode_state()
    }

    // ─── Persistence ──────────────────────────────────────────────────

    /// Changed since the last successful save.
    pub async fn is_dirty(&self) -> bool {
        let st = self.state.lock().await;
        st.revision != st.saved_revision
    }

    pub(crate) async fn needs_version(&self) -> bool {
        let st = self.state.lock().await;
        st.revision != st.versioned_revision
    }

    /// Encode and save the current state. The dirty mark survives a failure.
    pub async fn save(&self, persistence: &PersistenceGateway) -> Result<(), StoreError> {
        let _guard = self.save_lock.lock().await;
        let (state, revision) = {
            let st = self.state.lock().await;
            (st.replica.encode_state(), st.revision)
        };
        persistence.save(&self.doc_id, &state).await?;
        let mut st = self.state.lock().await;
        st.saved_revision = st.saved_revision.max(revision);
        Ok(())
    }

    /// Append a version holding the current state.
    pub async fn snapshot_version(
        &self,
        versions: &VersionStore,
        meta: SnapshotMeta,
    ) -> Result<VersionInfo, StoreError> {
        let (state, revision) = {
            let st = self.state.lock().await;
            (st.replica.encode_state(), st.revision)
        };
        let info = versions.create_snapshot(&self.doc_id, &state, meta).await?;
        let mut st = self.state.lock().await;
        st.versioned_revision = st.versioned_revision.max(revision);
        Ok(info)
    }

    /// Replace the live shapes with `shapes`, broadcast the change followed
    /// by `notice`, and persist the result. Returns the new full state.
    pub(crate) async fn restore(
        &self,
        shapes: Vec<Shape>,
        notice: SyncMessage,
        persistence: &PersistenceGateway,
    ) -> Result<Vec<u8>, ReplicaError> {
        let _guard = self.save_lock.lock().await;
        let (state, revision) = {
            let mut st = self.state.lock().await;
            let update = st.replica.replace_shapes(shapes)?;
            st.revision += 1;
            self.touch();
            self.broadcast(None, &SyncMessage::Update { update });
            self.broadcast(None, &notice);
            (st.replica.encode_state(), st.revision)
        };
        match persistence.save(&self.doc_id, &state).await {
            Ok(()) => {
                let mut st = self.state.lock().await;
                st.saved_revision = st.saved_revision.max(revision);
            }
            Err(e) => {
                log::warn!("Restored state of {} not saved yet, autosave will retry: {e}", self.doc_id);
            }
        }
        Ok(state)
    }

    pub async fn stats(&self) -> RoomStats {
        let (connections, users) = (self.member_count().await, self.user_count().await);
        let st = self.state.lock().await;
        RoomStats {
            doc_id: self.doc_id.clone(),
            connections,
            users,
            shapes: st.replica.len(),
            locks: st.locks.len(),
            load_status: self.load_status(),
            dirty: st.revision != st.saved_revision,
            closing: self.is_closing(),
            last_activity: DateTime::from_timestamp_millis(self.last_activity_ms.load(Ordering::Relaxed)),
            broadcast: self.broadcast.stats(),
        }
    }
}
