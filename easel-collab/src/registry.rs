//! The single map from document id to live [`Room`].
//!
//! Creation and membership changes happen under the map lock, so two
//! near-simultaneous joins for one id always land in the same room. A room
//! exists while it has members, programmatic pins or an idle flush in
//! flight; it is removed only after the flush triggered by its last member
//! leaving has settled, and only if nobody came back meanwhile.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::persistence::PersistenceGateway;
use crate::protocol::PeerInfo;
use crate::room::{Member, Room, RoomStats};
use crate::storage::{DocId, SnapshotMeta, StoreError};
use crate::versions::VersionStore;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Frames buffered per member before it lags.
    pub broadcast_capacity: usize,
    /// How long a joiner waits for the initial load.
    pub load_timeout: Duration,
    pub autosave_interval: Duration,
    /// Interval versions, `None` disables them.
    pub version_interval: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            load_timeout: Duration::from_secs(5),
            autosave_interval: Duration::from_secs(30),
            version_interval: Some(Duration::from_secs(10 * 60)),
        }
    }
}

pub struct RoomRegistry {
    rooms: Mutex<HashMap<DocId, Arc<Room>>>,
    persistence: Arc<PersistenceGateway>,
    versions: Arc<VersionStore>,
    config: RegistryConfig,
}

impl RoomRegistry {
    pub fn new(persistence: Arc<PersistenceGateway>, versions: Arc<VersionStore>, config: RegistryConfig) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            persistence,
            versions,
            config,
        }
    }

    pub fn persistence(&self) -> &Arc<PersistenceGateway> {
        &self.persistence
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub async fn get(&self, doc_id: &DocId) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(doc_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Existing room for `doc_id`, or a new one with its load and autosave
    /// tasks started. Called with the map lock held.
    async fn get_or_create(&self, rooms: &mut HashMap<DocId, Arc<Room>>, doc_id: &DocId) -> Arc<Room> {
        if let Some(room) = rooms.get(doc_id) {
            return Arc::clone(room);
        }

        let room = Arc::new(Room::new(doc_id.clone(), self.config.broadcast_capacity));
        rooms.insert(doc_id.clone(), Arc::clone(&room));
        log::info!("Created room {doc_id} ({} active)", rooms.len());

        let load = tokio::spawn(load_task(
            Arc::downgrade(&room),
            doc_id.clone(),
            Arc::clone(&self.persistence),
        ));
        let autosave = tokio::spawn(autosave_task(
            Arc::downgrade(&room),
            Arc::clone(&self.persistence),
            Arc::clone(&self.versions),
            self.config.autosave_interval,
            self.config.version_interval,
        ));
        room.attach_task(load).await;
        room.attach_task(autosave).await;
        room
    }

    /// Add a member to the room of `doc_id`, creating the room if needed.
    ///
    /// Returns once the initial load has settled or `load_timeout` passed;
    /// in the latter case the member is served the (empty) live replica.
    pub async fn join(&self, doc_id: &DocId, member: Member) -> Arc<Room> {
        let conn_id = member.peer.conn_id;
        let room = {
            let mut rooms = self.rooms.lock().await;
            let room = self.get_or_create(&mut rooms, doc_id).await;
            room.insert_member(member).await;
            room
        };
        log::debug!("{conn_id} joined {doc_id}");

        if !room.wait_loaded(self.config.load_timeout).await {
            log::warn!(
                "Load of {doc_id} still pending after {:?}, serving live replica",
                self.config.load_timeout
            );
        }
        room
    }

    /// Remove a member, clear what it left behind, and flush the room if it
    /// became idle.
    pub async fn leave(&self, doc_id: &DocId, peer: &PeerInfo) {
        let (room, idle) = {
            let rooms = self.rooms.lock().await;
            let Some(room) = rooms.get(doc_id).cloned() else {
                return;
            };
            room.remove_member(&peer.conn_id).await;
            let idle = room.is_idle().await;
            if idle {
                room.begin_flush();
            }
            (room, idle)
        };
        room.close_session(peer).await;
        log::debug!("{} left {doc_id}", peer.conn_id);

        if idle {
            self.flush_and_close(&room).await;
        }
    }

    /// Keep the room of `doc_id` resident for a programmatic operation.
    ///
    /// Unlike [`join`](Self::join) this refuses to proceed on an unsettled
    /// load, since the caller is about to read or overwrite state.
    pub async fn pin(&self, doc_id: &DocId) -> Result<Arc<Room>, StoreError> {
        let room = {
            let mut rooms = self.rooms.lock().await;
            let room = self.get_or_create(&mut rooms, doc_id).await;
            room.pin();
            room
        };
        if room.wait_loaded(self.config.load_timeout).await {
            Ok(room)
        } else {
            self.unpin(&room).await;
            Err(StoreError::Unavailable(format!("load of {doc_id} timed out")))
        }
    }

    pub async fn unpin(&self, room: &Arc<Room>) {
        let idle = {
            let _rooms = self.rooms.lock().await;
            room.unpin();
            let idle = room.is_idle().await;
            if idle {
                room.begin_flush();
            }
            idle
        };
        if idle {
            self.flush_and_close(room).await;
        }
    }

    /// Save a room unless its load never settled and nothing changed since,
    /// in which case saving would replace the stored state with an empty
    /// replica. `None` means the save was skipped.
    async fn flush_room(&self, room: &Arc<Room>) -> Option<Result<(), StoreError>> {
        let doc_id = room.doc_id();
        let settled = room.load_status().is_settled() || room.wait_loaded(self.config.load_timeout).await;
        if !settled && !room.is_dirty().await {
            log::warn!("Load of {doc_id} never settled and nothing changed, skipping flush");
            return None;
        }
        if !settled {
            log::warn!("Flushing {doc_id} before its load settled");
        }
        Some(room.save(&self.persistence).await)
    }

    /// Save an idle room, then drop it from the map unless it was rejoined.
    async fn flush_and_close(&self, room: &Arc<Room>) {
        let doc_id = room.doc_id().clone();
        match self.flush_room(room).await {
            Some(Ok(())) => log::info!("Flushed {doc_id}"),
            Some(Err(e)) => log::error!("Flush of {doc_id} failed, closing anyway: {e}"),
            None => {}
        }

        let mut rooms = self.rooms.lock().await;
        let remaining = room.end_flush();
        let current = rooms.get(&doc_id).is_some_and(|r| Arc::ptr_eq(r, room));
        if remaining == 0 && current && room.is_idle().await {
            rooms.remove(&doc_id);
            room.abort_tasks().await;
            log::info!("Closed room {doc_id} ({} active)", rooms.len());
        }
    }

    /// Save every live room. Returns (saved, failed); rooms skipped because
    /// their load never settled count as neither.
    pub async fn flush_all(&self) -> (usize, usize) {
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.values().cloned().collect();
        let (mut saved, mut failed) = (0, 0);
        for room in rooms {
            match self.flush_room(&room).await {
                Some(Ok(())) => saved += 1,
                Some(Err(e)) => {
                    failed += 1;
                    log::error!("Shutdown flush of {} failed: {e}", room.doc_id());
                }
                None => {}
            }
        }
        (saved, failed)
    }

    /// Flush every room, then stop their tasks and forget them.
    pub async fn shutdown(&self) -> (usize, usize) {
        let result = self.flush_all().await;
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.drain().map(|(_, room)| room).collect();
        for room in rooms {
            room.abort_tasks().await;
        }
        result
    }

    pub async fn stats(&self) -> Vec<RoomStats> {
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(rooms.len());
        for room in rooms {
            stats.push(room.stats().await);
        }
        stats.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        stats
    }
}

async fn load_task(room: Weak<Room>, doc_id: DocId, persistence: Arc<PersistenceGateway>) {
    let outcome = persistence.fetch(&doc_id).await;
    if let Some(room) = room.upgrade() {
        room.install_loaded(outcome).await;
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Periodic save of changed state and periodic interval versions.
async fn autosave_task(
    room: Weak<Room>,
    persistence: Arc<PersistenceGateway>,
    versions: Arc<VersionStore>,
    autosave_interval: Duration,
    version_interval: Option<Duration>,
) {
    let mut save_tick = ticker(autosave_interval);
    let mut version_tick = version_interval.map(ticker);

    loop {
        tokio::select! {
            _ = save_tick.tick() => {
                let Some(room) = room.upgrade() else { break };
                // An empty replica must not overwrite state still being loaded
                if !room.load_status().is_settled() || room.member_count().await == 0 {
                    continue;
                }
                if room.is_dirty().await {
                    if let Err(e) = room.save(&persistence).await {
                        log::warn!("Autosave of {} failed, retrying next interval: {e}", room.doc_id());
                    }
                }
            }
            _ = tick(&mut version_tick) => {
                let Some(room) = room.upgrade() else { break };
                if room.load_status().is_settled() && room.needs_version().await {
                    if let Err(e) = room.snapshot_version(&versions, SnapshotMeta::interval()).await {
                        log::warn!("Interval version of {} failed: {e}", room.doc_id());
                    }
                }
            }
        }
    }
}
