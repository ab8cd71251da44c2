//! # easel-collab — Real-time collaboration engine for Easel canvases
//!
//! Serves one WebSocket endpoint per document, keeps one live room per
//! document, and bridges rooms to durable storage and version history.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  ws://host/<doc>?token=…  ┌──────────────┐
//! │ client      │ ◄───────────────────────► │ gateway      │ verify, then join
//! │ (per tab)   │     bincode SyncMessage   └──────┬───────┘
//! └─────────────┘                                  ▼
//!                                           ┌──────────────┐
//!                                           │ RoomRegistry │ doc id → Room
//!                                           └──────┬───────┘
//!                                                  ▼
//!                         ┌────────────────────────────────────────────┐
//!                         │ Room: Replica · LockTable · presence ·     │
//!                         │       BroadcastGroup (fan-out)             │
//!                         └──────┬──────────────────────────┬──────────┘
//!                                ▼                          ▼
//!                       PersistenceGateway           VersionStore (≤ 50)
//!                                └──────────┬───────────────┘
//!                                           ▼
//!                                 DocumentStore (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`service`] — `SyncService` facade: serve, shutdown, programmatic API
//! - [`gateway`] — handshake, connect URL parsing, authentication
//! - [`auth`] — `IdentityVerifier` with JWT and static implementations
//! - [`connection`] — per-socket task (sync, awareness, locks, heartbeat)
//! - [`registry`] / [`room`] — live rooms and their lifecycle
//! - [`protocol`] — binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`] — room fan-out with lag accounting
//! - [`presence`] — ephemeral awareness (cursors, selections)
//! - [`locks`] — advisory per-shape locks
//! - [`persistence`] / [`versions`] / [`storage`] — durable state and history

pub mod auth;
pub mod broadcast;
pub mod connection;
pub mod gateway;
pub mod locks;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod service;
pub mod storage;
pub mod versions;

// Re-exports for convenience
pub use auth::{AuthError, Identity, IdentityVerifier, JwtVerifier, StaticVerifier};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use gateway::{ConnectRequest, CLOSE_BAD_REQUEST, CLOSE_GOING_AWAY, CLOSE_PROTOCOL_ERROR, CLOSE_UNAUTHORIZED};
pub use locks::{ConflictWarning, LockEntry, LockOwner, LockTable};
pub use persistence::{LoadOutcome, PersistenceGateway, PersistenceStats};
pub use presence::{AwarenessState, CursorColor, PresenceTable};
pub use protocol::{ChannelKind, ConnId, LockInfo, PeerAwareness, PeerInfo, ProtocolError, SyncMessage};
pub use registry::{RegistryConfig, RoomRegistry};
pub use room::{LoadStatus, Member, Room, RoomStats};
pub use service::{ServerConfig, ServerStats, SyncError, SyncService};
pub use storage::{
    DocId, DocumentMetadata, DocumentStore, MemoryStore, RocksStore, SnapshotMeta, SnapshotTrigger,
    StoreConfig, StoreError, VersionId, VersionInfo, VersionRecord,
};
pub use versions::{RestoreError, VersionStore, VersionSummary, MAX_VERSIONS};
