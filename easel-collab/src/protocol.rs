//! Binary protocol spoken over each document socket.
//!
//! Every binary WebSocket frame carries exactly one bincode-encoded
//! [`SyncMessage`]. Replica payloads (`state_vector`, `update`) are opaque Yrs
//! v1 encodings produced by [`easel_core::Replica`].
//!
//! ```text
//! client                                server
//!   │ ── connect /doc-1?token=… ──────────► │  (gateway: verify, join room)
//!   │ ◄─────────────── Welcome { peer } ─── │
//!   │ ◄──────── SyncStep1 { server sv } ─── │
//!   │ ◄──────── AwarenessSnapshot, Locks ── │
//!   │ ── SyncStep1 { client sv } ─────────► │
//!   │ ◄────────── SyncStep2 { diff } ────── │
//!   │ ── SyncStep2 / Update ──────────────► │  → Update to every other member
//! ```

use chrono::{DateTime, Utc};
use easel_core::ShapeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::{AwarenessState, CursorColor};

/// Identifier of one socket (one member of a room).
pub type ConnId = Uuid;

/// Frames above this size are refused before decoding.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Which sub-channel a connection joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Replica sync plus awareness and lock traffic.
    Sync,
    /// Awareness and lock traffic only.
    Presence,
}

impl ChannelKind {
    pub fn carries_replica(&self) -> bool {
        matches!(self, ChannelKind::Sync)
    }
}

/// A connected member as seen by the other members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub conn_id: ConnId,
    /// Verified user id (from the identity verifier, never from the client).
    pub user_id: String,
    pub name: String,
    pub color: CursorColor,
}

impl PeerInfo {
    pub fn new(conn_id: ConnId, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = CursorColor::from_user(&user_id);
        Self { conn_id, user_id, name: name.into(), color }
    }
}

/// Awareness entry of one connection, as relayed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerAwareness {
    pub peer: PeerInfo,
    /// Sender-side monotonic clock, newer entries win.
    pub clock: u64,
    pub state: AwarenessState,
}

/// One advisory lock as reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockInfo {
    pub shape_id: ShapeId,
    pub user_id: String,
    pub conn_id: Option<ConnId>,
    pub acquired_at: DateTime<Utc>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncMessage {
    /// Server → client, first frame after join.
    Welcome { peer: PeerInfo },
    /// Sender's state vector. The receiver answers with `SyncStep2`.
    SyncStep1 { state_vector: Vec<u8> },
    /// Everything the receiver of `SyncStep1` was missing.
    SyncStep2 { update: Vec<u8> },
    /// Incremental replica update.
    Update { update: Vec<u8> },
    /// Client → server: this connection's new awareness state.
    Awareness { clock: u64, state: AwarenessState },
    /// Server → client: one member's awareness changed.
    AwarenessChanged { entry: PeerAwareness },
    /// Server → client on join: current awareness of every member.
    AwarenessSnapshot { peers: Vec<PeerAwareness> },
    AwarenessRemoved { conn_id: ConnId },
    PeerJoined { peer: PeerInfo },
    PeerLeft { conn_id: ConnId, user_id: String },
    LockAcquire { shape_id: ShapeId },
    LockRelease { shape_id: ShapeId },
    /// A lock was taken (`owner = Some`) or dropped (`owner = None`).
    LockChanged { shape_id: ShapeId, owner: Option<LockInfo> },
    LockSnapshot { locks: Vec<LockInfo> },
    /// Sent to the requester only when another user holds the lock.
    LockDenied { shape_id: ShapeId, owner: String },
    VersionRestored { version_id: Uuid, ordinal: usize },
}

impl SyncMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Welcome { .. } => "welcome",
            SyncMessage::SyncStep1 { .. } => "sync_step1",
            SyncMessage::SyncStep2 { .. } => "sync_step2",
            SyncMessage::Update { .. } => "update",
            SyncMessage::Awareness { .. } => "awareness",
            SyncMessage::AwarenessChanged { .. } => "awareness_changed",
            SyncMessage::AwarenessSnapshot { .. } => "awareness_snapshot",
            SyncMessage::AwarenessRemoved { .. } => "awareness_removed",
            SyncMessage::PeerJoined { .. } => "peer_joined",
            SyncMessage::PeerLeft { .. } => "peer_left",
            SyncMessage::LockAcquire { .. } => "lock_acquire",
            SyncMessage::LockRelease { .. } => "lock_release",
            SyncMessage::LockChanged { .. } => "lock_changed",
            SyncMessage::LockSnapshot { .. } => "lock_snapshot",
            SyncMessage::LockDenied { .. } => "lock_denied",
            SyncMessage::VersionRestored { .. } => "version_restored",
        }
    }

    /// Whether the message carries replica state (not allowed on presence channels).
    pub fn is_replica_traffic(&self) -> bool {
        matches!(
            self,
            SyncMessage::SyncStep1 { .. } | SyncMessage::SyncStep2 { .. } | SyncMessage::Update { .. }
        )
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    ///
    /// Trailing bytes after a complete message are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(bytes.len()));
        }
        let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::Deserialization(format!(
                "{} trailing bytes",
                bytes.len() - read
            )));
        }
        Ok(msg)
    }
}

/// Protocol errors. Any of them closes the offending connection only.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("Unexpected message '{0}' on this channel")]
    UnexpectedMessage(&'static str),
    #[error(transparent)]
    Replica(#[from] easel_core::ReplicaError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_core::Point;

    #[test]
    fn test_update_roundtrip() {
        let msg = SyncMessage::Update { update: vec![1, 2, 3, 4, 5] };
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_awareness_with_null_cursor() {
        let msg = SyncMessage::Awareness {
            clock: 3,
            state: AwarenessState { cursor: None, selection: vec!["s1".into()] },
        };
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);

        let msg = SyncMessage::Awareness {
            clock: 4,
            state: AwarenessState { cursor: Some(Point::new(3.5, -2.0)), selection: vec![] },
        };
        assert_eq!(SyncMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_lock_changed_roundtrip() {
        let msg = SyncMessage::LockChanged {
            shape_id: "s1".into(),
            owner: Some(LockInfo {
                shape_id: "s1".into(),
                user_id: "alice".into(),
                conn_id: Some(Uuid::new_v4()),
                acquired_at: Utc::now(),
            }),
        };
        assert_eq!(SyncMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            SyncMessage::decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(SyncMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = SyncMessage::LockAcquire { shape_id: "s1".into() }.encode().unwrap();
        bytes.push(0);
        assert!(SyncMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_replica_traffic_classification() {
        assert!(SyncMessage::SyncStep1 { state_vector: vec![] }.is_replica_traffic());
        assert!(SyncMessage::Update { update: vec![] }.is_replica_traffic());
        assert!(!SyncMessage::LockAcquire { shape_id: "a".into() }.is_replica_traffic());
        assert!(!ChannelKind::Presence.carries_replica());
    }

    #[test]
    fn test_peer_color_stable_per_user() {
        let a = PeerInfo::new(Uuid::new_v4(), "alice", "Alice");
        let b = PeerInfo::new(Uuid::new_v4(), "alice", "Alice (tab 2)");
        assert_eq!(a.color, b.color);
    }

    #[test]
    fn test_update_size_efficient() {
        let msg = SyncMessage::Update { update: vec![0u8; 50] };
        let encoded = msg.encode().unwrap();
        // variant tag + length prefix + payload
        assert!(encoded.len() <= 53, "encoded {} bytes", encoded.len());
    }
}
