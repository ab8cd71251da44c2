//! Fan-out of encoded frames to every member of a room.
//!
//! One tokio broadcast channel per room. Frames are encoded once and shared
//! as `Arc<Vec<u8>>`; each receiver filters out frames it originated and,
//! on presence channels, replica frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{ConnId, ProtocolError, SyncMessage};

/// One frame on a room's broadcast channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Connection the frame came from, `None` for server-originated frames
    /// that every member (including the actor) must see.
    pub origin: Option<ConnId>,
    /// Replica traffic is skipped by presence-channel receivers.
    pub replica: bool,
    pub frame: Arc<Vec<u8>>,
}

impl Outbound {
    /// Whether the member `conn_id` should receive this frame.
    pub fn is_for(&self, conn_id: ConnId, wants_replica: bool) -> bool {
        self.origin != Some(conn_id) && (wants_replica || !self.replica)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
    /// Frames a receiver may fall behind before it lags.
    pub capacity: usize,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Outbound>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a receiver may fall behind before it
    /// lags and has to be resynchronized.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.sender.subscribe()
    }

    /// Encode and fan out a message. Returns the number of receivers.
    pub fn broadcast(&self, origin: Option<ConnId>, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(origin, msg.is_replica_traffic(), frame))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, origin: Option<ConnId>, replica: bool, frame: Arc<Vec<u8>>) -> usize {
        match self.sender.send(Outbound { origin, replica, frame }) {
            Ok(count) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(_) => 0, // No receivers, nothing to deliver
        }
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_fan_out_and_origin_filter() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();
        let sender = Uuid::new_v4();
        let other = Uuid::new_v4();

        let count = group
            .broadcast(Some(sender), &SyncMessage::Update { update: vec![1, 2, 3] })
            .unwrap();
        assert_eq!(count, 2);

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert!(Arc::ptr_eq(&a.frame, &b.frame));
        assert!(!a.is_for(sender, true));
        assert!(a.is_for(other, true));
        assert!(!a.is_for(other, false), "presence members skip replica frames");
    }

    #[tokio::test]
    async fn test_server_frames_reach_everyone() {
        let group = BroadcastGroup::new(4);
        let mut rx = group.subscribe();
        group
            .broadcast(None, &SyncMessage::LockRelease { shape_id: "s1".into() })
            .unwrap();
        let out = rx.recv().await.unwrap();
        assert!(out.is_for(Uuid::new_v4(), false));
        assert_eq!(
            SyncMessage::decode(&out.frame).unwrap(),
            SyncMessage::LockRelease { shape_id: "s1".into() }
        );
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for i in 0..5u8 {
            group.broadcast_raw(None, true, Arc::new(vec![i]));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                group.record_dropped(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().messages_dropped, 3);
        assert_eq!(group.stats().messages_sent, 5);
        assert_eq!(group.stats().capacity, 2);
    }

    #[test]
    fn test_no_receivers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast_raw(None, false, Arc::new(vec![1])), 0);
        assert_eq!(group.stats().receivers, 0);
    }
}
