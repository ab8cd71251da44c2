//! Ephemeral awareness: who is in the room, where their cursor is, what they
//! have selected.
//!
//! Awareness never enters the replica and is never persisted. The server keeps
//! one [`PresenceTable`] per room so a late joiner can be sent everyone's
//! current state, and drops a member's entry the moment it disconnects.

use easel_core::{Point, ShapeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::protocol::{ConnId, PeerAwareness, PeerInfo};

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Per-connection awareness payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    /// Cursor in document coordinates, `None` while the pointer is off-canvas.
    pub cursor: Option<Point>,
    /// Selected shapes (empty = no selection).
    pub selection: Vec<ShapeId>,
}

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color for a user id.
    ///
    /// Every connection of the same user gets the same hue.
    pub fn from_user(user_id: &str) -> Self {
        let hue = (fnv1a(user_id.as_bytes()) % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

// FNV-1a rather than DefaultHasher, whose output may change between Rust
// releases and would recolor every user after an upgrade.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Room-side table
// ───────────────────────────────────────────────────────────────────

/// Awareness of every member of one room, keyed by connection.
#[derive(Debug, Default)]
pub struct PresenceTable {
    entries: HashMap<ConnId, PeerAwareness>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a member's new state.
    ///
    /// Returns the stored entry, or `None` when `clock` is older than what is
    /// already held for that connection (stale updates are dropped).
    pub fn update(&mut self, peer: &PeerInfo, clock: u64, state: AwarenessState) -> Option<PeerAwareness> {
        if let Some(existing) = self.entries.get(&peer.conn_id) {
            if clock < existing.clock {
                log::trace!("Dropping stale awareness from {} ({clock} < {})", peer.conn_id, existing.clock);
                return None;
            }
        }
        let entry = PeerAwareness { peer: peer.clone(), clock, state };
        self.entries.insert(peer.conn_id, entry.clone());
        Some(entry)
    }

    pub fn remove(&mut self, conn_id: &ConnId) -> Option<PeerAwareness> {
        self.entries.remove(conn_id)
    }

    pub fn get(&self, conn_id: &ConnId) -> Option<&PeerAwareness> {
        self.entries.get(conn_id)
    }

    /// All entries, in a stable order for the join snapshot.
    pub fn snapshot(&self) -> Vec<PeerAwareness> {
        let mut entries: Vec<PeerAwareness> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.peer.conn_id.cmp(&b.peer.conn_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn peer(user: &str) -> PeerInfo {
        PeerInfo::new(Uuid::new_v4(), user, user)
    }

    #[test]
    fn test_color_deterministic_and_in_range() {
        let c1 = CursorColor::from_user("alice");
        let c2 = CursorColor::from_user("alice");
        assert_eq!(c1, c2);
        for v in [c1.r, c1.g, c1.b, c1.a] {
            assert!((0.0..=1.0).contains(&v));
        }
        assert_ne!(CursorColor::from_user("alice"), CursorColor::from_user("bob"));
    }

    #[test]
    fn test_last_write_wins_and_stale_dropped() {
        let mut table = PresenceTable::new();
        let alice = peer("alice");
        let first = AwarenessState { cursor: Some(Point::new(1.0, 1.0)), selection: vec![] };
        let second = AwarenessState { cursor: Some(Point::new(2.0, 2.0)), selection: vec!["s1".into()] };

        assert!(table.update(&alice, 1, first.clone()).is_some());
        assert!(table.update(&alice, 2, second.clone()).is_some());
        assert!(table.update(&alice, 1, first).is_none());
        assert_eq!(table.get(&alice.conn_id).unwrap().state, second);
    }

    #[test]
    fn test_remove_clears_entry() {
        let mut table = PresenceTable::new();
        let alice = peer("alice");
        let bob = peer("bob");
        table.update(&alice, 0, AwarenessState::default());
        table.update(&bob, 0, AwarenessState::default());
        assert_eq!(table.len(), 2);

        assert!(table.remove(&alice.conn_id).is_some());
        assert!(table.remove(&alice.conn_id).is_none());
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].peer.user_id, "bob");
    }
}
