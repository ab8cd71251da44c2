//! Advisory per-shape locks.
//!
//! A lock says "this user is working on this shape". It never blocks
//! replication: the table sits next to the replica in the room state, is
//! never encoded into it, never saved and never merged. Callers that want to
//! enforce locks (the service's `apply_edit`) check [`LockTable::check`]
//! themselves.

use chrono::{DateTime, Utc};
use easel_core::ShapeId;
use std::collections::HashMap;
use thiserror::Error;

use crate::protocol::{ConnId, LockInfo};

/// Who is asking for a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub user_id: String,
    /// Owning connection. `None` for programmatic callers, whose locks only
    /// go away through an explicit release.
    pub session: Option<ConnId>,
}

impl LockOwner {
    pub fn session(user_id: impl Into<String>, conn_id: ConnId) -> Self {
        Self { user_id: user_id.into(), session: Some(conn_id) }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), session: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockEntry {
    pub shape_id: ShapeId,
    pub owner: LockOwner,
    pub acquired_at: DateTime<Utc>,
}

impl LockEntry {
    pub fn info(&self) -> LockInfo {
        LockInfo {
            shape_id: self.shape_id.clone(),
            user_id: self.owner.user_id.clone(),
            conn_id: self.owner.session,
            acquired_at: self.acquired_at,
        }
    }
}

/// Another user holds the lock. A rejected request, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Shape {shape_id} is locked by {owner}")]
pub struct ConflictWarning {
    pub shape_id: ShapeId,
    pub owner: String,
}

/// A lock and the sockets that took it. Several tabs of one user may hold
/// the same lock; it outlives all but the last of them.
#[derive(Debug)]
struct Held {
    entry: LockEntry,
    sessions: Vec<ConnId>,
}

#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<ShapeId, Held>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock on `shape_id`.
    ///
    /// Re-acquiring by the same user succeeds and refreshes `acquired_at`.
    /// A second session joins the first as a holder and the lock stays until
    /// every holding session has closed. A programmatic re-acquire pins the lock until it is released
    /// explicitly, and a session re-acquiring a pinned lock leaves it pinned.
    pub fn acquire(&mut self, shape_id: ShapeId, owner: LockOwner) -> Result<LockEntry, ConflictWarning> {
        if let Some(held) = self.locks.get_mut(&shape_id) {
            if held.entry.owner.user_id != owner.user_id {
                return Err(ConflictWarning { shape_id, owner: held.entry.owner.user_id.clone() });
            }
            match owner.session {
                None => {
                    held.sessions.clear();
                    held.entry.owner.session = None;
                }
                Some(conn_id) if held.entry.owner.session.is_some() && !held.sessions.contains(&conn_id) => {
                    held.sessions.push(conn_id);
                }
                Some(_) => {}
            }
            held.entry.acquired_at = Utc::now();
            return Ok(held.entry.clone());
        }
        let sessions = owner.session.into_iter().collect();
        let entry = LockEntry { shape_id: shape_id.clone(), owner, acquired_at: Utc::now() };
        self.locks.insert(shape_id, Held { entry: entry.clone(), sessions });
        Ok(entry)
    }

    /// Unconditional release.
    pub fn release(&mut self, shape_id: &ShapeId) -> Option<LockEntry> {
        self.locks.remove(shape_id).map(|held| held.entry)
    }

    /// Release on behalf of `user_id`, refused if someone else holds it.
    pub fn release_for(&mut self, shape_id: &ShapeId, user_id: &str) -> Result<Option<LockEntry>, ConflictWarning> {
        self.check(shape_id, user_id)?;
        Ok(self.release(shape_id))
    }

    /// Drop every lock held by `user_id`, returning the freed shapes.
    pub fn release_all(&mut self, user_id: &str) -> Vec<ShapeId> {
        let mut freed: Vec<ShapeId> = self
            .locks
            .values()
            .filter(|held| held.entry.owner.user_id == user_id)
            .map(|held| held.entry.shape_id.clone())
            .collect();
        for shape_id in &freed {
            self.locks.remove(shape_id);
        }
        freed.sort();
        freed
    }

    /// Forget connection `conn_id` as a holder. Returns the shapes whose
    /// lock it was the last holder of.
    pub fn release_session(&mut self, conn_id: ConnId) -> Vec<ShapeId> {
        let mut freed = Vec::new();
        for held in self.locks.values_mut() {
            let Some(pos) = held.sessions.iter().position(|c| *c == conn_id) else {
                continue;
            };
            held.sessions.remove(pos);
            match held.sessions.first() {
                None => freed.push(held.entry.shape_id.clone()),
                Some(next) if held.entry.owner.session == Some(conn_id) => held.entry.owner.session = Some(*next),
                Some(_) => {}
            }
        }
        for shape_id in &freed {
            self.locks.remove(shape_id);
        }
        freed.sort();
        freed
    }

    pub fn owner(&self, shape_id: &ShapeId) -> Option<&LockEntry> {
        self.locks.get(shape_id).map(|held| &held.entry)
    }

    /// Ok when the shape is unlocked or locked by `user_id` itself.
    pub fn check(&self, shape_id: &ShapeId, user_id: &str) -> Result<(), ConflictWarning> {
        match self.owner(shape_id) {
            Some(held) if held.owner.user_id != user_id => Err(ConflictWarning {
                shape_id: shape_id.clone(),
                owner: held.owner.user_id.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Wire view of every lock, ordered by shape id.
    pub fn snapshot(&self) -> Vec<LockInfo> {
        let mut locks: Vec<LockInfo> = self.locks.values().map(|held| held.entry.info()).collect();
        locks.sort_by(|a, b| a.shape_id.cmp(&b.shape_id));
        locks
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_acquire_conflict() {
        let mut table = LockTable::new();
        table.acquire("s1".into(), LockOwner::user("alice")).unwrap();
        let err = table.acquire("s1".into(), LockOwner::user("bob")).unwrap_err();
        assert_eq!(err, ConflictWarning { shape_id: "s1".into(), owner: "alice".into() });
        assert_eq!(err.to_string(), "Shape s1 is locked by alice");
    }

    #[test]
    fn test_lock_held_until_last_tab_closes() {
        let mut table = LockTable::new();
        let (tab1, tab2) = (Uuid::new_v4(), Uuid::new_v4());
        table.acquire("s1".into(), LockOwner::session("alice", tab1)).unwrap();
        let again = table.acquire("s1".into(), LockOwner::session("alice", tab2)).unwrap();
        assert_eq!(again.owner.session, Some(tab1));

        // Closing the second tab leaves the first tab's lock alone
        assert!(table.release_session(tab2).is_empty());
        assert_eq!(table.owner(&"s1".into()).unwrap().owner.session, Some(tab1));
        assert_eq!(table.release_session(tab1), vec![ShapeId::from("s1")]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_first_tab_closing_hands_lock_to_second() {
        let mut table = LockTable::new();
        let (tab1, tab2) = (Uuid::new_v4(), Uuid::new_v4());
        table.acquire("s1".into(), LockOwner::session("alice", tab1)).unwrap();
        table.acquire("s1".into(), LockOwner::session("alice", tab2)).unwrap();

        assert!(table.release_session(tab1).is_empty());
        assert_eq!(table.snapshot()[0].conn_id, Some(tab2));
        assert_eq!(table.release_session(tab2), vec![ShapeId::from("s1")]);
    }

    #[test]
    fn test_programmatic_reacquire_pins_lock() {
        let mut table = LockTable::new();
        let tab = Uuid::new_v4();
        table.acquire("s1".into(), LockOwner::session("alice", tab)).unwrap();
        table.acquire("s1".into(), LockOwner::user("alice")).unwrap();
        assert!(table.release_session(tab).is_empty());
        assert_eq!(table.owner(&"s1".into()).unwrap().owner.session, None);

        // A session taking a pinned lock does not make it session-bound
        table.acquire("s1".into(), LockOwner::session("alice", tab)).unwrap();
        assert!(table.release_session(tab).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_release_for_other_user_refused() {
        let mut table = LockTable::new();
        table.acquire("s1".into(), LockOwner::user("alice")).unwrap();
        assert!(table.release_for(&"s1".into(), "bob").is_err());
        assert!(table.release_for(&"s1".into(), "alice").unwrap().is_some());
        assert_eq!(table.release_for(&"s1".into(), "bob").unwrap(), None);
    }

    #[test]
    fn test_release_all_for_user() {
        let mut table = LockTable::new();
        for id in ["b", "a", "c"] {
            table.acquire(id.into(), LockOwner::user("alice")).unwrap();
        }
        table.acquire("d".into(), LockOwner::user("bob")).unwrap();

        let freed = table.release_all("alice");
        assert_eq!(freed, vec![ShapeId::from("a"), "b".into(), "c".into()]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot()[0].user_id, "bob");
    }

    #[test]
    fn test_check() {
        let mut table = LockTable::new();
        assert!(table.check(&"s1".into(), "bob").is_ok());
        table.acquire("s1".into(), LockOwner::user("alice")).unwrap();
        assert!(table.check(&"s1".into(), "alice").is_ok());
        assert!(table.check(&"s1".into(), "bob").is_err());
        assert!(table.release(&"s1".into()).is_some());
        assert!(table.is_empty());
    }
}
