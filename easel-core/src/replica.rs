//! Replicated shape collection backed by a Yrs document.
//!
//! Shapes live in a single Yrs map (`"shapes"`), keyed by shape id, each
//! value being the shape serialized as JSON. Concurrent writes to the same
//! key resolve last-writer-wins by Yrs client ordering, so two replicas that
//! have seen the same set of updates always hold the same shapes.
//!
//! Every mutating call returns the Yrs update it produced so the caller can
//! ship it to peers.

use std::collections::BTreeMap;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, Update};

use crate::op::{OpError, ShapeOp};
use crate::shape::{Shape, ShapeId};

/// Name of the root map holding all shapes.
pub const SHAPES_MAP: &str = "shapes";

#[derive(Debug, Clone, Error)]
pub enum ReplicaError {
    #[error("Malformed update: {0}")]
    MalformedUpdate(String),
    #[error("Malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("Failed to apply update: {0}")]
    Apply(String),
    #[error("Shape serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Op(#[from] OpError),
}

/// In-memory replica of one document's shapes.
pub struct Replica {
    doc: Doc,
    shapes: MapRef,
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica {
    /// Create an empty replica.
    pub fn new() -> Self {
        let doc = Doc::new();
        let shapes = doc.get_or_insert_map(SHAPES_MAP);
        Self { doc, shapes }
    }

    /// Rebuild a replica from a full state blob (as produced by [`encode_state`]).
    ///
    /// An empty blob yields an empty replica.
    ///
    /// [`encode_state`]: Replica::encode_state
    pub fn from_state(state: &[u8]) -> Result<Self, ReplicaError> {
        let mut replica = Self::new();
        if !state.is_empty() {
            replica.apply_update(state)?;
        }
        Ok(replica)
    }

    /// Encode the full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode this replica's state vector (the handshake summary).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode everything a peer with `remote_sv` is missing.
    pub fn diff_since(&self, remote_sv: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| ReplicaError::MalformedStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Merge a remote update. Applying the same update twice is a no-op.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<(), ReplicaError> {
        let update = Update::decode_v1(update)
            .map_err(|e| ReplicaError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Apply(e.to_string()))
    }

    /// Apply a local edit operation, returning the update to broadcast.
    pub fn apply_op(&mut self, op: &ShapeOp) -> Result<Vec<u8>, ReplicaError> {
        let mut txn = self.doc.transact_mut();
        let key = op.target().as_str();
        match op {
            ShapeOp::Create { shape } => {
                if self.shapes.contains_key(&txn, key) {
                    return Err(OpError::DuplicateShape(shape.id.clone()).into());
                }
                let json = shape.to_json()
                    .map_err(|e| ReplicaError::Serialization(e.to_string()))?;
                self.shapes.insert(&mut txn, key, json);
            }
            ShapeOp::Delete { id } => {
                if self.shapes.remove(&mut txn, key).is_none() {
                    return Err(OpError::UnknownShape(id.clone()).into());
                }
            }
            _ => {
                let mut shape = read_shape(&self.shapes, &txn, key)
                    .ok_or_else(|| OpError::UnknownShape(op.target().clone()))?;
                op.apply_to(&mut shape)?;
                let json = shape.to_json()
                    .map_err(|e| ReplicaError::Serialization(e.to_string()))?;
                self.shapes.insert(&mut txn, key, json);
            }
        }
        Ok(txn.encode_update_v1())
    }

    /// Replace the whole shape collection with `shapes` in one transaction.
    ///
    /// Shapes absent from `shapes` are deleted (leaving tombstones, so a peer
    /// holding older state cannot bring them back), changed shapes are
    /// overwritten, identical ones are left untouched.
    pub fn replace_shapes<I>(&mut self, shapes: I) -> Result<Vec<u8>, ReplicaError>
    where
        I: IntoIterator<Item = Shape>,
    {
        let mut target = BTreeMap::new();
        for shape in shapes {
            let json = shape.to_json()
                .map_err(|e| ReplicaError::Serialization(e.to_string()))?;
            target.insert(shape.id.as_str().to_string(), json);
        }

        let mut txn = self.doc.transact_mut();
        let current: Vec<(String, Option<String>)> = self.shapes
            .iter(&txn)
            .map(|(k, v)| (k.to_string(), raw_json(v)))
            .collect();

        for (key, json) in &current {
            match target.get(key) {
                Some(wanted) if Some(wanted) == json.as_ref() => {
                    target.remove(key);
                }
                Some(_) => {}
                None => {
                    self.shapes.remove(&mut txn, key);
                }
            }
        }
        for (key, json) in target {
            self.shapes.insert(&mut txn, key, json);
        }
        Ok(txn.encode_update_v1())
    }

    /// All shapes, ordered by id.
    pub fn shapes(&self) -> BTreeMap<ShapeId, Shape> {
        let txn = self.doc.transact();
        self.shapes
            .iter(&txn)
            .filter_map(|(key, value)| {
                let json = raw_json(value)?;
                match Shape::from_json(&json) {
                    Ok(shape) => Some((shape.id.clone(), shape)),
                    Err(e) => {
                        log::warn!("Skipping undecodable shape {key}: {e}");
                        None
                    }
                }
            })
            .collect()
    }

    /// Shapes sorted by stack order (bottom first), ties broken by id.
    pub fn shapes_by_z(&self) -> Vec<Shape> {
        let mut shapes: Vec<Shape> = self.shapes().into_values().collect();
        shapes.sort_by(|a, b| a.z_index.cmp(&b.z_index).then_with(|| a.id.cmp(&b.id)));
        shapes
    }

    pub fn shape(&self, id: &ShapeId) -> Option<Shape> {
        let txn = self.doc.transact();
        read_shape(&self.shapes, &txn, id.as_str())
    }

    pub fn contains(&self, id: &ShapeId) -> bool {
        let txn = self.doc.transact();
        self.shapes.contains_key(&txn, id.as_str())
    }

    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.shapes.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn raw_json(value: Out) -> Option<String> {
    match value {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn read_shape<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<Shape> {
    let json = raw_json(map.get(txn, key)?)?;
    Shape::from_json(&json).ok()
}
