//! Edit operations on the shape collection.
//!
//! Human edits and the command interpreter both produce [`ShapeOp`] values,
//! so the replica applies them through one code path.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shape::{Shape, ShapeId, Style};

/// Errors raised while applying an operation to a shape.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpError {
    #[error("Shape not found: {0}")]
    UnknownShape(ShapeId),
    #[error("Shape already exists: {0}")]
    DuplicateShape(ShapeId),
    #[error("Operation '{op}' is not supported on {kind} shapes")]
    Unsupported { op: &'static str, kind: &'static str },
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),
}

/// A single edit to the shape collection.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ShapeOp {
    Create { shape: Shape },
    Move { id: ShapeId, dx: f32, dy: f32 },
    Resize { id: ShapeId, width: f32, height: f32 },
    Restyle { id: ShapeId, style: Style },
    SetText { id: ShapeId, content: String },
    Reorder { id: ShapeId, z_index: i64 },
    Delete { id: ShapeId },
}

impl ShapeOp {
    /// The shape this operation targets.
    pub fn target(&self) -> &ShapeId {
        match self {
            ShapeOp::Create { shape } => &shape.id,
            ShapeOp::Move { id, .. }
            | ShapeOp::Resize { id, .. }
            | ShapeOp::Restyle { id, .. }
            | ShapeOp::SetText { id, .. }
            | ShapeOp::Reorder { id, .. }
            | ShapeOp::Delete { id } => id,
        }
    }

    /// Whether the operation touches an existing shape.
    pub fn modifies_existing(&self) -> bool {
        !matches!(self, ShapeOp::Create { .. })
    }

    /// Apply an in-place edit to `shape`.
    ///
    /// `Create` and `Delete` change membership rather than content and are
    /// handled by the replica, they are rejected here.
    pub fn apply_to(&self, shape: &mut Shape) -> Result<(), OpError> {
        match self {
            ShapeOp::Move { dx, dy, .. } => {
                shape.kind.translate(*dx, *dy);
                Ok(())
            }
            ShapeOp::Resize { width, height, .. } => shape.kind.resize(*width, *height),
            ShapeOp::Restyle { style, .. } => {
                shape.style = style.clone();
                Ok(())
            }
            ShapeOp::SetText { content, .. } => shape.kind.set_text(content.clone()),
            ShapeOp::Reorder { z_index, .. } => {
                shape.z_index = *z_index;
                Ok(())
            }
            ShapeOp::Create { .. } => Err(OpError::DuplicateShape(shape.id.clone())),
            ShapeOp::Delete { .. } => Err(OpError::Unsupported { op: "delete", kind: shape.kind.name() }),
        }
    }
}
