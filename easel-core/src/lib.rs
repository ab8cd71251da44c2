//! # easel-core — shared canvas document model
//!
//! - [`shape`] — closed set of shape kinds, geometry and style
//! - [`op`] — edit operations produced by people or the command interpreter
//! - [`replica`] — Yrs-backed replicated shape collection

pub mod op;
pub mod replica;
pub mod shape;

pub use op::{OpError, ShapeOp};
pub use replica::{Replica, ReplicaError, SHAPES_MAP};
pub use shape::{Bounds, Point, Shape, ShapeId, ShapeKind, Style};
