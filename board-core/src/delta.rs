//! Causally stamped document deltas.
//!
//! A delta is one operation plus the Lamport stamp of the client that
//! produced it. Deltas are the only thing replicas exchange; applying
//! them must be idempotent and commutative (see [`crate::store`]), so
//! duplicated or reordered delivery needs no special handling.
//!
//! Wire/storage encoding is bincode, same as the sync protocol.

use serde::{Deserialize, Serialize};

use crate::clock::Lamport;
use crate::shape::{Geometry, GroupId, ShapeId, ShapeRecord};

/// A single mutable shape attribute.
///
/// Each attribute is its own last-writer-wins register; concurrent
/// edits to different fields of one shape both survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldId {
    Geometry,
    Fill,
    FillOpacity,
    Stroke,
    StrokeWidth,
    StrokeOpacity,
    Rotation,
    Visible,
    Locked,
    Group,
}

/// Value written into a field register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Geometry(Geometry),
    Color([f32; 4]),
    Scalar(f32),
    Bool(bool),
    Group(Option<GroupId>),
}

/// One document operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Introduce a shape with its full initial record and layer key.
    Add { shape: ShapeRecord, order_key: f64 },
    /// Write one field register.
    Set { shape: ShapeId, field: FieldId, value: FieldValue },
    /// Write the layer-order key register.
    Move { shape: ShapeId, order_key: f64 },
    /// Tombstone a shape (the record is retained, hidden).
    Remove { shape: ShapeId },
    /// Flip a tombstoned shape back to alive (undo of a delete).
    Restore { shape: ShapeId },
}

impl DeltaOp {
    /// Shape this operation targets.
    pub fn shape_id(&self) -> ShapeId {
        match self {
            DeltaOp::Add { shape, .. } => shape.id,
            DeltaOp::Set { shape, .. }
            | DeltaOp::Move { shape, .. }
            | DeltaOp::Remove { shape }
            | DeltaOp::Restore { shape } => *shape,
        }
    }
}

/// A stamped operation — the unit of replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub stamp: Lamport,
    pub op: DeltaOp,
}

impl Delta {
    pub fn new(stamp: Lamport, op: DeltaOp) -> Self {
        Self { stamp, op }
    }

    /// Serialize to binary form.
    pub fn encode(&self) -> Result<Vec<u8>, DeltaError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| DeltaError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary form.
    pub fn decode(bytes: &[u8]) -> Result<Self, DeltaError> {
        let (delta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DeltaError::DeserializationError(e.to_string()))?;
        Ok(delta)
    }
}

/// Delta codec errors.
#[derive(Debug, Clone)]
pub enum DeltaError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for DeltaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeltaError::SerializationError(e) => write!(f, "Delta serialization error: {e}"),
            DeltaError::DeserializationError(e) => write!(f, "Delta deserialization error: {e}"),
        }
    }
}

impl std::error::Error for DeltaError {}
