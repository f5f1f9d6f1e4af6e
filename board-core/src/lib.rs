//! # board-core — CRDT document model for collaborative whiteboards
//!
//! The replicated document: shapes, causal clocks, deltas, the merge
//! engine, and local undo/redo. No networking lives here — transport
//! and rooms are `board-collab`'s job.
//!
//! ## Architecture
//!
//! ```text
//! local edit ──► DocumentStore ──► Delta (stamped op)
//!                    ▲                  │
//!                    │   idempotent,    │ transmitted by
//!                    │   commutative    │ board-collab
//!                    │   merge          ▼
//!               remote Delta ◄──── other replicas
//! ```
//!
//! ## Modules
//!
//! - [`shape`] — geometry union (8 kinds), style, shape records
//! - [`clock`] — Lamport stamps, per-replica clock, version vectors
//! - [`delta`] — stamped field-level operations and their codec
//! - [`order`] — fractional keys behind the derived layer order
//! - [`store`] — the document store: LWW merge, snapshots, listeners
//! - [`undo`] — capture-window undo/redo over inverse local edits

pub mod clock;
pub mod delta;
pub mod order;
pub mod shape;
pub mod store;
pub mod undo;

pub use clock::{ClientId, Lamport, LamportClock, VersionVector};
pub use delta::{Delta, DeltaError, DeltaOp, FieldId, FieldValue};
pub use shape::{Geometry, GroupId, Point, ShapeId, ShapeRecord, ShapeStyle};
pub use store::{field_of, ApplyOutcome, DocumentStore, ShapePatch, StoreError};
pub use undo::{LocalEdit, UndoTracker};
