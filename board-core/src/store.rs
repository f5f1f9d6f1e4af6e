//! Shared document store: the conflict-free replicated whiteboard.
//!
//! Architecture:
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │               DocumentStore                     │
//! │                                                │
//! │  ShapeId → ShapeState                          │
//! │            ├── field registers (LWW, stamped)  │
//! │            ├── order-key register              │
//! │            └── aliveness register (tombstone)  │
//! │                                                │
//! │  LayerOrder: derived — alive shapes sorted by  │
//! │              (order key, shape id)             │
//! │                                                │
//! │  VersionVector: max stamp seen per client      │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Merge rules:
//! - Every attribute is a last-writer-wins register stamped with
//!   `(lamport_time, client_id)`. A write lands iff its stamp is
//!   strictly greater, so applying a delta twice — or two replicas
//!   applying the same set in different orders — yields one state.
//! - Deletion tombstones the aliveness register; field writes for a
//!   tombstoned shape still merge but stay invisible, so a late edit
//!   of a deleted shape is absorbed without error.
//! - A field write that arrives before its shape's Add is parked in a
//!   partial state; the shape surfaces once the Add lands.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Last Write Wins)

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::clock::{ClientId, Lamport, LamportClock, VersionVector};
use crate::delta::{Delta, DeltaOp, FieldId, FieldValue};
use crate::order::{key_between, spread_keys};
use crate::shape::{clamp_opacity, clamp_stroke_width, Geometry, GroupId, ShapeId, ShapeRecord};

/// A stamped LWW register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Register<T> {
    value: T,
    stamp: Lamport,
}

impl<T> Register<T> {
    fn new(value: T, stamp: Lamport) -> Self {
        Self { value, stamp }
    }

    /// Write iff the incoming stamp is strictly newer.
    fn merge(&mut self, value: T, stamp: Lamport) -> bool {
        if stamp > self.stamp {
            self.value = value;
            self.stamp = stamp;
            true
        } else {
            false
        }
    }
}

fn merge_slot<T>(slot: &mut Option<Register<T>>, value: T, stamp: Lamport) -> bool {
    match slot {
        Some(reg) => reg.merge(value, stamp),
        None => {
            *slot = Some(Register::new(value, stamp));
            true
        }
    }
}

/// Per-shape register set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ShapeState {
    fields: HashMap<FieldId, Register<FieldValue>>,
    order: Option<Register<f64>>,
    alive: Option<Register<bool>>,
}

impl ShapeState {
    fn is_alive(&self) -> bool {
        matches!(&self.alive, Some(reg) if reg.value)
    }

    fn merge_field(&mut self, field: FieldId, value: FieldValue, stamp: Lamport) -> bool {
        match self.fields.entry(field) {
            std::collections::hash_map::Entry::Occupied(mut e) => e.get_mut().merge(value, stamp),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(Register::new(value, stamp));
                true
            }
        }
    }
}

/// Result of merging one delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// At least one register changed.
    Changed(ShapeId),
    /// Duplicate or superseded; nothing changed.
    Unchanged,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, ApplyOutcome::Changed(_))
    }
}

/// Partial update of a shape's mutable attributes.
///
/// `None` fields are untouched; `group` distinguishes "leave alone"
/// (`None`) from "clear the group" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct ShapePatch {
    pub geometry: Option<Geometry>,
    pub fill: Option<[f32; 4]>,
    pub fill_opacity: Option<f32>,
    pub stroke: Option<[f32; 4]>,
    pub stroke_width: Option<f32>,
    pub stroke_opacity: Option<f32>,
    pub rotation: Option<f32>,
    pub visible: Option<bool>,
    pub locked: Option<bool>,
    pub group: Option<Option<GroupId>>,
}

/// Store errors. These surface only from the local-edit API; remote
/// merge never fails.
#[derive(Debug, Clone)]
pub enum StoreError {
    ShapeNotFound(ShapeId),
    ShapeDeleted(ShapeId),
    /// Reorder target is not a permutation of the current layer order
    InvalidOrder,
    SnapshotError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::ShapeNotFound(id) => write!(f, "Shape not found: {id}"),
            StoreError::ShapeDeleted(id) => write!(f, "Shape is deleted: {id}"),
            StoreError::InvalidOrder => write!(f, "Reorder target does not match layer order"),
            StoreError::SnapshotError(e) => write!(f, "Snapshot error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Listener invoked with the shape ids touched by a batch of deltas.
pub type Listener = Box<dyn Fn(&[ShapeId]) + Send + Sync>;

/// Serialized form of the whole document (for compaction and joiners).
#[derive(Serialize, Deserialize)]
struct Snapshot {
    shapes: HashMap<ShapeId, ShapeState>,
    vv: VersionVector,
}

/// The replicated document.
///
/// One instance per replica (each client, plus the authoritative copy
/// inside each room coordinator). Local edits stamp, merge, and return
/// the delta to transmit; remote deltas go through [`apply`].
///
/// [`apply`]: DocumentStore::apply
pub struct DocumentStore {
    client: ClientId,
    clock: LamportClock,
    shapes: HashMap<ShapeId, ShapeState>,
    vv: VersionVector,
    listeners: Vec<Listener>,
}

impl DocumentStore {
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            clock: LamportClock::new(client),
            shapes: HashMap::new(),
            vv: VersionVector::new(),
            listeners: Vec::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client
    }

    pub fn version_vector(&self) -> &VersionVector {
        &self.vv
    }

    /// Register a change listener. Invoked once per applied batch with
    /// the ids of the shapes touched.
    pub fn subscribe(&mut self, listener: Listener) {
        self.listeners.push(listener);
    }

    // ---- local edits -------------------------------------------------

    /// Create a shape, appended to the top of the layer order.
    pub fn create_shape(&mut self, shape: ShapeRecord) -> (ShapeId, Delta) {
        let id = shape.id;
        let order_key = self.top_key() + 1.0;
        let delta = self.commit_local(DeltaOp::Add { shape, order_key });
        (id, delta)
    }

    /// Write one field register. Emits even when the value is equal,
    /// so an undo can re-assert a prior value with a newer stamp.
    pub fn set_field(
        &mut self,
        id: ShapeId,
        field: FieldId,
        value: FieldValue,
    ) -> Result<Delta, StoreError> {
        self.require_alive(id)?;
        Ok(self.commit_local(DeltaOp::Set { shape: id, field, value }))
    }

    /// Apply a patch, emitting one delta per field that actually changed.
    pub fn update_shape(&mut self, id: ShapeId, patch: ShapePatch) -> Result<Vec<Delta>, StoreError> {
        let current = self.get(id).ok_or_else(|| self.missing_error(id))?;

        let mut edits: Vec<(FieldId, FieldValue)> = Vec::new();
        if let Some(g) = patch.geometry {
            if g != current.geometry {
                edits.push((FieldId::Geometry, FieldValue::Geometry(g)));
            }
        }
        if let Some(v) = patch.fill {
            if v != current.style.fill {
                edits.push((FieldId::Fill, FieldValue::Color(v)));
            }
        }
        if let Some(v) = patch.fill_opacity {
            let v = clamp_opacity(v);
            if v != current.style.fill_opacity {
                edits.push((FieldId::FillOpacity, FieldValue::Scalar(v)));
            }
        }
        if let Some(v) = patch.stroke {
            if v != current.style.stroke {
                edits.push((FieldId::Stroke, FieldValue::Color(v)));
            }
        }
        if let Some(v) = patch.stroke_width {
            let v = clamp_stroke_width(v);
            if v != current.style.stroke_width {
                edits.push((FieldId::StrokeWidth, FieldValue::Scalar(v)));
            }
        }
        if let Some(v) = patch.stroke_opacity {
            let v = clamp_opacity(v);
            if v != current.style.stroke_opacity {
                edits.push((FieldId::StrokeOpacity, FieldValue::Scalar(v)));
            }
        }
        if let Some(v) = patch.rotation {
            if v != current.rotation {
                edits.push((FieldId::Rotation, FieldValue::Scalar(v)));
            }
        }
        if let Some(v) = patch.visible {
            if v != current.visible {
                edits.push((FieldId::Visible, FieldValue::Bool(v)));
            }
        }
        if let Some(v) = patch.locked {
            if v != current.locked {
                edits.push((FieldId::Locked, FieldValue::Bool(v)));
            }
        }
        if let Some(v) = patch.group {
            if v != current.group {
                edits.push((FieldId::Group, FieldValue::Group(v)));
            }
        }

        let deltas = edits
            .into_iter()
            .map(|(field, value)| self.commit_local(DeltaOp::Set { shape: id, field, value }))
            .collect();
        Ok(deltas)
    }

    /// Tombstone a shape. The record survives for conflict resolution.
    pub fn delete_shape(&mut self, id: ShapeId) -> Result<Delta, StoreError> {
        self.require_alive(id)?;
        Ok(self.commit_local(DeltaOp::Remove { shape: id }))
    }

    /// Bring a tombstoned shape back (the undo of a delete). The fresh
    /// stamp keeps the revival commutative with concurrent edits.
    pub fn restore_shape(&mut self, id: ShapeId) -> Result<Delta, StoreError> {
        if !self.shapes.contains_key(&id) {
            return Err(StoreError::ShapeNotFound(id));
        }
        // Restoring an already-alive shape just re-asserts the register.
        Ok(self.commit_local(DeltaOp::Restore { shape: id }))
    }

    /// Write a specific order key (used by undo of a move).
    pub fn move_shape(&mut self, id: ShapeId, order_key: f64) -> Result<Delta, StoreError> {
        self.require_alive(id)?;
        Ok(self.commit_local(DeltaOp::Move { shape: id, order_key }))
    }

    /// Rearrange the layer order to match `target`.
    ///
    /// Emits moves only for shapes out of place, so two concurrent
    /// reorders interleave per shape instead of clobbering each other.
    /// Falls back to a full key reassignment when fractional midpoints
    /// between neighbors are exhausted.
    pub fn reorder(&mut self, target: &[ShapeId]) -> Result<Vec<Delta>, StoreError> {
        let current = self.layer_order();
        if current.len() != target.len() {
            return Err(StoreError::InvalidOrder);
        }
        let cur_set: HashSet<&ShapeId> = current.iter().collect();
        let tgt_set: HashSet<&ShapeId> = target.iter().collect();
        if cur_set != tgt_set || tgt_set.len() != target.len() {
            return Err(StoreError::InvalidOrder);
        }

        let keys: Vec<f64> = target
            .iter()
            .map(|id| self.order_key(id).unwrap_or(0.0))
            .collect();

        // Greedy: shapes whose keys are already strictly increasing stay put.
        let mut keep = vec![false; target.len()];
        let mut last = f64::NEG_INFINITY;
        for i in 0..target.len() {
            if keys[i] > last {
                keep[i] = true;
                last = keys[i];
            }
        }

        let mut new_keys: Vec<Option<f64>> = vec![None; target.len()];
        let mut exhausted = false;
        let mut i = 0;
        while i < target.len() {
            if keep[i] {
                i += 1;
                continue;
            }
            let mut j = i;
            while j < target.len() && !keep[j] {
                j += 1;
            }
            // Kept neighbors bound the run
            let mut lo = if i == 0 { None } else { Some(keys[i - 1]) };
            let hi = if j < target.len() { Some(keys[j]) } else { None };
            for k in i..j {
                match key_between(lo, hi) {
                    Some(key) => {
                        new_keys[k] = Some(key);
                        lo = Some(key);
                    }
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }
            if exhausted {
                break;
            }
            i = j;
        }

        let mut deltas = Vec::new();
        if exhausted {
            log::debug!("Order keys exhausted; reassigning all {} keys", target.len());
            for (id, key) in target.iter().zip(spread_keys(target.len())) {
                if self.order_key(id) != Some(key) {
                    deltas.push(self.commit_local(DeltaOp::Move { shape: *id, order_key: key }));
                }
            }
        } else {
            for (idx, id) in target.iter().enumerate() {
                if let Some(key) = new_keys[idx] {
                    deltas.push(self.commit_local(DeltaOp::Move { shape: *id, order_key: key }));
                }
            }
        }
        Ok(deltas)
    }

    // ---- remote merge ------------------------------------------------

    /// Merge one delta of any origin and delivery order.
    pub fn apply(&mut self, delta: &Delta) -> ApplyOutcome {
        let outcomes = self.apply_batch(std::slice::from_ref(delta));
        if outcomes == 0 {
            ApplyOutcome::Unchanged
        } else {
            ApplyOutcome::Changed(delta.op.shape_id())
        }
    }

    /// Merge a batch; listeners are notified once for the whole batch.
    /// Returns the number of deltas that changed a register.
    pub fn apply_batch(&mut self, deltas: &[Delta]) -> usize {
        let mut touched = Vec::new();
        let mut changed = 0;
        for delta in deltas {
            if self.merge(delta) {
                touched.push(delta.op.shape_id());
                changed += 1;
            }
            self.vv.observe(&delta.stamp);
            self.clock.observe(delta.stamp);
        }
        if !touched.is_empty() {
            self.notify(&touched);
        }
        changed
    }

    fn merge(&mut self, delta: &Delta) -> bool {
        let id = delta.op.shape_id();
        let stamp = delta.stamp;
        let state = self.shapes.entry(id).or_default();

        match &delta.op {
            DeltaOp::Add { shape, order_key } => {
                let mut changed = false;
                changed |= state.merge_field(
                    FieldId::Geometry,
                    FieldValue::Geometry(shape.geometry.clone()),
                    stamp,
                );
                changed |= state.merge_field(FieldId::Fill, FieldValue::Color(shape.style.fill), stamp);
                changed |= state.merge_field(
                    FieldId::FillOpacity,
                    FieldValue::Scalar(shape.style.fill_opacity),
                    stamp,
                );
                changed |=
                    state.merge_field(FieldId::Stroke, FieldValue::Color(shape.style.stroke), stamp);
                changed |= state.merge_field(
                    FieldId::StrokeWidth,
                    FieldValue::Scalar(shape.style.stroke_width),
                    stamp,
                );
                changed |= state.merge_field(
                    FieldId::StrokeOpacity,
                    FieldValue::Scalar(shape.style.stroke_opacity),
                    stamp,
                );
                changed |=
                    state.merge_field(FieldId::Rotation, FieldValue::Scalar(shape.rotation), stamp);
                changed |= state.merge_field(FieldId::Visible, FieldValue::Bool(shape.visible), stamp);
                changed |= state.merge_field(FieldId::Locked, FieldValue::Bool(shape.locked), stamp);
                changed |= state.merge_field(FieldId::Group, FieldValue::Group(shape.group), stamp);
                changed |= merge_slot(&mut state.order, *order_key, stamp);
                changed |= merge_slot(&mut state.alive, true, stamp);
                changed
            }
            DeltaOp::Set { field, value, .. } => {
                if !state.is_alive() {
                    // Absorbed invisibly: either the shape is tombstoned
                    // or its Add has not arrived yet.
                    log::trace!("Field write for non-visible shape {id} absorbed");
                }
                state.merge_field(*field, value.clone(), stamp)
            }
            DeltaOp::Move { order_key, .. } => merge_slot(&mut state.order, *order_key, stamp),
            DeltaOp::Remove { .. } => merge_slot(&mut state.alive, false, stamp),
            DeltaOp::Restore { .. } => merge_slot(&mut state.alive, true, stamp),
        }
    }

    // ---- reads -------------------------------------------------------

    /// Materialize a live shape. `None` for unknown or tombstoned ids.
    pub fn get(&self, id: ShapeId) -> Option<ShapeRecord> {
        let state = self.shapes.get(&id)?;
        // Alive without a geometry register means the Restore beat the
        // Add; the shape surfaces once the Add arrives.
        if !state.is_alive() {
            return None;
        }
        let geometry = match state.fields.get(&FieldId::Geometry) {
            Some(Register { value: FieldValue::Geometry(g), .. }) => g.clone(),
            _ => return None,
        };

        let mut rec = ShapeRecord {
            id,
            geometry,
            style: Default::default(),
            rotation: 0.0,
            visible: true,
            locked: false,
            group: None,
        };
        for (field, reg) in &state.fields {
            match (field, &reg.value) {
                (FieldId::Fill, FieldValue::Color(c)) => rec.style.fill = *c,
                (FieldId::FillOpacity, FieldValue::Scalar(v)) => {
                    rec.style.fill_opacity = clamp_opacity(*v)
                }
                (FieldId::Stroke, FieldValue::Color(c)) => rec.style.stroke = *c,
                (FieldId::StrokeWidth, FieldValue::Scalar(v)) => {
                    rec.style.stroke_width = clamp_stroke_width(*v)
                }
                (FieldId::StrokeOpacity, FieldValue::Scalar(v)) => {
                    rec.style.stroke_opacity = clamp_opacity(*v)
                }
                (FieldId::Rotation, FieldValue::Scalar(v)) => rec.rotation = *v,
                (FieldId::Visible, FieldValue::Bool(v)) => rec.visible = *v,
                (FieldId::Locked, FieldValue::Bool(v)) => rec.locked = *v,
                (FieldId::Group, FieldValue::Group(g)) => rec.group = *g,
                _ => {}
            }
        }
        Some(rec)
    }

    /// Whether the id is known and tombstoned.
    pub fn is_tombstoned(&self, id: ShapeId) -> bool {
        matches!(self.shapes.get(&id), Some(s) if s.alive.as_ref().is_some_and(|r| !r.value))
    }

    /// Current order key of a shape.
    pub fn order_key(&self, id: &ShapeId) -> Option<f64> {
        self.shapes.get(id)?.order.as_ref().map(|r| r.value)
    }

    /// Derived layer order: live shapes sorted by (key, id).
    pub fn layer_order(&self) -> Vec<ShapeId> {
        let mut live: Vec<(f64, ShapeId)> = self
            .shapes
            .iter()
            .filter(|(id, s)| s.is_alive() && self.get(**id).is_some())
            .map(|(id, s)| (s.order.as_ref().map_or(0.0, |r| r.value), *id))
            .collect();
        live.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        live.into_iter().map(|(_, id)| id).collect()
    }

    /// All live shapes, bottom to top.
    pub fn shapes_in_order(&self) -> Vec<ShapeRecord> {
        self.layer_order()
            .into_iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Number of live shapes.
    pub fn len(&self) -> usize {
        self.layer_order().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---- snapshots ---------------------------------------------------

    /// Serialize the full register state plus version vector.
    pub fn encode_snapshot(&self) -> Result<Vec<u8>, StoreError> {
        let snapshot = Snapshot { shapes: self.shapes.clone(), vv: self.vv.clone() };
        bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(|e| StoreError::SnapshotError(e.to_string()))
    }

    /// Rebuild a replica from a snapshot. Stamps are preserved, so a
    /// delta older than the snapshotted register still loses.
    pub fn from_snapshot(client: ClientId, bytes: &[u8]) -> Result<Self, StoreError> {
        let (snapshot, _): (Snapshot, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::SnapshotError(e.to_string()))?;

        let mut store = Self::new(client);
        store.shapes = snapshot.shapes;
        store.vv = snapshot.vv;
        for (c, time) in store.vv.clone().clients() {
            store.clock.observe(Lamport::new(*time, *c));
        }
        Ok(store)
    }

    /// Merge a snapshot into this replica (state-based merge). The
    /// same strict-greater register rule applies, so merging is
    /// idempotent and order-independent with concurrent deltas.
    /// Returns the ids of shapes whose state changed.
    pub fn merge_snapshot(&mut self, bytes: &[u8]) -> Result<Vec<ShapeId>, StoreError> {
        let (snapshot, _): (Snapshot, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::SnapshotError(e.to_string()))?;

        let mut touched = Vec::new();
        for (id, incoming) in snapshot.shapes {
            let state = self.shapes.entry(id).or_default();
            let mut changed = false;
            for (field, reg) in incoming.fields {
                changed |= state.merge_field(field, reg.value, reg.stamp);
            }
            if let Some(reg) = incoming.order {
                changed |= merge_slot(&mut state.order, reg.value, reg.stamp);
            }
            if let Some(reg) = incoming.alive {
                changed |= merge_slot(&mut state.alive, reg.value, reg.stamp);
            }
            if changed {
                touched.push(id);
            }
        }

        self.vv.merge(&snapshot.vv);
        for (c, time) in snapshot.vv.clients() {
            self.clock.observe(Lamport::new(*time, *c));
        }
        if !touched.is_empty() {
            self.notify(&touched);
        }
        Ok(touched)
    }

    // ---- internals ---------------------------------------------------

    fn commit_local(&mut self, op: DeltaOp) -> Delta {
        let stamp = self.clock.tick();
        let delta = Delta::new(stamp, op);
        let changed = self.merge(&delta);
        self.vv.observe(&stamp);
        if changed {
            let touched = [delta.op.shape_id()];
            self.notify(&touched);
        }
        delta
    }

    fn top_key(&self) -> f64 {
        self.shapes
            .values()
            .filter(|s| s.is_alive())
            .filter_map(|s| s.order.as_ref().map(|r| r.value))
            .fold(0.0, f64::max)
    }

    fn require_alive(&self, id: ShapeId) -> Result<(), StoreError> {
        match self.shapes.get(&id) {
            None => Err(StoreError::ShapeNotFound(id)),
            Some(s) if !s.is_alive() => Err(StoreError::ShapeDeleted(id)),
            Some(_) => Ok(()),
        }
    }

    fn missing_error(&self, id: ShapeId) -> StoreError {
        if self.is_tombstoned(id) {
            StoreError::ShapeDeleted(id)
        } else {
            StoreError::ShapeNotFound(id)
        }
    }

    fn notify(&self, touched: &[ShapeId]) {
        for listener in &self.listeners {
            listener(touched);
        }
    }
}

/// Read the current value of one field out of a materialized record.
/// Used to capture the prior value before an edit, for undo.
pub fn field_of(record: &ShapeRecord, field: FieldId) -> FieldValue {
    match field {
        FieldId::Geometry => FieldValue::Geometry(record.geometry.clone()),
        FieldId::Fill => FieldValue::Color(record.style.fill),
        FieldId::FillOpacity => FieldValue::Scalar(record.style.fill_opacity),
        FieldId::Stroke => FieldValue::Color(record.style.stroke),
        FieldId::StrokeWidth => FieldValue::Scalar(record.style.stroke_width),
        FieldId::StrokeOpacity => FieldValue::Scalar(record.style.stroke_opacity),
        FieldId::Rotation => FieldValue::Scalar(record.rotation),
        FieldId::Visible => FieldValue::Bool(record.visible),
        FieldId::Locked => FieldValue::Bool(record.locked),
        FieldId::Group => FieldValue::Group(record.group),
    }
}
