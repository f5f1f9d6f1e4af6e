//! Local undo/redo over the replicated document.
//!
//! The tracker observes local-origin edits only; remote deltas never
//! enter the history. Consecutive edits within a capture window
//! (default 500 ms) coalesce into one step, so a drag is one undo.
//!
//! Undo does not rewind the document — it emits fresh inverse edits
//! through the store, stamped like any other local change, so remote
//! work that landed in between is preserved. If the target of an
//! inverse was deleted by another replica in the meantime, that
//! inverse is a silent no-op.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::delta::{Delta, FieldId, FieldValue};
use crate::shape::ShapeId;
use crate::store::{DocumentStore, StoreError};

/// Default capture window for grouping consecutive edits.
pub const DEFAULT_CAPTURE_WINDOW: Duration = Duration::from_millis(500);

/// Default bound on each history stack.
pub const DEFAULT_MAX_STEPS: usize = 100;

/// One captured local edit, with enough context to invert it.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEdit {
    /// Shape created locally
    Added(ShapeId),
    /// Field written: prior and new value
    Set { shape: ShapeId, field: FieldId, prior: FieldValue, next: FieldValue },
    /// Order key written: prior and new key
    Moved { shape: ShapeId, prior: f64, next: f64 },
    /// Shape tombstoned locally
    Removed(ShapeId),
    /// Shape brought back from a tombstone
    Restored(ShapeId),
}

impl LocalEdit {
    /// The edit that undoes this one.
    ///
    /// The inverse of Added is Removed (not "never existed"): the
    /// record stays in the tombstone, so redo can revive it.
    fn invert(&self) -> LocalEdit {
        match self {
            LocalEdit::Added(id) => LocalEdit::Removed(*id),
            LocalEdit::Set { shape, field, prior, next } => LocalEdit::Set {
                shape: *shape,
                field: *field,
                prior: next.clone(),
                next: prior.clone(),
            },
            LocalEdit::Moved { shape, prior, next } => {
                LocalEdit::Moved { shape: *shape, prior: *next, next: *prior }
            }
            LocalEdit::Removed(id) => LocalEdit::Restored(*id),
            LocalEdit::Restored(id) => LocalEdit::Removed(*id),
        }
    }

    /// Perform this edit against the store. `Ok(None)` means the
    /// target was deleted remotely and the edit was skipped.
    fn perform(&self, store: &mut DocumentStore) -> Option<Delta> {
        let result = match self {
            LocalEdit::Added(_) => unreachable!("Added is never performed, only inverted"),
            LocalEdit::Set { shape, field, next, .. } => {
                store.set_field(*shape, *field, next.clone())
            }
            LocalEdit::Moved { shape, next, .. } => store.move_shape(*shape, *next),
            LocalEdit::Removed(id) => store.delete_shape(*id),
            LocalEdit::Restored(id) => store.restore_shape(*id),
        };
        match result {
            Ok(delta) => Some(delta),
            Err(StoreError::ShapeDeleted(id)) | Err(StoreError::ShapeNotFound(id)) => {
                log::debug!("Undo target {id} gone; step entry skipped");
                None
            }
            Err(e) => {
                log::warn!("Undo edit failed: {e}");
                None
            }
        }
    }
}

/// A group of edits captured within one window.
#[derive(Debug, Clone)]
struct UndoStep {
    edits: Vec<LocalEdit>,
    last_edit: Instant,
}

/// Bounded undo/redo stacks with capture-window grouping.
pub struct UndoTracker {
    undo: VecDeque<UndoStep>,
    redo: VecDeque<UndoStep>,
    window: Duration,
    max_steps: usize,
}

impl UndoTracker {
    pub fn new(window: Duration, max_steps: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            window,
            max_steps,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CAPTURE_WINDOW, DEFAULT_MAX_STEPS)
    }

    /// Record a local edit. Joins the open step when the previous edit
    /// was within the capture window, else opens a new step. Any new
    /// edit invalidates the redo stack.
    pub fn record(&mut self, edit: LocalEdit) {
        self.record_at(edit, Instant::now());
    }

    fn record_at(&mut self, edit: LocalEdit, now: Instant) {
        self.redo.clear();

        let join = match self.undo.back() {
            Some(step) => now.duration_since(step.last_edit) < self.window,
            None => false,
        };

        if join {
            let step = self.undo.back_mut().unwrap();
            step.edits.push(edit);
            step.last_edit = now;
        } else {
            self.undo.push_back(UndoStep { edits: vec![edit], last_edit: now });
            if self.undo.len() > self.max_steps {
                self.undo.pop_front();
            }
        }
    }

    /// Force the open step closed; the next edit starts a new one.
    pub fn commit_step(&mut self) {
        if let Some(step) = self.undo.back_mut() {
            // Backdate so the window test can never join onto it
            step.last_edit = step.last_edit.checked_sub(self.window + self.window)
                .unwrap_or(step.last_edit);
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    /// Undo the most recent step. Returns the deltas emitted (to be
    /// transmitted like any local edit); `None` when there is nothing
    /// to undo. Edits whose target is gone are skipped.
    pub fn undo(&mut self, store: &mut DocumentStore) -> Option<Vec<Delta>> {
        let step = self.undo.pop_back()?;

        let mut deltas = Vec::new();
        let mut redo_edits = Vec::new();
        for edit in step.edits.iter().rev() {
            let inverse = edit.invert();
            if let Some(delta) = inverse.perform(store) {
                deltas.push(delta);
            }
            redo_edits.push(inverse.invert());
        }
        redo_edits.reverse();

        self.redo.push_back(UndoStep { edits: redo_edits, last_edit: step.last_edit });
        if self.redo.len() > self.max_steps {
            self.redo.pop_front();
        }
        Some(deltas)
    }

    /// Re-apply the most recently undone step.
    pub fn redo(&mut self, store: &mut DocumentStore) -> Option<Vec<Delta>> {
        let step = self.redo.pop_back()?;

        let mut deltas = Vec::new();
        let mut undo_edits = Vec::new();
        for edit in &step.edits {
            // Redo of a create is a restore: the record lives on in
            // the tombstone.
            let replay = match edit {
                LocalEdit::Added(id) => LocalEdit::Restored(*id),
                other => other.clone(),
            };
            if let Some(delta) = replay.perform(store) {
                deltas.push(delta);
            }
            undo_edits.push(replay);
        }

        self.undo.push_back(UndoStep { edits: undo_edits, last_edit: step.last_edit });
        if self.undo.len() > self.max_steps {
            self.undo.pop_front();
        }
        Some(deltas)
    }

    /// Drop all history (e.g. when leaving a room).
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}
