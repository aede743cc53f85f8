//! Variable handles with sensitivity accumulators

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::value::Value;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

struct VariableCell {
    id: u64,
    /// Snapshot sufficient to recompute any consumer deterministically,
    /// even after the live value has moved on.
    checkpoint: RefCell<Value>,
    adj: RefCell<Option<Value>>,
    tlm: RefCell<Option<Value>>,
    hessian: RefCell<Option<Value>>,
    /// Set when the checkpoint was overwritten from outside the tape; tells
    /// the replay sweep which blocks must recompute.
    dirty: Cell<bool>,
}

/// A handle to one value produced or consumed during recording.
///
/// Cloning is cheap and shares state: a variable may be a dependency of any
/// number of blocks, and every consumer accumulates into the same adjoint
/// and Hessian slots. The tangent slot holds a single seeded direction per
/// forward pass.
#[derive(Clone)]
pub struct Variable {
    cell: Rc<VariableCell>,
}

impl Variable {
    /// Create a variable with its initial checkpoint.
    pub fn new(checkpoint: Value) -> Self {
        Variable {
            cell: Rc::new(VariableCell {
                id: fresh_id(),
                checkpoint: RefCell::new(checkpoint),
                adj: RefCell::new(None),
                tlm: RefCell::new(None),
                hessian: RefCell::new(None),
                dirty: Cell::new(false),
            }),
        }
    }

    /// Stable identity, used for dependency deduplication and coefficient
    /// bookkeeping.
    pub fn id(&self) -> u64 {
        self.cell.id
    }

    /// The checkpointed value.
    pub fn saved_output(&self) -> Value {
        self.cell.checkpoint.borrow().clone()
    }

    /// Overwrite the checkpoint from inside a `recompute`. Does not mark the
    /// variable dirty; the replay sweep tracks refreshed outputs itself.
    pub fn set_checkpoint(&self, value: Value) {
        *self.cell.checkpoint.borrow_mut() = value;
    }

    /// Overwrite the checkpoint from outside the tape (a control took a new
    /// value). Marks the variable dirty so the next replay recomputes every
    /// downstream block.
    pub fn update_checkpoint(&self, value: Value) {
        *self.cell.checkpoint.borrow_mut() = value;
        self.cell.dirty.set(true);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.cell.dirty.get()
    }

    pub(crate) fn clear_dirty(&self) {
        self.cell.dirty.set(false);
    }

    // ── Adjoint slot ─────────────────────────────────────────────

    /// Accumulate an adjoint contribution. The first call initializes the
    /// slot, later calls add.
    pub fn add_adj_output(&self, value: Value) -> Result<()> {
        accumulate_into(&self.cell.adj, value)
    }

    /// Seed the adjoint slot for a gradient root, overwriting anything
    /// accumulated so far.
    pub fn set_initial_adj_input(&self, value: Value) {
        *self.cell.adj.borrow_mut() = Some(value);
    }

    pub fn adj_value(&self) -> Option<Value> {
        self.cell.adj.borrow().clone()
    }

    // ── Tangent slot ─────────────────────────────────────────────

    /// Accumulate a tangent contribution from the current forward pass.
    pub fn add_tlm_output(&self, value: Value) -> Result<()> {
        accumulate_into(&self.cell.tlm, value)
    }

    /// Seed the tangent slot on a root control, overwriting any previous
    /// direction.
    pub fn set_initial_tlm_input(&self, value: Value) {
        *self.cell.tlm.borrow_mut() = Some(value);
    }

    pub fn tlm_value(&self) -> Option<Value> {
        self.cell.tlm.borrow().clone()
    }

    // ── Hessian slot ─────────────────────────────────────────────

    /// Accumulate a second-order contribution. Additive, like the adjoint.
    pub fn add_hessian_output(&self, value: Value) -> Result<()> {
        accumulate_into(&self.cell.hessian, value)
    }

    /// Seed the Hessian slot, overwriting anything accumulated so far.
    pub fn set_hessian_seed(&self, value: Value) {
        *self.cell.hessian.borrow_mut() = Some(value);
    }

    pub fn hessian_value(&self) -> Option<Value> {
        self.cell.hessian.borrow().clone()
    }

    // ── Reset helpers ────────────────────────────────────────────

    /// Clear the adjoint and Hessian accumulators. Checkpoints are kept.
    pub fn clear_sensitivities(&self) {
        *self.cell.adj.borrow_mut() = None;
        *self.cell.hessian.borrow_mut() = None;
    }

    /// Clear the tangent slot ahead of a fresh forward pass.
    pub fn clear_tlm(&self) {
        *self.cell.tlm.borrow_mut() = None;
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Eq for Variable {}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.cell.id)
            .field("checkpoint", &self.cell.checkpoint.borrow())
            .field("adj", &self.cell.adj.borrow())
            .field("tlm", &self.cell.tlm.borrow())
            .field("hessian", &self.cell.hessian.borrow())
            .finish()
    }
}

fn accumulate_into(slot: &RefCell<Option<Value>>, value: Value) -> Result<()> {
    let mut slot = slot.borrow_mut();
    match slot.as_mut() {
        Some(existing) => existing.accumulate(&value),
        None => {
            *slot = Some(value);
            Ok(())
        }
    }
}
