//! The tape: an ordered record of operations and the passes over it
//!
//! Recording appends blocks in execution order, which is by construction a
//! topological order of the dependency graph. The adjoint and Hessian passes
//! walk the record backwards, the tangent-linear pass walks it forwards, and
//! replay recomputes stale checkpoints front to back; none of them needs a
//! separate sort.
//!
//! A process-wide (thread-local) stack of working tapes supports nested and
//! temporary tapes; RAII guards restore the previous tape and the annotation
//! flag on every exit path.

mod block;
mod variable;


pub use block::Block;
pub use variable::Variable;

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use crate::error::Result;

/// Ordered container of recorded blocks.
#[derive(Default)]
pub struct Tape {
    blocks: Vec<Box<dyn Block>>,
}

impl Tape {
    pub fn new() -> Self {
        Tape { blocks: Vec::new() }
    }

    /// Append a block. Insertion order is the evaluation order.
    pub fn add_block(&mut self, block: Box<dyn Block>) {
        self.blocks.push(block);
    }

    /// Number of recorded blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Clear every adjoint and Hessian accumulator on the tape, preparing a
    /// fresh reverse pass. Checkpoints are untouched.
    pub fn reset_variables(&self) {
        self.for_each_variable(|v| v.clear_sensitivities());
    }

    /// Clear every tangent slot, preparing a fresh forward pass.
    pub fn reset_tlm_values(&self) {
        self.for_each_variable(|v| v.clear_tlm());
    }

    fn for_each_variable(&self, f: impl Fn(&Variable)) {
        let mut seen = HashSet::new();
        for block in &self.blocks {
            for dep in block.dependencies() {
                if seen.insert(dep.id()) {
                    f(dep);
                }
            }
            let out = block.output();
            if seen.insert(out.id()) {
                f(out);
            }
        }
    }

    /// Forward replay: walk blocks from `stop_index` to the end in recorded
    /// order, recomputing each block whose inputs changed, either because a
    /// control was updated since recording or because an upstream block was
    /// itself recomputed in this sweep. Checkpoints end up consistent with
    /// the current control values.
    pub fn evaluate(&self, stop_index: usize) -> Result<()> {
        let start = stop_index.min(self.blocks.len());
        let mut refreshed: HashSet<u64> = HashSet::new();
        for block in &self.blocks[start..] {
            let stale = block
                .dependencies()
                .iter()
                .any(|d| d.is_dirty() || refreshed.contains(&d.id()));
            if stale {
                block.recompute()?;
                refreshed.insert(block.output().id());
            }
        }
        self.for_each_variable(|v| v.clear_dirty());
        Ok(())
    }

    /// Adjoint sweep: walk blocks from the end down to `stop_index` in
    /// reverse recorded order. Seed at least one output's adjoint first;
    /// with no seed the sweep is a deterministic no-op and every gradient
    /// stays zero.
    pub fn evaluate_adj(&self, stop_index: usize) -> Result<()> {
        let start = stop_index.min(self.blocks.len());
        for block in self.blocks[start..].iter().rev() {
            block.evaluate_adj()?;
        }
        Ok(())
    }

    /// Tangent-linear sweep: walk blocks in recorded order after seeding the
    /// tangent of one or more root controls.
    pub fn evaluate_tlm(&self) -> Result<()> {
        for block in &self.blocks {
            block.evaluate_tlm()?;
        }
        Ok(())
    }

    /// Hessian sweep: walk blocks in reverse recorded order. Requires a
    /// tangent-linear sweep earlier in the same evaluation so tangent values
    /// are populated.
    pub fn evaluate_hessian(&self) -> Result<()> {
        for block in self.blocks.iter().rev() {
            block.evaluate_hessian()?;
        }
        Ok(())
    }
}

// ── Working tape and annotation state ────────────────────────────────

thread_local! {
    static TAPE_STACK: RefCell<Vec<Rc<RefCell<Tape>>>> = const { RefCell::new(Vec::new()) };
    static SUPPRESS_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// The innermost working tape, if any.
pub fn get_working_tape() -> Option<Rc<RefCell<Tape>>> {
    TAPE_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Whether operations should currently record blocks: a working tape exists
/// and no suppression scope is active.
pub fn annotate_tape() -> bool {
    get_working_tape().is_some() && SUPPRESS_DEPTH.with(|d| d.get()) == 0
}

/// Make `tape` the working tape until the returned guard drops, then
/// restore the previous one. Scopes nest.
#[must_use]
pub fn push_tape(tape: Rc<RefCell<Tape>>) -> TapeGuard {
    TAPE_STACK.with(|stack| stack.borrow_mut().push(tape));
    TapeGuard { _private: () }
}

/// Restores the previously working tape on drop.
pub struct TapeGuard {
    _private: (),
}

impl Drop for TapeGuard {
    fn drop(&mut self) {
        TAPE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Suppress recording until the returned guard drops. Scopes nest, and the
/// flag is restored on every exit path, so a propagation method's internal
/// bookkeeping never records blocks of its own.
#[must_use]
pub fn stop_annotating() -> AnnotationGuard {
    SUPPRESS_DEPTH.with(|d| d.set(d.get() + 1));
    AnnotationGuard { _private: () }
}

/// Re-enables recording on drop.
pub struct AnnotationGuard {
    _private: (),
}

impl Drop for AnnotationGuard {
    fn drop(&mut self) {
        SUPPRESS_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Run `f` against the working tape if recording is active. The recording
/// sites use this so an operation executes identically with and without an
/// active tape.
pub(crate) fn record_if_enabled(f: impl FnOnce(&mut Tape)) {
    if !annotate_tape() {
        return;
    }
    if let Some(tape) = get_working_tape() {
        f(&mut tape.borrow_mut());
    }
}
