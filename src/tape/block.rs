//! Block trait: one recorded differentiable operation

use super::Variable;
use crate::error::Result;

/// One recorded operation with a fixed dependency list and a single output.
///
/// The dependency list is frozen at construction time, before the underlying
/// operation runs, because the operation may overwrite its inputs in place.
/// Duplicate dependencies are kept in term order where multiplicity matters
/// (`a * a` has two terms).
///
/// Every propagation method treats an absent upstream signal (no adjoint,
/// tangent, or Hessian input) as "no contribution" and returns without side
/// effects; absence is a frequent, valid state, not an error.
pub trait Block {
    /// Dependencies in term order, duplicates preserved.
    fn dependencies(&self) -> &[Variable];

    /// The variable this block produced.
    fn output(&self) -> &Variable;

    /// Reproduce the output from the dependencies' current checkpoints and
    /// overwrite the output's checkpoint. Must be deterministic and must not
    /// modify any dependency.
    fn recompute(&self) -> Result<()>;

    /// Pull the accumulated adjoint off the output and push contributions
    /// onto each dependency's adjoint slot.
    fn evaluate_adj(&self) -> Result<()>;

    /// Combine the dependencies' tangent values into the output's tangent
    /// slot.
    fn evaluate_tlm(&self) -> Result<()>;

    /// Push second-order contributions onto each dependency, combining the
    /// output's adjoint, Hessian input, and the tangent values populated by
    /// a preceding forward pass.
    fn evaluate_hessian(&self) -> Result<()>;
}
