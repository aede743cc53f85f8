//! Recorded equation solves
//!
//! [`solve`] runs a parameterized residual equation through the backend and,
//! while annotation is active, records a [`SolveBlock`] that knows how to
//! propagate adjoint, tangent-linear, and second-order sensitivities through
//! the solve by implicit differentiation.

pub mod backend;
mod block;
pub mod dense;

#[cfg(test)]
mod tests;

pub use backend::{
    Assembled, AssembleOptions, Direction, DirichletConstraint, SolveBackend, SolveOptions,
};
pub use block::SolveBlock;
pub use dense::{DenseBackend, DenseForm};

use std::collections::BTreeMap;
use std::rc::Rc;

use block::SolveDependency;

use crate::control::{Coefficient, CoeffKey, ControlKind};
use crate::error::{Error, Result};
use crate::field::{Boundary, Field};
use crate::tape::{annotate_tape, record_if_enabled, stop_annotating};
use crate::value::Value;

/// Solve `residual = 0` for `unknown`, given the parameter handles the
/// residual refers to and the boundary conditions constraining it.
///
/// The dependency list is frozen before the backend runs; the solved value
/// lands in `unknown` under a fresh variable owned by the recorded block.
/// Error-controlled solves cannot be annotated: that combination is
/// rejected here, before anything reaches the tape.
pub fn solve<B: SolveBackend + 'static>(
    backend: &Rc<B>,
    residual: &B::Form,
    unknown: &mut Field,
    parameters: &[&dyn Coefficient],
    boundary_conditions: &[&Boundary],
    options: &SolveOptions,
) -> Result<()> {
    if options.error_control && annotate_tape() {
        return Err(Error::UnsupportedAnnotation);
    }
    let annotating = annotate_tape();

    // Freeze dependencies before the solve, which may touch values in
    // place. Order is preserved, duplicates collapse onto the first mention.
    let mut deps: Vec<SolveDependency> = Vec::new();
    for parameter in parameters {
        // The solved-for state is never a control of its own solve.
        if parameter.key() == unknown.key() {
            continue;
        }
        push_dep(&mut deps, *parameter);
    }
    for bc in boundary_conditions {
        push_dep(&mut deps, *bc);
    }
    for key in backend.coefficients(residual) {
        if key != unknown.key() && !deps.iter().any(|d| d.key == key) {
            return Err(Error::UnregisteredCoefficient(key.0));
        }
    }

    let solution = {
        let _guard = stop_annotating();
        let mut values: BTreeMap<CoeffKey, Value> = deps
            .iter()
            .map(|d| (d.key, d.var.saved_output()))
            .collect();
        // The current value of the unknown seeds nonlinear iteration.
        values.insert(unknown.key(), Value::Field(unknown.data().clone()));
        let bound = backend.bind(residual, &values);
        let constraints = constraint_set(&deps)?;
        backend.solve_equation(&bound, unknown.key(), &constraints, options)?
    };
    unknown.assign_solution(solution);

    if annotating {
        let block = SolveBlock::new(
            Rc::clone(backend),
            residual.clone(),
            unknown.key(),
            deps,
            unknown.variable().clone(),
            options.clone(),
        );
        record_if_enabled(|tape| tape.add_block(Box::new(block)));
    }
    Ok(())
}

fn push_dep(deps: &mut Vec<SolveDependency>, coefficient: &dyn Coefficient) {
    let key = coefficient.key();
    if deps.iter().any(|d| d.key == key) {
        return;
    }
    deps.push(SolveDependency {
        var: coefficient.variable().clone(),
        key,
        kind: coefficient.kind(),
    });
}

fn constraint_set(deps: &[SolveDependency]) -> Result<Vec<DirichletConstraint>> {
    let mut constraints = Vec::new();
    for dep in deps {
        if dep.kind == ControlKind::Constraint {
            let checkpoint = dep.var.saved_output();
            let update = checkpoint.as_boundary()?;
            constraints.push(DirichletConstraint::new(
                update.dofs.clone(),
                update.values.clone(),
            ));
        }
    }
    Ok(constraints)
}
