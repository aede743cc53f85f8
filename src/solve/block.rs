//! Implicit differentiation of a recorded equation solve
//!
//! The block records R(u; m₁, m₂, …) = 0 and derives every sensitivity from
//! the implicit function theorem: with J = ∂R/∂u,
//!
//! - adjoint:        Jᵗ·λ = g, controls receive −(∂R/∂mᵢ)ᵗ·λ
//! - tangent-linear: J·u̇ = −Σᵢ (∂R/∂mᵢ)·ṗᵢ
//! - Hessian:        Jᵗ·μ = h − (∂²R/∂u²·u̇ + Σᵢ ∂²R/∂u∂mᵢ·ṗᵢ)ᵗ·λ,
//!                   controls receive −(∂²R/∂mᵢ∂·)ᵗ·λ − (∂R/∂mᵢ)ᵗ·μ
//!
//! Constraint rows are homogenized before each solve; the part of a seed
//! absorbed by those rows is handed to constraint-valued controls as a
//! boundary update instead of vanishing.

use std::collections::BTreeMap;
use std::rc::Rc;

use ndarray::Array1;

use super::backend::{
    Assembled, AssembleOptions, Direction, DirichletConstraint, SolveBackend, SolveOptions,
};
use crate::control::{CoeffKey, ControlKind};
use crate::error::{Error, Result};
use crate::tape::{Block, Variable};
use crate::value::{BoundaryUpdate, Value};

pub(crate) struct SolveDependency {
    pub(crate) var: Variable,
    pub(crate) key: CoeffKey,
    pub(crate) kind: ControlKind,
}

pub struct SolveBlock<B: SolveBackend> {
    backend: Rc<B>,
    residual: B::Form,
    unknown: CoeffKey,
    deps: Vec<SolveDependency>,
    dep_vars: Vec<Variable>,
    output: Variable,
    solve_options: SolveOptions,
    assemble_options: AssembleOptions,
}

impl<B: SolveBackend> SolveBlock<B> {
    pub(crate) fn new(
        backend: Rc<B>,
        residual: B::Form,
        unknown: CoeffKey,
        deps: Vec<SolveDependency>,
        output: Variable,
        solve_options: SolveOptions,
    ) -> Self {
        let dep_vars = deps.iter().map(|d| d.var.clone()).collect();
        SolveBlock {
            backend,
            residual,
            unknown,
            deps,
            dep_vars,
            output,
            solve_options,
            assemble_options: AssembleOptions::default(),
        }
    }

    /// Every coefficient bound to its checkpoint, the unknown to the
    /// output's checkpoint.
    fn checkpoint_values(&self) -> BTreeMap<CoeffKey, Value> {
        let mut values: BTreeMap<CoeffKey, Value> = self
            .deps
            .iter()
            .map(|d| (d.key, d.var.saved_output()))
            .collect();
        values.insert(self.unknown, self.output.saved_output());
        values
    }

    fn bound_residual(&self) -> B::Form {
        self.backend.bind(&self.residual, &self.checkpoint_values())
    }

    /// Constraints at their checkpointed values.
    fn constraint_set(&self) -> Result<Vec<DirichletConstraint>> {
        let mut constraints = Vec::new();
        for dep in &self.deps {
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

    /// Contract an assembled derivative with a dual vector: operators yield
    /// the transposed action, vectors an inner product.
    fn contract(&self, assembled: Assembled, dual: &Array1<f64>) -> Result<Value> {
        match assembled {
            Assembled::Matrix(m) => Ok(Value::Field(self.backend.transpose(m).dot(dual))),
            Assembled::Vector(v) => {
                if v.len() != dual.len() {
                    return Err(Error::ShapeMismatch {
                        expected: dual.len(),
                        got: v.len(),
                    });
                }
                Ok(Value::Scalar(v.dot(dual)))
            }
        }
    }

    /// The constrained-row share of a residual vector, in a control's
    /// boundary shape.
    fn restrict(&self, dep: &SolveDependency, vector: &Array1<f64>) -> Result<BoundaryUpdate> {
        let checkpoint = dep.var.saved_output();
        let update = checkpoint.as_boundary()?;
        let values: Array1<f64> = update.dofs.iter().map(|&dof| vector[dof]).collect();
        Ok(BoundaryUpdate::new(update.dofs.clone(), values))
    }

    /// Jacobian of the bound residual with respect to the unknown, kept in
    /// symbolic form for second derivatives.
    fn jacobian_form(&self, bound: &B::Form) -> Result<B::Form> {
        self.backend
            .differentiate(bound, self.unknown, &Direction::Trial)?
            .ok_or(Error::DegenerateResidual)
    }
}

fn negated(value: Value) -> Value {
    match value {
        Value::Scalar(s) => Value::Scalar(-s),
        Value::Field(f) => Value::Field(-f),
        Value::Boundary(b) => Value::Boundary(BoundaryUpdate::new(b.dofs, -b.values)),
    }
}

impl<B: SolveBackend> Block for SolveBlock<B> {
    fn dependencies(&self) -> &[Variable] {
        &self.dep_vars
    }

    fn output(&self) -> &Variable {
        &self.output
    }

    fn recompute(&self) -> Result<()> {
        let bound = self.bound_residual();
        let constraints = self.constraint_set()?;
        let solution =
            self.backend
                .solve_equation(&bound, self.unknown, &constraints, &self.solve_options)?;
        self.output.set_checkpoint(Value::Field(solution));
        Ok(())
    }

    fn evaluate_adj(&self) -> Result<()> {
        let Some(adj) = self.output.adj_value() else {
            return Ok(());
        };
        let seed = adj.as_field()?.clone();

        let bound = self.bound_residual();
        let constraints = self.constraint_set()?;
        let jacobian = self.jacobian_form(&bound)?;
        let j = self
            .backend
            .assemble(&jacobian, &self.assemble_options)?
            .into_matrix()?;
        let jt_free = self.backend.transpose(j);

        let mut jt = jt_free.clone();
        let mut rhs = seed.clone();
        self.backend
            .apply_constraints(Some(&mut jt), Some(&mut rhs), &constraints, true);
        let lambda = self
            .backend
            .solve_linear(&jt, &rhs, &self.solve_options)?;

        // The share of the seed absorbed by the constraint rows; only
        // boundary controls can claim it.
        let boundary_residual = &seed - &jt_free.dot(&lambda);

        for dep in &self.deps {
            match dep.kind {
                ControlKind::Constraint => {
                    let update = self.restrict(dep, &boundary_residual)?;
                    dep.var.add_adj_output(Value::Boundary(update))?;
                }
                ControlKind::Field => {
                    let Some(dfdm) =
                        self.backend
                            .differentiate(&bound, dep.key, &Direction::Trial)?
                    else {
                        continue;
                    };
                    let assembled = self.backend.assemble(&dfdm, &self.assemble_options)?;
                    let contribution = negated(self.contract(assembled, &lambda)?);
                    dep.var.add_adj_output(contribution)?;
                }
                ControlKind::Scalar => {
                    let Some(dfdm) =
                        self.backend
                            .differentiate(&bound, dep.key, &Direction::Trial)?
                    else {
                        continue;
                    };
                    let mut v = self
                        .backend
                        .assemble(&dfdm, &self.assemble_options)?
                        .into_vector()?;
                    // Constrained rows do not respond to the parameter.
                    self.backend
                        .apply_constraints(None, Some(&mut v), &constraints, true);
                    dep.var.add_adj_output(Value::Scalar(-v.dot(&lambda)))?;
                }
            }
        }
        Ok(())
    }

    fn evaluate_tlm(&self) -> Result<()> {
        let seeded: Vec<(&SolveDependency, Value)> = self
            .deps
            .iter()
            .filter_map(|d| d.var.tlm_value().map(|t| (d, t)))
            .collect();
        if seeded.is_empty() {
            return Ok(());
        }

        let bound = self.bound_residual();
        let constraints = self.constraint_set()?;
        let jacobian = self.jacobian_form(&bound)?;
        let mut j = self
            .backend
            .assemble(&jacobian, &self.assemble_options)?
            .into_matrix()?;
        self.backend
            .apply_constraints(Some(&mut j), None, &constraints, true);

        let mut rhs = Array1::zeros(j.nrows());
        for (dep, tangent) in &seeded {
            if dep.kind == ControlKind::Constraint {
                continue;
            }
            let Some(dfdm) =
                self.backend
                    .differentiate(&bound, dep.key, &Direction::Value(tangent))?
            else {
                continue;
            };
            let mut v = self
                .backend
                .assemble(&dfdm, &self.assemble_options)?
                .into_vector()?;
            // Constraints do not respond to unrelated perturbations.
            self.backend
                .apply_constraints(None, Some(&mut v), &constraints, true);
            rhs -= &v;
        }
        // A perturbed constraint drives its own rows directly.
        for (dep, tangent) in &seeded {
            if dep.kind != ControlKind::Constraint {
                continue;
            }
            let update = tangent.as_boundary()?;
            for (i, &dof) in update.dofs.iter().enumerate() {
                rhs[dof] = update.values[i];
            }
        }

        let udot = self.backend.solve_linear(&j, &rhs, &self.solve_options)?;
        self.output.add_tlm_output(Value::Field(udot))?;
        Ok(())
    }

    fn evaluate_hessian(&self) -> Result<()> {
        let Some(adj) = self.output.adj_value() else {
            return Ok(());
        };
        let Some(hessian_seed) = self.output.hessian_value() else {
            return Ok(());
        };
        let tlm_out = self.output.tlm_value();

        let bound = self.bound_residual();
        let constraints = self.constraint_set()?;
        let jacobian = self.jacobian_form(&bound)?;
        let j = self
            .backend
            .assemble(&jacobian, &self.assemble_options)?
            .into_matrix()?;
        let jt_free = self.backend.transpose(j);

        // First-order adjoint, re-solved from the accumulated seed.
        let mut jt = jt_free.clone();
        let mut g = adj.as_field()?.clone();
        self.backend
            .apply_constraints(Some(&mut jt), Some(&mut g), &constraints, true);
        let lambda = self.backend.solve_linear(&jt, &g, &self.solve_options)?;

        // Second-order right-hand side: the Hessian seed minus the
        // curvature of the residual along the tangent direction, acted on
        // the first-order adjoint.
        let mut b = hessian_seed.as_field()?.clone();
        let mut curvature = Vec::new();
        if let Some(udot) = &tlm_out {
            if let Some(form) =
                self.backend
                    .differentiate(&jacobian, self.unknown, &Direction::Value(udot))?
            {
                curvature.push(form);
            }
        }
        for dep in &self.deps {
            if dep.kind == ControlKind::Constraint {
                continue;
            }
            let Some(tangent) = dep.var.tlm_value() else {
                continue;
            };
            if let Some(form) =
                self.backend
                    .differentiate(&jacobian, dep.key, &Direction::Value(&tangent))?
            {
                curvature.push(form);
            }
        }
        for form in &curvature {
            let m = self
                .backend
                .assemble(form, &self.assemble_options)?
                .into_matrix()?;
            b -= &self.backend.transpose(m).dot(&lambda);
        }

        let b_copy = b.clone();
        let mut jt2 = jt_free.clone();
        self.backend
            .apply_constraints(Some(&mut jt2), Some(&mut b), &constraints, true);
        let mu = self.backend.solve_linear(&jt2, &b, &self.solve_options)?;

        let boundary_residual = &b_copy - &jt_free.dot(&mu);

        for dep in &self.deps {
            if dep.kind == ControlKind::Constraint {
                // Constraint controls have no second derivative; they only
                // claim their share of the second-order adjoint.
                let update = self.restrict(dep, &boundary_residual)?;
                dep.var.add_hessian_output(Value::Boundary(update))?;
                continue;
            }
            let Some(dfdm) = self
                .backend
                .differentiate(&bound, dep.key, &Direction::Trial)?
            else {
                continue;
            };

            // −∂R/∂mᵢ acted on the second-order adjoint.
            let assembled = self.backend.assemble(&dfdm, &self.assemble_options)?;
            let mut contribution = negated(self.contract(assembled, &mu)?);

            // −∂²R/∂mᵢ∂u·u̇ and −∂²R/∂mᵢ∂mⱼ·ṗⱼ acted on the first-order
            // adjoint; structurally absent terms are skipped.
            let mut second = Vec::new();
            if let Some(udot) = &tlm_out {
                if let Some(form) =
                    self.backend
                        .differentiate(&dfdm, self.unknown, &Direction::Value(udot))?
                {
                    second.push(form);
                }
            }
            for dep2 in &self.deps {
                if dep2.kind == ControlKind::Constraint {
                    continue;
                }
                let Some(tangent) = dep2.var.tlm_value() else {
                    continue;
                };
                if let Some(form) =
                    self.backend
                        .differentiate(&dfdm, dep2.key, &Direction::Value(&tangent))?
                {
                    second.push(form);
                }
            }
            for form in &second {
                let assembled = self.backend.assemble(form, &self.assemble_options)?;
                let piece = negated(self.contract(assembled, &lambda)?);
                contribution.accumulate(&piece)?;
            }

            dep.var.add_hessian_output(contribution)?;
        }
        Ok(())
    }
}
