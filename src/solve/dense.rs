//! Reference dense backend
//!
//! Residuals are term lists with just enough symbolic structure for first
//! and second derivatives: matrix actions on field coefficients, scalar
//! coefficients scaling fixed vectors, componentwise powers, and constant
//! sources. Linear solves use LU with partial pivoting; nonlinear residuals
//! are driven to zero by Newton iteration.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};

use super::backend::{
    Assembled, AssembleOptions, Direction, DirichletConstraint, SolveBackend, SolveOptions,
};
use crate::control::{Coefficient, CoeffKey};
use crate::error::{Error, Result};
use crate::value::Value;

#[derive(Clone)]
enum Term {
    /// `K · c` for a field coefficient.
    MatVec {
        matrix: Array2<f64>,
        coeff: CoeffKey,
    },
    /// `c · v` for a scalar coefficient.
    ScaledVec {
        vector: Array1<f64>,
        coeff: CoeffKey,
    },
    /// `scale · Φ ∘ c^e` componentwise, where `Φ` is the product of the
    /// collected direction factors. With `trial` set the term is the
    /// diagonal operator `diag(scale · Φ ∘ c^e)` instead of a vector.
    Pow {
        coeff: CoeffKey,
        exponent: u32,
        scale: f64,
        factors: Vec<Array1<f64>>,
        trial: bool,
    },
    /// A coefficient-free operator produced by differentiation.
    Operator(Array2<f64>),
    /// A coefficient-free vector: constant sources and contracted
    /// derivatives.
    Konst(Array1<f64>),
}

/// A residual form over named coefficients, with optionally bound values.
#[derive(Clone, Default)]
pub struct DenseForm {
    terms: Vec<Term>,
    values: BTreeMap<CoeffKey, Value>,
}

impl DenseForm {
    pub fn new() -> Self {
        DenseForm::default()
    }

    /// Add the term `matrix · coeff`.
    pub fn operator(mut self, matrix: Array2<f64>, coeff: &dyn Coefficient) -> Self {
        self.terms.push(Term::MatVec {
            matrix,
            coeff: coeff.key(),
        });
        self
    }

    /// Add the term `coeff · vector` for a scalar coefficient.
    pub fn scaled_source(mut self, vector: Array1<f64>, coeff: &dyn Coefficient) -> Self {
        self.terms.push(Term::ScaledVec {
            vector,
            coeff: coeff.key(),
        });
        self
    }

    /// Add the componentwise term `scale · coeff^exponent`.
    pub fn power(mut self, scale: f64, coeff: &dyn Coefficient, exponent: u32) -> Self {
        self.terms.push(Term::Pow {
            coeff: coeff.key(),
            exponent,
            scale,
            factors: Vec::new(),
            trial: false,
        });
        self
    }

    /// Add a constant source term.
    pub fn source(mut self, vector: Array1<f64>) -> Self {
        self.terms.push(Term::Konst(vector));
        self
    }

    fn bound_field(&self, coeff: CoeffKey) -> Result<&Array1<f64>> {
        self.values
            .get(&coeff)
            .ok_or(Error::UnboundCoefficient(coeff.0))?
            .as_field()
    }

    fn bound_scalar(&self, coeff: CoeffKey) -> Result<f64> {
        self.values
            .get(&coeff)
            .ok_or(Error::UnboundCoefficient(coeff.0))?
            .as_scalar()
    }

    /// Componentwise value of a power term: `scale · Φ ∘ c^e`. A zero
    /// exponent no longer references the coefficient, so no binding is
    /// required for it.
    fn pow_profile(
        &self,
        n: usize,
        coeff: CoeffKey,
        exponent: u32,
        scale: f64,
        factors: &[Array1<f64>],
    ) -> Result<Array1<f64>> {
        let mut profile = if exponent == 0 {
            Array1::from_elem(n, scale)
        } else {
            self.bound_field(coeff)?
                .mapv(|x| scale * x.powi(exponent as i32))
        };
        for factor in factors {
            if factor.len() != profile.len() {
                return Err(Error::ShapeMismatch {
                    expected: profile.len(),
                    got: factor.len(),
                });
            }
            profile = &profile * factor;
        }
        Ok(profile)
    }

    /// Structural row count, where one is determined by the terms.
    fn dimension(&self) -> Option<usize> {
        for term in &self.terms {
            match term {
                Term::MatVec { matrix, .. } | Term::Operator(matrix) => return Some(matrix.nrows()),
                Term::ScaledVec { vector, .. } | Term::Konst(vector) => return Some(vector.len()),
                Term::Pow {
                    coeff, factors, ..
                } => {
                    if let Some(f) = factors.first() {
                        return Some(f.len());
                    }
                    if let Some(Value::Field(v)) = self.values.get(coeff) {
                        return Some(v.len());
                    }
                }
            }
        }
        None
    }
}

/// The in-crate reference backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct DenseBackend;

impl DenseBackend {
    pub fn new() -> Self {
        DenseBackend
    }

    fn lu_solve(&self, matrix: &Array2<f64>, rhs: &Array1<f64>) -> Result<Array1<f64>> {
        let n = matrix.nrows();
        if matrix.ncols() != n {
            return Err(Error::ShapeMismatch {
                expected: n,
                got: matrix.ncols(),
            });
        }
        if rhs.len() != n {
            return Err(Error::ShapeMismatch {
                expected: n,
                got: rhs.len(),
            });
        }

        let mut a = matrix.clone();
        let mut x = rhs.clone();

        // Elimination with partial pivoting.
        for col in 0..n {
            let mut pivot_row = col;
            let mut pivot = a[[col, col]].abs();
            for row in col + 1..n {
                let candidate = a[[row, col]].abs();
                if candidate > pivot {
                    pivot = candidate;
                    pivot_row = row;
                }
            }
            if pivot < f64::EPSILON * f64::EPSILON {
                return Err(Error::SingularMatrix(col));
            }
            if pivot_row != col {
                for k in 0..n {
                    let tmp = a[[col, k]];
                    a[[col, k]] = a[[pivot_row, k]];
                    a[[pivot_row, k]] = tmp;
                }
                x.swap(col, pivot_row);
            }
            for row in col + 1..n {
                let factor = a[[row, col]] / a[[col, col]];
                if factor == 0.0 {
                    continue;
                }
                for k in col..n {
                    a[[row, k]] -= factor * a[[col, k]];
                }
                x[row] -= factor * x[col];
            }
        }

        // Back substitution.
        for row in (0..n).rev() {
            let mut sum = x[row];
            for k in row + 1..n {
                sum -= a[[row, k]] * x[k];
            }
            x[row] = sum / a[[row, row]];
        }
        Ok(x)
    }
}

impl SolveBackend for DenseBackend {
    type Form = DenseForm;

    fn coefficients(&self, form: &DenseForm) -> Vec<CoeffKey> {
        let mut keys = Vec::new();
        for term in &form.terms {
            let key = match term {
                Term::MatVec { coeff, .. }
                | Term::ScaledVec { coeff, .. }
                | Term::Pow { coeff, .. } => Some(*coeff),
                Term::Operator(_) | Term::Konst(_) => None,
            };
            if let Some(key) = key {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    fn bind(&self, form: &DenseForm, values: &BTreeMap<CoeffKey, Value>) -> DenseForm {
        DenseForm {
            terms: form.terms.clone(),
            values: values.clone(),
        }
    }

    fn differentiate(
        &self,
        form: &DenseForm,
        wrt: CoeffKey,
        direction: &Direction<'_>,
    ) -> Result<Option<DenseForm>> {
        let mut terms = Vec::new();
        for term in &form.terms {
            match term {
                Term::MatVec { matrix, coeff } if *coeff == wrt => match direction {
                    Direction::Trial => terms.push(Term::Operator(matrix.clone())),
                    Direction::Value(Value::Field(v)) => terms.push(Term::Konst(matrix.dot(v))),
                    Direction::Value(other) => {
                        return Err(Error::KindMismatch {
                            expected: "field",
                            got: other.kind(),
                        })
                    }
                },
                Term::ScaledVec { vector, coeff } if *coeff == wrt => match direction {
                    Direction::Trial => terms.push(Term::Konst(vector.clone())),
                    Direction::Value(Value::Scalar(s)) => terms.push(Term::Konst(vector * *s)),
                    Direction::Value(other) => {
                        return Err(Error::KindMismatch {
                            expected: "scalar",
                            got: other.kind(),
                        })
                    }
                },
                Term::Pow {
                    coeff,
                    exponent,
                    scale,
                    factors,
                    trial,
                } if *coeff == wrt && *exponent > 0 => {
                    let scale = scale * f64::from(*exponent);
                    let exponent = exponent - 1;
                    match direction {
                        Direction::Trial => {
                            if *trial {
                                return Err(Error::KindMismatch {
                                    expected: "value direction",
                                    got: "trial",
                                });
                            }
                            terms.push(Term::Pow {
                                coeff: *coeff,
                                exponent,
                                scale,
                                factors: factors.clone(),
                                trial: true,
                            });
                        }
                        Direction::Value(Value::Field(v)) => {
                            let mut factors = factors.clone();
                            factors.push(v.clone());
                            terms.push(Term::Pow {
                                coeff: *coeff,
                                exponent,
                                scale,
                                factors,
                                trial: *trial,
                            });
                        }
                        Direction::Value(other) => {
                            return Err(Error::KindMismatch {
                                expected: "field",
                                got: other.kind(),
                            })
                        }
                    }
                }
                _ => {}
            }
        }
        if terms.is_empty() {
            return Ok(None);
        }
        Ok(Some(DenseForm {
            terms,
            values: form.values.clone(),
        }))
    }

    fn assemble(&self, form: &DenseForm, _options: &AssembleOptions) -> Result<Assembled> {
        let rank2 = form
            .terms
            .iter()
            .any(|t| matches!(t, Term::Operator(_) | Term::Pow { trial: true, .. }));
        let rank1 = form
            .terms
            .iter()
            .any(|t| !matches!(t, Term::Operator(_) | Term::Pow { trial: true, .. }));
        if rank2 && rank1 {
            return Err(Error::ShapeMismatch { expected: 2, got: 1 });
        }
        let n = form.dimension().ok_or(Error::DegenerateResidual)?;

        if rank2 {
            let mut out = Array2::zeros((n, n));
            for term in &form.terms {
                match term {
                    Term::Operator(matrix) => {
                        if matrix.nrows() != n || matrix.ncols() != n {
                            return Err(Error::ShapeMismatch {
                                expected: n,
                                got: matrix.nrows(),
                            });
                        }
                        out += matrix;
                    }
                    Term::Pow {
                        coeff,
                        exponent,
                        scale,
                        factors,
                        trial: true,
                    } => {
                        let profile = form.pow_profile(n, *coeff, *exponent, *scale, factors)?;
                        for (i, p) in profile.iter().enumerate() {
                            out[[i, i]] += p;
                        }
                    }
                    _ => unreachable!("mixed-rank form rejected above"),
                }
            }
            return Ok(Assembled::Matrix(out));
        }

        let mut out = Array1::zeros(n);
        for term in &form.terms {
            let contribution = match term {
                Term::MatVec { matrix, coeff } => matrix.dot(form.bound_field(*coeff)?),
                Term::ScaledVec { vector, coeff } => vector * form.bound_scalar(*coeff)?,
                Term::Pow {
                    coeff,
                    exponent,
                    scale,
                    factors,
                    trial: false,
                } => form.pow_profile(n, *coeff, *exponent, *scale, factors)?,
                Term::Konst(vector) => vector.clone(),
                _ => unreachable!("mixed-rank form rejected above"),
            };
            if contribution.len() != n {
                return Err(Error::ShapeMismatch {
                    expected: n,
                    got: contribution.len(),
                });
            }
            out += &contribution;
        }
        Ok(Assembled::Vector(out))
    }

    fn apply_constraints(
        &self,
        matrix: Option<&mut Array2<f64>>,
        vector: Option<&mut Array1<f64>>,
        constraints: &[DirichletConstraint],
        homogenize: bool,
    ) {
        if let Some(matrix) = matrix {
            for constraint in constraints {
                for &dof in &constraint.dofs {
                    for k in 0..matrix.ncols() {
                        matrix[[dof, k]] = 0.0;
                    }
                    matrix[[dof, dof]] = 1.0;
                }
            }
        }
        if let Some(vector) = vector {
            for constraint in constraints {
                for (i, &dof) in constraint.dofs.iter().enumerate() {
                    vector[dof] = if homogenize { 0.0 } else { constraint.values[i] };
                }
            }
        }
    }

    fn transpose(&self, matrix: Array2<f64>) -> Array2<f64> {
        matrix.reversed_axes()
    }

    fn solve_linear(
        &self,
        matrix: &Array2<f64>,
        rhs: &Array1<f64>,
        _options: &SolveOptions,
    ) -> Result<Array1<f64>> {
        self.lu_solve(matrix, rhs)
    }

    fn solve_equation(
        &self,
        form: &DenseForm,
        unknown: CoeffKey,
        constraints: &[DirichletConstraint],
        options: &SolveOptions,
    ) -> Result<Array1<f64>> {
        let assemble_options = AssembleOptions::default();
        let n = form.dimension().ok_or(Error::DegenerateResidual)?;

        if self.is_linear_in(form, unknown) {
            // J·u = −R(0): assemble the operator and the residual with the
            // unknown zeroed, then fix the constraint rows to their values.
            let dfdu = self
                .differentiate(form, unknown, &Direction::Trial)?
                .ok_or(Error::DegenerateResidual)?;
            let mut values = form.values.clone();
            values.insert(unknown, Value::Field(Array1::zeros(n)));
            let at_zero = self.bind(form, &values);
            let mut matrix = self.assemble(&dfdu, &assemble_options)?.into_matrix()?;
            let mut rhs = -self.assemble(&at_zero, &assemble_options)?.into_vector()?;
            self.apply_constraints(Some(&mut matrix), Some(&mut rhs), constraints, false);
            return self.solve_linear(&matrix, &rhs, options);
        }

        // Newton iteration from the bound value of the unknown (or zero),
        // made consistent with the constraints first.
        let mut u = match form.values.get(&unknown) {
            Some(value) => value.as_field()?.clone(),
            None => Array1::zeros(n),
        };
        for constraint in constraints {
            for (i, &dof) in constraint.dofs.iter().enumerate() {
                u[dof] = constraint.values[i];
            }
        }

        let mut values = form.values.clone();
        let mut norm0 = 0.0;
        let mut norm = f64::INFINITY;
        for iteration in 0..options.max_iterations {
            values.insert(unknown, Value::Field(u.clone()));
            let bound = self.bind(form, &values);
            let mut residual = self.assemble(&bound, &assemble_options)?.into_vector()?;
            self.apply_constraints(None, Some(&mut residual), constraints, true);
            norm = residual.dot(&residual).sqrt();
            if iteration == 0 {
                norm0 = norm.max(f64::MIN_POSITIVE);
            }
            if norm <= options.atol + options.rtol * norm0 {
                return Ok(u);
            }
            let jacobian = self
                .differentiate(&bound, unknown, &Direction::Trial)?
                .ok_or(Error::DegenerateResidual)?;
            let mut matrix = self.assemble(&jacobian, &assemble_options)?.into_matrix()?;
            let mut rhs = -residual;
            self.apply_constraints(Some(&mut matrix), Some(&mut rhs), constraints, true);
            let delta = self.solve_linear(&matrix, &rhs, options)?;
            u += &delta;
        }
        Err(Error::NonConvergence {
            iterations: options.max_iterations,
            residual: norm,
        })
    }

    fn is_linear_in(&self, form: &DenseForm, coeff: CoeffKey) -> bool {
        !form.terms.iter().any(|t| {
            matches!(t, Term::Pow { coeff: c, exponent, .. } if *c == coeff && *exponent >= 2)
        })
    }
}
