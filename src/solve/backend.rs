//! Capability contract for the numerical backend
//!
//! The equation-solve machinery never assembles, differentiates, or solves
//! anything itself; it drives a backend through this trait. A reference
//! dense implementation lives in [`super::dense`].

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::control::CoeffKey;
use crate::error::Result;
use crate::value::Value;

/// Direction of a symbolic derivative.
pub enum Direction<'a> {
    /// Keep the derivative as an operator; assembling it yields a matrix
    /// (or a vector for scalar coefficients).
    Trial,
    /// Contract the derivative with a concrete perturbation.
    Value(&'a Value),
}

/// Result of assembling a symbolic form.
pub enum Assembled {
    Matrix(Array2<f64>),
    Vector(Array1<f64>),
}

impl Assembled {
    pub fn into_matrix(self) -> Result<Array2<f64>> {
        match self {
            Assembled::Matrix(m) => Ok(m),
            Assembled::Vector(_) => Err(crate::error::Error::ShapeMismatch {
                expected: 2,
                got: 1,
            }),
        }
    }

    pub fn into_vector(self) -> Result<Array1<f64>> {
        match self {
            Assembled::Vector(v) => Ok(v),
            Assembled::Matrix(_) => Err(crate::error::Error::ShapeMismatch {
                expected: 1,
                got: 2,
            }),
        }
    }
}

/// A Dirichlet-style constraint: the listed rows are fixed to the listed
/// values, removing those degrees of freedom from the solve.
#[derive(Clone, Debug, PartialEq)]
pub struct DirichletConstraint {
    pub dofs: Vec<usize>,
    pub values: Array1<f64>,
}

impl DirichletConstraint {
    pub fn new(dofs: Vec<usize>, values: Array1<f64>) -> Self {
        debug_assert_eq!(dofs.len(), values.len());
        DirichletConstraint { dofs, values }
    }
}

/// Linear and nonlinear solve configuration. Recorded with the block so
/// replay re-solves with the original settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolveOptions {
    /// Relative residual tolerance for nonlinear iteration.
    pub rtol: f64,
    /// Absolute residual tolerance for nonlinear iteration.
    pub atol: f64,
    /// Newton iteration cap.
    pub max_iterations: usize,
    /// Adaptive error-controlled stepping. Incompatible with recording: the
    /// replayed operation count would not be deterministic.
    pub error_control: bool,
}

impl Default for SolveOptions {
    fn default() -> Self {
        SolveOptions {
            rtol: 1e-10,
            atol: 1e-12,
            max_iterations: 50,
            error_control: false,
        }
    }
}

impl SolveOptions {
    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

/// Backend-specific assembly hints, passed through opaquely.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AssembleOptions {
    pub hints: BTreeMap<String, String>,
}

/// What the external numerical backend must provide.
///
/// `Form` is the backend's symbolic residual representation; the core only
/// ever clones it, differentiates it, binds coefficient values into it, and
/// assembles it.
pub trait SolveBackend {
    type Form: Clone;

    /// Coefficient keys the form refers to.
    fn coefficients(&self, form: &Self::Form) -> Vec<CoeffKey>;

    /// Substitute concrete coefficient values into the form. Derivative and
    /// assembly results are evaluated at these values.
    fn bind(&self, form: &Self::Form, values: &BTreeMap<CoeffKey, Value>) -> Self::Form;

    /// Symbolic derivative of `form` with respect to `wrt` in the given
    /// direction. `Ok(None)` means the form has no structural dependence on
    /// `wrt`; callers skip that term rather than fail.
    fn differentiate(
        &self,
        form: &Self::Form,
        wrt: CoeffKey,
        direction: &Direction<'_>,
    ) -> Result<Option<Self::Form>>;

    /// Evaluate the (bound) form into a concrete matrix or vector.
    fn assemble(&self, form: &Self::Form, options: &AssembleOptions) -> Result<Assembled>;

    /// Fix constraint rows in place: matrix rows become identity rows, and
    /// vector entries become the constraint values, or zero when
    /// homogenized.
    fn apply_constraints(
        &self,
        matrix: Option<&mut Array2<f64>>,
        vector: Option<&mut Array1<f64>>,
        constraints: &[DirichletConstraint],
        homogenize: bool,
    );

    /// Swap the domain and codomain roles of an assembled operator.
    fn transpose(&self, matrix: Array2<f64>) -> Array2<f64>;

    /// Direct solve of an assembled linear system.
    fn solve_linear(
        &self,
        matrix: &Array2<f64>,
        rhs: &Array1<f64>,
        options: &SolveOptions,
    ) -> Result<Array1<f64>>;

    /// Solve the residual equation for `unknown`, honoring the constraints:
    /// directly when the form is linear in the unknown, by Newton iteration
    /// otherwise. The bound value of `unknown`, if any, seeds the iteration.
    fn solve_equation(
        &self,
        form: &Self::Form,
        unknown: CoeffKey,
        constraints: &[DirichletConstraint],
        options: &SolveOptions,
    ) -> Result<Array1<f64>>;

    /// Whether the form depends at most linearly on `coeff`.
    fn is_linear_in(&self, form: &Self::Form, coeff: CoeffKey) -> bool;
}
