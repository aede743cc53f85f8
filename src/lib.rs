//! # Derivar: Tape-Based Sensitivity Propagation
//!
//! Derivar records a computation as a tape of differentiable blocks and
//! propagates sensitivities through it in three modes: adjoint (reverse),
//! tangent-linear (forward), and Hessian (second-order reverse-over-forward).
//! Recorded operations include opaque parameterized equation solves, which
//! are differentiated implicitly through a pluggable numerical backend.
//!
//! ## Architecture
//!
//! - **tape**: The recorded operation graph, working-tape scoping, and the
//!   propagation sweeps
//! - **scalar**: Scalar handles and the elementary operator blocks
//! - **field**: Field and boundary-data handles plus field operations
//! - **control**: The closed set of control kinds and their capabilities
//! - **solve**: Recorded equation solves, the backend contract, and the
//!   reference dense backend
//! - **drivers**: Gradient computation and Hessian actions
//! - **reduced**: Reduced functionals and the Taylor-remainder check

pub mod control;
pub mod drivers;
pub mod field;
pub mod reduced;
pub mod scalar;
pub mod solve;
pub mod tape;
pub mod value;

pub mod error;

// Re-export commonly used types
pub use control::{Coefficient, CoeffKey, Control, ControlKind};
pub use drivers::{compute_gradient, Hessian};
pub use error::{Error, Result};
pub use field::{inner, Boundary, Field};
pub use reduced::{taylor_test, ReducedFunctional};
pub use scalar::{add, mul, powf, sub, Scalar};
pub use solve::{
    solve, DenseBackend, DenseForm, DirichletConstraint, SolveBackend, SolveOptions,
};
pub use tape::{annotate_tape, get_working_tape, push_tape, stop_annotating, Block, Tape, Variable};
pub use value::{BoundaryUpdate, Value};
