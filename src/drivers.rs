//! Gradient and Hessian drivers
//!
//! Entry points that seed a pass and run the working tape. These are the
//! only orchestration surface callers need.

use crate::control::{Coefficient, Control};
use crate::error::{Error, Result};
use crate::scalar::Scalar;
use crate::tape::{get_working_tape, stop_annotating};
use crate::value::Value;

/// Gradient of `functional` with respect to each control: reset the tape's
/// accumulators, seed the functional's adjoint with one, run the reverse
/// sweep, and convert each control's accumulated adjoint.
pub fn compute_gradient<C: Control>(functional: &Scalar, controls: &[&C]) -> Result<Vec<C::Repr>> {
    let tape = get_working_tape().ok_or(Error::NoWorkingTape)?;
    let tape = tape.borrow();
    tape.reset_variables();
    functional
        .variable()
        .set_initial_adj_input(Value::Scalar(1.0));
    let _guard = stop_annotating();
    tape.evaluate_adj(0)?;
    controls.iter().map(|c| c.derivative()).collect()
}

/// Hessian of a functional with respect to one control, applied to
/// directions one at a time (reverse-over-forward).
pub struct Hessian<'a, C: Control> {
    functional: &'a Scalar,
    control: &'a C,
}

impl<'a, C: Control> Hessian<'a, C> {
    pub fn new(functional: &'a Scalar, control: &'a C) -> Self {
        Hessian {
            functional,
            control,
        }
    }

    /// The Hessian applied to `direction`: adjoint sweep for the
    /// first-order multipliers, tangent-linear sweep along the direction,
    /// then the second-order reverse sweep seeded with a zero on the
    /// functional.
    pub fn action(&self, direction: &C::Repr) -> Result<C::Repr> {
        let tape = get_working_tape().ok_or(Error::NoWorkingTape)?;
        let tape = tape.borrow();
        let _guard = stop_annotating();

        tape.reset_variables();
        self.functional
            .variable()
            .set_initial_adj_input(Value::Scalar(1.0));
        tape.evaluate_adj(0)?;

        tape.reset_tlm_values();
        self.control.set_tangent(direction);
        tape.evaluate_tlm()?;

        self.functional
            .variable()
            .set_hessian_seed(Value::Scalar(0.0));
        tape.evaluate_hessian()?;

        self.control.hessian()
    }
}
