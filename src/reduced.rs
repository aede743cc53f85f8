//! Reduced functionals and the Taylor-remainder gradient check

use crate::control::Control;
use crate::drivers::compute_gradient;
use crate::error::{Error, Result};
use crate::scalar::Scalar;
use crate::tape::{get_working_tape, stop_annotating};

/// The recorded tape viewed as a function of one control.
///
/// Evaluation updates the control's checkpoint and replays the tape, so the
/// functional is recomputed consistently with the new value without
/// re-recording anything.
pub struct ReducedFunctional<C: Control> {
    functional: Scalar,
    control: C,
}

impl<C: Control + Clone> ReducedFunctional<C> {
    pub fn new(functional: &Scalar, control: &C) -> Self {
        ReducedFunctional {
            functional: functional.clone(),
            control: control.clone(),
        }
    }

    /// Evaluate the functional at a new control value via checkpointed
    /// replay.
    pub fn eval(&mut self, value: C::Repr) -> Result<f64> {
        let tape = get_working_tape().ok_or(Error::NoWorkingTape)?;
        let tape = tape.borrow();
        self.control.update(value)?;
        let _guard = stop_annotating();
        tape.evaluate(0)?;
        self.functional.saved_value()
    }

    /// Gradient at the control value of the last evaluation.
    pub fn derivative(&self) -> Result<C::Repr> {
        let mut gradients = compute_gradient(&self.functional, &[&self.control])?;
        Ok(gradients.remove(0))
    }
}

/// First-order Taylor-remainder convergence check.
///
/// Evaluates `rf` at `value` and at perturbations along `direction`,
/// subtracts the predicted first-order change, and measures how fast the
/// remainder shrinks as the step halves. A consistent gradient gives a rate
/// of about two.
pub fn taylor_test<C: Control + Clone>(
    rf: &mut ReducedFunctional<C>,
    value: &C::Repr,
    direction: &C::Repr,
) -> Result<f64> {
    let j0 = rf.eval(value.clone())?;
    let gradient = rf.derivative()?;
    let slope = C::inner(&gradient, direction);

    let mut residuals = Vec::new();
    let mut step = 0.01;
    for _ in 0..4 {
        let j = rf.eval(C::axpy(value, step, direction))?;
        residuals.push((j - j0 - step * slope).abs());
        step /= 2.0;
    }
    rf.eval(value.clone())?;

    // A vanishing remainder means the functional is linear along the
    // direction; any rate is consistent then.
    if residuals.iter().all(|r| *r < 1e-12) {
        return Ok(2.0);
    }

    let mut min_rate = f64::INFINITY;
    for pair in residuals.windows(2) {
        min_rate = min_rate.min((pair[0] / pair[1]).log2());
    }
    Ok(min_rate)
}
