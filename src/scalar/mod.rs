//! Scalar values with recording support

mod ops;


pub use ops::{add, mul, powf, sub};

use crate::control::{Coefficient, CoeffKey, Control, ControlKind};
use crate::error::Result;
use crate::tape::Variable;
use crate::value::Value;

/// A scalar participating in recording.
///
/// Every operation on scalars produces a new handle with a fresh variable;
/// the originals are untouched. A scalar used as a control keeps its key
/// stable across recordings.
#[derive(Clone)]
pub struct Scalar {
    value: f64,
    key: CoeffKey,
    var: Variable,
}

impl Scalar {
    pub fn new(value: f64) -> Self {
        let var = Variable::new(Value::Scalar(value));
        Scalar {
            value,
            key: CoeffKey(var.id()),
            var,
        }
    }

    /// The live value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// The checkpointed value, which tracks replay rather than the live
    /// value.
    pub fn saved_value(&self) -> Result<f64> {
        self.var.saved_output().as_scalar()
    }
}

impl Coefficient for Scalar {
    fn key(&self) -> CoeffKey {
        self.key
    }

    fn variable(&self) -> &Variable {
        &self.var
    }

    fn kind(&self) -> ControlKind {
        ControlKind::Scalar
    }
}

impl Control for Scalar {
    type Repr = f64;

    fn create_checkpoint(&self) -> Value {
        Value::Scalar(self.value)
    }

    fn restore_at_checkpoint(&mut self, value: &Value) -> Result<()> {
        self.value = value.as_scalar()?;
        Ok(())
    }

    fn convert(&self, value: Value) -> Result<f64> {
        value.as_scalar()
    }

    fn update(&mut self, value: f64) -> Result<()> {
        self.value = value;
        self.var.update_checkpoint(Value::Scalar(value));
        Ok(())
    }

    fn set_tangent(&self, direction: &f64) {
        self.var.set_initial_tlm_input(Value::Scalar(*direction));
    }

    fn axpy(value: &f64, step: f64, direction: &f64) -> f64 {
        value + step * direction
    }

    fn inner(a: &f64, b: &f64) -> f64 {
        a * b
    }
}

impl std::fmt::Debug for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scalar")
            .field("value", &self.value)
            .field("id", &self.var.id())
            .finish()
    }
}
