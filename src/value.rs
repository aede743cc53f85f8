//! Typed values carried by tape variables
//!
//! Sensitivity accumulators hold an `Option<Value>`: `None` means "no
//! sensitivity has reached this variable", and accumulation is only defined
//! between present values of the same kind.

use ndarray::Array1;

use crate::error::{Error, Result};

/// Values on the constrained rows of a boundary condition, keyed by degree
/// of freedom. The adjoint of a boundary control is delivered in this shape
/// rather than as a plain vector: it only has meaning on the constrained
/// subset.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundaryUpdate {
    /// Constrained degrees of freedom, in the order the owning condition
    /// lists them.
    pub dofs: Vec<usize>,
    /// One value per entry of `dofs`.
    pub values: Array1<f64>,
}

impl BoundaryUpdate {
    pub fn new(dofs: Vec<usize>, values: Array1<f64>) -> Self {
        debug_assert_eq!(dofs.len(), values.len());
        BoundaryUpdate { dofs, values }
    }

    pub fn len(&self) -> usize {
        self.dofs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dofs.is_empty()
    }
}

/// One value produced or consumed during a recorded computation.
///
/// The closed kind set mirrors the control kinds: plain scalars, field
/// vectors, and boundary (constraint) data.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Scalar(f64),
    Field(Array1<f64>),
    Boundary(BoundaryUpdate),
}

impl Value {
    /// Human-readable kind name, used in mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Field(_) => "field",
            Value::Boundary(_) => "boundary",
        }
    }

    /// The additive identity of the same kind and shape.
    pub fn zero_like(&self) -> Value {
        match self {
            Value::Scalar(_) => Value::Scalar(0.0),
            Value::Field(f) => Value::Field(Array1::zeros(f.len())),
            Value::Boundary(b) => Value::Boundary(BoundaryUpdate::new(
                b.dofs.clone(),
                Array1::zeros(b.values.len()),
            )),
        }
    }

    /// Add `other` into `self`. Defined only for matching kinds and shapes.
    pub fn accumulate(&mut self, other: &Value) -> Result<()> {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => {
                *a += b;
                Ok(())
            }
            (Value::Field(a), Value::Field(b)) => {
                if a.len() != b.len() {
                    return Err(Error::ShapeMismatch {
                        expected: a.len(),
                        got: b.len(),
                    });
                }
                *a += b;
                Ok(())
            }
            (Value::Boundary(a), Value::Boundary(b)) => {
                if a.dofs != b.dofs {
                    return Err(Error::ShapeMismatch {
                        expected: a.dofs.len(),
                        got: b.dofs.len(),
                    });
                }
                a.values += &b.values;
                Ok(())
            }
            (a, b) => Err(Error::KindMismatch {
                expected: a.kind(),
                got: b.kind(),
            }),
        }
    }

    pub fn as_scalar(&self) -> Result<f64> {
        match self {
            Value::Scalar(v) => Ok(*v),
            other => Err(Error::KindMismatch {
                expected: "scalar",
                got: other.kind(),
            }),
        }
    }

    pub fn as_field(&self) -> Result<&Array1<f64>> {
        match self {
            Value::Field(v) => Ok(v),
            other => Err(Error::KindMismatch {
                expected: "field",
                got: other.kind(),
            }),
        }
    }

    pub fn as_boundary(&self) -> Result<&BoundaryUpdate> {
        match self {
            Value::Boundary(v) => Ok(v),
            other => Err(Error::KindMismatch {
                expected: "boundary",
                got: other.kind(),
            }),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Scalar(v)
    }
}

impl From<Array1<f64>> for Value {
    fn from(v: Array1<f64>) -> Self {
        Value::Field(v)
    }
}
