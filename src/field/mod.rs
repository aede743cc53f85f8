//! Field and boundary-data handles

mod ops;


pub use ops::inner;

use ndarray::Array1;

use crate::control::{Coefficient, CoeffKey, Control, ControlKind};
use crate::error::{Error, Result};
use crate::tape::Variable;
use crate::value::{BoundaryUpdate, Value};

/// A vector of degrees of freedom participating in recording.
#[derive(Clone)]
pub struct Field {
    data: Array1<f64>,
    key: CoeffKey,
    var: Variable,
}

impl Field {
    pub fn new(data: Array1<f64>) -> Self {
        let var = Variable::new(Value::Field(data.clone()));
        Field {
            data,
            key: CoeffKey(var.id()),
            var,
        }
    }

    pub fn zeros(len: usize) -> Self {
        Field::new(Array1::zeros(len))
    }

    pub fn from_vec(data: Vec<f64>) -> Self {
        Field::new(Array1::from(data))
    }

    pub fn data(&self) -> &Array1<f64> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The checkpointed value, which tracks replay rather than the live
    /// value.
    pub fn saved_data(&self) -> Result<Array1<f64>> {
        self.var.saved_output().as_field().cloned()
    }

    /// Install a freshly solved value: the handle gets a new variable owned
    /// by the producing block, leaving earlier recordings pointing at the
    /// old one.
    pub(crate) fn assign_solution(&mut self, solution: Array1<f64>) {
        self.var = Variable::new(Value::Field(solution.clone()));
        self.data = solution;
    }
}

impl Coefficient for Field {
    fn key(&self) -> CoeffKey {
        self.key
    }

    fn variable(&self) -> &Variable {
        &self.var
    }

    fn kind(&self) -> ControlKind {
        ControlKind::Field
    }
}

impl Control for Field {
    type Repr = Array1<f64>;

    fn create_checkpoint(&self) -> Value {
        Value::Field(self.data.clone())
    }

    fn restore_at_checkpoint(&mut self, value: &Value) -> Result<()> {
        self.data = value.as_field()?.clone();
        Ok(())
    }

    fn convert(&self, value: Value) -> Result<Array1<f64>> {
        value.as_field().cloned()
    }

    fn update(&mut self, value: Array1<f64>) -> Result<()> {
        if value.len() != self.data.len() {
            return Err(Error::ShapeMismatch {
                expected: self.data.len(),
                got: value.len(),
            });
        }
        self.var.update_checkpoint(Value::Field(value.clone()));
        self.data = value;
        Ok(())
    }

    fn set_tangent(&self, direction: &Array1<f64>) {
        self.var.set_initial_tlm_input(Value::Field(direction.clone()));
    }

    fn axpy(value: &Array1<f64>, step: f64, direction: &Array1<f64>) -> Array1<f64> {
        value + &(direction * step)
    }

    fn inner(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
        a.dot(b)
    }
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("data", &self.data)
            .field("id", &self.var.id())
            .finish()
    }
}

/// Boundary data fixing a subset of degrees of freedom.
///
/// Used both as a plain boundary condition and as a constraint-valued
/// control; the external representation is the vector of values on the
/// constrained rows.
#[derive(Clone)]
pub struct Boundary {
    dofs: Vec<usize>,
    values: Array1<f64>,
    key: CoeffKey,
    var: Variable,
}

impl Boundary {
    pub fn new(dofs: Vec<usize>, values: Array1<f64>) -> Self {
        debug_assert_eq!(dofs.len(), values.len());
        let var = Variable::new(Value::Boundary(BoundaryUpdate::new(
            dofs.clone(),
            values.clone(),
        )));
        Boundary {
            dofs,
            values,
            key: CoeffKey(var.id()),
            var,
        }
    }

    /// Fix the listed degrees of freedom to one common value.
    pub fn uniform(dofs: Vec<usize>, value: f64) -> Self {
        let values = Array1::from_elem(dofs.len(), value);
        Boundary::new(dofs, values)
    }

    pub fn dofs(&self) -> &[usize] {
        &self.dofs
    }

    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }
}

impl Coefficient for Boundary {
    fn key(&self) -> CoeffKey {
        self.key
    }

    fn variable(&self) -> &Variable {
        &self.var
    }

    fn kind(&self) -> ControlKind {
        ControlKind::Constraint
    }
}

impl Control for Boundary {
    type Repr = Array1<f64>;

    fn create_checkpoint(&self) -> Value {
        Value::Boundary(BoundaryUpdate::new(self.dofs.clone(), self.values.clone()))
    }

    fn restore_at_checkpoint(&mut self, value: &Value) -> Result<()> {
        let update = value.as_boundary()?;
        if update.dofs != self.dofs {
            return Err(Error::ShapeMismatch {
                expected: self.dofs.len(),
                got: update.dofs.len(),
            });
        }
        self.values = update.values.clone();
        Ok(())
    }

    fn convert(&self, value: Value) -> Result<Array1<f64>> {
        let update = value.as_boundary()?;
        if update.dofs != self.dofs {
            return Err(Error::ShapeMismatch {
                expected: self.dofs.len(),
                got: update.dofs.len(),
            });
        }
        Ok(update.values.clone())
    }

    fn update(&mut self, value: Array1<f64>) -> Result<()> {
        if value.len() != self.dofs.len() {
            return Err(Error::ShapeMismatch {
                expected: self.dofs.len(),
                got: value.len(),
            });
        }
        self.var.update_checkpoint(Value::Boundary(BoundaryUpdate::new(
            self.dofs.clone(),
            value.clone(),
        )));
        self.values = value;
        Ok(())
    }

    fn set_tangent(&self, direction: &Array1<f64>) {
        self.var
            .set_initial_tlm_input(Value::Boundary(BoundaryUpdate::new(
                self.dofs.clone(),
                direction.clone(),
            )));
    }

    fn axpy(value: &Array1<f64>, step: f64, direction: &Array1<f64>) -> Array1<f64> {
        value + &(direction * step)
    }

    fn inner(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
        a.dot(b)
    }
}

impl std::fmt::Debug for Boundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Boundary")
            .field("dofs", &self.dofs)
            .field("values", &self.values)
            .field("id", &self.var.id())
            .finish()
    }
}
