//! Control kinds and their capability traits
//!
//! A control is a quantity a derivative can be taken with respect to. The
//! kind set is closed: scalar-valued, field-valued, and constraint-valued
//! (boundary data). Equation-solve blocks dispatch on the kind through the
//! `Coefficient` trait instead of inspecting concrete types.

use crate::error::Result;
use crate::tape::Variable;
use crate::value::Value;

/// Stable identity of a coefficient *handle* across re-solves.
///
/// A handle's variable changes every time a new value is produced for it
/// (each solve gives the unknown a fresh output variable), but residual
/// forms keep referring to the same coefficient. The key names the handle;
/// blocks capture the handle's variable at recording time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoeffKey(pub u64);

/// The closed set of control kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlKind {
    /// A single real parameter.
    Scalar,
    /// A vector of degrees of freedom.
    Field,
    /// Boundary data fixing a subset of degrees of freedom.
    Constraint,
}

/// Object-safe view of a handle that can parameterize a residual.
pub trait Coefficient {
    fn key(&self) -> CoeffKey;

    /// The variable currently bound to this handle.
    fn variable(&self) -> &Variable;

    fn kind(&self) -> ControlKind;
}

/// Full control capability: checkpointing, seeding, and conversion between
/// tape values and the control's external representation.
pub trait Control: Coefficient {
    /// External representation of values and derivatives for this control
    /// (`f64` for scalars, a vector for fields and boundary data).
    type Repr: Clone;

    /// Snapshot the current value as a tape checkpoint.
    fn create_checkpoint(&self) -> Value;

    /// Restore the handle's live value from a checkpoint.
    fn restore_at_checkpoint(&mut self, value: &Value) -> Result<()>;

    /// Convert an accumulated tape value into the external representation.
    fn convert(&self, value: Value) -> Result<Self::Repr>;

    /// Give the control a new value, marking its variable dirty so the next
    /// replay recomputes everything downstream.
    fn update(&mut self, value: Self::Repr) -> Result<()>;

    /// Seed the control's tangent slot with a perturbation direction.
    fn set_tangent(&self, direction: &Self::Repr);

    /// The accumulated first-order adjoint, converted. Zero when no
    /// sensitivity reached the control.
    fn derivative(&self) -> Result<Self::Repr> {
        let value = self
            .variable()
            .adj_value()
            .unwrap_or_else(|| self.create_checkpoint().zero_like());
        self.convert(value)
    }

    /// The accumulated second-order value, converted. Zero when no
    /// contribution reached the control.
    fn hessian(&self) -> Result<Self::Repr> {
        let value = self
            .variable()
            .hessian_value()
            .unwrap_or_else(|| self.create_checkpoint().zero_like());
        self.convert(value)
    }

    /// `value + step * direction` in the control's linear space; used by
    /// derivative-checking procedures.
    fn axpy(value: &Self::Repr, step: f64, direction: &Self::Repr) -> Self::Repr;

    /// Inner product in the control's linear space.
    fn inner(a: &Self::Repr, b: &Self::Repr) -> f64;
}
