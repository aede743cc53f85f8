//! Field operations and their blocks

use ndarray::Array1;

use super::Field;
use crate::control::Coefficient;
use crate::error::Result;
use crate::scalar::Scalar;
use crate::tape::{record_if_enabled, Block, Variable};
use crate::value::Value;

/// Inner product `⟨a, b⟩`, recorded as the usual objective-forming
/// operation on fields.
pub fn inner(a: &Field, b: &Field) -> Scalar {
    let out = Scalar::new(a.data().dot(b.data()));
    record_if_enabled(|tape| {
        tape.add_block(Box::new(InnerBlock {
            terms: [a.variable().clone(), b.variable().clone()],
            output: out.variable().clone(),
        }));
    });
    out
}

fn saved(var: &Variable) -> Result<Array1<f64>> {
    var.saved_output().as_field().cloned()
}

fn tlm_of(var: &Variable) -> Result<Option<Array1<f64>>> {
    var.tlm_value()
        .map(|v| v.as_field().cloned())
        .transpose()
}

struct InnerBlock {
    terms: [Variable; 2],
    output: Variable,
}

impl Block for InnerBlock {
    fn dependencies(&self) -> &[Variable] {
        &self.terms
    }

    fn output(&self) -> &Variable {
        &self.output
    }

    fn recompute(&self) -> Result<()> {
        let value = saved(&self.terms[0])?.dot(&saved(&self.terms[1])?);
        self.output.set_checkpoint(Value::Scalar(value));
        Ok(())
    }

    fn evaluate_adj(&self) -> Result<()> {
        let Some(seed) = self.output.adj_value() else {
            return Ok(());
        };
        let seed = seed.as_scalar()?;
        // ∂⟨a,b⟩/∂a = b, ∂⟨a,b⟩/∂b = a
        self.terms[0].add_adj_output(Value::Field(saved(&self.terms[1])? * seed))?;
        self.terms[1].add_adj_output(Value::Field(saved(&self.terms[0])? * seed))?;
        Ok(())
    }

    fn evaluate_tlm(&self) -> Result<()> {
        let da = tlm_of(&self.terms[0])?;
        let db = tlm_of(&self.terms[1])?;
        if da.is_none() && db.is_none() {
            return Ok(());
        }
        let a = saved(&self.terms[0])?;
        let b = saved(&self.terms[1])?;
        let mut total = 0.0;
        if let Some(da) = da {
            total += da.dot(&b);
        }
        if let Some(db) = db {
            total += a.dot(&db);
        }
        self.output.add_tlm_output(Value::Scalar(total))?;
        Ok(())
    }

    fn evaluate_hessian(&self) -> Result<()> {
        let adj = self.output.adj_value().map(|v| v.as_scalar()).transpose()?;
        let hessian = self
            .output
            .hessian_value()
            .map(|v| v.as_scalar())
            .transpose()?;
        if adj.is_none() && hessian.is_none() {
            return Ok(());
        }
        let lambda = adj.unwrap_or(0.0);
        let h = hessian.unwrap_or(0.0);
        let a = saved(&self.terms[0])?;
        let b = saved(&self.terms[1])?;
        let zero = Array1::zeros(a.len());
        let da = tlm_of(&self.terms[0])?.unwrap_or_else(|| zero.clone());
        let db = tlm_of(&self.terms[1])?.unwrap_or(zero);
        self.terms[0].add_hessian_output(Value::Field(&b * h + &db * lambda))?;
        self.terms[1].add_hessian_output(Value::Field(&a * h + &da * lambda))?;
        Ok(())
    }
}
