//! Elementary scalar operations and their blocks
//!
//! Each operation computes its result unconditionally and records a block
//! only while annotation is active, so user code runs identically with and
//! without a working tape.

use super::Scalar;
use crate::control::Coefficient;
use crate::error::Result;
use crate::tape::{record_if_enabled, Block, Variable};
use crate::value::Value;

/// `a + b`
pub fn add(a: &Scalar, b: &Scalar) -> Scalar {
    let out = Scalar::new(a.value() + b.value());
    record_if_enabled(|tape| {
        tape.add_block(Box::new(AddBlock {
            terms: [a.variable().clone(), b.variable().clone()],
            output: out.variable().clone(),
        }));
    });
    out
}

/// `a - b`
pub fn sub(a: &Scalar, b: &Scalar) -> Scalar {
    let out = Scalar::new(a.value() - b.value());
    record_if_enabled(|tape| {
        tape.add_block(Box::new(SubBlock {
            terms: [a.variable().clone(), b.variable().clone()],
            output: out.variable().clone(),
        }));
    });
    out
}

/// `a * b`
pub fn mul(a: &Scalar, b: &Scalar) -> Scalar {
    let out = Scalar::new(a.value() * b.value());
    record_if_enabled(|tape| {
        tape.add_block(Box::new(MulBlock {
            terms: [a.variable().clone(), b.variable().clone()],
            output: out.variable().clone(),
        }));
    });
    out
}

/// `base ^ exponent`
pub fn powf(base: &Scalar, exponent: &Scalar) -> Scalar {
    let out = Scalar::new(base.value().powf(exponent.value()));
    record_if_enabled(|tape| {
        tape.add_block(Box::new(PowBlock {
            terms: [base.variable().clone(), exponent.variable().clone()],
            output: out.variable().clone(),
        }));
    });
    out
}

fn saved(var: &Variable) -> Result<f64> {
    var.saved_output().as_scalar()
}

fn adj_of(var: &Variable) -> Result<Option<f64>> {
    var.adj_value().map(|v| v.as_scalar()).transpose()
}

fn tlm_of(var: &Variable) -> Result<Option<f64>> {
    var.tlm_value().map(|v| v.as_scalar()).transpose()
}

fn hessian_of(var: &Variable) -> Result<Option<f64>> {
    var.hessian_value().map(|v| v.as_scalar()).transpose()
}

struct AddBlock {
    // Terms are kept in position even when both refer to the same variable;
    // multiplicity matters for evaluation.
    terms: [Variable; 2],
    output: Variable,
}

impl Block for AddBlock {
    fn dependencies(&self) -> &[Variable] {
        &self.terms
    }

    fn output(&self) -> &Variable {
        &self.output
    }

    fn recompute(&self) -> Result<()> {
        let value = saved(&self.terms[0])? + saved(&self.terms[1])?;
        self.output.set_checkpoint(Value::Scalar(value));
        Ok(())
    }

    fn evaluate_adj(&self) -> Result<()> {
        let Some(seed) = adj_of(&self.output)? else {
            return Ok(());
        };
        for term in &self.terms {
            term.add_adj_output(Value::Scalar(seed))?;
        }
        Ok(())
    }

    fn evaluate_tlm(&self) -> Result<()> {
        let mut total = 0.0;
        let mut any = false;
        for term in &self.terms {
            if let Some(t) = tlm_of(term)? {
                total += t;
                any = true;
            }
        }
        if any {
            self.output.add_tlm_output(Value::Scalar(total))?;
        }
        Ok(())
    }

    fn evaluate_hessian(&self) -> Result<()> {
        let Some(h) = hessian_of(&self.output)? else {
            return Ok(());
        };
        for term in &self.terms {
            term.add_hessian_output(Value::Scalar(h))?;
        }
        Ok(())
    }
}

struct SubBlock {
    terms: [Variable; 2],
    output: Variable,
}

impl Block for SubBlock {
    fn dependencies(&self) -> &[Variable] {
        &self.terms
    }

    fn output(&self) -> &Variable {
        &self.output
    }

    fn recompute(&self) -> Result<()> {
        let value = saved(&self.terms[0])? - saved(&self.terms[1])?;
        self.output.set_checkpoint(Value::Scalar(value));
        Ok(())
    }

    fn evaluate_adj(&self) -> Result<()> {
        let Some(seed) = adj_of(&self.output)? else {
            return Ok(());
        };
        self.terms[0].add_adj_output(Value::Scalar(seed))?;
        self.terms[1].add_adj_output(Value::Scalar(-seed))?;
        Ok(())
    }

    fn evaluate_tlm(&self) -> Result<()> {
        let a = tlm_of(&self.terms[0])?;
        let b = tlm_of(&self.terms[1])?;
        if a.is_none() && b.is_none() {
            return Ok(());
        }
        let total = a.unwrap_or(0.0) - b.unwrap_or(0.0);
        self.output.add_tlm_output(Value::Scalar(total))?;
        Ok(())
    }

    fn evaluate_hessian(&self) -> Result<()> {
        let Some(h) = hessian_of(&self.output)? else {
            return Ok(());
        };
        self.terms[0].add_hessian_output(Value::Scalar(h))?;
        self.terms[1].add_hessian_output(Value::Scalar(-h))?;
        Ok(())
    }
}

struct MulBlock {
    terms: [Variable; 2],
    output: Variable,
}

impl Block for MulBlock {
    fn dependencies(&self) -> &[Variable] {
        &self.terms
    }

    fn output(&self) -> &Variable {
        &self.output
    }

    fn recompute(&self) -> Result<()> {
        let value = saved(&self.terms[0])? * saved(&self.terms[1])?;
        self.output.set_checkpoint(Value::Scalar(value));
        Ok(())
    }

    fn evaluate_adj(&self) -> Result<()> {
        let Some(seed) = adj_of(&self.output)? else {
            return Ok(());
        };
        // ∂(a·b)/∂a = b, ∂(a·b)/∂b = a
        self.terms[0].add_adj_output(Value::Scalar(seed * saved(&self.terms[1])?))?;
        self.terms[1].add_adj_output(Value::Scalar(seed * saved(&self.terms[0])?))?;
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
        let total = da.unwrap_or(0.0) * b + a * db.unwrap_or(0.0);
        self.output.add_tlm_output(Value::Scalar(total))?;
        Ok(())
    }

    fn evaluate_hessian(&self) -> Result<()> {
        let adj = adj_of(&self.output)?;
        let hessian = hessian_of(&self.output)?;
        if adj.is_none() && hessian.is_none() {
            return Ok(());
        }
        let lambda = adj.unwrap_or(0.0);
        let h = hessian.unwrap_or(0.0);
        let a = saved(&self.terms[0])?;
        let b = saved(&self.terms[1])?;
        let da = tlm_of(&self.terms[0])?.unwrap_or(0.0);
        let db = tlm_of(&self.terms[1])?.unwrap_or(0.0);
        // First-order transport of the Hessian input plus the curvature of
        // the product acting on the tangent direction.
        self.terms[0].add_hessian_output(Value::Scalar(h * b + lambda * db))?;
        self.terms[1].add_hessian_output(Value::Scalar(h * a + lambda * da))?;
        Ok(())
    }
}

struct PowBlock {
    terms: [Variable; 2],
    output: Variable,
}

impl PowBlock {
    fn partials(&self) -> Result<(f64, f64)> {
        let a = saved(&self.terms[0])?;
        let e = saved(&self.terms[1])?;
        Ok((e * a.powf(e - 1.0), a.powf(e) * a.ln()))
    }
}

impl Block for PowBlock {
    fn dependencies(&self) -> &[Variable] {
        &self.terms
    }

    fn output(&self) -> &Variable {
        &self.output
    }

    fn recompute(&self) -> Result<()> {
        let value = saved(&self.terms[0])?.powf(saved(&self.terms[1])?);
        self.output.set_checkpoint(Value::Scalar(value));
        Ok(())
    }

    fn evaluate_adj(&self) -> Result<()> {
        let Some(seed) = adj_of(&self.output)? else {
            return Ok(());
        };
        let (fa, fe) = self.partials()?;
        self.terms[0].add_adj_output(Value::Scalar(seed * fa))?;
        self.terms[1].add_adj_output(Value::Scalar(seed * fe))?;
        Ok(())
    }

    fn evaluate_tlm(&self) -> Result<()> {
        let da = tlm_of(&self.terms[0])?;
        let de = tlm_of(&self.terms[1])?;
        if da.is_none() && de.is_none() {
            return Ok(());
        }
        let (fa, fe) = self.partials()?;
        let total = fa * da.unwrap_or(0.0) + fe * de.unwrap_or(0.0);
        self.output.add_tlm_output(Value::Scalar(total))?;
        Ok(())
    }

    fn evaluate_hessian(&self) -> Result<()> {
        let adj = adj_of(&self.output)?;
        let hessian = hessian_of(&self.output)?;
        if adj.is_none() && hessian.is_none() {
            return Ok(());
        }
        let lambda = adj.unwrap_or(0.0);
        let h = hessian.unwrap_or(0.0);
        let a = saved(&self.terms[0])?;
        let e = saved(&self.terms[1])?;
        let da = tlm_of(&self.terms[0])?.unwrap_or(0.0);
        let de = tlm_of(&self.terms[1])?.unwrap_or(0.0);
        let (fa, fe) = self.partials()?;
        let faa = e * (e - 1.0) * a.powf(e - 2.0);
        let fae = a.powf(e - 1.0) * (1.0 + e * a.ln());
        let fee = a.powf(e) * a.ln() * a.ln();
        self.terms[0].add_hessian_output(Value::Scalar(h * fa + lambda * (faa * da + fae * de)))?;
        self.terms[1].add_hessian_output(Value::Scalar(h * fe + lambda * (fae * da + fee * de)))?;
        Ok(())
    }
}
