//! Tests for the dense backend and recorded equation solves

use std::cell::RefCell;
use std::rc::Rc;

use approx::assert_abs_diff_eq;
use ndarray::{array, Array2};

use super::*;
use crate::control::{Coefficient, Control};
use crate::drivers::compute_gradient;
use crate::field::{inner, Boundary, Field};
use crate::reduced::ReducedFunctional;
use crate::tape::{push_tape, Tape};
use crate::value::Value;

fn with_tape<R>(f: impl FnOnce(&Rc<RefCell<Tape>>) -> R) -> R {
    let tape = Rc::new(RefCell::new(Tape::new()));
    let _guard = push_tape(tape.clone());
    f(&tape)
}

fn tridiag(n: usize) -> Array2<f64> {
    let mut a = Array2::zeros((n, n));
    for i in 0..n {
        a[[i, i]] = 4.0;
        if i > 0 {
            a[[i, i - 1]] = 1.0;
        }
        if i + 1 < n {
            a[[i, i + 1]] = 1.0;
        }
    }
    a
}

#[test]
fn test_lu_solve_recovers_known_solution() {
    let backend = DenseBackend::new();
    let a = array![[4.0, 1.0], [2.0, 3.0]];
    let x = array![1.0, -2.0];
    let b = a.dot(&x);
    let solved = backend.solve_linear(&a, &b, &SolveOptions::default()).unwrap();
    assert_abs_diff_eq!(solved[0], x[0], epsilon = 1e-12);
    assert_abs_diff_eq!(solved[1], x[1], epsilon = 1e-12);
}

#[test]
fn test_lu_solve_pivots() {
    let backend = DenseBackend::new();
    // zero on the leading diagonal forces a row swap
    let a = array![[0.0, 1.0], [1.0, 0.0]];
    let b = array![2.0, 3.0];
    let solved = backend.solve_linear(&a, &b, &SolveOptions::default()).unwrap();
    assert_abs_diff_eq!(solved[0], 3.0);
    assert_abs_diff_eq!(solved[1], 2.0);
}

#[test]
fn test_lu_solve_rejects_singular_matrix() {
    let backend = DenseBackend::new();
    let a = array![[1.0, 2.0], [2.0, 4.0]];
    let b = array![1.0, 2.0];
    assert!(matches!(
        backend.solve_linear(&a, &b, &SolveOptions::default()),
        Err(crate::error::Error::SingularMatrix(_))
    ));
}

#[test]
fn test_apply_constraints_fixes_rows() {
    let backend = DenseBackend::new();
    let mut a = tridiag(3);
    let mut b = array![1.0, 2.0, 3.0];
    let bc = DirichletConstraint::new(vec![0], array![7.0]);

    backend.apply_constraints(Some(&mut a), Some(&mut b), &[bc.clone()], false);
    assert_abs_diff_eq!(a[[0, 0]], 1.0);
    assert_abs_diff_eq!(a[[0, 1]], 0.0);
    assert_abs_diff_eq!(b[0], 7.0);
    assert_abs_diff_eq!(b[1], 2.0);

    backend.apply_constraints(None, Some(&mut b), &[bc], true);
    assert_abs_diff_eq!(b[0], 0.0);
}

#[test]
fn test_differentiate_reports_absent_dependence() {
    let backend = DenseBackend::new();
    let u = Field::zeros(2);
    let m = Field::zeros(2);
    let form = DenseForm::new().operator(Array2::eye(2), &u);
    let derivative = backend
        .differentiate(&form, m.key(), &Direction::Trial)
        .unwrap();
    assert!(derivative.is_none());
}

#[test]
fn test_is_linear_in_tracks_powers() {
    let backend = DenseBackend::new();
    let u = Field::zeros(2);
    let m = Field::zeros(2);
    let linear = DenseForm::new().operator(Array2::eye(2), &u);
    assert!(backend.is_linear_in(&linear, u.key()));

    let cubic = DenseForm::new()
        .operator(Array2::eye(2), &u)
        .power(1.0, &u, 3);
    assert!(!backend.is_linear_in(&cubic, u.key()));
    assert!(backend.is_linear_in(&cubic, m.key()));
}

#[test]
fn test_newton_solves_cubic_residual() {
    let backend = DenseBackend::new();
    let u = Field::zeros(1);
    // 4u + u³ − 5 = 0 has the root u = 1
    let form = DenseForm::new()
        .operator(array![[4.0]], &u)
        .power(1.0, &u, 3)
        .source(array![-5.0]);
    let solution = backend
        .solve_equation(&form, u.key(), &[], &SolveOptions::default())
        .unwrap();
    assert_abs_diff_eq!(solution[0], 1.0, epsilon = 1e-9);
}

#[test]
fn test_newton_reports_non_convergence() {
    let backend = DenseBackend::new();
    let u = Field::zeros(1);
    let form = DenseForm::new()
        .operator(array![[4.0]], &u)
        .power(1.0, &u, 3)
        .source(array![-5.0]);
    let options = SolveOptions::default().with_max_iterations(1);
    assert!(matches!(
        backend.solve_equation(&form, u.key(), &[], &options),
        Err(crate::error::Error::NonConvergence { .. })
    ));
}

#[test]
fn test_error_control_is_rejected_while_recording() {
    with_tape(|tape| {
        let backend = Rc::new(DenseBackend::new());
        let mut u = Field::zeros(2);
        let m = Field::new(array![1.0, 1.0]);
        let form = DenseForm::new()
            .operator(Array2::eye(2), &u)
            .operator(Array2::eye(2) * -1.0, &m);
        let options = SolveOptions {
            error_control: true,
            ..SolveOptions::default()
        };
        let result = solve(&backend, &form, &mut u, &[&m], &[], &options);
        assert!(matches!(
            result,
            Err(crate::error::Error::UnsupportedAnnotation)
        ));
        // nothing reached the tape
        assert_eq!(tape.borrow().len(), 0);
    });
}

#[test]
fn test_unregistered_coefficient_is_rejected() {
    with_tape(|tape| {
        let backend = Rc::new(DenseBackend::new());
        let mut u = Field::zeros(2);
        let m = Field::new(array![1.0, 1.0]);
        let form = DenseForm::new()
            .operator(Array2::eye(2), &u)
            .operator(Array2::eye(2) * -1.0, &m);
        let result = solve(&backend, &form, &mut u, &[], &[], &SolveOptions::default());
        assert!(matches!(
            result,
            Err(crate::error::Error::UnregisteredCoefficient(_))
        ));
        assert_eq!(tape.borrow().len(), 0);
    });
}

#[test]
fn test_linear_solve_forward_value() {
    with_tape(|tape| {
        let backend = Rc::new(DenseBackend::new());
        let a = tridiag(3);
        let mut u = Field::zeros(3);
        let m = Field::new(array![1.0, 2.0, 3.0]);
        // A·u = 2m
        let form = DenseForm::new()
            .operator(a.clone(), &u)
            .operator(Array2::eye(3) * -2.0, &m);
        solve(&backend, &form, &mut u, &[&m], &[], &SolveOptions::default()).unwrap();
        assert_eq!(tape.borrow().len(), 1);

        let residual = a.dot(u.data()) - m.data() * 2.0;
        for r in residual.iter() {
            assert_abs_diff_eq!(*r, 0.0, epsilon = 1e-12);
        }
    });
}

#[test]
fn test_linear_solve_gradient_matches_finite_differences() {
    with_tape(|_| {
        let backend = Rc::new(DenseBackend::new());
        let mut u = Field::zeros(3);
        let m = Field::new(array![1.0, 2.0, 3.0]);
        let form = DenseForm::new()
            .operator(tridiag(3), &u)
            .operator(Array2::eye(3) * -2.0, &m);
        solve(&backend, &form, &mut u, &[&m], &[], &SolveOptions::default()).unwrap();
        let j = inner(&u, &u);

        let grads = compute_gradient(&j, &[&m]).unwrap();

        let m0 = array![1.0, 2.0, 3.0];
        let mut rf = ReducedFunctional::new(&j, &m);
        let eps = 1e-6;
        for i in 0..3 {
            let mut plus = m0.clone();
            plus[i] += eps;
            let j_plus = rf.eval(plus).unwrap();
            let mut minus = m0.clone();
            minus[i] -= eps;
            let j_minus = rf.eval(minus).unwrap();
            let fd = (j_plus - j_minus) / (2.0 * eps);
            let relative = ((grads[0][i] - fd) / fd).abs();
            assert!(
                relative < 0.01,
                "entry {i}: adjoint {} vs finite difference {fd}",
                grads[0][i]
            );
        }
    });
}

#[test]
fn test_tangent_matches_gradient_through_solve() {
    with_tape(|tape| {
        let backend = Rc::new(DenseBackend::new());
        let mut u = Field::zeros(3);
        let m = Field::new(array![1.0, 2.0, 3.0]);
        let form = DenseForm::new()
            .operator(tridiag(3), &u)
            .operator(Array2::eye(3) * -2.0, &m);
        solve(&backend, &form, &mut u, &[&m], &[], &SolveOptions::default()).unwrap();
        let j = inner(&u, &u);

        let grads = compute_gradient(&j, &[&m]).unwrap();

        let direction = array![0.3, -1.0, 0.7];
        tape.borrow().reset_tlm_values();
        m.set_tangent(&direction);
        tape.borrow().evaluate_tlm().unwrap();
        let directional = j.variable().tlm_value().unwrap().as_scalar().unwrap();

        assert_abs_diff_eq!(directional, grads[0].dot(&direction), epsilon = 1e-9);
    });
}

#[test]
fn test_constrained_row_carries_no_field_sensitivity() {
    with_tape(|_| {
        let backend = Rc::new(DenseBackend::new());
        let mut u = Field::zeros(4);
        let m = Field::new(array![1.0, 2.0, 3.0, 4.0]);
        let bc = Boundary::uniform(vec![0], 1.5);
        let form = DenseForm::new()
            .operator(tridiag(4), &u)
            .operator(Array2::eye(4) * -2.0, &m);
        solve(
            &backend,
            &form,
            &mut u,
            &[&m],
            &[&bc],
            &SolveOptions::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(u.data()[0], 1.5);
        let j = inner(&u, &u);

        // the constrained row does not respond to the field control
        let grads = compute_gradient(&j, &[&m]).unwrap();
        assert_abs_diff_eq!(grads[0][0], 0.0);
        assert!(grads[0][1].abs() > 0.0);
    });
}

#[test]
fn test_boundary_control_gradient_matches_finite_differences() {
    with_tape(|_| {
        let backend = Rc::new(DenseBackend::new());
        let mut u = Field::zeros(4);
        let m = Field::new(array![1.0, 2.0, 3.0, 4.0]);
        let bc = Boundary::uniform(vec![0], 1.5);
        let form = DenseForm::new()
            .operator(tridiag(4), &u)
            .operator(Array2::eye(4) * -2.0, &m);
        solve(
            &backend,
            &form,
            &mut u,
            &[&m],
            &[&bc],
            &SolveOptions::default(),
        )
        .unwrap();
        let j = inner(&u, &u);

        let grads = compute_gradient(&j, &[&bc]).unwrap();

        let mut rf = ReducedFunctional::new(&j, &bc);
        let eps = 1e-6;
        let j_plus = rf.eval(array![1.5 + eps]).unwrap();
        let j_minus = rf.eval(array![1.5 - eps]).unwrap();
        let fd = (j_plus - j_minus) / (2.0 * eps);
        let relative = ((grads[0][0] - fd) / fd).abs();
        assert!(relative < 0.01, "adjoint {} vs fd {fd}", grads[0][0]);
    });
}

#[test]
fn test_scalar_control_gradient_matches_finite_differences() {
    with_tape(|_| {
        let backend = Rc::new(DenseBackend::new());
        let mut u = Field::zeros(3);
        let s = crate::scalar::Scalar::new(2.0);
        // A·u = s·[1, 1, 1]
        let form = DenseForm::new()
            .operator(tridiag(3), &u)
            .scaled_source(array![-1.0, -1.0, -1.0], &s);
        solve(&backend, &form, &mut u, &[&s], &[], &SolveOptions::default()).unwrap();
        let j = inner(&u, &u);

        let grads = compute_gradient(&j, &[&s]).unwrap();

        let mut rf = ReducedFunctional::new(&j, &s);
        let eps = 1e-6;
        let j_plus = rf.eval(2.0 + eps).unwrap();
        let j_minus = rf.eval(2.0 - eps).unwrap();
        let fd = (j_plus - j_minus) / (2.0 * eps);
        let relative = ((grads[0] - fd) / fd).abs();
        assert!(relative < 0.01, "adjoint {} vs fd {fd}", grads[0]);
    });
}

#[test]
fn test_solve_recompute_is_idempotent() {
    with_tape(|tape| {
        let backend = Rc::new(DenseBackend::new());
        let mut u = Field::zeros(3);
        let mut m = Field::new(array![1.0, 2.0, 3.0]);
        let form = DenseForm::new()
            .operator(tridiag(3), &u)
            .operator(Array2::eye(3) * -2.0, &m);
        solve(&backend, &form, &mut u, &[&m], &[], &SolveOptions::default()).unwrap();

        m.update(array![2.0, 0.0, 1.0]).unwrap();
        tape.borrow().evaluate(0).unwrap();
        let first = u.variable().saved_output().as_field().unwrap().clone();

        m.update(array![2.0, 0.0, 1.0]).unwrap();
        tape.borrow().evaluate(0).unwrap();
        let second = u.variable().saved_output().as_field().unwrap().clone();

        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    });
}

#[test]
fn test_solve_block_ignores_missing_adjoint_seed() {
    with_tape(|tape| {
        let backend = Rc::new(DenseBackend::new());
        let mut u = Field::zeros(2);
        let m = Field::new(array![1.0, 1.0]);
        let form = DenseForm::new()
            .operator(Array2::eye(2) * 4.0, &u)
            .operator(Array2::eye(2) * -2.0, &m);
        solve(&backend, &form, &mut u, &[&m], &[], &SolveOptions::default()).unwrap();

        tape.borrow().evaluate_adj(0).unwrap();
        assert!(m.variable().adj_value().is_none());
    });
}

#[test]
fn test_assembled_residual_binding() {
    let backend = DenseBackend::new();
    let u = Field::new(array![1.0, 1.0]);
    let m = Field::new(array![2.0, 3.0]);
    let form = DenseForm::new()
        .operator(Array2::eye(2) * 4.0, &u)
        .operator(Array2::eye(2) * -2.0, &m);

    let mut values = std::collections::BTreeMap::new();
    values.insert(u.key(), Value::Field(array![1.0, 1.0]));
    values.insert(m.key(), Value::Field(array![2.0, 3.0]));
    let bound = backend.bind(&form, &values);
    let residual = backend
        .assemble(&bound, &AssembleOptions::default())
        .unwrap()
        .into_vector()
        .unwrap();
    // 4·u − 2·m at the bound values
    assert_abs_diff_eq!(residual[0], 0.0);
    assert_abs_diff_eq!(residual[1], -2.0);
}
