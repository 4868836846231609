//! Exact sparse derivatives of recorded functions.
//!
//! A [`DifferentiableFunction`] records a [`Traceable`] once at a sample
//! point and then answers value, gradient, Jacobian and Hessian queries by
//! replaying that trace. Sparsity patterns come from the trace structure
//! and never change afterwards; compressed evaluation uses a column
//! coloring so each Jacobian or Hessian costs one sweep per color.

use std::cell::{OnceCell, RefCell, RefMut};

use log::debug;

use crate::autodiff::{Tape, Var};
use crate::error::{Error, Result};
use crate::sparsity::{ColumnColoring, SparsityPattern};
use crate::trace::{Output, Trace};

/// A vector function that can be evaluated on traced variables.
///
/// Its control flow must not depend on the values of its inputs.
pub trait Traceable {
    fn num_inputs(&self) -> usize;
    fn num_outputs(&self) -> usize;
    fn eval<'t>(&self, x: &[Var<'t>]) -> Result<Vec<Var<'t>>>;
}

/// Sparsity pattern with its coloring and the nonzeros grouped by color.
#[derive(Debug)]
struct Compression {
    pattern: SparsityPattern,
    coloring: ColumnColoring,
    by_color: Vec<Vec<usize>>,
}

impl Compression {
    fn new(pattern: SparsityPattern, coloring: ColumnColoring) -> Self {
        let mut by_color = vec![Vec::new(); coloring.num_colors()];
        for (k, (_, j)) in pattern.iter().enumerate() {
            by_color[coloring.color_of(j)].push(k);
        }
        Self {
            pattern,
            coloring,
            by_color,
        }
    }
}

#[derive(Debug, Default)]
struct Workspace {
    x: Vec<f64>,
    values: Vec<f64>,
    valid: bool,
    dots: Vec<f64>,
    seed: Vec<f64>,
    column: Vec<f64>,
}

/// A recorded function with cached forward sweeps.
///
/// Not `Sync`: a solve drives each function from one thread.
#[derive(Debug)]
pub struct DifferentiableFunction {
    name: &'static str,
    trace: Trace,
    /// The Hessian covers only the first `hessian_inputs` inputs.
    hessian_inputs: usize,
    workspace: RefCell<Workspace>,
    jacobian: OnceCell<Compression>,
    hessian: OnceCell<Compression>,
}

impl DifferentiableFunction {
    /// Records `f` at `point`.
    pub fn record(name: &'static str, f: &impl Traceable, point: &[f64]) -> Result<Self> {
        Error::check_len(name, f.num_inputs(), point.len())?;
        let tape = Tape::new();
        let outputs = {
            let inputs: Vec<Var<'_>> = point.iter().map(|&v| tape.input(v)).collect();
            let outputs = f.eval(&inputs)?;
            Error::check_len(name, f.num_outputs(), outputs.len())?;
            outputs.iter().map(Var::output).collect::<Vec<Output>>()
        };
        let trace = tape.into_trace(outputs);
        debug!(
            "recorded {name}: {} inputs, {} outputs, {} operations",
            trace.num_inputs(),
            trace.num_outputs(),
            trace.num_ops()
        );
        Ok(Self {
            name,
            hessian_inputs: trace.num_inputs(),
            trace,
            workspace: RefCell::new(Workspace::default()),
            jacobian: OnceCell::new(),
            hessian: OnceCell::new(),
        })
    }

    /// Restricts the Hessian to the leading `n` inputs; the rest act as
    /// weights or parameters.
    pub fn with_hessian_inputs(mut self, n: usize) -> Self {
        self.hessian_inputs = n.min(self.trace.num_inputs());
        self.hessian = OnceCell::new();
        self
    }

    pub fn num_inputs(&self) -> usize {
        self.trace.num_inputs()
    }

    pub fn num_outputs(&self) -> usize {
        self.trace.num_outputs()
    }

    /// Runs the forward sweep unless the cached one is for the same `x`.
    fn prepare(&self, x: &[f64], new_x: bool) -> Result<RefMut<'_, Workspace>> {
        Error::check_len(self.name, self.num_inputs(), x.len())?;
        let mut ws = self.workspace.borrow_mut();
        if new_x || !ws.valid || ws.x != x {
            let ws = &mut *ws;
            self.trace.forward(x, &mut ws.values);
            ws.x.clear();
            ws.x.extend_from_slice(x);
            ws.valid = true;
        }
        Ok(ws)
    }

    pub fn eval(&self, x: &[f64], new_x: bool, out: &mut [f64]) -> Result<()> {
        Error::check_len(self.name, self.num_outputs(), out.len())?;
        let ws = self.prepare(x, new_x)?;
        self.trace.outputs(&ws.values, out);
        Ok(())
    }

    /// Value of a scalar function.
    pub fn value(&self, x: &[f64], new_x: bool) -> Result<f64> {
        let mut out = [0.0];
        self.eval(x, new_x, &mut out)?;
        Ok(out[0])
    }

    /// Gradient of a scalar function.
    pub fn gradient(&self, x: &[f64], new_x: bool, grad: &mut [f64]) -> Result<()> {
        self.weighted_gradient(x, new_x, &[1.0], grad)
    }

    /// `wᵀ J` for output weights `w`.
    pub fn weighted_gradient(
        &self,
        x: &[f64],
        new_x: bool,
        w: &[f64],
        grad: &mut [f64],
    ) -> Result<()> {
        Error::check_len(self.name, self.num_outputs(), w.len())?;
        Error::check_len(self.name, self.num_inputs(), grad.len())?;
        let ws = self.prepare(x, new_x)?;
        self.trace.reverse(&ws.values, w, grad);
        Ok(())
    }

    fn jacobian_compression(&self) -> &Compression {
        self.jacobian.get_or_init(|| {
            let pattern =
                SparsityPattern::from_rows(self.num_inputs(), self.trace.jacobian_structure());
            let coloring = ColumnColoring::for_jacobian(&pattern);
            debug!(
                "{} jacobian: {} nonzeros, {} colors",
                self.name,
                pattern.nnz(),
                coloring.num_colors()
            );
            Compression::new(pattern, coloring)
        })
    }

    fn hessian_compression(&self) -> &Compression {
        self.hessian.get_or_init(|| {
            let structure = self.trace.hessian_structure();
            let pattern = SparsityPattern::lower_triangle(self.hessian_inputs, &structure);
            let coloring = ColumnColoring::for_hessian(&pattern);
            debug!(
                "{} hessian: {} nonzeros, {} colors",
                self.name,
                pattern.nnz(),
                coloring.num_colors()
            );
            Compression::new(pattern, coloring)
        })
    }

    pub fn jacobian_sparsity(&self) -> &SparsityPattern {
        &self.jacobian_compression().pattern
    }

    /// Lower triangle of the Hessian over the leading inputs.
    pub fn hessian_sparsity(&self) -> &SparsityPattern {
        &self.hessian_compression().pattern
    }

    /// Jacobian nonzeros in the order of [`jacobian_sparsity`](Self::jacobian_sparsity).
    pub fn jacobian(&self, x: &[f64], new_x: bool, nonzeros: &mut [f64]) -> Result<()> {
        let comp = self.jacobian_compression();
        Error::check_len(self.name, comp.pattern.nnz(), nonzeros.len())?;
        let mut ws = self.prepare(x, new_x)?;
        let ws = &mut *ws;
        ws.seed.resize(self.num_inputs(), 0.0);
        ws.column.resize(self.num_outputs(), 0.0);
        let rows = comp.pattern.rows();
        for (color, entries) in comp.by_color.iter().enumerate() {
            comp.coloring.seed(color, &mut ws.seed);
            self.trace.tangent(&ws.values, &ws.seed, &mut ws.dots);
            self.trace.output_tangents(&ws.dots, &mut ws.column);
            for &k in entries {
                nonzeros[k] = ws.column[rows[k]];
            }
        }
        Ok(())
    }

    /// Nonzeros of `∇²(wᵀy)` in the order of [`hessian_sparsity`](Self::hessian_sparsity).
    pub fn hessian(&self, x: &[f64], new_x: bool, w: &[f64], nonzeros: &mut [f64]) -> Result<()> {
        let comp = self.hessian_compression();
        Error::check_len(self.name, self.num_outputs(), w.len())?;
        Error::check_len(self.name, comp.pattern.nnz(), nonzeros.len())?;
        let mut ws = self.prepare(x, new_x)?;
        let ws = &mut *ws;
        let n = self.num_inputs();
        ws.seed.clear();
        ws.seed.resize(n, 0.0);
        ws.column.resize(n, 0.0);
        let rows = comp.pattern.rows();
        for (color, entries) in comp.by_color.iter().enumerate() {
            comp.coloring.seed(color, &mut ws.seed[..self.hessian_inputs]);
            self.trace.tangent(&ws.values, &ws.seed, &mut ws.dots);
            self.trace
                .hessian_vector(&ws.values, &ws.dots, w, &mut ws.column);
            for &k in entries {
                nonzeros[k] = ws.column[rows[k]];
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    /// f(x) = [x0 * x1, sin(x2), x0 + 3]
    struct Vector3;

    impl Traceable for Vector3 {
        fn num_inputs(&self) -> usize {
            3
        }

        fn num_outputs(&self) -> usize {
            3
        }

        fn eval<'t>(&self, x: &[Var<'t>]) -> Result<Vec<Var<'t>>> {
            Ok(vec![x[0] * x[1], x[2].sin(), x[0] + 3.0])
        }
    }

    /// s * (x0^2 x1) + l * x1^3, Hessian over (x0, x1) only.
    struct Weighted;

    impl Traceable for Weighted {
        fn num_inputs(&self) -> usize {
            4
        }

        fn num_outputs(&self) -> usize {
            1
        }

        fn eval<'t>(&self, x: &[Var<'t>]) -> Result<Vec<Var<'t>>> {
            let f = x[0].powi(2) * x[1];
            let g = x[1].powi(3);
            Ok(vec![x[2] * f + x[3] * g])
        }
    }

    #[test]
    fn jacobian_matches_analytic_values() {
        let f = DifferentiableFunction::record("vector3", &Vector3, &[1.0, 1.0, 1.0]).unwrap();
        let pattern = f.jacobian_sparsity().clone();
        assert_eq!(
            pattern.iter().collect::<Vec<_>>(),
            vec![(0, 0), (0, 1), (1, 2), (2, 0)]
        );
        let x = [2.0, -3.0, 0.5];
        let mut nz = vec![0.0; pattern.nnz()];
        f.jacobian(&x, true, &mut nz).unwrap();
        assert_relative_eq!(nz[0], -3.0);
        assert_relative_eq!(nz[1], 2.0);
        assert_relative_eq!(nz[2], 0.5f64.cos());
        assert_relative_eq!(nz[3], 1.0);
        // The pattern does not move after evaluation.
        assert_eq!(f.jacobian_sparsity(), &pattern);
    }

    #[test]
    fn cached_sweep_is_refreshed_for_new_points() {
        let f = DifferentiableFunction::record("vector3", &Vector3, &[0.0; 3]).unwrap();
        let mut out = [0.0; 3];
        f.eval(&[1.0, 2.0, 0.0], true, &mut out).unwrap();
        assert_eq!(out[0], 2.0);
        // Different x with new_x = false still recomputes.
        f.eval(&[3.0, 2.0, 0.0], false, &mut out).unwrap();
        assert_eq!(out[0], 6.0);
        assert_eq!(out[2], 6.0);
    }

    #[test]
    fn restricted_hessian_of_weighted_sum() {
        let f = DifferentiableFunction::record("weighted", &Weighted, &[1.0; 4])
            .unwrap()
            .with_hessian_inputs(2);
        let pattern = f.hessian_sparsity().clone();
        assert_eq!(pattern.num_rows(), 2);
        assert_eq!(pattern.iter().collect::<Vec<_>>(), vec![(0, 0), (1, 0), (1, 1)]);

        let (x0, x1, s, l) = (1.5, -2.0, 0.5, 3.0);
        let mut nz = vec![0.0; pattern.nnz()];
        f.hessian(&[x0, x1, s, l], true, &[1.0], &mut nz).unwrap();
        assert_relative_eq!(nz[0], s * 2.0 * x1, epsilon = 1e-12);
        assert_relative_eq!(nz[1], s * 2.0 * x0, epsilon = 1e-12);
        assert_relative_eq!(nz[2], l * 6.0 * x1, epsilon = 1e-12);
    }

    #[test]
    fn gradient_of_scalar_function() {
        let f = DifferentiableFunction::record("weighted", &Weighted, &[1.0; 4]).unwrap();
        let mut grad = [0.0; 4];
        f.gradient(&[1.0, 2.0, 1.0, 1.0], true, &mut grad).unwrap();
        assert_relative_eq!(grad[0], 4.0);
        assert_relative_eq!(grad[1], 1.0 + 12.0);
        assert_relative_eq!(grad[2], 2.0);
        assert_relative_eq!(grad[3], 8.0);
    }

    #[test]
    fn wrong_lengths_are_evaluation_errors() {
        let f = DifferentiableFunction::record("vector3", &Vector3, &[0.0; 3]).unwrap();
        let mut out = [0.0; 3];
        let err = f.eval(&[1.0, 2.0], true, &mut out).unwrap_err();
        assert!(matches!(
            err,
            Error::Evaluation {
                expected: 3,
                got: 2,
                ..
            }
        ));
        assert!(DifferentiableFunction::record("vector3", &Vector3, &[0.0; 2]).is_err());
    }
}
