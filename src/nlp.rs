use std::cell::RefCell;

use log::debug;

use crate::adapter::DifferentiableFunction;
use crate::error::{Error, Result};
use crate::sparsity::SparsityPattern;
use crate::transcription::{
    ConstraintsFunction, LagrangianFunction, ObjectiveFunction, Transcription,
};

/// A sparse nonlinear program as seen by a solver backend.
///
/// `new_x` tells an implementation whether `x` differs from the previous
/// call; passing `true` is always safe. Jacobian and Hessian values are
/// written in the order of the corresponding sparsity pattern, and those
/// patterns never change during a solve.
pub trait Nlp {
    fn num_variables(&self) -> usize;
    fn num_constraints(&self) -> usize;

    /// Lower and upper bounds on the decision variables; ±∞ where unset.
    fn variable_bounds(&self) -> (&[f64], &[f64]);
    fn constraint_bounds(&self) -> (&[f64], &[f64]);

    fn jacobian_sparsity(&self) -> &SparsityPattern;
    /// Lower triangle of the Hessian of the Lagrangian.
    fn hessian_sparsity(&self) -> &SparsityPattern;

    fn objective(&self, x: &[f64], new_x: bool) -> Result<f64>;
    fn constraints(&self, x: &[f64], new_x: bool, g: &mut [f64]) -> Result<()>;
    fn gradient(&self, x: &[f64], new_x: bool, grad: &mut [f64]) -> Result<()>;
    fn jacobian(&self, x: &[f64], new_x: bool, nonzeros: &mut [f64]) -> Result<()>;

    /// Hessian of `obj_factor * f(x) + Σ lambda_i g_i(x)`.
    fn hessian_lagrangian(
        &self,
        x: &[f64],
        new_x: bool,
        obj_factor: f64,
        lambda: &[f64],
        new_lambda: bool,
        nonzeros: &mut [f64],
    ) -> Result<()>;
}

/// The NLP of a [`Transcription`], with every function recorded once.
pub struct TranscribedNlp {
    objective: DifferentiableFunction,
    constraints: DifferentiableFunction,
    lagrangian: DifferentiableFunction,
    variable_lower: Vec<f64>,
    variable_upper: Vec<f64>,
    constraint_lower: Vec<f64>,
    constraint_upper: Vec<f64>,
    /// `[x, obj_factor, lambda]` for the Lagrangian trace.
    lagrangian_input: RefCell<Vec<f64>>,
}

impl TranscribedNlp {
    /// Records the objective, constraints and Lagrangian at `x0`.
    ///
    /// The recorded traces are replayed at every other point, so every
    /// user function must follow the same path regardless of its inputs.
    pub fn new(transcription: &Transcription<'_>, x0: &[f64]) -> Result<Self> {
        let n = transcription.num_variables();
        let m = transcription.num_constraints();
        Error::check_len("initial point", n, x0.len())?;

        let objective =
            DifferentiableFunction::record("objective", &ObjectiveFunction(transcription), x0)?;
        let constraints =
            DifferentiableFunction::record("constraints", &ConstraintsFunction(transcription), x0)?;

        let mut point = x0.to_vec();
        point.push(1.0);
        point.resize(n + 1 + m, 0.0);
        let function = LagrangianFunction(transcription);
        let lagrangian = DifferentiableFunction::record("lagrangian", &function, &point)?
            .with_hessian_inputs(n);

        let (variable_lower, variable_upper) = transcription.variable_bounds();
        let (constraint_lower, constraint_upper) = transcription.constraint_bounds();
        let nlp = Self {
            objective,
            constraints,
            lagrangian,
            variable_lower: variable_lower.to_vec(),
            variable_upper: variable_upper.to_vec(),
            constraint_lower: constraint_lower.to_vec(),
            constraint_upper: constraint_upper.to_vec(),
            lagrangian_input: RefCell::new(point),
        };
        debug!(
            "nlp: {n} variables, {m} constraints, {} jacobian and {} hessian nonzeros",
            nlp.jacobian_sparsity().nnz(),
            nlp.hessian_sparsity().nnz()
        );
        Ok(nlp)
    }
}

impl Nlp for TranscribedNlp {
    fn num_variables(&self) -> usize {
        self.variable_lower.len()
    }

    fn num_constraints(&self) -> usize {
        self.constraint_lower.len()
    }

    fn variable_bounds(&self) -> (&[f64], &[f64]) {
        (&self.variable_lower, &self.variable_upper)
    }

    fn constraint_bounds(&self) -> (&[f64], &[f64]) {
        (&self.constraint_lower, &self.constraint_upper)
    }

    fn jacobian_sparsity(&self) -> &SparsityPattern {
        self.constraints.jacobian_sparsity()
    }

    fn hessian_sparsity(&self) -> &SparsityPattern {
        self.lagrangian.hessian_sparsity()
    }

    fn objective(&self, x: &[f64], new_x: bool) -> Result<f64> {
        self.objective.value(x, new_x)
    }

    fn constraints(&self, x: &[f64], new_x: bool, g: &mut [f64]) -> Result<()> {
        self.constraints.eval(x, new_x, g)
    }

    fn gradient(&self, x: &[f64], new_x: bool, grad: &mut [f64]) -> Result<()> {
        self.objective.gradient(x, new_x, grad)
    }

    fn jacobian(&self, x: &[f64], new_x: bool, nonzeros: &mut [f64]) -> Result<()> {
        self.constraints.jacobian(x, new_x, nonzeros)
    }

    fn hessian_lagrangian(
        &self,
        x: &[f64],
        new_x: bool,
        obj_factor: f64,
        lambda: &[f64],
        new_lambda: bool,
        nonzeros: &mut [f64],
    ) -> Result<()> {
        let n = self.num_variables();
        Error::check_len("x", n, x.len())?;
        Error::check_len("lambda", self.num_constraints(), lambda.len())?;
        let mut z = self.lagrangian_input.borrow_mut();
        z[..n].copy_from_slice(x);
        z[n] = obj_factor;
        z[n + 1..].copy_from_slice(lambda);
        self.lagrangian
            .hessian(&z, new_x || new_lambda, &[1.0], nonzeros)
    }
}
