//! NLP solver backends.
//!
//! The bundled backend wraps the PANOC solver of `optimization_engine` in an
//! augmented Lagrangian loop: PANOC handles the box bounds on the decision
//! variables and the constraint set `gl <= g(x) <= gu` is moved into the
//! cost as a penalty on the distance of `g(x) + y / rho` to that set.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use log::{debug, warn};
use optimization_engine::constraints::Rectangle;
use optimization_engine::panoc::{PANOCCache, PANOCOptimizer};
use optimization_engine::{Optimizer, Problem as PanocProblem, SolverError};

use crate::error::{Error, Result};
use crate::nlp::Nlp;

/// Outcome of one backend run.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReport {
    pub success: bool,
    pub status: String,
    pub outer_iterations: usize,
    pub inner_iterations: usize,
    pub objective: f64,
    pub constraint_violation: f64,
}

/// A solver for problems exposed through [`Nlp`].
pub trait NlpBackend {
    fn name(&self) -> &'static str;

    /// Solves from `x` in place.
    ///
    /// Not converging is reported through [`BackendReport::success`];
    /// only failures of the user functions are errors.
    fn solve(&self, nlp: &dyn Nlp, x: &mut [f64]) -> Result<BackendReport>;
}

pub const BACKEND_NAMES: [&str; 1] = ["panoc"];

/// Builds the named backend from string options.
pub fn create(name: &str, options: &BTreeMap<String, String>) -> Result<Box<dyn NlpBackend>> {
    match name {
        "panoc" => Ok(Box::new(PanocBackend::new(PanocOptions::from_options(options)?))),
        _ => Err(Error::config(format!(
            "unknown NLP backend '{name}' (available: {})",
            BACKEND_NAMES.join(", ")
        ))),
    }
}

/// Settings of [`PanocBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct PanocOptions {
    /// Final tolerance of the inner PANOC solves.
    pub tolerance: f64,
    /// Allowed constraint violation at convergence.
    pub constraint_tolerance: f64,
    pub lbfgs_memory: usize,
    /// Iteration limit of each inner solve.
    pub max_iterations: usize,
    pub max_outer_iterations: usize,
    pub initial_penalty: f64,
    pub penalty_update_factor: f64,
    /// Wall-clock limit of the whole solve.
    pub max_duration: Option<Duration>,
}

impl Default for PanocOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            constraint_tolerance: 1e-6,
            lbfgs_memory: 20,
            max_iterations: 1000,
            max_outer_iterations: 50,
            initial_penalty: 10.0,
            penalty_update_factor: 10.0,
            max_duration: None,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("invalid value '{value}' for option '{key}'")))
}

fn positive(key: &str, value: f64) -> Result<f64> {
    if value > 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(Error::config(format!("option '{key}' must be positive, got {value}")))
    }
}

impl PanocOptions {
    /// Reads the keys this backend knows and warns about the rest.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self> {
        let mut opts = Self::default();
        for (key, value) in options {
            match key.as_str() {
                "tolerance" => opts.tolerance = positive(key, parse(key, value)?)?,
                "constraint_tolerance" => {
                    opts.constraint_tolerance = positive(key, parse(key, value)?)?
                }
                "lbfgs_memory" => opts.lbfgs_memory = parse(key, value)?,
                "max_iterations" => opts.max_iterations = parse(key, value)?,
                "max_outer_iterations" => opts.max_outer_iterations = parse(key, value)?,
                "initial_penalty" => opts.initial_penalty = positive(key, parse(key, value)?)?,
                "penalty_update_factor" => {
                    let factor: f64 = parse(key, value)?;
                    if factor < 1.0 {
                        return Err(Error::config(format!(
                            "option '{key}' must be at least 1, got {factor}"
                        )));
                    }
                    opts.penalty_update_factor = factor;
                }
                "max_duration_secs" => {
                    let secs = positive(key, parse(key, value)?)?;
                    opts.max_duration = Some(Duration::from_secs_f64(secs));
                }
                _ => warn!("ignoring unknown backend option '{key}'"),
            }
        }
        if opts.max_outer_iterations == 0 || opts.max_iterations == 0 {
            return Err(Error::config("iteration limits must be at least 1"));
        }
        Ok(opts)
    }
}

/// Augmented Lagrangian method with PANOC inner solves.
#[derive(Debug, Clone, Default)]
pub struct PanocBackend {
    options: PanocOptions,
}

/// Scratch space shared by the cost and gradient closures.
struct Scratch {
    g: Vec<f64>,
    residual: Vec<f64>,
    jacobian: Vec<f64>,
    /// Point of the most recent evaluation.
    last_x: Option<Vec<f64>>,
    error: Option<Error>,
}

impl Scratch {
    /// Whether `x` differs from the previous evaluation point; remembers it.
    fn is_new(&mut self, x: &[f64]) -> bool {
        if self.last_x.as_deref() == Some(x) {
            return false;
        }
        let last = self.last_x.get_or_insert_with(Vec::new);
        last.clear();
        last.extend_from_slice(x);
        true
    }
}

impl PanocBackend {
    pub fn new(options: PanocOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &PanocOptions {
        &self.options
    }
}

/// `z - clamp(z, lo, hi)` for `z = g + y / rho`.
fn penalty_residual(g: &[f64], y: &[f64], rho: f64, lo: &[f64], hi: &[f64], out: &mut [f64]) {
    for i in 0..g.len() {
        let z = g[i] + y[i] / rho;
        out[i] = z - z.clamp(lo[i], hi[i]);
    }
}

fn violation(g: &[f64], lo: &[f64], hi: &[f64]) -> f64 {
    g.iter()
        .zip(lo.iter().zip(hi))
        .map(|(&v, (&l, &h))| (l - v).max(v - h).max(0.0))
        .fold(0.0, f64::max)
}

impl NlpBackend for PanocBackend {
    fn name(&self) -> &'static str {
        "panoc"
    }

    fn solve(&self, nlp: &dyn Nlp, x: &mut [f64]) -> Result<BackendReport> {
        let opts = &self.options;
        let n = nlp.num_variables();
        let m = nlp.num_constraints();
        Error::check_len("initial point", n, x.len())?;

        let (x_lower, x_upper) = nlp.variable_bounds();
        let (g_lower, g_upper) = nlp.constraint_bounds();
        let jac = nlp.jacobian_sparsity();
        let bounds = Rectangle::new(Some(x_lower), Some(x_upper));

        // start inside the box
        for i in 0..n {
            x[i] = x[i].clamp(x_lower[i], x_upper[i]);
        }

        let started = Instant::now();
        let mut y = vec![0.0; m];
        let mut rho = opts.initial_penalty;
        let mut inner_tolerance = opts.tolerance.max(1e-2);
        let mut previous_violation = f64::INFINITY;
        let mut inner_iterations = 0;
        let mut status = String::from("maximum outer iterations reached");
        let mut success = false;
        let mut outer_iterations = 0;

        let scratch = RefCell::new(Scratch {
            g: vec![0.0; m],
            residual: vec![0.0; m],
            jacobian: vec![0.0; jac.nnz()],
            last_x: None,
            error: None,
        });

        for outer in 0..opts.max_outer_iterations {
            outer_iterations = outer + 1;
            let max_duration = match opts.max_duration {
                Some(limit) => {
                    let remaining = limit.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        status = String::from("maximum duration reached");
                        break;
                    }
                    Some(remaining)
                }
                None => None,
            };

            let inner = {
                let cost = |u: &[f64], c: &mut f64| -> Result<(), SolverError> {
                    let mut s = scratch.borrow_mut();
                    let s = &mut *s;
                    let new_x = s.is_new(u);
                    let result = nlp.objective(u, new_x).and_then(|f| {
                        nlp.constraints(u, false, &mut s.g)?;
                        Ok(f)
                    });
                    match result {
                        Ok(f) => {
                            penalty_residual(&s.g, &y, rho, g_lower, g_upper, &mut s.residual);
                            let dist2: f64 = s.residual.iter().map(|r| r * r).sum();
                            *c = f + 0.5 * rho * dist2;
                            Ok(())
                        }
                        Err(e) => {
                            s.error.get_or_insert(e);
                            Err(SolverError::Cost)
                        }
                    }
                };
                let gradient = |u: &[f64], grad: &mut [f64]| -> Result<(), SolverError> {
                    let mut s = scratch.borrow_mut();
                    let s = &mut *s;
                    let new_x = s.is_new(u);
                    let result = nlp
                        .gradient(u, new_x, grad)
                        .and_then(|_| nlp.constraints(u, false, &mut s.g))
                        .and_then(|_| nlp.jacobian(u, false, &mut s.jacobian));
                    if let Err(e) = result {
                        s.error.get_or_insert(e);
                        return Err(SolverError::Cost);
                    }
                    penalty_residual(&s.g, &y, rho, g_lower, g_upper, &mut s.residual);
                    for (k, (row, col)) in jac.iter().enumerate() {
                        grad[col] += rho * s.jacobian[k] * s.residual[row];
                    }
                    Ok(())
                };

                let problem = PanocProblem::new(&bounds, gradient, cost);
                let mut cache = PANOCCache::new(n, inner_tolerance, opts.lbfgs_memory);
                let mut panoc =
                    PANOCOptimizer::new(problem, &mut cache).with_max_iter(opts.max_iterations);
                if let Some(remaining) = max_duration {
                    panoc = panoc.with_max_duration(remaining);
                }
                panoc.solve(x)
            };

            if let Some(err) = scratch.borrow_mut().error.take() {
                return Err(err);
            }
            let inner = match inner {
                Ok(inner) => inner,
                Err(e) => {
                    status = format!("inner solver: {e:?}");
                    break;
                }
            };
            inner_iterations += inner.iterations();

            let mut g = vec![0.0; m];
            let new_x = scratch.borrow_mut().is_new(x);
            nlp.constraints(x, new_x, &mut g)?;
            let current_violation = violation(&g, g_lower, g_upper);
            debug!(
                "outer iteration {outer}: inner {} iterations ({:?}), \
                 violation {current_violation:.3e}, penalty {rho:.1e}",
                inner.iterations(),
                inner.exit_status()
            );

            let final_inner = inner_tolerance <= opts.tolerance;
            let feasible = current_violation <= opts.constraint_tolerance;
            if feasible && final_inner && inner.has_converged() {
                status = String::from("converged");
                success = true;
                break;
            }

            let mut residual = vec![0.0; m];
            penalty_residual(&g, &y, rho, g_lower, g_upper, &mut residual);
            for (yi, ri) in y.iter_mut().zip(&residual) {
                *yi = rho * ri;
            }
            if current_violation > 0.25 * previous_violation {
                rho *= opts.penalty_update_factor;
            }
            previous_violation = current_violation;
            inner_tolerance = (inner_tolerance * 0.1).max(opts.tolerance);
        }

        let new_x = scratch.borrow_mut().is_new(x);
        let objective = nlp.objective(x, new_x)?;
        let mut g = vec![0.0; m];
        nlp.constraints(x, false, &mut g)?;
        let constraint_violation = violation(&g, g_lower, g_upper);
        if !success {
            warn!("panoc backend stopped without converging: {status}");
        }
        Ok(BackendReport {
            success,
            status,
            outer_iterations,
            inner_iterations,
            objective,
            constraint_violation,
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::sparsity::SparsityPattern;

    /// min (x0 - 1)^2 + (x1 - 2)^2  s.t.  x0 + x1 = 1,  x in [-5, 5]^2
    struct Projection {
        jacobian: SparsityPattern,
        hessian: SparsityPattern,
        lower: Vec<f64>,
        upper: Vec<f64>,
    }

    impl Projection {
        fn new() -> Self {
            Self {
                jacobian: SparsityPattern::from_rows(2, vec![vec![0, 1]]),
                hessian: SparsityPattern::from_rows(2, vec![vec![0], vec![1]]),
                lower: vec![-5.0; 2],
                upper: vec![5.0; 2],
            }
        }
    }

    impl Nlp for Projection {
        fn num_variables(&self) -> usize {
            2
        }

        fn num_constraints(&self) -> usize {
            1
        }

        fn variable_bounds(&self) -> (&[f64], &[f64]) {
            (&self.lower, &self.upper)
        }

        fn constraint_bounds(&self) -> (&[f64], &[f64]) {
            (&[1.0], &[1.0])
        }

        fn jacobian_sparsity(&self) -> &SparsityPattern {
            &self.jacobian
        }

        fn hessian_sparsity(&self) -> &SparsityPattern {
            &self.hessian
        }

        fn objective(&self, x: &[f64], _new_x: bool) -> Result<f64> {
            Ok((x[0] - 1.0).powi(2) + (x[1] - 2.0).powi(2))
        }

        fn constraints(&self, x: &[f64], _new_x: bool, g: &mut [f64]) -> Result<()> {
            g[0] = x[0] + x[1];
            Ok(())
        }

        fn gradient(&self, x: &[f64], _new_x: bool, grad: &mut [f64]) -> Result<()> {
            grad[0] = 2.0 * (x[0] - 1.0);
            grad[1] = 2.0 * (x[1] - 2.0);
            Ok(())
        }

        fn jacobian(&self, _x: &[f64], _new_x: bool, nonzeros: &mut [f64]) -> Result<()> {
            nonzeros.copy_from_slice(&[1.0, 1.0]);
            Ok(())
        }

        fn hessian_lagrangian(
            &self,
            _x: &[f64],
            _new_x: bool,
            obj_factor: f64,
            _lambda: &[f64],
            _new_lambda: bool,
            nonzeros: &mut [f64],
        ) -> Result<()> {
            nonzeros.fill(2.0 * obj_factor);
            Ok(())
        }
    }

    #[test]
    fn solves_equality_constrained_projection() {
        let backend = PanocBackend::default();
        let mut x = [0.0, 0.0];
        let report = backend.solve(&Projection::new(), &mut x).unwrap();
        assert!(report.success, "{report:?}");
        assert_eq!(report.status, "converged");
        assert_abs_diff_eq!(x[0], 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(x[1], 1.0, epsilon = 1e-4);
        assert!(report.constraint_violation <= 1e-6);
    }

    /// Logs the point and `new_x` flag of every first-order evaluation.
    struct Recorded {
        inner: Projection,
        calls: RefCell<Vec<(Vec<f64>, bool)>>,
    }

    impl Recorded {
        fn log(&self, x: &[f64], new_x: bool) {
            self.calls.borrow_mut().push((x.to_vec(), new_x));
        }
    }

    impl Nlp for Recorded {
        fn num_variables(&self) -> usize {
            self.inner.num_variables()
        }

        fn num_constraints(&self) -> usize {
            self.inner.num_constraints()
        }

        fn variable_bounds(&self) -> (&[f64], &[f64]) {
            self.inner.variable_bounds()
        }

        fn constraint_bounds(&self) -> (&[f64], &[f64]) {
            self.inner.constraint_bounds()
        }

        fn jacobian_sparsity(&self) -> &SparsityPattern {
            self.inner.jacobian_sparsity()
        }

        fn hessian_sparsity(&self) -> &SparsityPattern {
            self.inner.hessian_sparsity()
        }

        fn objective(&self, x: &[f64], new_x: bool) -> Result<f64> {
            self.log(x, new_x);
            self.inner.objective(x, new_x)
        }

        fn constraints(&self, x: &[f64], new_x: bool, g: &mut [f64]) -> Result<()> {
            self.log(x, new_x);
            self.inner.constraints(x, new_x, g)
        }

        fn gradient(&self, x: &[f64], new_x: bool, grad: &mut [f64]) -> Result<()> {
            self.log(x, new_x);
            self.inner.gradient(x, new_x, grad)
        }

        fn jacobian(&self, x: &[f64], new_x: bool, nonzeros: &mut [f64]) -> Result<()> {
            self.log(x, new_x);
            self.inner.jacobian(x, new_x, nonzeros)
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
            self.inner
                .hessian_lagrangian(x, new_x, obj_factor, lambda, new_lambda, nonzeros)
        }
    }

    #[test]
    fn repeated_points_are_not_flagged_as_new() {
        let nlp = Recorded {
            inner: Projection::new(),
            calls: RefCell::new(Vec::new()),
        };
        let mut x = [0.0, 0.0];
        let report = PanocBackend::default().solve(&nlp, &mut x).unwrap();
        assert!(report.success, "{report:?}");

        let calls = nlp.calls.borrow();
        assert!(calls[0].1);
        for pair in calls.windows(2) {
            let (previous, (x, new_x)) = (&pair[0].0, &pair[1]);
            if !new_x {
                assert_eq!(x, previous);
            } else {
                assert_ne!(x, previous);
            }
        }
        assert!(calls.iter().any(|(_, new_x)| !new_x));
    }

    #[test]
    fn options_are_parsed_and_checked() {
        let mut options = BTreeMap::new();
        options.insert("tolerance".to_string(), "1e-8".to_string());
        options.insert("max_outer_iterations".to_string(), "20".to_string());
        options.insert("linear_solver".to_string(), "mumps".to_string());
        let opts = PanocOptions::from_options(&options).unwrap();
        assert_eq!(opts.tolerance, 1e-8);
        assert_eq!(opts.max_outer_iterations, 20);

        options.insert("lbfgs_memory".to_string(), "many".to_string());
        assert!(matches!(
            PanocOptions::from_options(&options),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(create("panoc", &BTreeMap::new()).is_ok());
        assert!(matches!(
            create("ipopt", &BTreeMap::new()),
            Err(Error::Configuration(_))
        ));
    }
}
