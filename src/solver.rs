use std::collections::BTreeMap;
use std::time::Instant;

use log::{info, warn};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::backend::{self, BACKEND_NAMES};
use crate::error::{Error, Result};
use crate::iterate::{Iterate, Solution, SolveStats};
use crate::nlp::TranscribedNlp;
use crate::problem::Problem;
use crate::transcription::{uniform_mesh, validate_mesh, Scheme, Transcription};

/// Where a [`Solver`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    /// No mesh has been chosen yet.
    Unconfigured,
    Configured,
    Solving,
    /// The last solve converged.
    Solved,
    /// The last solve stopped without converging or returned an error.
    Failed,
}

/// Transcribes a problem, runs a backend on it and labels the result.
///
/// ```no_run
/// # fn demo(problem: &dircol::Problem) -> dircol::Result<()> {
/// let mut solver = dircol::Solver::new(problem)?;
/// solver.set_num_mesh_points(20)?;
/// solver.set_option("tolerance", "1e-8");
/// let guess = solver.create_initial_guess_from_bounds()?;
/// let solution = solver.solve(&guess)?;
/// println!("{} after {} iterations", solution.status, solution.num_iterations);
/// # Ok(())
/// # }
/// ```
pub struct Solver<'p> {
    problem: &'p Problem,
    mesh: Option<Vec<f64>>,
    scheme: Scheme,
    backend: String,
    options: BTreeMap<String, String>,
    state: SolverState,
}

impl<'p> Solver<'p> {
    /// Creates a solver for an initialized problem.
    pub fn new(problem: &'p Problem) -> Result<Self> {
        if !problem.is_initialized() {
            return Err(Error::NotInitialized("Solver::new"));
        }
        Ok(Self {
            problem,
            mesh: None,
            scheme: Scheme::default(),
            backend: BACKEND_NAMES[0].to_string(),
            options: BTreeMap::new(),
            state: SolverState::Unconfigured,
        })
    }

    pub fn problem(&self) -> &'p Problem {
        self.problem
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    pub fn num_mesh_points(&self) -> Option<usize> {
        self.mesh.as_ref().map(Vec::len)
    }

    pub fn mesh(&self) -> Option<&[f64]> {
        self.mesh.as_deref()
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Uses `n` evenly spaced mesh points.
    pub fn set_num_mesh_points(&mut self, n: usize) -> Result<()> {
        self.mesh = Some(uniform_mesh(n)?);
        self.state = SolverState::Configured;
        Ok(())
    }

    /// Uses an explicit mesh on [0, 1]; spacing may be non-uniform.
    pub fn set_mesh(&mut self, mesh: Vec<f64>) -> Result<()> {
        validate_mesh(&mesh)?;
        self.mesh = Some(mesh);
        self.state = SolverState::Configured;
        Ok(())
    }

    pub fn set_scheme(&mut self, name: &str) -> Result<()> {
        self.scheme = name.parse()?;
        Ok(())
    }

    pub fn set_backend(&mut self, name: &str) -> Result<()> {
        if !BACKEND_NAMES.contains(&name) {
            return Err(Error::config(format!(
                "unknown NLP backend '{name}' (available: {})",
                BACKEND_NAMES.join(", ")
            )));
        }
        self.backend = name.to_string();
        Ok(())
    }

    /// Stores a backend option. Values are checked when the backend is
    /// built at the start of [`solve`](Self::solve).
    pub fn set_option(&mut self, key: &str, value: &str) {
        self.options.insert(key.to_string(), value.to_string());
    }

    fn transcription(&self) -> Result<Transcription<'p>> {
        let mesh = self.mesh.clone().ok_or_else(|| {
            Error::Solve("the mesh must be configured before building guesses or solving".into())
        })?;
        Transcription::new(self.problem, mesh, self.scheme)
    }

    /// A guess at the midpoint of every bounded variable.
    ///
    /// Variables bounded on one side sit on that bound, unbounded ones at 0.
    pub fn create_initial_guess_from_bounds(&self) -> Result<Iterate> {
        let transcription = self.transcription()?;
        let (lower, upper) = transcription.variable_bounds();
        let x: Vec<f64> = lower
            .iter()
            .zip(upper)
            .map(|(&lo, &hi)| match (lo.is_finite(), hi.is_finite()) {
                (true, true) => 0.5 * lo + 0.5 * hi,
                (true, false) => lo,
                (false, true) => hi,
                (false, false) => 0.0,
            })
            .collect();
        transcription.expand(&x)
    }

    /// A uniformly random guess within the bounds, reproducible from `seed`.
    ///
    /// Unbounded variables are drawn from [-1, 1]; one-sided ones from a
    /// unit interval next to their bound.
    pub fn create_random_iterate_within_bounds(&self, seed: u64) -> Result<Iterate> {
        let transcription = self.transcription()?;
        let (lower, upper) = transcription.variable_bounds();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let x: Vec<f64> = lower
            .iter()
            .zip(upper)
            .map(|(&lo, &hi)| {
                let (lo, hi) = match (lo.is_finite(), hi.is_finite()) {
                    (true, true) => (lo, hi),
                    (true, false) => (lo, lo + 1.0),
                    (false, true) => (hi - 1.0, hi),
                    (false, false) => (-1.0, 1.0),
                };
                // blend the ends so wide finite ranges cannot overflow
                let u: f64 = rng.gen();
                (lo * (1.0 - u) + hi * u).clamp(lo, hi)
            })
            .collect();
        transcription.expand(&x)
    }

    /// Solves from `guess`.
    ///
    /// A backend that stops without converging still yields a
    /// [`Solution`], with `success == false`.
    ///
    /// # Errors
    ///
    /// [`Error::Solve`] before a mesh is configured; configuration errors
    /// from the options or the guess; errors raised by user functions.
    pub fn solve(&mut self, guess: &Iterate) -> Result<Solution> {
        if self.mesh.is_none() {
            return Err(Error::Solve(
                "solve() called before the mesh was configured".into(),
            ));
        }
        self.state = SolverState::Solving;
        let result = self.run(guess);
        self.state = match &result {
            Ok(solution) if solution.success => SolverState::Solved,
            _ => SolverState::Failed,
        };
        result
    }

    fn run(&self, guess: &Iterate) -> Result<Solution> {
        let backend = backend::create(&self.backend, &self.options)?;
        let transcription = self.transcription()?;
        let mut x = transcription.flatten(guess)?;
        info!(
            "solving with {} mesh points, {} scheme, {} backend: {} variables, {} constraints",
            transcription.num_points(),
            transcription.scheme(),
            backend.name(),
            transcription.num_variables(),
            transcription.num_constraints()
        );

        let started = Instant::now();
        let nlp = TranscribedNlp::new(&transcription, &x)?;
        let report = backend.solve(&nlp, &mut x)?;
        let solve_time = started.elapsed();

        if report.success {
            info!(
                "{}: {} iterations, objective {:.6e}, {:.3?}",
                report.status, report.inner_iterations, report.objective, solve_time
            );
        } else {
            warn!(
                "solve failed: {} after {} iterations (violation {:.3e})",
                report.status, report.inner_iterations, report.constraint_violation
            );
        }

        Ok(Solution {
            iterate: transcription.expand(&x)?,
            success: report.success,
            status: report.status,
            num_iterations: report.inner_iterations,
            stats: SolveStats {
                objective: report.objective,
                constraint_violation: report.constraint_violation,
                outer_iterations: report.outer_iterations,
                inner_iterations: report.inner_iterations,
                solve_time,
                cost_terms: transcription.evaluate_cost_terms(&x)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Bounds;
    use crate::variables::Variable;

    fn problem() -> Problem {
        let mut problem = Problem::new();
        problem
            .add_control("u", Bounds::new(-2.0, 4.0), Bounds::unset(), Bounds::unset())
            .unwrap();
        problem
            .add_control("v", Bounds::new(0.0, f64::INFINITY), Bounds::unset(), Bounds::unset())
            .unwrap();
        problem.add_parameter("k", Bounds::unset()).unwrap();
        problem.initialize().unwrap();
        problem
    }

    #[test]
    fn new_requires_initialized_problem() {
        let problem = Problem::new();
        assert!(matches!(Solver::new(&problem), Err(Error::NotInitialized(_))));
    }

    #[test]
    fn configuration_is_validated_eagerly() {
        let problem = problem();
        let mut solver = Solver::new(&problem).unwrap();
        assert_eq!(solver.state(), SolverState::Unconfigured);
        assert!(matches!(solver.set_num_mesh_points(1), Err(Error::Configuration(_))));
        assert!(matches!(solver.set_scheme("unknown_scheme"), Err(Error::Configuration(_))));
        assert!(matches!(solver.set_backend("snopt"), Err(Error::Configuration(_))));
        solver.set_num_mesh_points(4).unwrap();
        assert_eq!(solver.state(), SolverState::Configured);
        assert_eq!(solver.num_mesh_points(), Some(4));
    }

    #[test]
    fn solve_before_configuration_fails() {
        let problem = problem();
        let mut solver = Solver::new(&problem).unwrap();
        let guess = problem.create_iterate().unwrap();
        assert!(matches!(solver.solve(&guess), Err(Error::Solve(_))));
        assert!(matches!(
            solver.create_initial_guess_from_bounds(),
            Err(Error::Solve(_))
        ));
    }

    #[test]
    fn guess_from_bounds_is_deterministic() {
        let problem = problem();
        let mut solver = Solver::new(&problem).unwrap();
        solver.set_num_mesh_points(3).unwrap();
        let a = solver.create_initial_guess_from_bounds().unwrap();
        let b = solver.create_initial_guess_from_bounds().unwrap();
        assert_eq!(a, b);
        let controls = a.variable(Variable::Controls);
        assert_eq!(controls[(0, 1)], 1.0);
        assert_eq!(controls[(1, 1)], 0.0);
        assert_eq!(a.variable(Variable::Parameters)[(0, 0)], 0.0);
        assert_eq!(a.final_time(), 1.0);
    }

    #[test]
    fn random_iterate_respects_bounds_and_seed() {
        let problem = problem();
        let mut solver = Solver::new(&problem).unwrap();
        solver.set_num_mesh_points(5).unwrap();
        let a = solver.create_random_iterate_within_bounds(7).unwrap();
        let b = solver.create_random_iterate_within_bounds(7).unwrap();
        assert_eq!(a, b);
        let controls = a.variable(Variable::Controls);
        for k in 0..5 {
            assert!((-2.0..=4.0).contains(&controls[(0, k)]));
            assert!((0.0..=1.0).contains(&controls[(1, k)]));
        }
        assert!((-1.0..=1.0).contains(&a.variable(Variable::Parameters)[(0, 0)]));
    }

    #[test]
    fn guesses_handle_the_widest_finite_bounds() {
        let mut problem = Problem::new();
        problem
            .add_control("wide", Bounds::new(-1e308, 1e308), Bounds::unset(), Bounds::unset())
            .unwrap();
        problem
            .add_control("high", Bounds::new(1e308, f64::MAX), Bounds::unset(), Bounds::unset())
            .unwrap();
        problem.initialize().unwrap();
        let mut solver = Solver::new(&problem).unwrap();
        solver.set_num_mesh_points(3).unwrap();

        let mid = solver.create_initial_guess_from_bounds().unwrap();
        assert_eq!(mid.variable(Variable::Controls)[(0, 0)], 0.0);
        assert!(mid.variable(Variable::Controls)[(1, 0)].is_finite());

        let random = solver.create_random_iterate_within_bounds(1).unwrap();
        let controls = random.variable(Variable::Controls);
        for k in 0..3 {
            assert!((-1e308..=1e308).contains(&controls[(0, k)]));
            assert!((1e308..=f64::MAX).contains(&controls[(1, k)]));
        }
    }
}
