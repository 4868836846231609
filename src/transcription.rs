//! Direct collocation of a [`Problem`] on a time mesh.
//!
//! The decision vector is laid out as
//!
//! ```text
//! [t0, tf, states(p0), .., states(pN-1), controls(p0), .., controls(pN-1),
//!  multipliers(p0), .., multipliers(pN-1), parameters]
//! ```
//!
//! and the constraint vector holds every dynamics defect, interval by
//! interval, followed by the path constraints, point by point, and then
//! the boundary constraints.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use na::DVector;

use crate::adapter::Traceable;
use crate::autodiff::Var;
use crate::bounds::Bounds;
use crate::error::{Error, Result};
use crate::function::{
    BoundaryConstraints, ContinuousInput, Dynamics, EndpointCost, EndpointInput, IntegralCost,
    PathConstraints,
};
use crate::iterate::Iterate;
use crate::problem::Problem;
use crate::variables::{Variable, VariableCatalog};

/// How the dynamics are integrated across a mesh interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    /// Average of the derivatives at both ends.
    #[default]
    Trapezoidal,
    /// Derivative at the start of the interval.
    Euler,
}

impl Scheme {
    pub fn name(self) -> &'static str {
        match self {
            Scheme::Trapezoidal => "trapezoidal",
            Scheme::Euler => "euler",
        }
    }

    /// Weights of the start and end derivatives.
    fn weights(self) -> (f64, f64) {
        match self {
            Scheme::Trapezoidal => (0.5, 0.5),
            Scheme::Euler => (1.0, 0.0),
        }
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trapezoidal" => Ok(Scheme::Trapezoidal),
            "euler" => Ok(Scheme::Euler),
            _ => Err(Error::config(format!(
                "unknown transcription scheme '{s}' (expected 'trapezoidal' or 'euler')"
            ))),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `n` evenly spaced points on [0, 1].
pub fn uniform_mesh(n: usize) -> Result<Vec<f64>> {
    if n < 2 {
        return Err(Error::config(format!(
            "a mesh needs at least 2 points, got {n}"
        )));
    }
    let last = (n - 1) as f64;
    Ok((0..n).map(|k| k as f64 / last).collect())
}

/// Checks that `mesh` is a strictly increasing grid from 0 to 1.
pub fn validate_mesh(mesh: &[f64]) -> Result<()> {
    if mesh.len() < 2 {
        return Err(Error::config(format!(
            "a mesh needs at least 2 points, got {}",
            mesh.len()
        )));
    }
    if mesh[0] != 0.0 || mesh[mesh.len() - 1] != 1.0 {
        return Err(Error::config("the mesh must start at 0 and end at 1"));
    }
    if mesh.windows(2).any(|w| !(w[1] > w[0])) {
        return Err(Error::config("mesh points must be strictly increasing"));
    }
    Ok(())
}

/// Positions of each variable category in the decision vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    num_points: usize,
    num_states: usize,
    num_controls: usize,
    num_multipliers: usize,
    num_parameters: usize,
}

impl Layout {
    pub fn new(catalog: &VariableCatalog, num_points: usize) -> Self {
        Self {
            num_points,
            num_states: catalog.count(Variable::States),
            num_controls: catalog.count(Variable::Controls),
            num_multipliers: catalog.count(Variable::Multipliers),
            num_parameters: catalog.count(Variable::Parameters),
        }
    }

    pub fn num_points(&self) -> usize {
        self.num_points
    }

    /// Rows a category occupies at each point.
    pub fn rows(&self, category: Variable) -> usize {
        match category {
            Variable::InitialTime | Variable::FinalTime => 1,
            Variable::States => self.num_states,
            Variable::Controls => self.num_controls,
            Variable::Multipliers => self.num_multipliers,
            Variable::Derivatives => 0,
            Variable::Parameters => self.num_parameters,
        }
    }

    fn width(&self, category: Variable) -> usize {
        if category.is_time_varying() {
            self.rows(category) * self.num_points
        } else {
            self.rows(category)
        }
    }

    pub fn offset(&self, category: Variable) -> usize {
        Variable::ALL
            .into_iter()
            .take_while(|&v| v < category)
            .map(|v| self.width(v))
            .sum()
    }

    pub fn range(&self, category: Variable) -> Range<usize> {
        let start = self.offset(category);
        start..start + self.width(category)
    }

    /// Index of row `row` of `category` at mesh point `point`.
    ///
    /// `point` is ignored for categories that do not vary in time.
    pub fn index(&self, category: Variable, row: usize, point: usize) -> usize {
        let point = if category.is_time_varying() { point } else { 0 };
        self.offset(category) + point * self.rows(category) + row
    }

    /// Total length of the decision vector.
    pub fn len(&self) -> usize {
        self.offset(Variable::Parameters) + self.num_parameters
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Slices of a decision vector, one per category.
struct Split<'a, T> {
    initial_time: T,
    final_time: T,
    states: &'a [T],
    controls: &'a [T],
    multipliers: &'a [T],
    parameters: &'a [T],
}

/// Values of one mesh point in a point-major block.
fn column<T>(values: &[T], rows: usize, point: usize) -> &[T] {
    &values[point * rows..(point + 1) * rows]
}

/// A problem discretized on a mesh with a scheme.
pub struct Transcription<'p> {
    catalog: &'p VariableCatalog,
    integral_costs: Vec<(&'p str, &'p dyn IntegralCost)>,
    endpoint_costs: Vec<(&'p str, &'p dyn EndpointCost)>,
    dynamics: Option<&'p dyn Dynamics>,
    path_constraints: Option<&'p dyn PathConstraints>,
    path_bounds: &'p [Bounds],
    boundary_constraints: Option<&'p dyn BoundaryConstraints>,
    boundary_bounds: &'p [Bounds],
    scheme: Scheme,
    mesh: Vec<f64>,
    layout: Layout,
    variable_lower: Vec<f64>,
    variable_upper: Vec<f64>,
    constraint_lower: Vec<f64>,
    constraint_upper: Vec<f64>,
}

impl<'p> Transcription<'p> {
    /// Transcribes an initialized problem onto a normalized mesh.
    pub fn new(problem: &'p Problem, mesh: Vec<f64>, scheme: Scheme) -> Result<Self> {
        validate_mesh(&mesh)?;
        let catalog = problem.catalog()?;
        let layout = Layout::new(catalog, mesh.len());
        let mut transcription = Self {
            catalog,
            integral_costs: problem.integral_costs()?,
            endpoint_costs: problem.endpoint_costs()?,
            dynamics: problem.dynamics()?,
            path_constraints: problem.path_constraints()?,
            path_bounds: problem.path_constraint_bounds()?,
            boundary_constraints: problem.boundary_constraints()?,
            boundary_bounds: problem.boundary_constraint_bounds()?,
            scheme,
            mesh,
            layout,
            variable_lower: Vec::new(),
            variable_upper: Vec::new(),
            constraint_lower: Vec::new(),
            constraint_upper: Vec::new(),
        };
        transcription.expand_variable_bounds(
            problem.time_initial_bounds()?,
            problem.time_final_bounds()?,
        );
        transcription.expand_constraint_bounds();
        Ok(transcription)
    }

    fn expand_variable_bounds(&mut self, initial_time: Bounds, final_time: Bounds) {
        let n = self.layout.len();
        let mut bounds = vec![Bounds::unset(); n];
        bounds[self.layout.index(Variable::InitialTime, 0, 0)] = initial_time;
        bounds[self.layout.index(Variable::FinalTime, 0, 0)] = final_time;
        let num_points = self.num_points();
        for category in [Variable::States, Variable::Controls, Variable::Multipliers] {
            for point in 0..num_points {
                for row in 0..self.layout.rows(category) {
                    bounds[self.layout.index(category, row, point)] =
                        self.catalog.bounds_at(category, row, point, num_points);
                }
            }
        }
        for row in 0..self.layout.rows(Variable::Parameters) {
            bounds[self.layout.index(Variable::Parameters, row, 0)] =
                self.catalog.bounds_at(Variable::Parameters, row, 0, 1);
        }
        self.variable_lower = bounds.iter().map(Bounds::lower_or_inf).collect();
        self.variable_upper = bounds.iter().map(Bounds::upper_or_inf).collect();
    }

    fn expand_constraint_bounds(&mut self) {
        let defects = self.num_defects();
        let mut lower = vec![0.0; defects];
        let mut upper = vec![0.0; defects];
        for _ in 0..self.num_points() {
            lower.extend(self.path_bounds.iter().map(Bounds::lower_or_inf));
            upper.extend(self.path_bounds.iter().map(Bounds::upper_or_inf));
        }
        lower.extend(self.boundary_bounds.iter().map(Bounds::lower_or_inf));
        upper.extend(self.boundary_bounds.iter().map(Bounds::upper_or_inf));
        self.constraint_lower = lower;
        self.constraint_upper = upper;
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn mesh(&self) -> &[f64] {
        &self.mesh
    }

    pub fn num_points(&self) -> usize {
        self.mesh.len()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn num_variables(&self) -> usize {
        self.layout.len()
    }

    fn num_defects(&self) -> usize {
        (self.num_points() - 1) * self.layout.rows(Variable::States)
    }

    pub fn num_constraints(&self) -> usize {
        let path = self.num_points() * self.path_bounds.len();
        self.num_defects() + path + self.boundary_bounds.len()
    }

    pub fn variable_bounds(&self) -> (&[f64], &[f64]) {
        (&self.variable_lower, &self.variable_upper)
    }

    pub fn constraint_bounds(&self) -> (&[f64], &[f64]) {
        (&self.constraint_lower, &self.constraint_upper)
    }

    /// Absolute times of the mesh points for decision vector `x`.
    pub fn times(&self, x: &[f64]) -> DVector<f64> {
        let (t0, tf) = (x[0], x[1]);
        DVector::from_iterator(
            self.mesh.len(),
            self.mesh.iter().map(|&m| t0 + (tf - t0) * m),
        )
    }

    fn split<'a, T: Copy>(&self, x: &'a [T]) -> Split<'a, T> {
        let l = &self.layout;
        Split {
            initial_time: x[l.offset(Variable::InitialTime)],
            final_time: x[l.offset(Variable::FinalTime)],
            states: &x[l.range(Variable::States)],
            controls: &x[l.range(Variable::Controls)],
            multipliers: &x[l.range(Variable::Multipliers)],
            parameters: &x[l.range(Variable::Parameters)],
        }
    }

    fn at_point<'a, 't>(
        &self,
        split: &Split<'a, Var<'t>>,
        time: Var<'t>,
        point: usize,
    ) -> ContinuousInput<'a, 't> {
        let l = &self.layout;
        ContinuousInput {
            time,
            states: column(split.states, l.rows(Variable::States), point),
            controls: column(split.controls, l.rows(Variable::Controls), point),
            multipliers: column(split.multipliers, l.rows(Variable::Multipliers), point),
            derivatives: &[],
            parameters: split.parameters,
        }
    }

    fn point_times<'t>(&self, split: &Split<'_, Var<'t>>) -> (Vec<Var<'t>>, Var<'t>) {
        let duration = split.final_time - split.initial_time;
        let times = self
            .mesh
            .iter()
            .map(|&m| split.initial_time + duration * m)
            .collect();
        (times, duration)
    }

    fn endpoint_input<'a, 't>(&self, split: &Split<'a, Var<'t>>) -> EndpointInput<'a, 't> {
        let first = self.at_point(split, split.initial_time, 0);
        let last = self.at_point(split, split.final_time, self.num_points() - 1);
        EndpointInput {
            initial_time: split.initial_time,
            initial_states: first.states,
            initial_controls: first.controls,
            initial_multipliers: first.multipliers,
            final_time: split.final_time,
            final_states: last.states,
            final_controls: last.controls,
            final_multipliers: last.multipliers,
            parameters: split.parameters,
        }
    }

    /// Names of the cost terms: endpoint terms, then integral terms.
    pub fn cost_names(&self) -> Vec<&str> {
        let endpoint = self.endpoint_costs.iter().map(|&(name, _)| name);
        let integral = self.integral_costs.iter().map(|&(name, _)| name);
        endpoint.chain(integral).collect()
    }

    /// Value of every cost term, in the order of [`cost_names`].
    ///
    /// Integral terms use trapezoidal quadrature on the mesh.
    ///
    /// [`cost_names`]: Transcription::cost_names
    pub fn cost_terms<'t>(&self, x: &[Var<'t>]) -> Result<Vec<Var<'t>>> {
        Error::check_len("decision vector", self.num_variables(), x.len())?;
        let split = self.split(x);
        let mut terms = Vec::with_capacity(self.endpoint_costs.len() + self.integral_costs.len());

        if !self.endpoint_costs.is_empty() {
            let input = self.endpoint_input(&split);
            for (_, endpoint) in &self.endpoint_costs {
                terms.push(endpoint.calc(&input)?);
            }
        }

        if !self.integral_costs.is_empty() {
            let (times, duration) = self.point_times(&split);
            for (_, integrand) in &self.integral_costs {
                let values = times
                    .iter()
                    .enumerate()
                    .map(|(k, &t)| integrand.calc(&self.at_point(&split, t, k)))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut integral = Var::constant(0.0);
                for (k, w) in self.mesh.windows(2).enumerate() {
                    let h = duration * (w[1] - w[0]);
                    integral += h * (values[k] + values[k + 1]) * 0.5;
                }
                terms.push(integral);
            }
        }
        Ok(terms)
    }

    /// Sum of every cost term.
    pub fn objective<'t>(&self, x: &[Var<'t>]) -> Result<Var<'t>> {
        let mut cost = Var::constant(0.0);
        for term in self.cost_terms(x)? {
            cost += term;
        }
        Ok(cost)
    }

    /// Defects for every interval, path constraints for every point, then
    /// boundary constraints.
    pub fn constraints<'t>(&self, x: &[Var<'t>]) -> Result<Vec<Var<'t>>> {
        Error::check_len("decision vector", self.num_variables(), x.len())?;
        let split = self.split(x);
        let num_points = self.num_points();
        let ns = self.layout.rows(Variable::States);
        let (times, duration) = self.point_times(&split);
        let mut g = Vec::with_capacity(self.num_constraints());

        if ns > 0 {
            let dynamics = self
                .dynamics
                .ok_or_else(|| Error::config("the problem has states but no dynamics function"))?;
            let mut derivatives = vec![Var::constant(0.0); ns * num_points];
            for (k, chunk) in derivatives.chunks_mut(ns).enumerate() {
                dynamics.calc(&self.at_point(&split, times[k], k), chunk)?;
            }
            let (w0, w1) = self.scheme.weights();
            for (k, w) in self.mesh.windows(2).enumerate() {
                let h = duration * (w[1] - w[0]);
                let (now, next) = (k * ns, (k + 1) * ns);
                for i in 0..ns {
                    let mut slope = derivatives[now + i] * w0;
                    if w1 != 0.0 {
                        slope += derivatives[next + i] * w1;
                    }
                    g.push(split.states[next + i] - split.states[now + i] - h * slope);
                }
            }
        }

        if let Some(path) = self.path_constraints {
            let count = self.path_bounds.len();
            let mut values = vec![Var::constant(0.0); count];
            for (k, &t) in times.iter().enumerate() {
                values.fill(Var::constant(0.0));
                path.calc(&self.at_point(&split, t, k), &mut values)?;
                g.extend_from_slice(&values);
            }
        }

        if let Some(boundary) = self.boundary_constraints {
            let mut values = vec![Var::constant(0.0); self.boundary_bounds.len()];
            boundary.calc(&self.endpoint_input(&split), &mut values)?;
            g.extend_from_slice(&values);
        }
        Ok(g)
    }

    /// Objective and constraint values at `x`, without recording.
    pub fn evaluate(&self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
        let vars: Vec<Var<'_>> = x.iter().map(|&v| Var::constant(v)).collect();
        let objective = self.objective(&vars)?.value();
        let constraints = self.constraints(&vars)?.iter().map(Var::value).collect();
        Ok((objective, constraints))
    }

    /// Named cost term values at `x`, without recording.
    pub fn evaluate_cost_terms(&self, x: &[f64]) -> Result<Vec<(String, f64)>> {
        let vars: Vec<Var<'_>> = x.iter().map(|&v| Var::constant(v)).collect();
        let terms = self.cost_terms(&vars)?;
        Ok(self
            .cost_names()
            .into_iter()
            .zip(terms)
            .map(|(name, term)| (name.to_string(), term.value()))
            .collect())
    }

    /// Largest distance of a constraint value from its bounds.
    pub fn constraint_violation(&self, g: &[f64]) -> f64 {
        g.iter()
            .zip(self.constraint_lower.iter().zip(&self.constraint_upper))
            .map(|(&v, (&lo, &hi))| Bounds::new(lo, hi).violation(v))
            .fold(0.0, f64::max)
    }

    /// Flattens an iterate into a decision vector.
    ///
    /// An iterate on a different time grid is resampled onto the mesh
    /// first.
    pub fn flatten(&self, iterate: &Iterate) -> Result<Vec<f64>> {
        for category in [
            Variable::States,
            Variable::Controls,
            Variable::Multipliers,
            Variable::Parameters,
        ] {
            let expected = self.catalog.names(category);
            if iterate.names(category) != expected.as_slice() {
                return Err(Error::config(format!(
                    "iterate {category} {:?} do not match the problem's {:?}",
                    iterate.names(category),
                    expected
                )));
            }
        }

        let (t0, tf) = (iterate.initial_time(), iterate.final_time());
        let mesh_times = DVector::from_iterator(
            self.mesh.len(),
            self.mesh.iter().map(|&m| t0 + (tf - t0) * m),
        );
        let on_mesh = iterate.num_times() == mesh_times.len()
            && iterate
                .times()
                .iter()
                .zip(mesh_times.iter())
                .all(|(a, b)| (a - b).abs() <= 1e-12 * (1.0 + b.abs()));
        let resampled;
        let iterate = if on_mesh {
            iterate
        } else {
            resampled = iterate.resample(&mesh_times)?;
            &resampled
        };

        let l = &self.layout;
        let mut x = vec![0.0; l.len()];
        x[l.offset(Variable::InitialTime)] = t0;
        x[l.offset(Variable::FinalTime)] = tf;
        for category in [Variable::States, Variable::Controls, Variable::Multipliers] {
            let values = iterate.variable(category);
            for point in 0..l.num_points() {
                for row in 0..l.rows(category) {
                    x[l.index(category, row, point)] = values[(row, point)];
                }
            }
        }
        let parameters = iterate.variable(Variable::Parameters);
        for row in 0..l.rows(Variable::Parameters) {
            x[l.index(Variable::Parameters, row, 0)] = parameters[(row, 0)];
        }
        Ok(x)
    }

    /// Rebuilds a labeled iterate from a decision vector.
    pub fn expand(&self, x: &[f64]) -> Result<Iterate> {
        Error::check_len("decision vector", self.num_variables(), x.len())?;
        let l = &self.layout;
        let mut iterate = Iterate::zeros(self.catalog, self.times(x));
        iterate.set_initial_time(x[l.offset(Variable::InitialTime)]);
        iterate.set_final_time(x[l.offset(Variable::FinalTime)]);
        for category in [Variable::States, Variable::Controls, Variable::Multipliers] {
            let values = na::DMatrix::from_fn(l.rows(category), l.num_points(), |row, point| {
                x[l.index(category, row, point)]
            });
            iterate.set_variable(category, values)?;
        }
        let parameters = na::DMatrix::from_fn(l.rows(Variable::Parameters), 1, |row, _| {
            x[l.index(Variable::Parameters, row, 0)]
        });
        iterate.set_variable(Variable::Parameters, parameters)?;
        Ok(iterate)
    }
}

/// The transcribed objective as a traceable function of the decision vector.
pub(crate) struct ObjectiveFunction<'a, 'p>(pub(crate) &'a Transcription<'p>);

impl Traceable for ObjectiveFunction<'_, '_> {
    fn num_inputs(&self) -> usize {
        self.0.num_variables()
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn eval<'t>(&self, x: &[Var<'t>]) -> Result<Vec<Var<'t>>> {
        Ok(vec![self.0.objective(x)?])
    }
}

pub(crate) struct ConstraintsFunction<'a, 'p>(pub(crate) &'a Transcription<'p>);

impl Traceable for ConstraintsFunction<'_, '_> {
    fn num_inputs(&self) -> usize {
        self.0.num_variables()
    }

    fn num_outputs(&self) -> usize {
        self.0.num_constraints()
    }

    fn eval<'t>(&self, x: &[Var<'t>]) -> Result<Vec<Var<'t>>> {
        self.0.constraints(x)
    }
}

/// `σ f(x) + Σ λᵢ gᵢ(x)` over the inputs `[x, σ, λ]`.
pub(crate) struct LagrangianFunction<'a, 'p>(pub(crate) &'a Transcription<'p>);

impl Traceable for LagrangianFunction<'_, '_> {
    fn num_inputs(&self) -> usize {
        self.0.num_variables() + 1 + self.0.num_constraints()
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn eval<'t>(&self, z: &[Var<'t>]) -> Result<Vec<Var<'t>>> {
        Error::check_len("lagrangian input", self.num_inputs(), z.len())?;
        let n = self.0.num_variables();
        let (x, rest) = z.split_at(n);
        let (sigma, lambda) = (rest[0], &rest[1..]);
        let mut lagrangian = sigma * self.0.objective(x)?;
        for (&l, g) in lambda.iter().zip(self.0.constraints(x)?) {
            lagrangian += l * g;
        }
        Ok(vec![lagrangian])
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::error::UserError;
    use crate::variables::StateType;

    struct Integrator;

    impl Dynamics for Integrator {
        fn calc<'t>(
            &self,
            input: &ContinuousInput<'_, 't>,
            derivatives: &mut [Var<'t>],
        ) -> Result<(), UserError> {
            derivatives[0] = input.controls[0];
            Ok(())
        }
    }

    struct Effort;

    impl IntegralCost for Effort {
        fn calc<'t>(&self, input: &ContinuousInput<'_, 't>) -> Result<Var<'t>, UserError> {
            Ok(input.controls[0] * input.controls[0])
        }
    }

    struct MissTarget;

    impl EndpointCost for MissTarget {
        fn calc<'t>(&self, input: &EndpointInput<'_, 't>) -> Result<Var<'t>, UserError> {
            Ok((input.final_states[0] - 5.0).powi(2))
        }
    }

    struct Speed;

    impl PathConstraints for Speed {
        fn bounds(&self) -> Vec<Bounds> {
            vec![Bounds::new(-2.0, 2.0)]
        }

        fn calc<'t>(
            &self,
            input: &ContinuousInput<'_, 't>,
            values: &mut [Var<'t>],
        ) -> Result<(), UserError> {
            values[0] = input.controls[0] + input.parameters[0];
            Ok(())
        }
    }

    fn build(configure: impl FnOnce(&mut Problem)) -> Problem {
        let mut problem = Problem::new();
        problem
            .add_state(
                "x",
                StateType::Coordinate,
                Bounds::new(-10.0, 10.0),
                Bounds::fixed(0.0),
                Bounds::unset(),
            )
            .unwrap();
        problem
            .add_control("u", Bounds::new(-50.0, 50.0), Bounds::unset(), Bounds::unset())
            .unwrap();
        problem.add_parameter("p", Bounds::new(0.0, 1.0)).unwrap();
        problem.set_dynamics_function(Integrator).unwrap();
        problem.set_path_constraints_function(Speed).unwrap();
        configure(&mut problem);
        problem.initialize().unwrap();
        problem
    }

    fn problem() -> Problem {
        build(|problem| {
            problem.set_integral_cost_function(Effort).unwrap();
            problem.set_endpoint_cost_function(MissTarget).unwrap();
        })
    }

    fn uniform(problem: &Problem, n: usize) -> Transcription<'_> {
        Transcription::new(problem, uniform_mesh(n).unwrap(), Scheme::Trapezoidal).unwrap()
    }

    /// Holds the final state at 5 and keeps the start and end apart.
    struct Ends;

    impl BoundaryConstraints for Ends {
        fn bounds(&self) -> Vec<Bounds> {
            vec![Bounds::fixed(5.0), Bounds::new(1.0, f64::INFINITY)]
        }

        fn calc<'t>(
            &self,
            input: &EndpointInput<'_, 't>,
            values: &mut [Var<'t>],
        ) -> Result<(), UserError> {
            values[0] = input.final_states[0];
            values[1] = input.final_states[0] - input.initial_states[0];
            Ok(())
        }
    }

    struct Elapsed;

    impl EndpointCost for Elapsed {
        fn calc<'t>(&self, input: &EndpointInput<'_, 't>) -> Result<Var<'t>, UserError> {
            Ok(input.final_time - input.initial_time)
        }
    }

    struct ParameterCost;

    impl IntegralCost for ParameterCost {
        fn calc<'t>(&self, input: &ContinuousInput<'_, 't>) -> Result<Var<'t>, UserError> {
            Ok(input.parameters[0] * 2.0)
        }
    }

    #[test]
    fn scheme_names_parse() {
        assert_eq!("trapezoidal".parse::<Scheme>().unwrap(), Scheme::Trapezoidal);
        assert_eq!("euler".parse::<Scheme>().unwrap(), Scheme::Euler);
        assert!(matches!(
            "unknown_scheme".parse::<Scheme>(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn meshes_are_validated() {
        assert!(uniform_mesh(1).is_err());
        assert_eq!(uniform_mesh(3).unwrap(), vec![0.0, 0.5, 1.0]);
        assert!(validate_mesh(&[0.0, 0.3, 1.0]).is_ok());
        assert!(validate_mesh(&[0.0, 0.6, 0.4, 1.0]).is_err());
        assert!(validate_mesh(&[0.1, 1.0]).is_err());
    }

    #[test]
    fn layout_orders_categories() {
        let problem = problem();
        let t = uniform(&problem, 4);
        let l = t.layout();
        assert_eq!(l.offset(Variable::States), 2);
        assert_eq!(l.offset(Variable::Controls), 6);
        assert_eq!(l.offset(Variable::Multipliers), 10);
        assert_eq!(l.range(Variable::Derivatives), 10..10);
        assert_eq!(l.index(Variable::Parameters, 0, 3), 10);
        assert_eq!(t.num_variables(), 11);
        // 3 defects, then 4 path constraints
        assert_eq!(t.num_constraints(), 7);
    }

    #[test]
    fn bounds_expand_with_boundary_overrides() {
        let problem = problem();
        let t = uniform(&problem, 3);
        let (lo, hi) = t.variable_bounds();
        assert_eq!((lo[0], hi[0]), (0.0, 0.0));
        assert_eq!((lo[1], hi[1]), (1.0, 1.0));
        assert_eq!((lo[2], hi[2]), (0.0, 0.0));
        assert_eq!((lo[3], hi[3]), (-10.0, 10.0));
        assert_eq!((lo[4], hi[4]), (-10.0, 10.0));
        assert_eq!((lo[5], hi[5]), (-50.0, 50.0));
        let (glo, ghi) = t.constraint_bounds();
        assert_eq!(&glo[..2], &[0.0, 0.0]);
        assert_eq!(&ghi[2..], &[2.0, 2.0, 2.0]);
    }

    #[test]
    fn plain_evaluation_of_defects_and_cost() {
        let problem = problem();
        let t = Transcription::new(&problem, vec![0.0, 0.25, 1.0], Scheme::Trapezoidal).unwrap();
        // x = [0, 1, 3], u = [2, 2, 4], p = 0.5
        let x = [0.0, 2.0, 0.0, 1.0, 3.0, 2.0, 2.0, 4.0, 0.5];
        let (f, g) = t.evaluate(&x).unwrap();
        // h = [0.5, 1.5]
        assert_relative_eq!(g[0], 1.0 - 0.0 - 0.5 * 2.0);
        assert_relative_eq!(g[1], 3.0 - 1.0 - 1.5 * 3.0);
        assert_relative_eq!(g[2], 2.5);
        assert_relative_eq!(g[4], 4.5);
        let integral = 0.5 * (4.0 + 4.0) / 2.0 + 1.5 * (4.0 + 16.0) / 2.0;
        assert_relative_eq!(f, 4.0 + integral);
        assert_relative_eq!(t.constraint_violation(&g), 2.5);
    }

    #[test]
    fn euler_uses_the_start_of_each_interval() {
        let problem = problem();
        let t = Transcription::new(&problem, uniform_mesh(2).unwrap(), Scheme::Euler).unwrap();
        let x = [0.0, 1.0, 0.0, 1.0, 3.0, 7.0, 0.0];
        let (_, g) = t.evaluate(&x).unwrap();
        assert_relative_eq!(g[0], 1.0 - 3.0);
    }

    #[test]
    fn flatten_and_expand_agree() {
        let problem = problem();
        let t = uniform(&problem, 5);
        let x: Vec<f64> = (0..t.num_variables()).map(|i| i as f64 * 0.1).collect();
        let iterate = t.expand(&x).unwrap();
        assert_eq!(iterate.variable(Variable::States).ncols(), 5);
        assert_eq!(iterate.names(Variable::Controls), ["u".to_string()]);
        assert_eq!(t.flatten(&iterate).unwrap(), x);
    }

    #[test]
    fn flatten_resamples_coarse_guesses() {
        let problem = problem();
        let coarse = uniform(&problem, 2);
        let fine = uniform(&problem, 3);
        let guess = coarse.expand(&[0.0, 1.0, 0.0, 4.0, 1.0, 3.0, 0.2]).unwrap();
        let x = fine.flatten(&guess).unwrap();
        assert_eq!(&x[2..5], &[0.0, 2.0, 4.0]);
        assert_eq!(&x[5..8], &[1.0, 2.0, 3.0]);
        assert_eq!(x[8], 0.2);
    }

    #[test]
    fn flatten_rejects_foreign_names() {
        let problem = problem();
        let t = uniform(&problem, 2);
        let mut other = Problem::new();
        other.initialize().unwrap();
        let foreign = other.create_iterate().unwrap();
        assert!(matches!(t.flatten(&foreign), Err(Error::Configuration(_))));
    }

    #[test]
    fn boundary_constraints_follow_path_constraints() {
        let problem = build(|problem| {
            problem.set_boundary_constraints_function(Ends).unwrap();
        });
        assert_eq!(problem.num_boundary_constraints().unwrap(), 2);

        let t = Transcription::new(&problem, vec![0.0, 0.25, 1.0], Scheme::Trapezoidal).unwrap();
        // 2 defects, 3 path constraints, 2 boundary constraints
        assert_eq!(t.num_constraints(), 7);
        let (glo, ghi) = t.constraint_bounds();
        assert_eq!(&glo[5..], &[5.0, 1.0]);
        assert_eq!(ghi[5], 5.0);
        assert_eq!(ghi[6], f64::INFINITY);

        let x = [0.0, 2.0, 0.0, 1.0, 3.0, 2.0, 2.0, 4.0, 0.5];
        let (_, g) = t.evaluate(&x).unwrap();
        assert_eq!(g.len(), 7);
        assert_relative_eq!(g[5], 3.0);
        assert_relative_eq!(g[6], 3.0);
        assert_relative_eq!(t.constraint_violation(&g), 2.5);
    }

    #[test]
    fn named_cost_terms_are_summed() {
        let mut problem = Problem::new();
        problem
            .add_control("u", Bounds::new(-5.0, 5.0), Bounds::unset(), Bounds::unset())
            .unwrap();
        problem.add_parameter("p", Bounds::new(0.0, 1.0)).unwrap();
        problem.set_time_bounds(Bounds::fixed(0.0), Bounds::fixed(2.0)).unwrap();
        problem.set_integral_cost_function(Effort).unwrap();
        problem.add_integral_cost("parameter", ParameterCost).unwrap();
        problem.add_endpoint_cost("duration", Elapsed).unwrap();
        problem.initialize().unwrap();

        let t = uniform(&problem, 2);
        assert_eq!(t.cost_names(), ["duration", "integral_cost", "parameter"]);
        // t0, tf, u0, u1, p
        let x = [0.0, 2.0, 1.0, 3.0, 0.25];
        let terms = t.evaluate_cost_terms(&x).unwrap();
        assert_eq!(terms[0], ("duration".to_string(), 2.0));
        assert_relative_eq!(terms[1].1, 2.0 * (1.0 + 9.0) / 2.0);
        assert_relative_eq!(terms[2].1, 2.0 * 0.5);
        let (f, _) = t.evaluate(&x).unwrap();
        assert_relative_eq!(f, 2.0 + 10.0 + 1.0);
    }
}
