use log::debug;

use crate::bounds::{Bounds, BoundsTable};
use crate::error::{Error, Result};
use crate::function::{BoundaryConstraints, Dynamics, EndpointCost, IntegralCost, PathConstraints};
use crate::iterate::Iterate;
use crate::variables::{
    ControlInfo, MultiplierInfo, ParameterInfo, StateInfo, StateType, Variable, VariableCatalog,
};

/// Name of the term replaced by [`Problem::set_integral_cost_function`].
pub const INTEGRAL_COST_NAME: &str = "integral_cost";
/// Name of the term replaced by [`Problem::set_endpoint_cost_function`].
pub const ENDPOINT_COST_NAME: &str = "endpoint_cost";

/// Counts frozen by [`Problem::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedCounts {
    pub num_coordinates: usize,
    pub num_speeds: usize,
    pub num_auxiliary_states: usize,
}

/// An optimal control problem: variables, bounds, and the user functions.
///
/// Build it with the `add_*`/`set_*` methods, then call [`initialize`]
/// once. After that the problem is read-only and can be handed to a
/// [`Solver`](crate::Solver), which borrows it for its whole lifetime.
///
/// The time window defaults to a fixed `[0, 1]` until
/// [`set_time_bounds`](Problem::set_time_bounds) is called.
///
/// The objective is the sum of every cost term. Terms have unique names;
/// the `set_*_cost_function` methods manage the terms named
/// [`INTEGRAL_COST_NAME`] and [`ENDPOINT_COST_NAME`].
///
/// [`initialize`]: Problem::initialize
pub struct Problem {
    catalog: VariableCatalog,
    time_initial_bounds: Bounds,
    time_final_bounds: Bounds,
    integral_costs: Vec<(String, Box<dyn IntegralCost>)>,
    endpoint_costs: Vec<(String, Box<dyn EndpointCost>)>,
    dynamics: Option<Box<dyn Dynamics>>,
    path_constraints: Option<Box<dyn PathConstraints>>,
    path_constraint_bounds: Vec<Bounds>,
    boundary_constraints: Option<Box<dyn BoundaryConstraints>>,
    boundary_constraint_bounds: Vec<Bounds>,
    counts: Option<DerivedCounts>,
}

impl Default for Problem {
    fn default() -> Self {
        Self::new()
    }
}

impl Problem {
    pub fn new() -> Self {
        Self {
            catalog: VariableCatalog::default(),
            time_initial_bounds: Bounds::fixed(0.0),
            time_final_bounds: Bounds::fixed(1.0),
            integral_costs: Vec::new(),
            endpoint_costs: Vec::new(),
            dynamics: None,
            path_constraints: None,
            path_constraint_bounds: Vec::new(),
            boundary_constraints: None,
            boundary_constraint_bounds: Vec::new(),
            counts: None,
        }
    }

    fn ensure_building(&self, what: &str) -> Result<()> {
        if self.counts.is_some() {
            return Err(Error::config(format!(
                "cannot {what} after initialize() has been called"
            )));
        }
        Ok(())
    }

    fn ensure_unique(&self, category: Variable, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::config(format!("{category} names must not be empty")));
        }
        if self.catalog.contains(category, name) {
            return Err(Error::config(format!(
                "duplicate {category} name '{name}'"
            )));
        }
        Ok(())
    }

    fn ensure_unique_cost(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::config("cost names must not be empty"));
        }
        let taken = self.integral_costs.iter().any(|(n, _)| n == name)
            || self.endpoint_costs.iter().any(|(n, _)| n == name);
        if taken {
            return Err(Error::config(format!("duplicate cost name '{name}'")));
        }
        Ok(())
    }

    pub fn set_time_bounds(&mut self, initial: Bounds, r#final: Bounds) -> Result<()> {
        self.ensure_building("set time bounds")?;
        self.time_initial_bounds = initial;
        self.time_final_bounds = r#final;
        Ok(())
    }

    /// Adds a differential state. Coordinates and speeds must come before
    /// any auxiliary state.
    pub fn add_state(
        &mut self,
        name: &str,
        state_type: StateType,
        bounds: Bounds,
        initial_bounds: Bounds,
        final_bounds: Bounds,
    ) -> Result<()> {
        self.ensure_building("add a state")?;
        self.ensure_unique(Variable::States, name)?;
        if state_type != StateType::Auxiliary
            && self.catalog.count_states(StateType::Auxiliary) > 0
        {
            return Err(Error::config(format!(
                "state '{name}' is a {state_type:?} but auxiliary states were already added; \
                 coordinates and speeds must precede auxiliary states"
            )));
        }
        self.catalog.states.push(StateInfo {
            name: name.to_string(),
            state_type,
            bounds: BoundsTable::new(bounds, initial_bounds, final_bounds),
        });
        Ok(())
    }

    pub fn add_control(
        &mut self,
        name: &str,
        bounds: Bounds,
        initial_bounds: Bounds,
        final_bounds: Bounds,
    ) -> Result<()> {
        self.ensure_building("add a control")?;
        self.ensure_unique(Variable::Controls, name)?;
        self.catalog.controls.push(ControlInfo {
            name: name.to_string(),
            bounds: BoundsTable::new(bounds, initial_bounds, final_bounds),
        });
        Ok(())
    }

    /// Adds a time-varying algebraic multiplier.
    ///
    /// Multipliers are decision variables handed to every continuous
    /// function; no constraint equations are generated for them.
    pub fn add_multiplier(
        &mut self,
        name: &str,
        bounds: Bounds,
        initial_bounds: Bounds,
        final_bounds: Bounds,
    ) -> Result<()> {
        self.ensure_building("add a multiplier")?;
        self.ensure_unique(Variable::Multipliers, name)?;
        self.catalog.multipliers.push(MultiplierInfo {
            name: name.to_string(),
            bounds: BoundsTable::new(bounds, initial_bounds, final_bounds),
        });
        Ok(())
    }

    /// Adds a time-invariant decision variable.
    pub fn add_parameter(&mut self, name: &str, bounds: Bounds) -> Result<()> {
        self.ensure_building("add a parameter")?;
        self.ensure_unique(Variable::Parameters, name)?;
        self.catalog.parameters.push(ParameterInfo {
            name: name.to_string(),
            bounds,
        });
        Ok(())
    }

    /// Sets the [`INTEGRAL_COST_NAME`] term, replacing an earlier one.
    pub fn set_integral_cost_function(&mut self, f: impl IntegralCost + 'static) -> Result<()> {
        self.ensure_building("set the integral cost")?;
        self.integral_costs.retain(|(n, _)| n != INTEGRAL_COST_NAME);
        self.add_integral_cost(INTEGRAL_COST_NAME, f)
    }

    /// Sets the [`ENDPOINT_COST_NAME`] term, replacing an earlier one.
    pub fn set_endpoint_cost_function(&mut self, f: impl EndpointCost + 'static) -> Result<()> {
        self.ensure_building("set the endpoint cost")?;
        self.endpoint_costs.retain(|(n, _)| n != ENDPOINT_COST_NAME);
        self.add_endpoint_cost(ENDPOINT_COST_NAME, f)
    }

    /// Adds a named integral cost term to the objective.
    pub fn add_integral_cost(&mut self, name: &str, f: impl IntegralCost + 'static) -> Result<()> {
        self.ensure_building("add a cost")?;
        self.ensure_unique_cost(name)?;
        self.integral_costs.push((name.to_string(), Box::new(f)));
        Ok(())
    }

    /// Adds a named endpoint cost term to the objective.
    pub fn add_endpoint_cost(&mut self, name: &str, f: impl EndpointCost + 'static) -> Result<()> {
        self.ensure_building("add a cost")?;
        self.ensure_unique_cost(name)?;
        self.endpoint_costs.push((name.to_string(), Box::new(f)));
        Ok(())
    }

    pub fn set_dynamics_function(&mut self, f: impl Dynamics + 'static) -> Result<()> {
        self.ensure_building("set the dynamics")?;
        self.dynamics = Some(Box::new(f));
        Ok(())
    }

    pub fn set_path_constraints_function(
        &mut self,
        f: impl PathConstraints + 'static,
    ) -> Result<()> {
        self.ensure_building("set the path constraints")?;
        self.path_constraints = Some(Box::new(f));
        Ok(())
    }

    pub fn set_boundary_constraints_function(
        &mut self,
        f: impl BoundaryConstraints + 'static,
    ) -> Result<()> {
        self.ensure_building("set the boundary constraints")?;
        self.boundary_constraints = Some(Box::new(f));
        Ok(())
    }

    /// Validates the problem and freezes it.
    ///
    /// Calling this again on an initialized problem does nothing.
    ///
    /// # Errors
    ///
    /// Fails if any set bound has `lower > upper`, if the time window is
    /// empty, or if states exist without a dynamics function.
    pub fn initialize(&mut self) -> Result<()> {
        if self.counts.is_some() {
            return Ok(());
        }

        self.time_initial_bounds.validate("initial time")?;
        self.time_final_bounds.validate("final time")?;
        if self.time_initial_bounds.lower_or_inf() > self.time_final_bounds.upper_or_inf() {
            return Err(Error::config(
                "initial time lower bound exceeds final time upper bound",
            ));
        }
        for info in &self.catalog.states {
            info.bounds.validate(&format!("state '{}'", info.name))?;
        }
        for info in &self.catalog.controls {
            info.bounds.validate(&format!("control '{}'", info.name))?;
        }
        for info in &self.catalog.multipliers {
            info.bounds.validate(&format!("multiplier '{}'", info.name))?;
        }
        for info in &self.catalog.parameters {
            info.bounds.validate(&format!("parameter '{}'", info.name))?;
        }
        if !self.catalog.states.is_empty() && self.dynamics.is_none() {
            return Err(Error::config(
                "the problem has states but no dynamics function",
            ));
        }

        let path_constraint_bounds = match &self.path_constraints {
            Some(f) => f.bounds(),
            None => Vec::new(),
        };
        for (i, b) in path_constraint_bounds.iter().enumerate() {
            b.validate(&format!("path constraint {i}"))?;
        }
        let boundary_constraint_bounds = match &self.boundary_constraints {
            Some(f) => f.bounds(),
            None => Vec::new(),
        };
        for (i, b) in boundary_constraint_bounds.iter().enumerate() {
            b.validate(&format!("boundary constraint {i}"))?;
        }
        self.path_constraint_bounds = path_constraint_bounds;
        self.boundary_constraint_bounds = boundary_constraint_bounds;

        let counts = DerivedCounts {
            num_coordinates: self.catalog.count_states(StateType::Coordinate),
            num_speeds: self.catalog.count_states(StateType::Speed),
            num_auxiliary_states: self.catalog.count_states(StateType::Auxiliary),
        };
        debug!(
            "initialized problem: {} states ({counts:?}), {} controls, {} multipliers, \
             {} parameters, {} cost terms, {} path and {} boundary constraints",
            self.catalog.states.len(),
            self.catalog.controls.len(),
            self.catalog.multipliers.len(),
            self.catalog.parameters.len(),
            self.integral_costs.len() + self.endpoint_costs.len(),
            self.path_constraint_bounds.len(),
            self.boundary_constraint_bounds.len(),
        );
        self.counts = Some(counts);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.counts.is_some()
    }

    fn ready(&self, query: &'static str) -> Result<&DerivedCounts> {
        self.counts.as_ref().ok_or(Error::NotInitialized(query))
    }

    pub fn derived_counts(&self) -> Result<DerivedCounts> {
        self.ready("derived_counts").copied()
    }

    pub fn catalog(&self) -> Result<&VariableCatalog> {
        self.ready("catalog")?;
        Ok(&self.catalog)
    }

    pub fn num_states(&self) -> Result<usize> {
        self.ready("num_states")?;
        Ok(self.catalog.states.len())
    }

    pub fn num_controls(&self) -> Result<usize> {
        self.ready("num_controls")?;
        Ok(self.catalog.controls.len())
    }

    pub fn num_multipliers(&self) -> Result<usize> {
        self.ready("num_multipliers")?;
        Ok(self.catalog.multipliers.len())
    }

    pub fn num_parameters(&self) -> Result<usize> {
        self.ready("num_parameters")?;
        Ok(self.catalog.parameters.len())
    }

    pub fn num_path_constraints(&self) -> Result<usize> {
        self.ready("num_path_constraints")?;
        Ok(self.path_constraint_bounds.len())
    }

    pub fn num_boundary_constraints(&self) -> Result<usize> {
        self.ready("num_boundary_constraints")?;
        Ok(self.boundary_constraint_bounds.len())
    }

    pub fn num_coordinates(&self) -> Result<usize> {
        Ok(self.ready("num_coordinates")?.num_coordinates)
    }

    pub fn num_speeds(&self) -> Result<usize> {
        Ok(self.ready("num_speeds")?.num_speeds)
    }

    pub fn num_auxiliary_states(&self) -> Result<usize> {
        Ok(self.ready("num_auxiliary_states")?.num_auxiliary_states)
    }

    pub fn state_infos(&self) -> Result<&[StateInfo]> {
        self.ready("state_infos")?;
        Ok(&self.catalog.states)
    }

    pub fn control_infos(&self) -> Result<&[ControlInfo]> {
        self.ready("control_infos")?;
        Ok(&self.catalog.controls)
    }

    pub fn multiplier_infos(&self) -> Result<&[MultiplierInfo]> {
        self.ready("multiplier_infos")?;
        Ok(&self.catalog.multipliers)
    }

    pub fn parameter_infos(&self) -> Result<&[ParameterInfo]> {
        self.ready("parameter_infos")?;
        Ok(&self.catalog.parameters)
    }

    pub fn time_initial_bounds(&self) -> Result<Bounds> {
        self.ready("time_initial_bounds")?;
        Ok(self.time_initial_bounds)
    }

    pub fn time_final_bounds(&self) -> Result<Bounds> {
        self.ready("time_final_bounds")?;
        Ok(self.time_final_bounds)
    }

    pub fn path_constraint_bounds(&self) -> Result<&[Bounds]> {
        self.ready("path_constraint_bounds")?;
        Ok(&self.path_constraint_bounds)
    }

    pub fn boundary_constraint_bounds(&self) -> Result<&[Bounds]> {
        self.ready("boundary_constraint_bounds")?;
        Ok(&self.boundary_constraint_bounds)
    }

    /// The [`INTEGRAL_COST_NAME`] term.
    pub fn integral_cost(&self) -> Result<Option<&dyn IntegralCost>> {
        Ok(self
            .integral_costs()?
            .into_iter()
            .find_map(|(n, f)| (n == INTEGRAL_COST_NAME).then_some(f)))
    }

    /// The [`ENDPOINT_COST_NAME`] term.
    pub fn endpoint_cost(&self) -> Result<Option<&dyn EndpointCost>> {
        Ok(self
            .endpoint_costs()?
            .into_iter()
            .find_map(|(n, f)| (n == ENDPOINT_COST_NAME).then_some(f)))
    }

    /// Every integral cost term in the order it was added.
    pub fn integral_costs(&self) -> Result<Vec<(&str, &dyn IntegralCost)>> {
        self.ready("integral_costs")?;
        Ok(self
            .integral_costs
            .iter()
            .map(|(n, f)| (n.as_str(), &**f))
            .collect())
    }

    /// Every endpoint cost term in the order it was added.
    pub fn endpoint_costs(&self) -> Result<Vec<(&str, &dyn EndpointCost)>> {
        self.ready("endpoint_costs")?;
        Ok(self
            .endpoint_costs
            .iter()
            .map(|(n, f)| (n.as_str(), &**f))
            .collect())
    }

    pub fn dynamics(&self) -> Result<Option<&dyn Dynamics>> {
        self.ready("dynamics")?;
        Ok(self.dynamics.as_deref())
    }

    pub fn path_constraints(&self) -> Result<Option<&dyn PathConstraints>> {
        self.ready("path_constraints")?;
        Ok(self.path_constraints.as_deref())
    }

    pub fn boundary_constraints(&self) -> Result<Option<&dyn BoundaryConstraints>> {
        self.ready("boundary_constraints")?;
        Ok(self.boundary_constraints.as_deref())
    }

    /// An empty iterate with every name list populated.
    pub fn create_iterate(&self) -> Result<Iterate> {
        self.ready("create_iterate")?;
        Ok(Iterate::empty(&self.catalog))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Var;
    use crate::error::UserError;
    use crate::function::{ContinuousInput, EndpointInput};

    struct Passthrough;

    impl Dynamics for Passthrough {
        fn calc<'t>(
            &self,
            input: &ContinuousInput<'_, 't>,
            derivatives: &mut [Var<'t>],
        ) -> Result<(), UserError> {
            derivatives.copy_from_slice(&input.controls[..derivatives.len()]);
            Ok(())
        }
    }

    fn unset() -> Bounds {
        Bounds::unset()
    }

    fn one_state_problem() -> Problem {
        let mut problem = Problem::new();
        problem
            .add_state("x", StateType::Coordinate, Bounds::new(-1.0, 1.0), unset(), unset())
            .unwrap();
        problem
            .add_control("u", Bounds::new(-1.0, 1.0), unset(), unset())
            .unwrap();
        problem.set_dynamics_function(Passthrough).unwrap();
        problem
    }

    #[test]
    fn queries_require_initialize() {
        let mut problem = one_state_problem();
        assert!(matches!(problem.num_states(), Err(Error::NotInitialized(_))));
        assert!(matches!(problem.state_infos(), Err(Error::NotInitialized(_))));
        problem.initialize().unwrap();
        assert_eq!(problem.num_states().unwrap(), 1);
        assert_eq!(problem.num_controls().unwrap(), 1);
    }

    #[test]
    fn builder_is_frozen_after_initialize() {
        let mut problem = one_state_problem();
        problem.initialize().unwrap();
        let err = problem
            .add_state("y", StateType::Speed, unset(), unset(), unset())
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        let err = problem.add_control("v", unset(), unset(), unset()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(problem.set_dynamics_function(Passthrough).is_err());
    }

    #[test]
    fn initialize_is_idempotent() {
        let mut problem = one_state_problem();
        problem.initialize().unwrap();
        let first = problem.derived_counts().unwrap();
        problem.initialize().unwrap();
        assert_eq!(problem.derived_counts().unwrap(), first);
        assert_eq!(first.num_coordinates, 1);
        assert_eq!(first.num_speeds, 0);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut problem = one_state_problem();
        let err = problem
            .add_state("x", StateType::Speed, unset(), unset(), unset())
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        // The same name in another category is fine.
        problem.add_control("x", unset(), unset(), unset()).unwrap();
    }

    #[test]
    fn auxiliary_states_come_last() {
        let mut problem = Problem::new();
        problem
            .add_state("a", StateType::Auxiliary, unset(), unset(), unset())
            .unwrap();
        let err = problem
            .add_state("q", StateType::Coordinate, unset(), unset(), unset())
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn inverted_bounds_fail_at_initialize() {
        let mut problem = Problem::new();
        problem
            .add_state("x", StateType::Coordinate, Bounds::new(1.0, -1.0), unset(), unset())
            .unwrap();
        problem.set_dynamics_function(Passthrough).unwrap();
        assert!(matches!(problem.initialize(), Err(Error::Configuration(_))));
        assert!(!problem.is_initialized());
    }

    #[test]
    fn states_without_dynamics_fail_at_initialize() {
        let mut problem = Problem::new();
        problem
            .add_state("x", StateType::Coordinate, unset(), unset(), unset())
            .unwrap();
        assert!(matches!(problem.initialize(), Err(Error::Configuration(_))));
    }

    #[test]
    fn created_iterate_carries_names() {
        let mut problem = one_state_problem();
        problem.add_parameter("mass", Bounds::new(0.5, 2.0)).unwrap();
        problem.initialize().unwrap();
        let iterate = problem.create_iterate().unwrap();
        assert_eq!(iterate.names(Variable::States), ["x".to_string()]);
        assert_eq!(iterate.names(Variable::Controls), ["u".to_string()]);
        assert_eq!(iterate.names(Variable::Parameters), ["mass".to_string()]);
    }

    struct Zero;

    impl EndpointCost for Zero {
        fn calc<'t>(&self, _input: &EndpointInput<'_, 't>) -> Result<Var<'t>, UserError> {
            Ok(Var::constant(0.0))
        }
    }

    struct NoBounds;

    impl BoundaryConstraints for NoBounds {
        fn bounds(&self) -> Vec<Bounds> {
            vec![Bounds::new(2.0, 1.0)]
        }

        fn calc<'t>(
            &self,
            input: &EndpointInput<'_, 't>,
            values: &mut [Var<'t>],
        ) -> Result<(), UserError> {
            values[0] = input.final_time;
            Ok(())
        }
    }

    #[test]
    fn cost_terms_have_unique_names() {
        let mut problem = one_state_problem();
        problem.set_endpoint_cost_function(Zero).unwrap();
        // replacing the default term keeps a single entry
        problem.set_endpoint_cost_function(Zero).unwrap();
        problem.add_endpoint_cost("extra", Zero).unwrap();
        let err = problem.add_endpoint_cost("extra", Zero).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(problem.add_endpoint_cost("", Zero).is_err());
        problem.initialize().unwrap();

        let names: Vec<&str> = problem
            .endpoint_costs()
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, [ENDPOINT_COST_NAME, "extra"]);
        assert!(problem.endpoint_cost().unwrap().is_some());
        assert!(problem.integral_cost().unwrap().is_none());
    }

    #[test]
    fn boundary_constraint_bounds_are_validated() {
        let mut problem = one_state_problem();
        problem.set_boundary_constraints_function(NoBounds).unwrap();
        assert!(matches!(problem.num_boundary_constraints(), Err(Error::NotInitialized(_))));
        assert!(matches!(problem.initialize(), Err(Error::Configuration(_))));
    }
}
