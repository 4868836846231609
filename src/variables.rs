use std::fmt;

use crate::bounds::{Bounds, BoundsTable};

/// Categories of decision variables, in decision-vector order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Variable {
    InitialTime,
    FinalTime,
    States,
    Controls,
    Multipliers,
    Derivatives,
    Parameters,
}

impl Variable {
    pub const ALL: [Variable; 7] = [
        Variable::InitialTime,
        Variable::FinalTime,
        Variable::States,
        Variable::Controls,
        Variable::Multipliers,
        Variable::Derivatives,
        Variable::Parameters,
    ];

    /// Whether the category has one column per mesh point.
    pub fn is_time_varying(self) -> bool {
        matches!(
            self,
            Variable::States | Variable::Controls | Variable::Multipliers | Variable::Derivatives
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Variable::InitialTime => "initial_time",
            Variable::FinalTime => "final_time",
            Variable::States => "states",
            Variable::Controls => "controls",
            Variable::Multipliers => "multipliers",
            Variable::Derivatives => "derivatives",
            Variable::Parameters => "parameters",
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classification of a state variable.
///
/// Coordinates and speeds must be added before auxiliary states so the
/// dynamics function sees them first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateType {
    Coordinate,
    Speed,
    Auxiliary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateInfo {
    pub name: String,
    pub state_type: StateType,
    pub bounds: BoundsTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlInfo {
    pub name: String,
    pub bounds: BoundsTable,
}

/// An algebraic multiplier; time-varying like a control.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiplierInfo {
    pub name: String,
    pub bounds: BoundsTable,
}

/// A time-invariant decision variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterInfo {
    pub name: String,
    pub bounds: Bounds,
}

/// Ordered registry of the variables a problem declares.
#[derive(Debug, Clone, Default)]
pub struct VariableCatalog {
    pub(crate) states: Vec<StateInfo>,
    pub(crate) controls: Vec<ControlInfo>,
    pub(crate) multipliers: Vec<MultiplierInfo>,
    pub(crate) parameters: Vec<ParameterInfo>,
}

impl VariableCatalog {
    pub fn states(&self) -> &[StateInfo] {
        &self.states
    }

    pub fn controls(&self) -> &[ControlInfo] {
        &self.controls
    }

    pub fn multipliers(&self) -> &[MultiplierInfo] {
        &self.multipliers
    }

    pub fn parameters(&self) -> &[ParameterInfo] {
        &self.parameters
    }

    /// Row names for a category. Time categories have a single unnamed row.
    pub fn names(&self, category: Variable) -> Vec<String> {
        match category {
            Variable::InitialTime | Variable::FinalTime => vec![category.name().to_string()],
            Variable::States => self.states.iter().map(|s| s.name.clone()).collect(),
            Variable::Controls => self.controls.iter().map(|c| c.name.clone()).collect(),
            Variable::Multipliers => self.multipliers.iter().map(|m| m.name.clone()).collect(),
            Variable::Derivatives => Vec::new(),
            Variable::Parameters => self.parameters.iter().map(|p| p.name.clone()).collect(),
        }
    }

    /// Number of rows a category occupies at each mesh point.
    pub fn count(&self, category: Variable) -> usize {
        match category {
            Variable::InitialTime | Variable::FinalTime => 1,
            Variable::States => self.states.len(),
            Variable::Controls => self.controls.len(),
            Variable::Multipliers => self.multipliers.len(),
            Variable::Derivatives => 0,
            Variable::Parameters => self.parameters.len(),
        }
    }

    pub(crate) fn contains(&self, category: Variable, name: &str) -> bool {
        match category {
            Variable::States => self.states.iter().any(|s| s.name == name),
            Variable::Controls => self.controls.iter().any(|c| c.name == name),
            Variable::Multipliers => self.multipliers.iter().any(|m| m.name == name),
            Variable::Parameters => self.parameters.iter().any(|p| p.name == name),
            _ => false,
        }
    }

    /// Bounds for row `row` of a time-varying category at a mesh point.
    pub(crate) fn bounds_at(
        &self,
        category: Variable,
        row: usize,
        index: usize,
        num_points: usize,
    ) -> Bounds {
        match category {
            Variable::States => self.states[row].bounds.at(index, num_points),
            Variable::Controls => self.controls[row].bounds.at(index, num_points),
            Variable::Multipliers => self.multipliers[row].bounds.at(index, num_points),
            Variable::Parameters => self.parameters[row].bounds,
            _ => Bounds::unset(),
        }
    }

    pub(crate) fn count_states(&self, state_type: StateType) -> usize {
        self.states
            .iter()
            .filter(|s| s.state_type == state_type)
            .count()
    }
}
