//! User-supplied functions evaluated by the transcription.
//!
//! Each function is written against [`Var`] and is executed once while its
//! trace is recorded; derivatives come from replaying that trace. Values
//! can still be read with [`Var::value`], but branching on them changes
//! nothing after recording.

use crate::autodiff::Var;
use crate::bounds::Bounds;
use crate::error::UserError;

/// Variables at one mesh point.
#[derive(Debug, Clone, Copy)]
pub struct ContinuousInput<'a, 't> {
    pub time: Var<'t>,
    pub states: &'a [Var<'t>],
    pub controls: &'a [Var<'t>],
    pub multipliers: &'a [Var<'t>],
    pub derivatives: &'a [Var<'t>],
    pub parameters: &'a [Var<'t>],
}

/// Variables at the two ends of the trajectory.
#[derive(Debug, Clone, Copy)]
pub struct EndpointInput<'a, 't> {
    pub initial_time: Var<'t>,
    pub initial_states: &'a [Var<'t>],
    pub initial_controls: &'a [Var<'t>],
    pub initial_multipliers: &'a [Var<'t>],
    pub final_time: Var<'t>,
    pub final_states: &'a [Var<'t>],
    pub final_controls: &'a [Var<'t>],
    pub final_multipliers: &'a [Var<'t>],
    pub parameters: &'a [Var<'t>],
}

/// Integrand of the running cost.
pub trait IntegralCost {
    fn calc<'t>(&self, input: &ContinuousInput<'_, 't>) -> Result<Var<'t>, UserError>;
}

/// Cost on the initial and final points.
pub trait EndpointCost {
    fn calc<'t>(&self, input: &EndpointInput<'_, 't>) -> Result<Var<'t>, UserError>;
}

/// Explicit state dynamics: writes one derivative per state.
///
/// States arrive in declaration order: coordinates, speeds, then auxiliary
/// states.
pub trait Dynamics {
    fn calc<'t>(
        &self,
        input: &ContinuousInput<'_, 't>,
        derivatives: &mut [Var<'t>],
    ) -> Result<(), UserError>;
}

/// Path constraints enforced at every mesh point.
pub trait PathConstraints {
    /// Bounds on each output; the length is the number of outputs.
    fn bounds(&self) -> Vec<Bounds>;

    fn calc<'t>(
        &self,
        input: &ContinuousInput<'_, 't>,
        values: &mut [Var<'t>],
    ) -> Result<(), UserError>;
}

/// Constraints on the initial and final points, evaluated once per solve.
pub trait BoundaryConstraints {
    /// Bounds on each output; the length is the number of outputs.
    fn bounds(&self) -> Vec<Bounds>;

    fn calc<'t>(
        &self,
        input: &EndpointInput<'_, 't>,
        values: &mut [Var<'t>],
    ) -> Result<(), UserError>;
}
