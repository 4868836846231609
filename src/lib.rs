//! Direct collocation of multibody optimal control problems.
//!
//! A [`Problem`] declares states, controls, multipliers and parameters with
//! their bounds, plus cost, dynamics and path-constraint functions written
//! against the traced scalar [`Var`]. A [`Solver`] transcribes it onto a
//! time mesh into a sparse nonlinear program, records each function once to
//! get exact sparse derivatives, and hands the result to an NLP backend.

extern crate nalgebra as na;

pub mod adapter;
pub mod autodiff;
pub mod backend;
pub mod bounds;
pub mod error;
pub mod function;
pub mod iterate;
pub mod nlp;
pub mod problem;
pub mod solver;
pub mod sparsity;
mod trace;
pub mod transcription;
pub mod variables;

pub use autodiff::{Scalar, Tape, Var};
pub use backend::{BackendReport, NlpBackend, PanocBackend, PanocOptions};
pub use bounds::{Bounds, BoundsTable};
pub use error::{Error, Result, UserError};
pub use function::{
    BoundaryConstraints, ContinuousInput, Dynamics, EndpointCost, EndpointInput, IntegralCost,
    PathConstraints,
};
pub use iterate::{Iterate, Solution, SolveStats, VariableBlock};
pub use nlp::{Nlp, TranscribedNlp};
pub use problem::{DerivedCounts, Problem, ENDPOINT_COST_NAME, INTEGRAL_COST_NAME};
pub use solver::{Solver, SolverState};
pub use sparsity::SparsityPattern;
pub use transcription::{Layout, Scheme, Transcription};
pub use variables::{StateInfo, StateType, Variable, VariableCatalog};
