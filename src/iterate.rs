use std::collections::BTreeMap;
use std::ops::Deref;
use std::time::Duration;

use na::{DMatrix, DVector};
use ndarray::Array1;
use ninterp::interpolator::Extrapolate;
use ninterp::prelude::{Interp1DOwned, Interpolator};
use ninterp::strategy::Linear;

use crate::error::{Error, Result};
use crate::variables::{Variable, VariableCatalog};

/// Numeric values of every variable category.
///
/// Time-varying categories hold one column per time point; time categories
/// and parameters hold a single column.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableBlock(BTreeMap<Variable, DMatrix<f64>>);

impl VariableBlock {
    fn zeros(rows: impl Fn(Variable) -> usize, num_times: usize) -> Self {
        Self(
            Variable::ALL
                .into_iter()
                .map(|v| {
                    let cols = if v.is_time_varying() { num_times } else { 1 };
                    (v, DMatrix::zeros(rows(v), cols))
                })
                .collect(),
        )
    }

    pub fn get(&self, category: Variable) -> &DMatrix<f64> {
        &self.0[&category]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Variable, &DMatrix<f64>)> {
        self.0.iter().map(|(&v, m)| (v, m))
    }
}

/// A labeled trajectory: values per category, the time grid, and row names.
#[derive(Debug, Clone, PartialEq)]
pub struct Iterate {
    variables: VariableBlock,
    times: DVector<f64>,
    names: BTreeMap<Variable, Vec<String>>,
}

impl Iterate {
    /// An iterate with no time points.
    pub(crate) fn empty(catalog: &VariableCatalog) -> Self {
        Self::zeros(catalog, DVector::zeros(0))
    }

    /// An all-zero iterate on the given time grid.
    pub(crate) fn zeros(catalog: &VariableCatalog, times: DVector<f64>) -> Self {
        let names: BTreeMap<Variable, Vec<String>> = Variable::ALL
            .into_iter()
            .map(|v| (v, catalog.names(v)))
            .collect();
        Self {
            variables: VariableBlock::zeros(|v| catalog.count(v), times.len()),
            times,
            names,
        }
    }

    pub fn variables(&self) -> &VariableBlock {
        &self.variables
    }

    pub fn variable(&self, category: Variable) -> &DMatrix<f64> {
        self.variables.get(category)
    }

    pub fn times(&self) -> &DVector<f64> {
        &self.times
    }

    pub fn num_times(&self) -> usize {
        self.times.len()
    }

    pub fn names(&self, category: Variable) -> &[String] {
        self.names.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn initial_time(&self) -> f64 {
        self.variable(Variable::InitialTime)[(0, 0)]
    }

    pub fn final_time(&self) -> f64 {
        self.variable(Variable::FinalTime)[(0, 0)]
    }

    /// Value of the named row of a category at time point `index`.
    pub fn value(&self, category: Variable, name: &str, index: usize) -> Option<f64> {
        let row = self.names(category).iter().position(|n| n == name)?;
        self.variable(category).get((row, index)).copied()
    }

    /// Replaces the time grid and resizes time-varying categories to match,
    /// zero-filling new columns.
    pub fn set_times(&mut self, times: DVector<f64>) {
        let n = times.len();
        for (v, m) in self.variables.0.iter_mut() {
            if v.is_time_varying() && m.ncols() != n {
                let rows = m.nrows();
                m.resize_mut(rows, n, 0.0);
            }
        }
        self.times = times;
    }

    /// Replaces the values of one category.
    ///
    /// # Errors
    ///
    /// The shape must be (number of names × number of time points) for
    /// time-varying categories and (rows × 1) otherwise.
    pub fn set_variable(&mut self, category: Variable, values: DMatrix<f64>) -> Result<()> {
        let rows = self.variable(category).nrows();
        let cols = if category.is_time_varying() {
            self.times.len()
        } else {
            1
        };
        if values.shape() != (rows, cols) {
            return Err(Error::config(format!(
                "{category} values have shape {:?}, expected {:?}",
                values.shape(),
                (rows, cols)
            )));
        }
        self.variables.0.insert(category, values);
        Ok(())
    }

    pub fn set_initial_time(&mut self, t: f64) {
        if let Some(m) = self.variables.0.get_mut(&Variable::InitialTime) {
            m[(0, 0)] = t;
        }
    }

    pub fn set_final_time(&mut self, t: f64) {
        if let Some(m) = self.variables.0.get_mut(&Variable::FinalTime) {
            m[(0, 0)] = t;
        }
    }

    /// Interpolates every time-varying category onto `new_times`.
    ///
    /// Linear between known points and constant outside them. Parameters
    /// and the time variables are copied.
    pub fn resample(&self, new_times: &DVector<f64>) -> Result<Iterate> {
        if new_times.is_empty() {
            return Err(Error::config("cannot resample onto an empty time grid"));
        }
        if new_times.iter().any(|t| !t.is_finite()) {
            return Err(Error::config("resample times must be finite"));
        }
        if new_times.as_slice().windows(2).any(|w| w[1] < w[0]) {
            return Err(Error::config("resample times must be non-decreasing"));
        }
        let old = self.times.as_slice();
        let has_rows = self
            .variables
            .iter()
            .any(|(v, m)| v.is_time_varying() && m.nrows() > 0);
        if old.is_empty() && has_rows {
            return Err(Error::config("cannot resample an iterate with no time points"));
        }
        if old.windows(2).any(|w| w[1] <= w[0]) || old.iter().any(|t| !t.is_finite()) {
            return Err(Error::config(
                "iterate times must be finite and strictly increasing to resample",
            ));
        }

        let mut out = self.clone();
        out.times = new_times.clone();
        for (v, m) in out.variables.0.iter_mut() {
            if !v.is_time_varying() {
                continue;
            }
            let src = self.variable(*v);
            let mut resampled = DMatrix::zeros(src.nrows(), new_times.len());
            for i in 0..src.nrows() {
                let row = RowInterp::new(old, src.row(i).iter().copied())?;
                for (k, &t) in new_times.iter().enumerate() {
                    resampled[(i, k)] = row.at(t)?;
                }
            }
            *m = resampled;
        }
        Ok(out)
    }
}

/// One row of a trajectory as a function of time, clamped at both ends.
enum RowInterp {
    Constant(f64),
    Linear(Interp1DOwned<f64, Linear>),
}

impl RowInterp {
    fn new(times: &[f64], values: impl Iterator<Item = f64>) -> Result<Self> {
        let values: Array1<f64> = values.collect();
        if times.len() == 1 {
            return Ok(Self::Constant(values[0]));
        }
        let interp = Interp1DOwned::new(
            Array1::from_vec(times.to_vec()),
            values,
            Linear,
            Extrapolate::Clamp,
        )
        .map_err(|e| Error::config(format!("cannot interpolate iterate: {e}")))?;
        Ok(Self::Linear(interp))
    }

    fn at(&self, t: f64) -> Result<f64> {
        match self {
            Self::Constant(value) => Ok(*value),
            Self::Linear(interp) => interp
                .interpolate(&[t])
                .map_err(|e| Error::config(format!("cannot interpolate iterate at {t}: {e}"))),
        }
    }
}

/// Figures reported by the backend for one solve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveStats {
    pub objective: f64,
    /// Largest distance of a constraint value from its bounds.
    pub constraint_violation: f64,
    pub outer_iterations: usize,
    pub inner_iterations: usize,
    pub solve_time: Duration,
    /// Value of each named cost term at the solution.
    pub cost_terms: Vec<(String, f64)>,
}

/// An optimized iterate plus the outcome of the solve that produced it.
#[derive(Debug, Clone)]
pub struct Solution {
    pub iterate: Iterate,
    pub success: bool,
    pub status: String,
    pub num_iterations: usize,
    pub stats: SolveStats,
}

impl Deref for Solution {
    type Target = Iterate;

    fn deref(&self) -> &Iterate {
        &self.iterate
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::bounds::{Bounds, BoundsTable};
    use crate::variables::{ParameterInfo, StateInfo, StateType};

    fn catalog() -> VariableCatalog {
        let mut catalog = VariableCatalog::default();
        catalog.states.push(StateInfo {
            name: "x".into(),
            state_type: StateType::Coordinate,
            bounds: BoundsTable::default(),
        });
        catalog.parameters.push(ParameterInfo {
            name: "k".into(),
            bounds: Bounds::unset(),
        });
        catalog
    }

    fn ramp() -> Iterate {
        let mut it = Iterate::zeros(&catalog(), DVector::from_vec(vec![0.0, 1.0, 2.0]));
        it.set_variable(Variable::States, DMatrix::from_row_slice(1, 3, &[0.0, 10.0, 30.0]))
            .unwrap();
        it.set_variable(Variable::Parameters, DMatrix::from_element(1, 1, 7.0))
            .unwrap();
        it
    }

    #[test]
    fn zeros_has_expected_shapes() {
        let it = ramp();
        assert_eq!(it.variable(Variable::States).shape(), (1, 3));
        assert_eq!(it.variable(Variable::Controls).shape(), (0, 3));
        assert_eq!(it.variable(Variable::Derivatives).shape(), (0, 3));
        assert_eq!(it.variable(Variable::Parameters).shape(), (1, 1));
        assert_eq!(it.names(Variable::States), ["x".to_string()]);
        assert_eq!(it.value(Variable::States, "x", 2), Some(30.0));
    }

    #[test]
    fn set_variable_checks_shape() {
        let mut it = ramp();
        let err = it
            .set_variable(Variable::States, DMatrix::zeros(1, 2))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn resample_onto_same_times_is_identity() {
        let it = ramp();
        let same = it.resample(it.times()).unwrap();
        assert_eq!(same, it);
    }

    #[test]
    fn resample_interpolates_and_holds_ends() {
        let it = ramp();
        let out = it
            .resample(&DVector::from_vec(vec![-1.0, 0.5, 1.5, 5.0]))
            .unwrap();
        let x = out.variable(Variable::States);
        assert_relative_eq!(x[(0, 0)], 0.0);
        assert_relative_eq!(x[(0, 1)], 5.0);
        assert_relative_eq!(x[(0, 2)], 20.0);
        assert_relative_eq!(x[(0, 3)], 30.0);
        assert_eq!(out.variable(Variable::Parameters)[(0, 0)], 7.0);
        assert_eq!(out.num_times(), 4);
    }

    #[test]
    fn resample_rejects_bad_grids() {
        let it = ramp();
        assert!(it.resample(&DVector::zeros(0)).is_err());
        assert!(it.resample(&DVector::from_vec(vec![1.0, 0.0])).is_err());
        let empty = Iterate::empty(&catalog());
        assert!(empty.resample(&DVector::from_vec(vec![0.0])).is_err());
    }

    #[test]
    fn resample_rejects_non_finite_times() {
        let it = ramp();
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = it
                .resample(&DVector::from_vec(vec![0.0, bad]))
                .unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{err}");
        }
    }

    #[test]
    fn resample_single_point_holds_its_value() {
        let mut it = Iterate::zeros(&catalog(), DVector::from_vec(vec![0.5]));
        it.set_variable(Variable::States, DMatrix::from_element(1, 1, 4.0))
            .unwrap();
        let out = it.resample(&DVector::from_vec(vec![0.0, 1.0, 2.0])).unwrap();
        assert_eq!(out.variable(Variable::States), &DMatrix::from_element(1, 3, 4.0));
    }

    #[test]
    fn set_times_resizes_time_varying_blocks() {
        let mut it = Iterate::empty(&catalog());
        it.set_times(DVector::from_vec(vec![0.0, 0.5]));
        assert_eq!(it.variable(Variable::States).shape(), (1, 2));
        assert_eq!(it.variable(Variable::Parameters).shape(), (1, 1));
    }
}
