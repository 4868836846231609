use crate::error::{Error, Result};

/// A lower/upper bound pair. Unset bounds are stored as NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub lower: f64,
    pub upper: f64,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            lower: f64::NAN,
            upper: f64::NAN,
        }
    }
}

impl Bounds {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    /// Bounds that pin a variable to a single value.
    pub fn fixed(value: f64) -> Self {
        Self::new(value, value)
    }

    /// Bounds with no limits on either side.
    pub fn unset() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        !self.lower.is_nan() && !self.upper.is_nan()
    }

    /// Lower bound with NaN mapped to -inf.
    pub fn lower_or_inf(&self) -> f64 {
        if self.lower.is_nan() {
            f64::NEG_INFINITY
        } else {
            self.lower
        }
    }

    /// Upper bound with NaN mapped to +inf.
    pub fn upper_or_inf(&self) -> f64 {
        if self.upper.is_nan() {
            f64::INFINITY
        } else {
            self.upper
        }
    }

    /// Returns these bounds if set, otherwise `fallback`.
    pub fn or(self, fallback: Bounds) -> Bounds {
        if self.is_set() {
            self
        } else {
            fallback
        }
    }

    /// Tightens `self` so it is at least as strict as `outer`.
    ///
    /// Unset boundary bounds stay unset; they fall back to `outer` later.
    pub(crate) fn clip_to(self, outer: &Bounds) -> Bounds {
        if !self.is_set() || !outer.is_set() {
            return self;
        }
        Bounds::new(self.lower.max(outer.lower), self.upper.min(outer.upper))
    }

    /// Fails if the bounds are set but inverted.
    pub(crate) fn validate(&self, what: &str) -> Result<()> {
        if self.is_set() && self.lower > self.upper {
            return Err(Error::config(format!(
                "{what}: lower bound {} exceeds upper bound {}",
                self.lower, self.upper
            )));
        }
        Ok(())
    }

    /// Distance of `value` outside the bounds, zero inside.
    pub(crate) fn violation(&self, value: f64) -> f64 {
        let lo = self.lower_or_inf();
        let hi = self.upper_or_inf();
        if value < lo {
            lo - value
        } else if value > hi {
            value - hi
        } else {
            0.0
        }
    }
}

impl From<(f64, f64)> for Bounds {
    fn from((lower, upper): (f64, f64)) -> Self {
        Self::new(lower, upper)
    }
}

impl From<[f64; 2]> for Bounds {
    fn from([lower, upper]: [f64; 2]) -> Self {
        Self::new(lower, upper)
    }
}

/// The three bound sets attached to a time-varying variable.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundsTable {
    /// Bounds at interior mesh points.
    pub general: Bounds,
    /// Bounds at the first mesh point.
    pub initial: Bounds,
    /// Bounds at the last mesh point.
    pub r#final: Bounds,
}

impl BoundsTable {
    /// Builds a table, clipping the boundary bounds to the general bounds.
    pub fn new(general: Bounds, initial: Bounds, r#final: Bounds) -> Self {
        Self {
            general,
            initial: initial.clip_to(&general),
            r#final: r#final.clip_to(&general),
        }
    }

    /// Bounds that apply at mesh point `index` of `num_points`.
    ///
    /// Unset boundary bounds fall back to the general bounds.
    pub fn at(&self, index: usize, num_points: usize) -> Bounds {
        if index == 0 {
            self.initial.or(self.general)
        } else if index + 1 == num_points {
            self.r#final.or(self.general)
        } else {
            self.general
        }
    }

    pub(crate) fn validate(&self, what: &str) -> Result<()> {
        self.general.validate(what)?;
        self.initial.validate(&format!("{what} (initial)"))?;
        self.r#final.validate(&format!("{what} (final)"))
    }
}
