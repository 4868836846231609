//! Traced scalar type used to record user functions.
//!
//! A [`Var`] is either a plain number or a node on a [`Tape`]. Arithmetic on
//! traced vars appends one operation to the tape they belong to; arithmetic
//! on plain vars just computes. User functions are written once against
//! `Var` and run in either mode.
//!
//! A tape is recorded once and replayed at other points, so control flow
//! inside a recorded function must not depend on the values of traced vars.

use std::cell::RefCell;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use crate::trace::{Op, Output, Trace};

/// Append-only record of the operations performed on traced vars.
#[derive(Default)]
pub struct Tape {
    ops: RefCell<Vec<Op>>,
    inputs: RefCell<Vec<u32>>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an independent variable with the given value.
    pub fn input(&self, value: f64) -> Var<'_> {
        let index = self.push(Op::Input);
        self.inputs.borrow_mut().push(index);
        Var {
            tape: Some(self),
            index,
            value,
        }
    }

    pub fn len(&self) -> usize {
        self.ops.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, op: Op) -> u32 {
        let mut ops = self.ops.borrow_mut();
        let index = ops.len() as u32;
        ops.push(op);
        index
    }

    /// Closes the tape, marking `outputs` as the dependent variables.
    pub(crate) fn into_trace(self, outputs: Vec<Output>) -> Trace {
        Trace::new(self.ops.into_inner(), self.inputs.into_inner(), outputs)
    }
}

/// A scalar that may be recorded on a [`Tape`].
#[derive(Clone, Copy)]
pub struct Var<'t> {
    tape: Option<&'t Tape>,
    index: u32,
    value: f64,
}

impl<'t> Var<'t> {
    /// An untraced constant.
    pub fn constant(value: f64) -> Self {
        Self {
            tape: None,
            index: u32::MAX,
            value,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_traced(&self) -> bool {
        self.tape.is_some()
    }

    pub(crate) fn output(&self) -> Output {
        match self.tape {
            Some(_) => Output::Node(self.index),
            None => Output::Constant(self.value),
        }
    }

    fn unary(self, value: f64, op: impl FnOnce(u32) -> Op) -> Self {
        match self.tape {
            Some(tape) => Var {
                tape: Some(tape),
                index: tape.push(op(self.index)),
                value,
            },
            None => Var::constant(value),
        }
    }

    fn binary(
        self,
        rhs: Self,
        value: f64,
        both: impl FnOnce(u32, u32) -> Op,
        lhs_only: impl FnOnce(u32) -> Op,
        rhs_only: impl FnOnce(u32) -> Op,
    ) -> Self {
        let (tape, op) = match (self.tape, rhs.tape) {
            (Some(a), Some(b)) => {
                debug_assert!(std::ptr::eq(a, b), "vars from different tapes");
                (a, both(self.index, rhs.index))
            }
            (Some(a), None) => (a, lhs_only(self.index)),
            (None, Some(b)) => (b, rhs_only(rhs.index)),
            (None, None) => return Var::constant(value),
        };
        Var {
            tape: Some(tape),
            index: tape.push(op),
            value,
        }
    }

    pub fn sin(self) -> Self {
        self.unary(self.value.sin(), Op::Sin)
    }

    pub fn cos(self) -> Self {
        self.unary(self.value.cos(), Op::Cos)
    }

    pub fn tan(self) -> Self {
        self.unary(self.value.tan(), Op::Tan)
    }

    pub fn exp(self) -> Self {
        self.unary(self.value.exp(), Op::Exp)
    }

    pub fn ln(self) -> Self {
        self.unary(self.value.ln(), Op::Ln)
    }

    pub fn sqrt(self) -> Self {
        self.unary(self.value.sqrt(), Op::Sqrt)
    }

    pub fn tanh(self) -> Self {
        self.unary(self.value.tanh(), Op::Tanh)
    }

    pub fn abs(self) -> Self {
        self.unary(self.value.abs(), Op::Abs)
    }

    pub fn powi(self, n: i32) -> Self {
        self.unary(self.value.powi(n), |a| Op::Powi(a, n))
    }

    pub fn powf(self, p: f64) -> Self {
        self.unary(self.value.powf(p), |a| Op::Powf(a, p))
    }
}

impl fmt::Debug for Var<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tape {
            Some(_) => write!(f, "Var({} @ {})", self.value, self.index),
            None => write!(f, "Var({})", self.value),
        }
    }
}

impl From<f64> for Var<'_> {
    fn from(value: f64) -> Self {
        Var::constant(value)
    }
}

impl<'t> Add for Var<'t> {
    type Output = Var<'t>;

    fn add(self, rhs: Self) -> Self {
        let (a, b) = (self.value, rhs.value);
        self.binary(
            rhs,
            a + b,
            Op::Add,
            |i| Op::AddConst(i, b),
            |j| Op::AddConst(j, a),
        )
    }
}

impl<'t> Sub for Var<'t> {
    type Output = Var<'t>;

    fn sub(self, rhs: Self) -> Self {
        let (a, b) = (self.value, rhs.value);
        self.binary(
            rhs,
            a - b,
            Op::Sub,
            |i| Op::AddConst(i, -b),
            |j| Op::ConstSub(a, j),
        )
    }
}

impl<'t> Mul for Var<'t> {
    type Output = Var<'t>;

    fn mul(self, rhs: Self) -> Self {
        let (a, b) = (self.value, rhs.value);
        self.binary(
            rhs,
            a * b,
            Op::Mul,
            |i| Op::MulConst(i, b),
            |j| Op::MulConst(j, a),
        )
    }
}

impl<'t> Div for Var<'t> {
    type Output = Var<'t>;

    fn div(self, rhs: Self) -> Self {
        let (a, b) = (self.value, rhs.value);
        self.binary(
            rhs,
            a / b,
            Op::Div,
            |i| Op::MulConst(i, 1.0 / b),
            |j| Op::ConstDiv(a, j),
        )
    }
}

impl<'t> Neg for Var<'t> {
    type Output = Var<'t>;

    fn neg(self) -> Self {
        self.unary(-self.value, Op::Neg)
    }
}

macro_rules! impl_f64_ops {
    ($($trait:ident::$method:ident),*) => {$(
        impl<'t> $trait<f64> for Var<'t> {
            type Output = Var<'t>;

            fn $method(self, rhs: f64) -> Var<'t> {
                $trait::$method(self, Var::constant(rhs))
            }
        }

        impl<'t> $trait<Var<'t>> for f64 {
            type Output = Var<'t>;

            fn $method(self, rhs: Var<'t>) -> Var<'t> {
                $trait::$method(Var::constant(self), rhs)
            }
        }
    )*};
}

impl_f64_ops!(Add::add, Sub::sub, Mul::mul, Div::div);

macro_rules! impl_assign_ops {
    ($($trait:ident::$method:ident => $op:tt),*) => {$(
        impl<'t> $trait for Var<'t> {
            fn $method(&mut self, rhs: Var<'t>) {
                *self = *self $op rhs;
            }
        }

        impl<'t> $trait<f64> for Var<'t> {
            fn $method(&mut self, rhs: f64) {
                *self = *self $op rhs;
            }
        }
    )*};
}

impl_assign_ops!(
    AddAssign::add_assign => +,
    SubAssign::sub_assign => -,
    MulAssign::mul_assign => *,
    DivAssign::div_assign => /
);

impl<'t> Sum for Var<'t> {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Var::constant(0.0), |acc, v| acc + v)
    }
}

/// Numeric operations shared by `f64` and [`Var`].
///
/// Helpers generic over `Scalar` can be called from recorded user functions
/// and from plain numeric code alike.
pub trait Scalar:
    Copy
    + fmt::Debug
    + From<f64>
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
{
    fn value(&self) -> f64;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn tan(self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sqrt(self) -> Self;
    fn tanh(self) -> Self;
    fn abs(self) -> Self;
    fn powi(self, n: i32) -> Self;
    fn powf(self, p: f64) -> Self;
}

impl Scalar for f64 {
    fn value(&self) -> f64 {
        *self
    }
    fn sin(self) -> Self {
        f64::sin(self)
    }
    fn cos(self) -> Self {
        f64::cos(self)
    }
    fn tan(self) -> Self {
        f64::tan(self)
    }
    fn exp(self) -> Self {
        f64::exp(self)
    }
    fn ln(self) -> Self {
        f64::ln(self)
    }
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
    fn tanh(self) -> Self {
        f64::tanh(self)
    }
    fn abs(self) -> Self {
        f64::abs(self)
    }
    fn powi(self, n: i32) -> Self {
        f64::powi(self, n)
    }
    fn powf(self, p: f64) -> Self {
        f64::powf(self, p)
    }
}

impl<'t> Scalar for Var<'t> {
    fn value(&self) -> f64 {
        self.value
    }
    fn sin(self) -> Self {
        Var::sin(self)
    }
    fn cos(self) -> Self {
        Var::cos(self)
    }
    fn tan(self) -> Self {
        Var::tan(self)
    }
    fn exp(self) -> Self {
        Var::exp(self)
    }
    fn ln(self) -> Self {
        Var::ln(self)
    }
    fn sqrt(self) -> Self {
        Var::sqrt(self)
    }
    fn tanh(self) -> Self {
        Var::tanh(self)
    }
    fn abs(self) -> Self {
        Var::abs(self)
    }
    fn powi(self, n: i32) -> Self {
        Var::powi(self, n)
    }
    fn powf(self, p: f64) -> Self {
        Var::powf(self, p)
    }
}
