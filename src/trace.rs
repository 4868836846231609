//! Recorded operation sequences and their replay.
//!
//! Every sweep works on node values produced by [`Trace::forward`]; node `i`
//! is the result of `ops[i]`.

use std::collections::BTreeSet;

/// A recorded operation. Operands are node indices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Op {
    Input,
    Add(u32, u32),
    Sub(u32, u32),
    Mul(u32, u32),
    Div(u32, u32),
    Neg(u32),
    AddConst(u32, f64),
    MulConst(u32, f64),
    /// `c - a`
    ConstSub(f64, u32),
    /// `c / a`
    ConstDiv(f64, u32),
    Sin(u32),
    Cos(u32),
    Tan(u32),
    Exp(u32),
    Ln(u32),
    Sqrt(u32),
    Tanh(u32),
    Abs(u32),
    Powi(u32, i32),
    Powf(u32, f64),
}

/// How a node depends on its operands, for structural analysis.
enum Structure {
    Leaf,
    /// Linear in all operands.
    Linear(u32, Option<u32>),
    /// Nonlinear in its single operand.
    Unary(u32),
    /// Bilinear: `a * b`.
    Product(u32, u32),
    /// Linear in `a`, nonlinear in `b`: `a / b`.
    Quotient(u32, u32),
}

/// First and second partial derivatives of one operation.
///
/// `d2[0]` is d²/da², `d2[1]` is d²/da db, `d2[2]` is d²/db².
struct Partials {
    a: Option<(u32, f64)>,
    b: Option<(u32, f64)>,
    d2: [f64; 3],
}

impl Op {
    fn structure(&self) -> Structure {
        use Op::*;
        match *self {
            Input => Structure::Leaf,
            Add(a, b) | Sub(a, b) => Structure::Linear(a, Some(b)),
            Neg(a) | AddConst(a, _) | MulConst(a, _) | ConstSub(_, a) | Abs(a) => {
                Structure::Linear(a, None)
            }
            Powi(a, n) if n == 0 || n == 1 => Structure::Linear(a, None),
            Powf(a, p) if p == 0.0 || p == 1.0 => Structure::Linear(a, None),
            Mul(a, b) => Structure::Product(a, b),
            Div(a, b) => Structure::Quotient(a, b),
            ConstDiv(_, a) | Sin(a) | Cos(a) | Tan(a) | Exp(a) | Ln(a) | Sqrt(a) | Tanh(a)
            | Powi(a, _) | Powf(a, _) => Structure::Unary(a),
        }
    }

    fn eval(&self, v: &[f64]) -> f64 {
        use Op::*;
        let at = |i: u32| v[i as usize];
        match *self {
            Input => f64::NAN,
            Add(a, b) => at(a) + at(b),
            Sub(a, b) => at(a) - at(b),
            Mul(a, b) => at(a) * at(b),
            Div(a, b) => at(a) / at(b),
            Neg(a) => -at(a),
            AddConst(a, c) => at(a) + c,
            MulConst(a, c) => at(a) * c,
            ConstSub(c, a) => c - at(a),
            ConstDiv(c, a) => c / at(a),
            Sin(a) => at(a).sin(),
            Cos(a) => at(a).cos(),
            Tan(a) => at(a).tan(),
            Exp(a) => at(a).exp(),
            Ln(a) => at(a).ln(),
            Sqrt(a) => at(a).sqrt(),
            Tanh(a) => at(a).tanh(),
            Abs(a) => at(a).abs(),
            Powi(a, n) => at(a).powi(n),
            Powf(a, p) => at(a).powf(p),
        }
    }

    /// Partials at the recorded values; `y` is this node's value.
    fn partials(&self, v: &[f64], y: f64) -> Partials {
        use Op::*;
        let at = |i: u32| v[i as usize];
        let unary = |a: u32, d: f64, d2: f64| Partials {
            a: Some((a, d)),
            b: None,
            d2: [d2, 0.0, 0.0],
        };
        match *self {
            Input => Partials {
                a: None,
                b: None,
                d2: [0.0; 3],
            },
            Add(a, b) => Partials {
                a: Some((a, 1.0)),
                b: Some((b, 1.0)),
                d2: [0.0; 3],
            },
            Sub(a, b) => Partials {
                a: Some((a, 1.0)),
                b: Some((b, -1.0)),
                d2: [0.0; 3],
            },
            Mul(a, b) => Partials {
                a: Some((a, at(b))),
                b: Some((b, at(a))),
                d2: [0.0, 1.0, 0.0],
            },
            Div(a, b) => {
                let (x, d) = (at(a), at(b));
                Partials {
                    a: Some((a, 1.0 / d)),
                    b: Some((b, -x / (d * d))),
                    d2: [0.0, -1.0 / (d * d), 2.0 * x / (d * d * d)],
                }
            }
            Neg(a) => unary(a, -1.0, 0.0),
            AddConst(a, _) => unary(a, 1.0, 0.0),
            MulConst(a, c) => unary(a, c, 0.0),
            ConstSub(_, a) => unary(a, -1.0, 0.0),
            ConstDiv(c, a) => {
                let x = at(a);
                unary(a, -c / (x * x), 2.0 * c / (x * x * x))
            }
            Sin(a) => unary(a, at(a).cos(), -y),
            Cos(a) => unary(a, -at(a).sin(), -y),
            Tan(a) => {
                let sec2 = 1.0 + y * y;
                unary(a, sec2, 2.0 * y * sec2)
            }
            Exp(a) => unary(a, y, y),
            Ln(a) => {
                let x = at(a);
                unary(a, 1.0 / x, -1.0 / (x * x))
            }
            Sqrt(a) => unary(a, 0.5 / y, -0.25 / (y * y * y)),
            Tanh(a) => {
                let d = 1.0 - y * y;
                unary(a, d, -2.0 * y * d)
            }
            Abs(a) => {
                let x = at(a);
                let sign = if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                };
                unary(a, sign, 0.0)
            }
            Powi(a, n) => {
                let x = at(a);
                let nf = f64::from(n);
                let d = if n == 0 { 0.0 } else { nf * x.powi(n - 1) };
                let d2 = if n == 0 || n == 1 {
                    0.0
                } else {
                    nf * (nf - 1.0) * x.powi(n - 2)
                };
                unary(a, d, d2)
            }
            Powf(a, p) => {
                let x = at(a);
                let d = if p == 0.0 { 0.0 } else { p * x.powf(p - 1.0) };
                let d2 = if p == 0.0 || p == 1.0 {
                    0.0
                } else {
                    p * (p - 1.0) * x.powf(p - 2.0)
                };
                unary(a, d, d2)
            }
        }
    }
}

/// A dependent variable of a trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Output {
    Node(u32),
    /// The output never depended on an input.
    Constant(f64),
}

/// An immutable recording of one function evaluation.
#[derive(Debug, Clone)]
pub(crate) struct Trace {
    ops: Vec<Op>,
    inputs: Vec<u32>,
    outputs: Vec<Output>,
    /// Input position of each node, `usize::MAX` for non-inputs.
    input_slot: Vec<usize>,
}

impl Trace {
    pub(crate) fn new(ops: Vec<Op>, inputs: Vec<u32>, outputs: Vec<Output>) -> Self {
        let mut input_slot = vec![usize::MAX; ops.len()];
        for (k, &node) in inputs.iter().enumerate() {
            input_slot[node as usize] = k;
        }
        Self {
            ops,
            inputs,
            outputs,
            input_slot,
        }
    }

    pub(crate) fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub(crate) fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub(crate) fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Computes every node value at `x`.
    pub(crate) fn forward(&self, x: &[f64], values: &mut Vec<f64>) {
        debug_assert_eq!(x.len(), self.inputs.len());
        values.clear();
        values.resize(self.ops.len(), 0.0);
        for (&node, &xi) in self.inputs.iter().zip(x) {
            values[node as usize] = xi;
        }
        for (i, op) in self.ops.iter().enumerate() {
            if !matches!(op, Op::Input) {
                values[i] = op.eval(values);
            }
        }
    }

    /// Output values from a completed forward sweep.
    pub(crate) fn outputs(&self, values: &[f64], out: &mut [f64]) {
        for (o, slot) in out.iter_mut().zip(&self.outputs) {
            *o = match *slot {
                Output::Node(i) => values[i as usize],
                Output::Constant(c) => c,
            };
        }
    }

    /// Forward tangent sweep: node derivatives along input direction `dx`.
    pub(crate) fn tangent(&self, values: &[f64], dx: &[f64], dots: &mut Vec<f64>) {
        dots.clear();
        dots.resize(self.ops.len(), 0.0);
        for (&node, &d) in self.inputs.iter().zip(dx) {
            dots[node as usize] = d;
        }
        for (i, op) in self.ops.iter().enumerate() {
            if matches!(op, Op::Input) {
                continue;
            }
            let p = op.partials(values, values[i]);
            let mut dot = 0.0;
            if let Some((a, da)) = p.a {
                dot += da * dots[a as usize];
            }
            if let Some((b, db)) = p.b {
                dot += db * dots[b as usize];
            }
            dots[i] = dot;
        }
    }

    /// Output tangents from a completed tangent sweep.
    pub(crate) fn output_tangents(&self, dots: &[f64], out: &mut [f64]) {
        for (o, slot) in out.iter_mut().zip(&self.outputs) {
            *o = match *slot {
                Output::Node(i) => dots[i as usize],
                Output::Constant(_) => 0.0,
            };
        }
    }

    /// Reverse sweep: `grad = wᵀ J` for output weights `w`.
    pub(crate) fn reverse(&self, values: &[f64], w: &[f64], grad: &mut [f64]) {
        let mut bars = vec![0.0; self.ops.len()];
        self.seed_outputs(w, &mut bars);
        for i in (0..self.ops.len()).rev() {
            let bar = bars[i];
            if bar == 0.0 {
                continue;
            }
            let p = self.ops[i].partials(values, values[i]);
            if let Some((a, da)) = p.a {
                bars[a as usize] += bar * da;
            }
            if let Some((b, db)) = p.b {
                bars[b as usize] += bar * db;
            }
        }
        for (g, &node) in grad.iter_mut().zip(&self.inputs) {
            *g = bars[node as usize];
        }
    }

    /// Forward-over-reverse sweep: `hv = ∇²(wᵀy) · dx`.
    ///
    /// `dots` must come from [`Trace::tangent`] along `dx`.
    pub(crate) fn hessian_vector(&self, values: &[f64], dots: &[f64], w: &[f64], hv: &mut [f64]) {
        let n = self.ops.len();
        let mut bars = vec![0.0; n];
        let mut bar_dots = vec![0.0; n];
        self.seed_outputs(w, &mut bars);
        for i in (0..n).rev() {
            let (bar, bar_dot) = (bars[i], bar_dots[i]);
            if bar == 0.0 && bar_dot == 0.0 {
                continue;
            }
            let p = self.ops[i].partials(values, values[i]);
            let dot_a = p.a.map_or(0.0, |(a, _)| dots[a as usize]);
            let dot_b = p.b.map_or(0.0, |(b, _)| dots[b as usize]);
            if let Some((a, da)) = p.a {
                bars[a as usize] += bar * da;
                bar_dots[a as usize] += bar_dot * da + bar * (p.d2[0] * dot_a + p.d2[1] * dot_b);
            }
            if let Some((b, db)) = p.b {
                bars[b as usize] += bar * db;
                bar_dots[b as usize] += bar_dot * db + bar * (p.d2[1] * dot_a + p.d2[2] * dot_b);
            }
        }
        for (h, &node) in hv.iter_mut().zip(&self.inputs) {
            *h = bar_dots[node as usize];
        }
    }

    fn seed_outputs(&self, w: &[f64], bars: &mut [f64]) {
        for (slot, &wk) in self.outputs.iter().zip(w) {
            if let Output::Node(i) = *slot {
                bars[i as usize] += wk;
            }
        }
    }

    /// Input positions each output depends on, sorted.
    pub(crate) fn jacobian_structure(&self) -> Vec<Vec<usize>> {
        let deps = self.dependencies();
        self.outputs
            .iter()
            .map(|slot| match *slot {
                Output::Node(i) => deps[i as usize].clone(),
                Output::Constant(_) => Vec::new(),
            })
            .collect()
    }

    /// Nonlinear interactions between inputs: entry `j` holds every input `k`
    /// for which ∂²/∂xj∂xk may be nonzero for some output.
    pub(crate) fn hessian_structure(&self) -> Vec<BTreeSet<usize>> {
        let deps = self.dependencies();
        let mut interactions = vec![BTreeSet::new(); self.inputs.len()];
        let mut connect = |lhs: &[usize], rhs: &[usize]| {
            for &j in lhs {
                interactions[j].extend(rhs.iter().copied());
            }
            for &k in rhs {
                interactions[k].extend(lhs.iter().copied());
            }
        };
        for op in &self.ops {
            match op.structure() {
                Structure::Leaf | Structure::Linear(..) => {}
                Structure::Unary(a) => {
                    let da = &deps[a as usize];
                    connect(da, da);
                }
                Structure::Product(a, b) => connect(&deps[a as usize], &deps[b as usize]),
                Structure::Quotient(a, b) => {
                    let db = &deps[b as usize];
                    connect(&deps[a as usize], db);
                    connect(db, db);
                }
            }
        }
        interactions
    }

    /// Forward propagation of input index sets.
    fn dependencies(&self) -> Vec<Vec<usize>> {
        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(self.ops.len());
        for (i, op) in self.ops.iter().enumerate() {
            let set = match op.structure() {
                Structure::Leaf => {
                    let slot = self.input_slot[i];
                    if slot == usize::MAX {
                        Vec::new()
                    } else {
                        vec![slot]
                    }
                }
                Structure::Linear(a, None) | Structure::Unary(a) => deps[a as usize].clone(),
                Structure::Linear(a, Some(b))
                | Structure::Product(a, b)
                | Structure::Quotient(a, b) => union(&deps[a as usize], &deps[b as usize]),
            };
            deps.push(set);
        }
        deps
    }
}

/// Union of two sorted index lists.
fn union(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}
