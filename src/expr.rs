//! Affine expressions over decision variables and random-variable references.
//!
//! Coefficients are themselves affine in the random variables, so both
//! `5.0 * sell` and `price * sell` (random price) are linear in the decisions.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

/// Handle to a decision variable, only obtainable from a [`crate::problem::DecisionProblem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableHandle {
    pub(crate) problem: u64,
    pub(crate) index: usize,
}

impl fmt::Display for VariableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}@p{}", self.index, self.problem)
    }
}

/// Placeholder for a random variable realized per stage by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RandomRef {
    pub(crate) problem: u64,
    pub(crate) index: usize,
}

/// `constant + Σ weight·ξ`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Coefficient {
    pub constant: f64,
    pub random: Vec<(RandomRef, f64)>,
}

impl Coefficient {
    pub fn constant(value: f64) -> Self {
        Self {
            constant: value,
            random: Vec::new(),
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.random.iter().all(|(_, w)| *w == 0.0)
    }

    /// Value given realized random variables indexed by declaration order.
    pub fn evaluate(&self, realized: &[f64]) -> f64 {
        self.random.iter().fold(self.constant, |acc, (r, w)| {
            acc + w * realized.get(r.index).copied().unwrap_or(0.0)
        })
    }

    fn add_assign(&mut self, other: &Coefficient) {
        self.constant += other.constant;
        for &(r, w) in &other.random {
            match self.random.iter_mut().find(|(existing, _)| *existing == r) {
                Some((_, acc)) => *acc += w,
                None => self.random.push((r, w)),
            }
        }
    }

    fn scale(&mut self, factor: f64) {
        self.constant *= factor;
        for (_, w) in &mut self.random {
            *w *= factor;
        }
    }
}

/// `Σ coefficient·x + constant`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinExpr {
    pub(crate) terms: Vec<(VariableHandle, Coefficient)>,
    pub(crate) constant: Coefficient,
}

impl LinExpr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terms(&self) -> &[(VariableHandle, Coefficient)] {
        &self.terms
    }

    pub fn constant_part(&self) -> &Coefficient {
        &self.constant
    }

    pub fn variables(&self) -> impl Iterator<Item = VariableHandle> + '_ {
        self.terms.iter().map(|(v, _)| *v)
    }

    pub fn random_refs(&self) -> impl Iterator<Item = RandomRef> + '_ {
        self.terms
            .iter()
            .flat_map(|(_, c)| c.random.iter().map(|(r, _)| *r))
            .chain(self.constant.random.iter().map(|(r, _)| *r))
    }

    /// Adds `coefficient·var`, merging with an existing term for the same variable.
    pub fn add_term(&mut self, var: VariableHandle, coefficient: Coefficient) {
        match self.terms.iter_mut().find(|(v, _)| *v == var) {
            Some((_, c)) => c.add_assign(&coefficient),
            None => self.terms.push((var, coefficient)),
        }
    }

    pub fn leq(self, rhs: impl Into<LinExpr>) -> Constraint {
        Constraint::new(self - rhs.into(), Sense::LessEqual)
    }

    pub fn geq(self, rhs: impl Into<LinExpr>) -> Constraint {
        Constraint::new(self - rhs.into(), Sense::GreaterEqual)
    }

    pub fn equals(self, rhs: impl Into<LinExpr>) -> Constraint {
        Constraint::new(self - rhs.into(), Sense::Equal)
    }

    fn scaled(mut self, factor: f64) -> Self {
        for (_, c) in &mut self.terms {
            c.scale(factor);
        }
        self.constant.scale(factor);
        self
    }
}

impl VariableHandle {
    pub fn leq(self, rhs: impl Into<LinExpr>) -> Constraint {
        LinExpr::from(self).leq(rhs)
    }

    pub fn geq(self, rhs: impl Into<LinExpr>) -> Constraint {
        LinExpr::from(self).geq(rhs)
    }

    pub fn equals(self, rhs: impl Into<LinExpr>) -> Constraint {
        LinExpr::from(self).equals(rhs)
    }
}

impl From<VariableHandle> for LinExpr {
    fn from(var: VariableHandle) -> Self {
        Self {
            terms: vec![(var, Coefficient::constant(1.0))],
            constant: Coefficient::default(),
        }
    }
}

impl From<RandomRef> for LinExpr {
    fn from(r: RandomRef) -> Self {
        Self {
            terms: Vec::new(),
            constant: Coefficient {
                constant: 0.0,
                random: vec![(r, 1.0)],
            },
        }
    }
}

impl From<f64> for LinExpr {
    fn from(value: f64) -> Self {
        Self {
            terms: Vec::new(),
            constant: Coefficient::constant(value),
        }
    }
}

impl<T: Into<LinExpr>> Add<T> for LinExpr {
    type Output = LinExpr;

    fn add(mut self, rhs: T) -> LinExpr {
        let rhs = rhs.into();
        for (var, c) in rhs.terms {
            self.add_term(var, c);
        }
        self.constant.add_assign(&rhs.constant);
        self
    }
}

impl<T: Into<LinExpr>> Sub<T> for LinExpr {
    type Output = LinExpr;

    fn sub(self, rhs: T) -> LinExpr {
        self + rhs.into().scaled(-1.0)
    }
}

impl Neg for LinExpr {
    type Output = LinExpr;

    fn neg(self) -> LinExpr {
        self.scaled(-1.0)
    }
}

impl Mul<f64> for LinExpr {
    type Output = LinExpr;

    fn mul(self, rhs: f64) -> LinExpr {
        self.scaled(rhs)
    }
}

impl Mul<LinExpr> for f64 {
    type Output = LinExpr;

    fn mul(self, rhs: LinExpr) -> LinExpr {
        rhs.scaled(self)
    }
}

macro_rules! expr_operand {
    ($ty:ty) => {
        impl<T: Into<LinExpr>> Add<T> for $ty {
            type Output = LinExpr;

            fn add(self, rhs: T) -> LinExpr {
                LinExpr::from(self) + rhs
            }
        }

        impl<T: Into<LinExpr>> Sub<T> for $ty {
            type Output = LinExpr;

            fn sub(self, rhs: T) -> LinExpr {
                LinExpr::from(self) - rhs
            }
        }

        impl Neg for $ty {
            type Output = LinExpr;

            fn neg(self) -> LinExpr {
                -LinExpr::from(self)
            }
        }

        impl Mul<f64> for $ty {
            type Output = LinExpr;

            fn mul(self, rhs: f64) -> LinExpr {
                LinExpr::from(self) * rhs
            }
        }

        impl Mul<$ty> for f64 {
            type Output = LinExpr;

            fn mul(self, rhs: $ty) -> LinExpr {
                LinExpr::from(rhs) * self
            }
        }

        impl Add<$ty> for f64 {
            type Output = LinExpr;

            fn add(self, rhs: $ty) -> LinExpr {
                LinExpr::from(self) + rhs
            }
        }

        impl Sub<$ty> for f64 {
            type Output = LinExpr;

            fn sub(self, rhs: $ty) -> LinExpr {
                LinExpr::from(self) - rhs
            }
        }
    };
}

expr_operand!(VariableHandle);
expr_operand!(RandomRef);

/// Random coefficient on a decision variable, e.g. `price * sell`.
impl Mul<VariableHandle> for RandomRef {
    type Output = LinExpr;

    fn mul(self, rhs: VariableHandle) -> LinExpr {
        let mut expr = LinExpr::new();
        expr.add_term(
            rhs,
            Coefficient {
                constant: 0.0,
                random: vec![(self, 1.0)],
            },
        );
        expr
    }
}

impl Mul<RandomRef> for VariableHandle {
    type Output = LinExpr;

    fn mul(self, rhs: RandomRef) -> LinExpr {
        rhs * self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    LessEqual,
    GreaterEqual,
    Equal,
}

/// `expr (≤ | ≥ | =) 0`
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub(crate) expr: LinExpr,
    pub(crate) sense: Sense,
}

impl Constraint {
    pub fn new(expr: LinExpr, sense: Sense) -> Self {
        Self { expr, sense }
    }

    pub fn expr(&self) -> &LinExpr {
        &self.expr
    }

    pub fn sense(&self) -> Sense {
        self.sense
    }
}
