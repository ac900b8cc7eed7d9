//! Piecewise-linear approximation of the expected future reward.
//!
//! Rewards are maximized, so every cut is an affine *over*-estimator
//! `θ ≤ intercept + slopes·state` and the approximation is their minimum.

use serde::Serialize;

const DUPLICATE_TOLERANCE: f64 = 1e-7;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cut {
    pub intercept: f64,
    /// One slope per outgoing state variable of the stage
    pub slopes: Vec<f64>,
}

impl Cut {
    pub fn evaluate(&self, state: &[f64]) -> f64 {
        self.intercept + self.slopes.iter().zip(state).map(|(b, s)| b * s).sum::<f64>()
    }

    /// Probability-weighted combination of per-successor values and slopes,
    /// all measured at the trial `state`.
    pub fn expected(probabilities: &[f64], values: &[f64], slopes: &[Vec<f64>], state: &[f64]) -> Self {
        let mut intercept = 0.0;
        let mut combined = vec![0.0; state.len()];
        for ((p, v), g) in probabilities.iter().zip(values).zip(slopes) {
            if *p == 0.0 {
                continue;
            }
            let at_state: f64 = g.iter().zip(state).map(|(gi, si)| gi * si).sum();
            intercept += p * (v - at_state);
            for (c, gi) in combined.iter_mut().zip(g) {
                *c += p * gi;
            }
        }
        Self {
            intercept,
            slopes: combined,
        }
    }

    fn is_close_to(&self, other: &Cut) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= DUPLICATE_TOLERANCE * (1.0 + a.abs().max(b.abs()));
        close(self.intercept, other.intercept)
            && self.slopes.len() == other.slopes.len()
            && self.slopes.iter().zip(&other.slopes).all(|(a, b)| close(*a, *b))
    }
}

/// Cut set for one (stage, node)
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValueFunction {
    cuts: Vec<Cut>,
}

impl ValueFunction {
    /// Returns `false` when an equivalent cut is already present.
    pub fn add(&mut self, cut: Cut) -> bool {
        if self.cuts.iter().any(|c| c.is_close_to(&cut)) {
            return false;
        }
        self.cuts.push(cut);
        true
    }

    pub fn cuts(&self) -> &[Cut] {
        &self.cuts
    }

    pub fn len(&self) -> usize {
        self.cuts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cuts.is_empty()
    }

    /// Tightest over-estimate at `state`, `None` without cuts.
    pub fn evaluate(&self, state: &[f64]) -> Option<f64> {
        self.cuts.iter().map(|c| c.evaluate(state)).reduce(f64::min)
    }
}

/// Cut sets indexed `[stage][node]`; the last stage has no future and no entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CutStore {
    stages: Vec<Vec<ValueFunction>>,
}

impl CutStore {
    pub fn new(nodes_per_stage: &[usize]) -> Self {
        let nonterminal = nodes_per_stage.len().saturating_sub(1);
        Self {
            stages: nodes_per_stage[..nonterminal]
                .iter()
                .map(|&n| vec![ValueFunction::default(); n])
                .collect(),
        }
    }

    pub fn get(&self, stage: usize, node: usize) -> Option<&ValueFunction> {
        self.stages.get(stage).and_then(|nodes| nodes.get(node))
    }

    pub fn add(&mut self, stage: usize, node: usize, cut: Cut) -> bool {
        match self.stages.get_mut(stage).and_then(|nodes| nodes.get_mut(node)) {
            Some(vf) => vf.add(cut),
            None => false,
        }
    }

    pub fn total(&self) -> usize {
        self.stages.iter().flatten().map(ValueFunction::len).sum()
    }
}
