use std::collections::BTreeMap;

use serde::Serialize;

use crate::monte_carlo::{summarize, SampleSummary};

/// One optimizer iteration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolutionStats {
    pub iteration: usize,
    /// Cut-based bound on the optimal expected reward (tightest seen so far)
    pub expected_reward: f64,
    /// Mean reward of the current policy over simulated lattice paths
    pub simulated_reward: f64,
    pub std_error: f64,
    pub sample_size: usize,
    pub cut_count: usize,
    /// Subproblem solves since the start of the run
    pub solves: usize,
    pub elapsed_secs: f64,
}

impl SolutionStats {
    pub fn gap(&self) -> f64 {
        self.expected_reward - self.simulated_reward
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminationReason {
    /// Bound gap within tolerance for the required number of iterations
    BoundsClosed,
    IterationLimit,
    TimeLimit,
}

/// Outcome of a finished solve, returned by `join`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolveSummary {
    pub iterations: usize,
    pub termination: TerminationReason,
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub std_error: f64,
    pub cut_count: usize,
    pub elapsed_secs: f64,
}

/// Decision taken at one stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageDecision {
    pub stage: usize,
    pub node: usize,
    /// Reward collected in this stage only
    pub reward: f64,
    /// Approximated expected reward of the remaining stages
    pub future_value: f64,
    pub decisions: BTreeMap<String, f64>,
    /// Marginal value of one more unit of each linking variable
    pub shadow_prices: BTreeMap<String, f64>,
}

/// One (sample, stage) row of a policy simulation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationRecord {
    pub sample: usize,
    pub stage: usize,
    /// Lattice node whose cuts drove the decision
    pub node: usize,
    pub reward: f64,
    pub decisions: BTreeMap<String, f64>,
    pub shadow_prices: BTreeMap<String, f64>,
    /// Realized random variables
    pub states: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationResult {
    pub sample_size: usize,
    pub num_stages: usize,
    /// Ordered by sample, then stage
    pub records: Vec<SimulationRecord>,
}

impl SimulationResult {
    pub fn record(&self, sample: usize, stage: usize) -> Option<&SimulationRecord> {
        self.records.get(sample * self.num_stages + stage)
    }

    /// Sum of stage rewards per sample.
    pub fn total_rewards(&self) -> Vec<f64> {
        let mut totals = vec![0.0; self.sample_size];
        for r in &self.records {
            totals[r.sample] += r.reward;
        }
        totals
    }

    pub fn reward_summary(&self) -> SampleSummary {
        summarize(&self.total_rewards())
    }

    /// Values of decision `name` at `stage`, one per sample.
    pub fn decision_column(&self, stage: usize, name: &str) -> Vec<f64> {
        self.column(stage, |r| r.decisions.get(name).copied())
    }

    pub fn shadow_price_column(&self, stage: usize, name: &str) -> Vec<f64> {
        self.column(stage, |r| r.shadow_prices.get(name).copied())
    }

    pub fn state_column(&self, stage: usize, name: &str) -> Vec<f64> {
        self.column(stage, |r| r.states.get(name).copied())
    }

    fn column(&self, stage: usize, pick: impl Fn(&SimulationRecord) -> Option<f64>) -> Vec<f64> {
        self.records
            .iter()
            .filter(|r| r.stage == stage)
            .filter_map(pick)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sample: usize, stage: usize, reward: f64, sell: f64) -> SimulationRecord {
        SimulationRecord {
            sample,
            stage,
            node: 0,
            reward,
            decisions: BTreeMap::from([("sell".to_string(), sell)]),
            shadow_prices: BTreeMap::new(),
            states: BTreeMap::from([("demand".to_string(), sell + 1.0)]),
        }
    }

    #[test]
    fn test_totals_and_columns() {
        let result = SimulationResult {
            sample_size: 2,
            num_stages: 2,
            records: vec![
                record(0, 0, 10.0, 1.0),
                record(0, 1, 5.0, 2.0),
                record(1, 0, 7.0, 3.0),
                record(1, 1, -1.0, 4.0),
            ],
        };
        assert_eq!(result.total_rewards(), vec![15.0, 6.0]);
        assert_eq!(result.decision_column(1, "sell"), vec![2.0, 4.0]);
        assert_eq!(result.state_column(0, "demand"), vec![2.0, 4.0]);
        assert!(result.shadow_price_column(0, "stock").is_empty());
        assert_eq!(result.record(1, 0).map(|r| r.reward), Some(7.0));
        assert!((result.reward_summary().mean - 10.5).abs() < 1e-12);
    }
}
