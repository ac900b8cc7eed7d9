//! Run configuration: optimizer knobs, process parameters and the demo
//! inventory problem, loadable from a single JSON file.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ModelError};
use crate::inventory::InventoryParams;
use crate::process::ProcessConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Maximum lattice nodes per stage
    pub num_nodes: usize,
    /// Lattice paths sampled per iteration to build new cuts
    pub forward_passes: usize,
    /// Policy simulations per iteration for the simulated reward
    pub bound_sample_size: usize,
    pub max_iterations: usize,
    pub time_limit_secs: Option<f64>,
    pub abs_tolerance: f64,
    pub rel_tolerance: f64,
    /// Consecutive iterations the gap must stay closed
    pub stable_iterations: usize,
    /// Multiplier on the standard error of the simulated reward
    pub confidence_z: f64,
    /// Bound on the future value of a stage before it has cuts
    pub value_bound: f64,
    /// Numerical failures tolerated on one subproblem before the run fails
    pub max_subproblem_failures: usize,
    /// Proximal weight of the retry after a failed solve
    pub regularization: f64,
    pub solver_max_iter: u32,
    pub parallel: bool,
    pub seed: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            num_nodes: 10,
            forward_passes: 1,
            bound_sample_size: 100,
            max_iterations: 100,
            time_limit_secs: None,
            abs_tolerance: 1e-3,
            rel_tolerance: 1e-4,
            stable_iterations: 3,
            confidence_z: 1.96,
            value_bound: 1e6,
            max_subproblem_failures: 3,
            regularization: 1e-7,
            solver_max_iter: 200,
            parallel: true,
            seed: None,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        let positive = [
            ("num_nodes", self.num_nodes),
            ("forward_passes", self.forward_passes),
            ("bound_sample_size", self.bound_sample_size),
            ("max_iterations", self.max_iterations),
            ("stable_iterations", self.stable_iterations),
            ("max_subproblem_failures", self.max_subproblem_failures),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(invalid(format!("{} must be positive", name)));
            }
        }
        let non_negative = [
            ("abs_tolerance", self.abs_tolerance),
            ("rel_tolerance", self.rel_tolerance),
            ("confidence_z", self.confidence_z),
            ("regularization", self.regularization),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!("{} must be finite and non-negative, got {}", name, value)));
            }
        }
        if !self.value_bound.is_finite() || self.value_bound <= 0.0 {
            return Err(invalid(format!("value_bound must be finite and positive, got {}", self.value_bound)));
        }
        if let Some(limit) = self.time_limit_secs {
            if !(limit > 0.0) {
                return Err(invalid(format!("time_limit_secs must be positive, got {}", limit)));
            }
        }
        if self.solver_max_iter == 0 {
            return Err(invalid("solver_max_iter must be positive".to_string()));
        }
        Ok(())
    }
}

fn invalid(msg: String) -> ModelError {
    ModelError::InvalidParameter(msg)
}

/// Everything the demo binary needs for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    pub process: ProcessConfig,
    #[serde(default)]
    pub inventory: InventoryParams,
    /// Policy simulations reported after convergence
    #[serde(default = "default_simulation_samples")]
    pub simulation_samples: usize,
}

fn default_simulation_samples() -> usize {
    1000
}

impl RunConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_json::from_str(json)?;
        config.optimizer.validate()?;
        config.inventory.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
