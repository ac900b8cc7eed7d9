//! Converged decision rule: first-stage decision and out-of-sample simulation.
//!
//! Each simulated path follows the continuous process. The cuts come from
//! the lattice node nearest to the realized values at every stage.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{OptimizerError, OptimizerStatus};
use crate::models::{SimulationRecord, SimulationResult, StageDecision};
use crate::optimizer::{Shared, SolveScope};

/// Offset separating the policy's random stream from the optimizer's
const POLICY_STREAM: u64 = 0x5EED_0F_90_11C7;

#[derive(Clone)]
pub struct Policy {
    shared: Arc<Shared>,
    rng: Arc<Mutex<StdRng>>,
}

impl Policy {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let rng = match shared.engine.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(POLICY_STREAM)),
            None => StdRng::from_entropy(),
        };
        Self {
            shared,
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.shared.status() == OptimizerStatus::Converged
    }

    /// Stage-0 decision with its reward and shadow prices.
    pub fn first_stage_solution(&self) -> Result<StageDecision, OptimizerError> {
        let solution = self.shared.solution()?;
        let engine = &self.shared.engine;
        let solves = AtomicUsize::new(0);
        let scope = SolveScope {
            cancel: None,
            solves: &solves,
        };
        let root = &solution.lattice.nodes(0)[0];
        let stage0 = engine
            .solve_node(&solution.cuts, 0, 0, &root.values, &[], scope)
            .map_err(|f| f.into_error())?;
        Ok(engine.describe(0, 0, &stage0))
    }

    /// Run the policy on `sample_size` fresh process trajectories.
    ///
    /// Successive calls draw new trajectories; a seeded optimizer gives the
    /// same sequence of results across runs.
    pub fn simulate(&self, sample_size: usize) -> Result<SimulationResult, OptimizerError> {
        let solution = self.shared.solution()?;
        let engine = &self.shared.engine;
        let num_stages = engine.num_stages();
        let paths = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            engine.process.simulate_with(&mut *rng, num_stages, sample_size)?
        };
        let names = paths.names.clone();
        let solves = AtomicUsize::new(0);
        let scope = SolveScope {
            cancel: None,
            solves: &solves,
        };

        let per_sample = engine
            .map_indices(sample_size, |sample| {
                let path = paths.path(sample);
                let steps: Vec<(usize, &[f64])> = path
                    .iter()
                    .enumerate()
                    .map(|(t, values)| (solution.lattice.nearest_node(t, values), values.as_slice()))
                    .collect();
                let solutions = engine.walk(&solution.cuts, &steps, scope)?;
                Ok(solutions
                    .iter()
                    .enumerate()
                    .map(|(stage, sol)| {
                        let decision = engine.describe(stage, steps[stage].0, sol);
                        let states: BTreeMap<String, f64> =
                            names.iter().cloned().zip(path[stage].iter().copied()).collect();
                        SimulationRecord {
                            sample,
                            stage,
                            node: decision.node,
                            reward: decision.reward,
                            decisions: decision.decisions,
                            shadow_prices: decision.shadow_prices,
                            states,
                        }
                    })
                    .collect::<Vec<_>>())
            })
            .map_err(|f| f.into_error())?;

        Ok(SimulationResult {
            sample_size,
            num_stages,
            records: per_sample.into_iter().flatten().collect(),
        })
    }
}
