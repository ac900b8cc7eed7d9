//! Background optimizer: iterates forward/backward passes over the scenario
//! lattice, refining per-node cut approximations of the future reward until
//! the cut bound and the simulated policy reward meet.
//!
//! Lifecycle: `Configured → Running → Converged | Failed`. `solve` starts a
//! worker thread; `join` blocks until the run is terminal and may be called
//! any number of times from any thread.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::OptimizerConfig;
use crate::cuts::{Cut, CutStore};
use crate::error::{InfeasibleError, ModelError, NotReadyError, OptimizerError, OptimizerStatus};
use crate::lattice::Lattice;
use crate::models::{SolutionStats, SolveSummary, StageDecision, TerminationReason};
use crate::monte_carlo::{summarize, SampleSummary};
use crate::policy::Policy;
use crate::problem::DecisionProblem;
use crate::process::StochasticProcess;
use crate::subproblem::{solve_stage, SolveFailure, SolverSettings, StagePlan, SubproblemInput, SubproblemSolution};

/// Shared flag checked before every subproblem solve.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Read-only, thread-safe view of the per-iteration statistics.
///
/// Each append publishes a new immutable snapshot, so the lock is only held
/// to swap or clone a pointer and readers never see a partial iteration.
#[derive(Debug, Clone)]
pub struct StatsLog {
    records: Arc<RwLock<Arc<[SolutionStats]>>>,
}

impl Default for StatsLog {
    fn default() -> Self {
        Self {
            records: Arc::new(RwLock::new(Arc::from(Vec::new()))),
        }
    }
}

impl StatsLog {
    /// Records published so far, shared with the log.
    pub fn current(&self) -> Arc<[SolutionStats]> {
        Arc::clone(&self.records.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn snapshot(&self) -> Vec<SolutionStats> {
        self.current().to_vec()
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    pub fn last(&self) -> Option<SolutionStats> {
        self.current().last().cloned()
    }

    /// Single writer: the worker thread.
    fn push(&self, record: SolutionStats) {
        let mut next = self.current().to_vec();
        next.push(record);
        *self.records.write().unwrap_or_else(PoisonError::into_inner) = Arc::from(next);
    }
}

/// Where a subproblem solve went wrong.
#[derive(Debug, Clone)]
pub(crate) enum NodeFailure {
    Cancelled,
    Solve {
        stage: usize,
        node: usize,
        failure: SolveFailure,
    },
}

impl NodeFailure {
    /// Terminal error for a failure that is not retried at the iteration level.
    pub(crate) fn into_error(self) -> OptimizerError {
        match self {
            NodeFailure::Cancelled => OptimizerError::Cancelled,
            NodeFailure::Solve { stage, node, failure } => match failure {
                SolveFailure::Infeasible(detail) => InfeasibleError { stage, node, detail }.into(),
                SolveFailure::Unbounded => OptimizerError::Unbounded { stage, node },
                SolveFailure::Numerical(detail) => OptimizerError::Numerical {
                    stage,
                    node,
                    failures: 1,
                    detail,
                },
            },
        }
    }
}

/// Cancellation and solve counting for one batch of subproblem solves.
#[derive(Clone, Copy)]
pub(crate) struct SolveScope<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub solves: &'a AtomicUsize,
}

/// Bounds from one completed sweep.
struct IterationOutcome {
    upper: f64,
    lower: SampleSummary,
    /// First (stage, node) whose future value sat on `value_bound` despite cuts
    capped: Option<(usize, usize)>,
}

fn note_capped(slot: &mut Option<(usize, usize)>, stage: usize, node: usize, solution: &SubproblemSolution) {
    if solution.capped && slot.is_none() {
        *slot = Some((stage, node));
    }
}

/// Converged state handed to the policy.
#[derive(Debug)]
pub(crate) struct Solution {
    pub lattice: Lattice,
    pub cuts: CutStore,
    pub summary: SolveSummary,
}

/// Immutable inputs of a run plus the stage plans derived from them.
pub(crate) struct Engine {
    pub problem: DecisionProblem,
    pub process: StochasticProcess,
    pub config: OptimizerConfig,
    plans: Vec<StagePlan>,
    /// Process dimension feeding each random variable of the problem
    random_dims: Vec<usize>,
    preset_lattice: Option<Lattice>,
    settings: SolverSettings,
}

impl Engine {
    fn new(
        problem: DecisionProblem,
        process: StochasticProcess,
        preset_lattice: Option<Lattice>,
        config: OptimizerConfig,
    ) -> Result<Self, OptimizerError> {
        config.validate()?;
        let num_stages = problem.num_stages();
        if num_stages == 0 {
            return Err(ModelError::InvalidParameter("problem has no stages".to_string()).into());
        }
        if problem.variables().is_empty() {
            return Err(ModelError::NoDecisionVariables.into());
        }
        let random_dims = problem
            .random_names()
            .iter()
            .map(|name| {
                process
                    .dimension_index(name)
                    .ok_or_else(|| ModelError::UnknownRandomVariable(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        process.initial_state()?;

        if let Some(lattice) = &preset_lattice {
            if lattice.num_stages() != num_stages {
                return Err(ModelError::InvalidParameter(format!(
                    "lattice has {} stages, problem has {}",
                    lattice.num_stages(),
                    num_stages
                ))
                .into());
            }
            if lattice.names() != process.names().as_slice() {
                return Err(ModelError::InvalidParameter(
                    "lattice dimensions differ from the process dimensions".to_string(),
                )
                .into());
            }
            if lattice.num_nodes(0) != 1 {
                return Err(ModelError::InvalidParameter("lattice stage 0 must have a single node".to_string()).into());
            }
        }

        let layout = problem.layout();
        let plans = layout
            .stages
            .iter()
            .enumerate()
            .map(|(t, shape)| StagePlan::new(shape, t + 1 < num_stages))
            .collect();
        let settings = SolverSettings {
            max_iter: config.solver_max_iter,
            regularization: config.regularization,
            value_bound: config.value_bound,
        };

        Ok(Self {
            problem,
            process,
            config,
            plans,
            random_dims,
            preset_lattice,
            settings,
        })
    }

    pub(crate) fn num_stages(&self) -> usize {
        self.plans.len()
    }

    pub(crate) fn solve_node(
        &self,
        cuts: &CutStore,
        stage: usize,
        node: usize,
        values: &[f64],
        incoming: &[f64],
        scope: SolveScope<'_>,
    ) -> Result<SubproblemSolution, NodeFailure> {
        if scope.cancel.map_or(false, CancellationToken::is_cancelled) {
            return Err(NodeFailure::Cancelled);
        }
        let realized: Vec<f64> = self.random_dims.iter().map(|&d| values[d]).collect();
        let input = SubproblemInput {
            realized: &realized,
            incoming,
            cuts: cuts.get(stage, node),
        };
        scope.solves.fetch_add(1, Ordering::Relaxed);
        let solution = solve_stage(&self.problem, &self.plans[stage], &input, &self.settings)
            .map_err(|failure| NodeFailure::Solve { stage, node, failure })?;
        if solution.retried {
            warn!(stage, node, "subproblem solved only after a regularized retry");
        }
        Ok(solution)
    }

    /// Solve stage by stage along one path, `steps[t]` = (node, process values).
    pub(crate) fn walk(
        &self,
        cuts: &CutStore,
        steps: &[(usize, &[f64])],
        scope: SolveScope<'_>,
    ) -> Result<Vec<SubproblemSolution>, NodeFailure> {
        let mut incoming: Vec<f64> = Vec::new();
        let mut solutions = Vec::with_capacity(steps.len());
        for (stage, &(node, values)) in steps.iter().enumerate() {
            let solution = self.solve_node(cuts, stage, node, values, &incoming, scope)?;
            incoming = solution.outgoing.clone();
            solutions.push(solution);
        }
        Ok(solutions)
    }

    /// Named view of one stage solution.
    pub(crate) fn describe(&self, stage: usize, node: usize, solution: &SubproblemSolution) -> StageDecision {
        let plan = &self.plans[stage];
        let vars = self.problem.variables();
        let decisions = plan
            .columns
            .iter()
            .zip(&solution.decisions)
            .map(|(&v, &x)| (vars[v].name.clone(), x))
            .collect();
        let mut shadow_prices: BTreeMap<String, f64> = plan
            .incoming_labels
            .iter()
            .cloned()
            .zip(solution.slopes.iter().copied())
            .collect();
        for &(col, marginal) in &solution.fixed_marginals {
            shadow_prices.insert(vars[plan.columns[col]].name.clone(), marginal);
        }
        StageDecision {
            stage,
            node,
            reward: solution.stage_reward,
            future_value: solution.future_value,
            decisions,
            shadow_prices,
        }
    }

    /// Run `f` over `0..n`, on the rayon pool when parallel solving is enabled.
    pub(crate) fn map_indices<T, F>(&self, n: usize, f: F) -> Result<Vec<T>, NodeFailure>
    where
        T: Send,
        F: Fn(usize) -> Result<T, NodeFailure> + Sync + Send,
    {
        if self.config.parallel {
            (0..n).into_par_iter().map(f).collect()
        } else {
            (0..n).map(f).collect()
        }
    }

    fn run(&self, stats: &StatsLog, cancel: &CancellationToken) -> Result<Solution, OptimizerError> {
        let started = Instant::now();
        let config = &self.config;
        let num_stages = self.num_stages();
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let lattice = match &self.preset_lattice {
            Some(lattice) => lattice.clone(),
            None => self
                .process
                .discretize_with(&mut rng, num_stages, config.num_nodes)?,
        };
        let nodes_per_stage: Vec<usize> = (0..num_stages).map(|t| lattice.num_nodes(t)).collect();
        info!(stages = num_stages, nodes = ?nodes_per_stage, "lattice ready");

        let mut cuts = CutStore::new(&nodes_per_stage);
        let solves = AtomicUsize::new(0);
        let scope = SolveScope {
            cancel: Some(cancel),
            solves: &solves,
        };
        let simulation_seed: u64 = rng.gen();
        let mut failures: HashMap<(usize, usize), usize> = HashMap::new();
        let mut best_upper = f64::INFINITY;
        let mut stable = 0;
        let mut last: Option<SolutionStats> = None;
        let mut last_capped: Option<(usize, usize)> = None;
        let mut termination = TerminationReason::IterationLimit;
        // every lattice path is the same path, so the simulated reward is exact
        let exact_lower = nodes_per_stage.iter().all(|&n| n == 1);

        for iteration in 1..=config.max_iterations {
            if cancel.is_cancelled() {
                return Err(OptimizerError::Cancelled);
            }
            let outcome = self.iterate(&lattice, &mut cuts, &mut rng, scope, iteration, simulation_seed);
            let IterationOutcome { upper, lower, capped } = match outcome {
                Ok(outcome) => outcome,
                Err(NodeFailure::Solve {
                    stage,
                    node,
                    failure: SolveFailure::Numerical(detail),
                }) => {
                    let count = failures.entry((stage, node)).or_insert(0);
                    *count += 1;
                    if *count >= config.max_subproblem_failures {
                        error!(stage, node, failures = *count, %detail, "giving up on subproblem");
                        return Err(OptimizerError::Numerical {
                            stage,
                            node,
                            failures: *count,
                            detail,
                        });
                    }
                    warn!(iteration, stage, node, %detail, "numerical failure, iteration abandoned");
                    if self.out_of_time(started) {
                        termination = TerminationReason::TimeLimit;
                        break;
                    }
                    continue;
                }
                Err(failure) => {
                    let err = failure.into_error();
                    error!(iteration, error = %err, "optimizer failed");
                    return Err(err);
                }
            };

            best_upper = best_upper.min(upper);
            let record = SolutionStats {
                iteration,
                expected_reward: best_upper,
                simulated_reward: lower.mean,
                std_error: lower.std_error,
                sample_size: lower.sample_size,
                cut_count: cuts.total(),
                solves: solves.load(Ordering::Relaxed),
                elapsed_secs: started.elapsed().as_secs_f64(),
            };
            info!(
                iteration,
                upper = record.expected_reward,
                lower = record.simulated_reward,
                std_error = record.std_error,
                cuts = record.cut_count,
                "iteration complete"
            );
            stats.push(record.clone());

            let tolerance = config.abs_tolerance.max(config.rel_tolerance * best_upper.abs())
                + config.confidence_z * lower.std_error;
            if record.gap() < -tolerance {
                if exact_lower {
                    error!(iteration, upper = best_upper, lower = lower.mean, "simulated reward above the bound");
                    return Err(OptimizerError::BoundsInverted {
                        iteration,
                        upper: best_upper,
                        lower: lower.mean,
                    });
                }
                warn!(iteration, upper = best_upper, lower = lower.mean, "simulated reward above the bound");
            }
            if let Some((stage, node)) = capped {
                debug!(iteration, stage, node, "future value held at value_bound");
                if record.gap() <= tolerance {
                    return Err(self.value_bound_active(stage, node));
                }
                stable = 0;
            } else if record.gap() <= tolerance {
                stable += 1;
            } else {
                stable = 0;
            }
            last = Some(record);
            last_capped = capped;

            if stable >= config.stable_iterations {
                termination = TerminationReason::BoundsClosed;
                break;
            }
            if self.out_of_time(started) {
                termination = TerminationReason::TimeLimit;
                break;
            }
        }

        let last = last.ok_or_else(|| OptimizerError::Internal("no iteration completed".to_string()))?;
        if let Some((stage, node)) = last_capped {
            return Err(self.value_bound_active(stage, node));
        }
        let summary = SolveSummary {
            iterations: last.iteration,
            termination,
            upper_bound: last.expected_reward,
            lower_bound: last.simulated_reward,
            std_error: last.std_error,
            cut_count: last.cut_count,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        info!(?termination, iterations = summary.iterations, upper = summary.upper_bound, lower = summary.lower_bound, "optimizer converged");
        Ok(Solution {
            lattice,
            cuts,
            summary,
        })
    }

    fn value_bound_active(&self, stage: usize, node: usize) -> OptimizerError {
        let bound = self.config.value_bound;
        error!(stage, node, bound, "future value still held at value_bound");
        OptimizerError::ValueBoundActive { stage, node, bound }
    }

    fn out_of_time(&self, started: Instant) -> bool {
        self.config
            .time_limit_secs
            .map_or(false, |limit| started.elapsed().as_secs_f64() >= limit)
    }

    /// One forward/backward sweep; returns the stage-0 value and the simulated rewards.
    fn iterate(
        &self,
        lattice: &Lattice,
        cuts: &mut CutStore,
        rng: &mut StdRng,
        scope: SolveScope<'_>,
        iteration: usize,
        simulation_seed: u64,
    ) -> Result<IterationOutcome, NodeFailure> {
        let num_stages = self.num_stages();
        let mut capped = None;

        // forward: trial outgoing states per pass and stage
        let mut trials: Vec<Vec<Vec<f64>>> = Vec::with_capacity(self.config.forward_passes);
        for _ in 0..self.config.forward_passes {
            let path = lattice.sample_path(rng);
            let solutions = self.walk(cuts, &lattice_steps(lattice, &path), scope)?;
            for (t, solution) in solutions.iter().enumerate() {
                note_capped(&mut capped, t, path[t], solution);
            }
            trials.push(solutions.into_iter().map(|s| s.outgoing).collect());
        }

        // backward: every node of stage t at the trial state, one cut per node of t - 1
        for t in (1..num_stages).rev() {
            let nodes = lattice.nodes(t);
            for trial in &trials {
                let state = &trial[t - 1];
                let frozen: &CutStore = cuts;
                let solutions = self.map_indices(nodes.len(), |m| {
                    self.solve_node(frozen, t, m, &nodes[m].values, state, scope)
                })?;
                for (m, solution) in solutions.iter().enumerate() {
                    note_capped(&mut capped, t, m, solution);
                }
                let values: Vec<f64> = solutions.iter().map(SubproblemSolution::value).collect();
                let slopes: Vec<Vec<f64>> = solutions.into_iter().map(|s| s.slopes).collect();
                for n in 0..lattice.num_nodes(t - 1) {
                    let cut = Cut::expected(lattice.transition_row(t - 1, n), &values, &slopes, state);
                    if cuts.add(t - 1, n, cut) {
                        debug!(iteration, stage = t - 1, node = n, "cut added");
                    }
                }
            }
        }

        let roots = lattice.nodes(0);
        let mut upper = 0.0;
        for (n, node) in roots.iter().enumerate() {
            let root = self.solve_node(cuts, 0, n, &node.values, &[], scope)?;
            note_capped(&mut capped, 0, n, &root);
            upper += node.probability * root.value();
        }

        let frozen: &CutStore = cuts;
        let totals = self.map_indices(self.config.bound_sample_size, |i| {
            let mut sample_rng = StdRng::seed_from_u64(sample_seed(simulation_seed, iteration, i));
            let path = lattice.sample_path(&mut sample_rng);
            let solutions = self.walk(frozen, &lattice_steps(lattice, &path), scope)?;
            let mut sample_capped = None;
            for (t, solution) in solutions.iter().enumerate() {
                note_capped(&mut sample_capped, t, path[t], solution);
            }
            Ok((solutions.iter().map(|s| s.stage_reward).sum::<f64>(), sample_capped))
        })?;
        if capped.is_none() {
            capped = totals.iter().find_map(|(_, c)| *c);
        }
        let totals: Vec<f64> = totals.into_iter().map(|(total, _)| total).collect();

        Ok(IterationOutcome {
            upper,
            lower: summarize(&totals),
            capped,
        })
    }
}

fn lattice_steps<'a>(lattice: &'a Lattice, path: &[usize]) -> Vec<(usize, &'a [f64])> {
    path.iter()
        .enumerate()
        .map(|(t, &n)| (n, lattice.nodes(t)[n].values.as_slice()))
        .collect()
}

/// Independent stream per (iteration, sample) so results do not depend on thread scheduling.
fn sample_seed(base: u64, iteration: usize, sample: usize) -> u64 {
    base ^ (iteration as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (sample as u64).wrapping_add(1).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
}

#[derive(Debug)]
enum Phase {
    Configured,
    Running,
    Converged(Arc<Solution>),
    Failed(OptimizerError),
}

impl Phase {
    fn status(&self) -> OptimizerStatus {
        match self {
            Phase::Configured => OptimizerStatus::Configured,
            Phase::Running => OptimizerStatus::Running,
            Phase::Converged(_) => OptimizerStatus::Converged,
            Phase::Failed(_) => OptimizerStatus::Failed,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) engine: Engine,
    phase: Mutex<Phase>,
    finished: Condvar,
    stats: StatsLog,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status(&self) -> OptimizerStatus {
        self.lock_phase().status()
    }

    /// Converged state, or the phase the optimizer is in instead.
    pub(crate) fn solution(&self) -> Result<Arc<Solution>, NotReadyError> {
        let phase = self.lock_phase();
        match &*phase {
            Phase::Converged(solution) => Ok(Arc::clone(solution)),
            other => Err(NotReadyError {
                status: other.status(),
            }),
        }
    }

    fn finish(&self, outcome: Result<Solution, OptimizerError>) {
        let mut phase = self.lock_phase();
        if !matches!(*phase, Phase::Running) {
            return;
        }
        *phase = match outcome {
            Ok(solution) => Phase::Converged(Arc::new(solution)),
            Err(err) => Phase::Failed(err),
        };
        self.finished.notify_all();
    }

    fn run_worker(&self) {
        let _guard = PanicGuard { shared: self };
        let outcome = self.engine.run(&self.stats, &self.cancel);
        self.finish(outcome);
    }
}

/// Marks the run failed if the worker unwinds.
struct PanicGuard<'a> {
    shared: &'a Shared,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("optimizer worker panicked");
            self.shared
                .finish(Err(OptimizerError::Internal("optimizer worker panicked".to_string())));
        }
    }
}

/// Iterative optimizer for a [`DecisionProblem`] driven by a [`StochasticProcess`].
pub struct DynamicOptimizer {
    shared: Arc<Shared>,
}

impl DynamicOptimizer {
    /// Validate the inputs; the lattice is built from the process when the solve starts.
    pub fn new(
        problem: DecisionProblem,
        process: StochasticProcess,
        config: OptimizerConfig,
    ) -> Result<Self, OptimizerError> {
        Ok(Self::from_engine(Engine::new(problem, process, None, config)?))
    }

    /// Use a prepared lattice instead of discretizing the process.
    ///
    /// The process still drives [`Policy::simulate`].
    pub fn with_lattice(
        problem: DecisionProblem,
        process: StochasticProcess,
        lattice: Lattice,
        config: OptimizerConfig,
    ) -> Result<Self, OptimizerError> {
        Ok(Self::from_engine(Engine::new(problem, process, Some(lattice), config)?))
    }

    fn from_engine(engine: Engine) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                phase: Mutex::new(Phase::Configured),
                finished: Condvar::new(),
                stats: StatsLog::default(),
                cancel: CancellationToken::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> OptimizerStatus {
        self.shared.status()
    }

    pub fn stats(&self) -> StatsLog {
        self.shared.stats.clone()
    }

    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Start the background run.
    pub fn solve(&self) -> Result<(), OptimizerError> {
        let mut phase = self.shared.lock_phase();
        if !matches!(*phase, Phase::Configured) {
            return Err(OptimizerError::AlreadyStarted);
        }
        *phase = Phase::Running;
        drop(phase);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("dynamic-optimizer".to_string())
            .spawn(move || shared.run_worker());
        match spawned {
            Ok(handle) => {
                *self.shared.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Err(e) => {
                let err = OptimizerError::Internal(format!("failed to spawn worker: {}", e));
                self.shared.finish(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Block until the run is terminal.
    pub fn join(&self) -> Result<SolveSummary, OptimizerError> {
        let outcome = {
            let mut phase = self.shared.lock_phase();
            loop {
                match &*phase {
                    Phase::Configured => return Err(OptimizerError::NotStarted),
                    Phase::Running => {
                        phase = self
                            .shared
                            .finished
                            .wait(phase)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    Phase::Converged(solution) => break Ok(solution.summary.clone()),
                    Phase::Failed(err) => break Err(err.clone()),
                }
            }
        };
        let handle = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        outcome
    }

    /// `solve` followed by `join`.
    pub fn solve_blocking(&self) -> Result<SolveSummary, OptimizerError> {
        self.solve()?;
        self.join()
    }

    /// Handle on the decision rule; usable once the run has converged.
    pub fn policy(&self) -> Policy {
        Policy::new(Arc::clone(&self.shared))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::InventoryParams;
    use crate::process::StochasticProcess;

    fn demand_process() -> StochasticProcess {
        StochasticProcess::geometric_brownian("demand", 0.0, 0.0)
            .unwrap()
            .with_initial_state("demand", 10.0)
            .unwrap()
            .with_seed(3)
    }

    fn config() -> OptimizerConfig {
        OptimizerConfig {
            num_nodes: 2,
            bound_sample_size: 4,
            max_iterations: 20,
            seed: Some(11),
            ..OptimizerConfig::default()
        }
    }

    fn params(num_stages: usize) -> InventoryParams {
        InventoryParams {
            num_stages,
            ..InventoryParams::default()
        }
    }

    #[test]
    fn test_new_optimizer_is_configured() {
        let problem = params(2).build_problem().unwrap();
        let optimizer = DynamicOptimizer::new(problem, demand_process(), config()).unwrap();
        assert_eq!(optimizer.status(), OptimizerStatus::Configured);
        assert!(optimizer.stats().is_empty());
        assert!(matches!(optimizer.join(), Err(OptimizerError::NotStarted)));
    }

    #[test]
    fn test_unknown_random_variable_rejected() {
        let problem = InventoryParams {
            demand: "orders".to_string(),
            ..params(2)
        }
        .build_problem()
        .unwrap();
        let err = DynamicOptimizer::new(problem, demand_process(), config()).err();
        assert!(matches!(
            err,
            Some(OptimizerError::Model(ModelError::UnknownRandomVariable(ref name))) if name == "orders"
        ));
    }

    #[test]
    fn test_missing_initial_state_rejected() {
        let problem = params(2).build_problem().unwrap();
        let process = StochasticProcess::geometric_brownian("demand", 0.0, 0.1).unwrap();
        let err = DynamicOptimizer::new(problem, process, config()).err();
        assert!(matches!(err, Some(OptimizerError::NotConfigured(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let problem = params(2).build_problem().unwrap();
        let bad = OptimizerConfig {
            value_bound: 0.0,
            ..config()
        };
        assert!(matches!(
            DynamicOptimizer::new(problem, demand_process(), bad),
            Err(OptimizerError::Model(ModelError::InvalidParameter(_)))
        ));
    }

    #[test]
    fn test_second_solve_is_rejected() {
        let problem = params(2).build_problem().unwrap();
        let optimizer = DynamicOptimizer::new(problem, demand_process(), config()).unwrap();
        optimizer.solve().unwrap();
        assert!(matches!(optimizer.solve(), Err(OptimizerError::AlreadyStarted)));
        assert!(optimizer.join().is_ok());
        assert_eq!(optimizer.status(), OptimizerStatus::Converged);
    }

    #[test]
    fn test_deterministic_two_stage_bounds_meet() {
        // demand 10 at both stages, 12 on hand: buy 8 at stage 0 to cover stage 1
        let problem = params(2).build_problem().unwrap();
        let optimizer = DynamicOptimizer::new(problem, demand_process(), config()).unwrap();
        let summary = optimizer.solve_blocking().unwrap();
        assert_eq!(summary.termination, TerminationReason::BoundsClosed);
        assert!((summary.upper_bound - summary.lower_bound).abs() < 1e-2);
        let stats = optimizer.stats().snapshot();
        assert_eq!(stats.len(), summary.iterations);
        assert!(stats.windows(2).all(|w| w[1].expected_reward <= w[0].expected_reward));
    }

    #[test]
    fn test_stats_snapshots_are_not_disturbed_by_appends() {
        let record = |iteration: usize| SolutionStats {
            iteration,
            expected_reward: 10.0,
            simulated_reward: 9.0,
            std_error: 0.1,
            sample_size: 4,
            cut_count: iteration,
            solves: 3 * iteration,
            elapsed_secs: 0.0,
        };
        let log = StatsLog::default();
        log.push(record(1));
        let held = log.current();
        log.push(record(2));
        assert_eq!(held.len(), 1);
        assert_eq!(log.len(), 2);
        assert_eq!(log.last().map(|r| r.iteration), Some(2));
    }

    #[test]
    fn test_sample_seeds_differ() {
        assert_ne!(sample_seed(1, 1, 0), sample_seed(1, 1, 1));
        assert_ne!(sample_seed(1, 1, 0), sample_seed(1, 2, 0));
    }
}
