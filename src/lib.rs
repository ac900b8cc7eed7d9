//! Multi-stage stochastic inventory optimization.
//!
//! Build a [`DecisionProblem`], describe the uncertainty with a
//! [`StochasticProcess`], and let a [`DynamicOptimizer`] approximate the
//! optimal policy in the background.

pub mod config;
pub mod cuts;
pub mod error;
pub mod expr;
pub mod inventory;
pub mod lattice;
pub mod logging;
pub mod models;
pub mod monte_carlo;
pub mod optimizer;
pub mod policy;
pub mod problem;
pub mod process;
pub mod reporting;
mod subproblem;

pub use config::{OptimizerConfig, RunConfig};
pub use error::{
    ConfigError, InfeasibleError, ModelError, NotConfiguredError, NotReadyError, OptimizerError, OptimizerStatus,
    ProcessError,
};
pub use expr::{Constraint, LinExpr, RandomRef, Sense, VariableHandle};
pub use inventory::InventoryParams;
pub use lattice::{Lattice, LatticeNode};
pub use models::{SimulationRecord, SimulationResult, SolutionStats, SolveSummary, StageDecision, TerminationReason};
pub use optimizer::{CancellationToken, DynamicOptimizer, StatsLog};
pub use policy::Policy;
pub use problem::DecisionProblem;
pub use process::{DimensionConfig, ProcessConfig, ProcessLaw, SamplePaths, StochasticProcess};
