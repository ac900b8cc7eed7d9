//! Error taxonomy shared by the model, process and optimizer layers.

use std::fmt;

use thiserror::Error;

/// Malformed problem or process definition. Reported at build time, never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    /// Variable name reused within one stage
    #[error("variable '{name}' already declared in stage {stage}")]
    DuplicateVariable { stage: usize, name: String },

    /// Handle does not belong to this problem
    #[error("variable {handle} was never declared in this problem")]
    UndeclaredVariable { handle: String },

    /// Lower bound above upper bound, or NaN bound
    #[error("inconsistent bounds for '{name}': [{lower}, {upper}]")]
    InconsistentBounds {
        name: String,
        lower: f64,
        upper: f64,
    },

    /// Constraint or objective term tagged with a stage earlier than one of its variables
    #[error("'{variable}' (stage {variable_stage}) referenced from stage {stage}")]
    ForwardReference {
        variable: String,
        variable_stage: usize,
        stage: usize,
    },

    /// Expression with no decision variable and no explicit stage
    #[error("cannot infer the stage of an expression without decision variables")]
    NoDecisionVariables,

    /// Random variable with no matching process dimension
    #[error("random variable '{0}' has no matching process dimension")]
    UnknownRandomVariable(String),

    /// Invalid numeric parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// AR coefficients with a root on or inside the unit circle
    #[error("autoregressive coefficients {coefficients:?} for '{dimension}' are not stationary")]
    NonStationary {
        dimension: String,
        coefficients: Vec<f64>,
    },
}

/// A process was used before every dimension had an initial state.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("process dimension '{dimension}' has no initial state")]
pub struct NotConfiguredError {
    pub dimension: String,
}

/// Lifecycle phase of a [`crate::optimizer::DynamicOptimizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum OptimizerStatus {
    Configured,
    Running,
    Converged,
    Failed,
}

impl fmt::Display for OptimizerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerStatus::Configured => write!(f, "configured"),
            OptimizerStatus::Running => write!(f, "running"),
            OptimizerStatus::Converged => write!(f, "converged"),
            OptimizerStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Policy queried before the optimizer converged.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("policy is not ready (optimizer is {status})")]
pub struct NotReadyError {
    pub status: OptimizerStatus,
}

/// No feasible decision exists from a reachable state.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("subproblem infeasible at stage {stage}, node {node}: {detail}")]
pub struct InfeasibleError {
    pub stage: usize,
    pub node: usize,
    pub detail: String,
}

/// Failures of the stochastic process layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessError {
    #[error(transparent)]
    NotConfigured(#[from] NotConfiguredError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Failures surfaced by the optimizer and its policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizerError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    NotConfigured(#[from] NotConfiguredError),

    #[error(transparent)]
    NotReady(#[from] NotReadyError),

    #[error(transparent)]
    Infeasible(#[from] InfeasibleError),

    /// Subproblem objective unbounded (future value bound too loose or missing costs)
    #[error("subproblem unbounded at stage {stage}, node {node}")]
    Unbounded { stage: usize, node: usize },

    /// Repeated solver failure on the same subproblem
    #[error("numerical failure at stage {stage}, node {node} after {failures} failures: {detail}")]
    Numerical {
        stage: usize,
        node: usize,
        failures: usize,
        detail: String,
    },

    /// Future value still pinned at `value_bound`, so the cut bound cannot be trusted
    #[error("future value at stage {stage}, node {node} is held at value_bound = {bound}; raise value_bound")]
    ValueBoundActive { stage: usize, node: usize, bound: f64 },

    /// Exact simulated reward above the cut bound
    #[error("iteration {iteration}: simulated reward {lower} exceeds upper bound {upper}")]
    BoundsInverted { iteration: usize, upper: f64, lower: f64 },

    #[error("solve was cancelled")]
    Cancelled,

    #[error("solve() was already called")]
    AlreadyStarted,

    #[error("solve() was never called")]
    NotStarted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ProcessError> for OptimizerError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::NotConfigured(e) => OptimizerError::NotConfigured(e),
            ProcessError::Model(e) => OptimizerError::Model(e),
        }
    }
}

/// Failures loading a run configuration from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] ModelError),
}
