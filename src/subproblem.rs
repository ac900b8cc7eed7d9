//! Stage subproblem: one LP per (stage, lattice node, incoming state).
//!
//! The LP is handed to Clarabel in conic form
//!
//! ```text
//!   minimize    ½ x'Px + q'x
//!   subject to  Ax + s = b,  s ∈ {0}^m_eq × R+^m_ineq
//! ```
//!
//! with `q` the negated stage reward. Rows are kept in a canonical
//! `a_x·x + a_s·state + c (≤|=) 0` form so that the duals `z` give the
//! marginal value of each incoming state variable:
//! `∂V/∂s = c_s - Σ_rows z·a_s`.

use std::collections::HashMap;

use clarabel::algebra::CscMatrix;
use clarabel::solver::{DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus, SupportedConeT};

use crate::cuts::ValueFunction;
use crate::expr::{LinExpr, Sense};
use crate::problem::{DecisionProblem, StageShape};

const FEASIBILITY_TOLERANCE: f64 = 1e-7;
/// Relative slack under which the future value counts as sitting on `value_bound`
const VALUE_BOUND_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy)]
enum StateSource {
    Column(usize),
    Incoming(usize),
}

/// Precomputed column/state bookkeeping for one stage.
#[derive(Debug, Clone)]
pub(crate) struct StagePlan {
    pub columns: Vec<usize>,
    pub incoming: Vec<usize>,
    pub incoming_labels: Vec<String>,
    pub has_future: bool,
    constraints: Vec<usize>,
    objective: Vec<usize>,
    out_sources: Vec<StateSource>,
    col_of: HashMap<usize, usize>,
    in_of: HashMap<usize, usize>,
}

impl StagePlan {
    pub fn new(shape: &StageShape, has_future: bool) -> Self {
        let col_of: HashMap<usize, usize> = shape.columns.iter().enumerate().map(|(c, &v)| (v, c)).collect();
        let in_of: HashMap<usize, usize> = shape.incoming.iter().enumerate().map(|(i, &v)| (v, i)).collect();
        let out_sources = shape
            .outgoing
            .iter()
            .map(|v| match col_of.get(v) {
                Some(&c) => StateSource::Column(c),
                None => StateSource::Incoming(in_of.get(v).copied().unwrap_or(0)),
            })
            .collect();
        Self {
            columns: shape.columns.clone(),
            incoming: shape.incoming.clone(),
            incoming_labels: shape.incoming_labels.clone(),
            has_future,
            constraints: shape.constraints.clone(),
            objective: shape.objective.clone(),
            out_sources,
            col_of,
            in_of,
        }
    }

    fn num_lp_columns(&self) -> usize {
        self.columns.len() + usize::from(self.has_future)
    }

    fn theta(&self) -> Option<usize> {
        self.has_future.then_some(self.columns.len())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SolverSettings {
    pub max_iter: u32,
    /// Proximal weight used when retrying a failed solve
    pub regularization: f64,
    /// Upper bound on the future value before any cut exists
    pub value_bound: f64,
}

pub(crate) struct SubproblemInput<'a> {
    /// Realized random variables, indexed like the problem's random names
    pub realized: &'a [f64],
    /// Values of the plan's incoming state
    pub incoming: &'a [f64],
    pub cuts: Option<&'a ValueFunction>,
}

#[derive(Debug, Clone)]
pub(crate) struct SubproblemSolution {
    /// Per plan column
    pub decisions: Vec<f64>,
    pub stage_reward: f64,
    pub future_value: f64,
    /// Per outgoing state variable
    pub outgoing: Vec<f64>,
    /// Marginal value of each incoming state variable
    pub slopes: Vec<f64>,
    /// `(plan column, marginal value)` for every fixed column
    pub fixed_marginals: Vec<(usize, f64)>,
    /// Future value held at `value_bound` although cuts exist for this node
    pub capped: bool,
    pub retried: bool,
}

impl SubproblemSolution {
    pub fn value(&self) -> f64 {
        self.stage_reward + self.future_value
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SolveFailure {
    Infeasible(String),
    Unbounded,
    Numerical(String),
}

struct Row {
    coeffs: Vec<(usize, f64)>,
    state: Vec<(usize, f64)>,
    constant: f64,
    equality: bool,
}

impl Row {
    /// `a_x·x ≤ rhs` with the incoming state moved to the right.
    fn rhs(&self, incoming: &[f64]) -> f64 {
        -self.constant - self.state.iter().map(|(i, a)| a * incoming[*i]).sum::<f64>()
    }
}

struct Assembled {
    rows: Vec<Row>,
    /// `(plan column, row)` of each fixed-value equality
    fixed_rows: Vec<(usize, usize)>,
    reward: Vec<f64>,
    reward_state: Vec<f64>,
    reward_constant: f64,
}

fn assemble(
    problem: &DecisionProblem,
    plan: &StagePlan,
    input: &SubproblemInput<'_>,
    value_bound: f64,
) -> Assembled {
    let vars = problem.variables();
    let n_in = plan.incoming.len();
    let mut rows = Vec::new();
    let mut fixed_rows = Vec::new();

    let linear_row = |expr: &LinExpr, sign: f64, equality: bool| -> Row {
        let mut coeffs = Vec::new();
        let mut state = Vec::new();
        for (var, coef) in expr.terms() {
            let a = sign * coef.evaluate(input.realized);
            if a == 0.0 {
                continue;
            }
            if let Some(&c) = plan.col_of.get(&var.index) {
                coeffs.push((c, a));
            } else if let Some(&i) = plan.in_of.get(&var.index) {
                state.push((i, a));
            }
        }
        Row {
            coeffs,
            state,
            constant: sign * expr.constant_part().evaluate(input.realized),
            equality,
        }
    };

    for &ci in &plan.constraints {
        let c = &problem.constraints()[ci].constraint;
        let row = match c.sense() {
            Sense::LessEqual => linear_row(c.expr(), 1.0, false),
            Sense::GreaterEqual => linear_row(c.expr(), -1.0, false),
            Sense::Equal => linear_row(c.expr(), 1.0, true),
        };
        rows.push(row);
    }

    for (col, &v) in plan.columns.iter().enumerate() {
        let var = &vars[v];
        let bound_row = |a: f64, constant: f64, equality: bool| Row {
            coeffs: vec![(col, a)],
            state: Vec::new(),
            constant,
            equality,
        };
        if var.is_fixed() {
            fixed_rows.push((col, rows.len()));
            rows.push(bound_row(1.0, -var.lower, true));
            continue;
        }
        if var.lower.is_finite() {
            rows.push(bound_row(-1.0, var.lower, false));
        }
        if var.upper.is_finite() {
            rows.push(bound_row(1.0, -var.upper, false));
        }
    }

    if let Some(theta) = plan.theta() {
        rows.push(Row {
            coeffs: vec![(theta, 1.0)],
            state: Vec::new(),
            constant: -value_bound,
            equality: false,
        });
        for cut in input.cuts.map(ValueFunction::cuts).unwrap_or_default() {
            let mut coeffs = vec![(theta, 1.0)];
            let mut state = Vec::new();
            for (beta, source) in cut.slopes.iter().zip(&plan.out_sources) {
                if *beta == 0.0 {
                    continue;
                }
                match *source {
                    StateSource::Column(c) => coeffs.push((c, -beta)),
                    StateSource::Incoming(i) => state.push((i, -beta)),
                }
            }
            rows.push(Row {
                coeffs,
                state,
                constant: -cut.intercept,
                equality: false,
            });
        }
    }

    let mut reward = vec![0.0; plan.num_lp_columns()];
    let mut reward_state = vec![0.0; n_in];
    let mut reward_constant = 0.0;
    for &oi in &plan.objective {
        let expr = &problem.objective_terms()[oi].expr;
        for (var, coef) in expr.terms() {
            let c = coef.evaluate(input.realized);
            if let Some(&col) = plan.col_of.get(&var.index) {
                reward[col] += c;
            } else if let Some(&i) = plan.in_of.get(&var.index) {
                reward_state[i] += c;
            }
        }
        reward_constant += expr.constant_part().evaluate(input.realized);
    }
    if let Some(theta) = plan.theta() {
        reward[theta] = 1.0;
    }

    Assembled {
        rows,
        fixed_rows,
        reward,
        reward_state,
        reward_constant,
    }
}

/// Solve the stage LP; a failed attempt is retried once with a small proximal term.
pub(crate) fn solve_stage(
    problem: &DecisionProblem,
    plan: &StagePlan,
    input: &SubproblemInput<'_>,
    settings: &SolverSettings,
) -> Result<SubproblemSolution, SolveFailure> {
    let assembled = assemble(problem, plan, input, settings.value_bound);
    match solve_assembled(plan, input, &assembled, settings, 0.0) {
        Ok(solution) => Ok(solution),
        Err(SolveFailure::Unbounded) => Err(SolveFailure::Unbounded),
        Err(_) => {
            let mut solution = solve_assembled(plan, input, &assembled, settings, settings.regularization)?;
            solution.retried = true;
            Ok(solution)
        }
    }
}

fn solve_assembled(
    plan: &StagePlan,
    input: &SubproblemInput<'_>,
    lp: &Assembled,
    settings: &SolverSettings,
    regularization: f64,
) -> Result<SubproblemSolution, SolveFailure> {
    let n = plan.num_lp_columns();
    if n == 0 {
        return solve_without_columns(plan, input, lp);
    }

    // equality rows first (zero cone), then inequalities (nonnegative cone)
    let order: Vec<usize> = (0..lp.rows.len())
        .filter(|&r| lp.rows[r].equality)
        .chain((0..lp.rows.len()).filter(|&r| !lp.rows[r].equality))
        .collect();
    let n_eq = lp.rows.iter().filter(|r| r.equality).count();
    let n_ineq = lp.rows.len() - n_eq;

    let mut columns: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
    let mut rhs = Vec::with_capacity(order.len());
    for (pos, &r) in order.iter().enumerate() {
        let row = &lp.rows[r];
        for &(c, a) in &row.coeffs {
            columns[c].push((pos, a));
        }
        rhs.push(row.rhs(input.incoming));
    }

    let mut col_ptr = Vec::with_capacity(n + 1);
    let mut row_idx = Vec::new();
    let mut values = Vec::new();
    for col in &mut columns {
        col_ptr.push(row_idx.len());
        col.sort_by_key(|(r, _)| *r);
        for &(r, v) in col.iter() {
            row_idx.push(r);
            values.push(v);
        }
    }
    col_ptr.push(row_idx.len());
    let a_mat = CscMatrix::new(order.len(), n, col_ptr, row_idx, values);

    let p_mat = if regularization > 0.0 {
        CscMatrix::new(n, n, (0..=n).collect(), (0..n).collect(), vec![regularization; n])
    } else {
        CscMatrix::new(n, n, vec![0; n + 1], Vec::new(), Vec::new())
    };
    let q: Vec<f64> = lp.reward.iter().map(|c| -c).collect();

    let mut cones: Vec<SupportedConeT<f64>> = Vec::new();
    if n_eq > 0 {
        cones.push(SupportedConeT::ZeroConeT(n_eq));
    }
    if n_ineq > 0 {
        cones.push(SupportedConeT::NonnegativeConeT(n_ineq));
    }

    let solver_settings = DefaultSettingsBuilder::default()
        .verbose(false)
        .max_iter(settings.max_iter)
        .build()
        .map_err(|e| SolveFailure::Numerical(format!("settings: {:?}", e)))?;
    let mut solver = DefaultSolver::new(&p_mat, &q, &a_mat, &rhs, &cones, solver_settings)
        .map_err(|e| SolveFailure::Numerical(format!("setup: {:?}", e)))?;
    solver.solve();

    let sol = &solver.solution;
    match sol.status {
        SolverStatus::Solved | SolverStatus::AlmostSolved => {}
        SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
            return Err(SolveFailure::Infeasible(format!("{:?}", sol.status)));
        }
        SolverStatus::DualInfeasible | SolverStatus::AlmostDualInfeasible => {
            return Err(SolveFailure::Unbounded);
        }
        _ => return Err(SolveFailure::Numerical(format!("{:?}", sol.status))),
    }

    let x = &sol.x;
    let z = &sol.z;
    let decisions = x[..plan.columns.len()].to_vec();
    let stage_reward = lp.reward_constant
        + lp.reward[..plan.columns.len()]
            .iter()
            .zip(&decisions)
            .map(|(c, v)| c * v)
            .sum::<f64>()
        + lp.reward_state
            .iter()
            .zip(input.incoming)
            .map(|(c, s)| c * s)
            .sum::<f64>();
    let future_value = plan.theta().map_or(0.0, |t| x[t]);
    let has_cuts = input.cuts.map_or(false, |vf| !vf.is_empty());
    let capped = has_cuts
        && future_value >= settings.value_bound - VALUE_BOUND_TOLERANCE * settings.value_bound.abs().max(1.0);

    let mut slopes = lp.reward_state.clone();
    for (pos, &r) in order.iter().enumerate() {
        for &(i, a) in &lp.rows[r].state {
            slopes[i] -= z[pos] * a;
        }
    }

    let mut position = vec![0; lp.rows.len()];
    for (pos, &r) in order.iter().enumerate() {
        position[r] = pos;
    }
    let fixed_marginals = lp
        .fixed_rows
        .iter()
        .map(|&(col, r)| (col, z[position[r]]))
        .collect();

    Ok(SubproblemSolution {
        outgoing: outgoing_values(plan, &decisions, input.incoming),
        decisions,
        stage_reward,
        future_value,
        slopes,
        fixed_marginals,
        capped,
        retried: false,
    })
}

/// A stage with no decisions: only check that the fixed rows hold.
fn solve_without_columns(
    plan: &StagePlan,
    input: &SubproblemInput<'_>,
    lp: &Assembled,
) -> Result<SubproblemSolution, SolveFailure> {
    for row in &lp.rows {
        let slack = row.rhs(input.incoming);
        let violated = if row.equality {
            slack.abs() > FEASIBILITY_TOLERANCE
        } else {
            slack < -FEASIBILITY_TOLERANCE
        };
        if violated {
            return Err(SolveFailure::Infeasible(format!(
                "fixed row violated by {:.3e}",
                slack.abs()
            )));
        }
    }
    let stage_reward = lp.reward_constant
        + lp.reward_state
            .iter()
            .zip(input.incoming)
            .map(|(c, s)| c * s)
            .sum::<f64>();
    Ok(SubproblemSolution {
        outgoing: outgoing_values(plan, &[], input.incoming),
        decisions: Vec::new(),
        stage_reward,
        future_value: 0.0,
        slopes: lp.reward_state.clone(),
        fixed_marginals: Vec::new(),
        capped: false,
        retried: false,
    })
}

fn outgoing_values(plan: &StagePlan, decisions: &[f64], incoming: &[f64]) -> Vec<f64> {
    plan.out_sources
        .iter()
        .map(|source| match *source {
            StateSource::Column(c) => decisions[c],
            StateSource::Incoming(i) => incoming[i],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cuts::Cut;
    use approx::assert_abs_diff_eq;

    const SETTINGS: SolverSettings = SolverSettings {
        max_iter: 200,
        regularization: 1e-8,
        value_bound: 1e4,
    };

    /// Stage 1 of a two-stage inventory problem, with the stage-0 stock as state.
    fn inventory_stage() -> (DecisionProblem, Vec<StagePlan>) {
        let mut problem = DecisionProblem::new();
        let demand = problem.random("demand");
        let stock = problem.add_fixed(0, "stock", 12.0).unwrap();
        let sell = problem.add_variable(1, "sell").unwrap();
        let buy = problem.add_variable(1, "buy").unwrap();
        let end = problem.add_variable(1, "end").unwrap();
        problem.add_constraint(sell.leq(demand)).unwrap();
        problem.add_constraint(sell.leq(stock)).unwrap();
        problem.add_constraint(end.equals(stock + buy - sell)).unwrap();
        problem
            .add_objective_term(5.0 * sell - 2.0 * buy - 0.5 * end)
            .unwrap();
        let layout = problem.layout();
        let plans = layout
            .stages
            .iter()
            .enumerate()
            .map(|(t, shape)| StagePlan::new(shape, t + 1 < layout.stages.len()))
            .collect();
        (problem, plans)
    }

    #[test]
    fn test_decisions_and_state_slope() {
        let (problem, plans) = inventory_stage();
        let plan = &plans[1];
        let input = SubproblemInput {
            realized: &[10.0],
            incoming: &[12.0],
            cuts: None,
        };
        let sol = solve_stage(&problem, plan, &input, &SETTINGS).unwrap();
        assert_abs_diff_eq!(sol.decisions[0], 10.0, epsilon = 1e-5);
        assert_abs_diff_eq!(sol.decisions[1], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(sol.decisions[2], 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(sol.stage_reward, 49.0, epsilon = 1e-4);
        // one more unit of stock is only held, at a cost of 0.5
        assert_abs_diff_eq!(sol.slopes[0], -0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_slope_when_stock_is_short() {
        let (problem, plans) = inventory_stage();
        let input = SubproblemInput {
            realized: &[10.0],
            incoming: &[6.0],
            cuts: None,
        };
        let sol = solve_stage(&problem, &plans[1], &input, &SETTINGS).unwrap();
        // sell ≤ stock binds, so an extra unit of stock sells at 5
        assert_abs_diff_eq!(sol.decisions[0], 6.0, epsilon = 1e-5);
        assert_abs_diff_eq!(sol.stage_reward, 30.0, epsilon = 1e-4);
        assert_abs_diff_eq!(sol.slopes[0], 5.0, epsilon = 1e-4);
    }

    #[test]
    fn test_cut_bounds_future_value() {
        let (problem, plans) = inventory_stage();
        let plan = &plans[0];
        assert!(plan.has_future);
        let mut vf = ValueFunction::default();
        vf.add(Cut {
            intercept: 55.0,
            slopes: vec![-0.5],
        });
        let input = SubproblemInput {
            realized: &[10.0],
            incoming: &[],
            cuts: Some(&vf),
        };
        let sol = solve_stage(&problem, plan, &input, &SETTINGS).unwrap();
        assert_abs_diff_eq!(sol.future_value, 49.0, epsilon = 1e-4);
        assert_eq!(sol.outgoing.len(), 1);
        assert_abs_diff_eq!(sol.outgoing[0], 12.0, epsilon = 1e-6);
        // the fixed stock is worth the cut slope
        assert_eq!(sol.fixed_marginals.len(), 1);
        assert_eq!(sol.fixed_marginals[0].0, 0);
        assert_abs_diff_eq!(sol.fixed_marginals[0].1, -0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_value_bound_reported_when_it_binds_over_cuts() {
        let (problem, plans) = inventory_stage();
        let plan = &plans[0];
        let mut vf = ValueFunction::default();
        vf.add(Cut {
            intercept: 2e4,
            slopes: vec![0.0],
        });
        let input = SubproblemInput {
            realized: &[10.0],
            incoming: &[],
            cuts: Some(&vf),
        };
        let sol = solve_stage(&problem, plan, &input, &SETTINGS).unwrap();
        assert!(sol.capped);
        assert_abs_diff_eq!(sol.future_value, SETTINGS.value_bound, epsilon = 1e-2);

        let loose = SolverSettings {
            value_bound: 1e5,
            ..SETTINGS
        };
        let sol = solve_stage(&problem, plan, &input, &loose).unwrap();
        assert!(!sol.capped);
        assert_abs_diff_eq!(sol.future_value, 2e4, epsilon = 1e-2);
    }

    #[test]
    fn test_infeasible_stage_reported() {
        let mut problem = DecisionProblem::new();
        let x = problem.add_variable(0, "x").unwrap();
        problem.add_constraint(x.geq(5.0)).unwrap();
        problem.add_constraint(x.leq(2.0)).unwrap();
        problem.add_objective_term(x * 1.0).unwrap();
        let layout = problem.layout();
        let plan = StagePlan::new(&layout.stages[0], false);
        let input = SubproblemInput {
            realized: &[],
            incoming: &[],
            cuts: None,
        };
        let err = solve_stage(&problem, &plan, &input, &SETTINGS).unwrap_err();
        assert!(matches!(err, SolveFailure::Infeasible(_)));
    }
}
