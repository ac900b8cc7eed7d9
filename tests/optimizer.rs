use approx::assert_abs_diff_eq;

use stochastic_inventory::inventory::{BUY, INITIAL_INVENTORY, INVENTORY, SELL};
use stochastic_inventory::{
    logging, DecisionProblem, DynamicOptimizer, InventoryParams, Lattice, LatticeNode, OptimizerConfig,
    OptimizerError, OptimizerStatus, StochasticProcess, TerminationReason,
};

fn constant_demand(level: f64) -> StochasticProcess {
    StochasticProcess::geometric_brownian("demand", 0.0, 0.0)
        .unwrap()
        .with_initial_state("demand", level)
        .unwrap()
        .with_seed(5)
}

fn config() -> OptimizerConfig {
    OptimizerConfig {
        num_nodes: 3,
        bound_sample_size: 8,
        max_iterations: 25,
        seed: Some(2024),
        ..OptimizerConfig::default()
    }
}

fn inventory(num_stages: usize, initial_inventory: f64) -> InventoryParams {
    InventoryParams {
        num_stages,
        initial_inventory,
        ..InventoryParams::default()
    }
}

#[test]
fn test_single_stage_sells_demand() {
    logging::init_test();
    let params = InventoryParams {
        liquidation_price: 0.0,
        max_purchase: None,
        ..inventory(1, 12.0)
    };
    let optimizer = DynamicOptimizer::new(params.build_problem().unwrap(), constant_demand(10.0), config()).unwrap();
    let summary = optimizer.solve_blocking().unwrap();
    assert_abs_diff_eq!(summary.upper_bound, 49.0, epsilon = 1e-4);

    let first = optimizer.policy().first_stage_solution().unwrap();
    assert_abs_diff_eq!(first.decisions[SELL], 10.0, epsilon = 1e-4);
    assert_abs_diff_eq!(first.decisions[BUY], 0.0, epsilon = 1e-4);
    assert_abs_diff_eq!(first.decisions[INVENTORY], 2.0, epsilon = 1e-4);
    assert_abs_diff_eq!(first.decisions[INITIAL_INVENTORY], 12.0, epsilon = 1e-6);
    assert_abs_diff_eq!(first.reward, 49.0, epsilon = 1e-4);
    // an extra starting unit is only held
    assert_abs_diff_eq!(first.shadow_prices[INITIAL_INVENTORY], -0.5, epsilon = 1e-4);
}

#[test]
fn test_zero_demand_buys_nothing() {
    let params = InventoryParams {
        max_purchase: None,
        ..inventory(2, 0.0)
    };
    let optimizer = DynamicOptimizer::new(params.build_problem().unwrap(), constant_demand(0.0), config()).unwrap();
    let summary = optimizer.solve_blocking().unwrap();
    assert!(summary.upper_bound <= 1e-4);

    let policy = optimizer.policy();
    let first = policy.first_stage_solution().unwrap();
    assert_abs_diff_eq!(first.decisions[SELL], 0.0, epsilon = 1e-4);
    assert_abs_diff_eq!(first.decisions[BUY], 0.0, epsilon = 1e-4);

    let result = policy.simulate(5).unwrap();
    assert_eq!(result.records.len(), 10);
    for total in result.total_rewards() {
        assert!(total <= 1e-4);
    }
    assert!(result.decision_column(1, SELL).iter().all(|s| s.abs() < 1e-4));
}

#[test]
fn test_deterministic_bounds_are_ordered_and_monotone() {
    let optimizer = DynamicOptimizer::new(inventory(3, 12.0).build_problem().unwrap(), constant_demand(10.0), config())
        .unwrap();
    let summary = optimizer.solve_blocking().unwrap();
    let stats = optimizer.stats().snapshot();
    assert!(!stats.is_empty());
    for pair in stats.windows(2) {
        assert!(pair[1].expected_reward <= pair[0].expected_reward);
        assert!(pair[1].solves > pair[0].solves);
    }
    for record in &stats {
        assert!(record.simulated_reward <= record.expected_reward + 1e-4 * (1.0 + record.expected_reward.abs()));
    }
    // 12 on hand, demand 10 each stage: buy 8, then 10, then nothing
    assert_eq!(summary.termination, TerminationReason::BoundsClosed);
    assert_abs_diff_eq!(summary.upper_bound, 50.0 - 16.0 - 5.0 + 50.0 - 20.0 - 5.0 + 50.0, epsilon = 1e-2);
}

#[test]
fn test_stochastic_upper_bound_never_increases() {
    let process = StochasticProcess::geometric_brownian("demand", 0.0, 0.3)
        .unwrap()
        .with_initial_state("demand", 10.0)
        .unwrap()
        .with_seed(9)
        .with_discretization_samples(300);
    let run = OptimizerConfig {
        max_iterations: 8,
        bound_sample_size: 50,
        ..config()
    };
    let optimizer = DynamicOptimizer::new(inventory(3, 12.0).build_problem().unwrap(), process, run).unwrap();
    optimizer.solve_blocking().unwrap();
    let stats = optimizer.stats().snapshot();
    assert!(stats.windows(2).all(|w| w[1].expected_reward <= w[0].expected_reward));
    assert!(stats.iter().all(|s| s.std_error >= 0.0 && s.sample_size == 50));
    for record in &stats {
        assert!(
            record.simulated_reward <= record.expected_reward + 1e-3 + 4.0 * record.std_error,
            "iteration {}: lower {} above upper {}",
            record.iteration,
            record.simulated_reward,
            record.expected_reward
        );
    }
}

#[test]
fn test_join_is_idempotent() {
    let optimizer = DynamicOptimizer::new(inventory(2, 12.0).build_problem().unwrap(), constant_demand(10.0), config())
        .unwrap();
    optimizer.solve().unwrap();
    let first = optimizer.join().unwrap();
    let stats = optimizer.stats().snapshot();

    let again = optimizer.join().unwrap();
    assert_eq!(first, again);
    assert_eq!(optimizer.stats().snapshot(), stats);
    assert_eq!(optimizer.status(), OptimizerStatus::Converged);

    let from_threads: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4).map(|_| s.spawn(|| optimizer.join())).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(from_threads.into_iter().all(|r| r.unwrap() == first));
}

#[test]
fn test_policy_not_ready_before_solve() {
    let optimizer = DynamicOptimizer::new(inventory(2, 12.0).build_problem().unwrap(), constant_demand(10.0), config())
        .unwrap();
    let policy = optimizer.policy();
    assert!(!policy.is_ready());
    match policy.simulate(3) {
        Err(OptimizerError::NotReady(err)) => assert_eq!(err.status, OptimizerStatus::Configured),
        other => panic!("expected NotReady, got {:?}", other.map(|r| r.records.len())),
    }
    assert!(matches!(policy.first_stage_solution(), Err(OptimizerError::NotReady(_))));
}

#[test]
fn test_cancelled_run_fails() {
    let optimizer = DynamicOptimizer::new(inventory(3, 12.0).build_problem().unwrap(), constant_demand(10.0), config())
        .unwrap();
    optimizer.cancel();
    optimizer.solve().unwrap();
    assert!(matches!(optimizer.join(), Err(OptimizerError::Cancelled)));
    assert_eq!(optimizer.status(), OptimizerStatus::Failed);
    match optimizer.policy().simulate(1) {
        Err(OptimizerError::NotReady(err)) => assert_eq!(err.status, OptimizerStatus::Failed),
        _ => panic!("policy must not be usable after cancellation"),
    }
}

#[test]
fn test_infeasible_subproblem_is_reported() {
    // must sell at least the demand but only 4 units are ever available
    let params = InventoryParams {
        max_purchase: Some(0.0),
        ..inventory(1, 4.0)
    };
    let mut problem = params.build_problem().unwrap();
    let demand = problem.random("demand");
    let sell = problem.variable(0, SELL).unwrap();
    problem.add_constraint(sell.geq(demand)).unwrap();

    let optimizer = DynamicOptimizer::new(problem, constant_demand(10.0), config()).unwrap();
    match optimizer.solve_blocking() {
        Err(OptimizerError::Infeasible(err)) => {
            assert_eq!(err.stage, 0);
            assert_eq!(err.node, 0);
        }
        other => panic!("expected infeasibility, got {:?}", other),
    }
    assert_eq!(optimizer.status(), OptimizerStatus::Failed);
}

#[test]
fn test_explicit_lattice_hedges_between_outcomes() {
    // demand 10 now, then 5 or 15 with equal probability
    let lattice = Lattice::new(
        vec!["demand".to_string()],
        vec![
            vec![LatticeNode {
                values: vec![10.0],
                probability: 1.0,
            }],
            vec![
                LatticeNode {
                    values: vec![5.0],
                    probability: 0.5,
                },
                LatticeNode {
                    values: vec![15.0],
                    probability: 0.5,
                },
            ],
        ],
        vec![vec![vec![0.5, 0.5]]],
    )
    .unwrap();
    let run = OptimizerConfig {
        confidence_z: 0.0,
        max_iterations: 12,
        ..config()
    };
    let optimizer =
        DynamicOptimizer::with_lattice(inventory(2, 12.0).build_problem().unwrap(), constant_demand(10.0), lattice, run)
            .unwrap();
    let summary = optimizer.solve_blocking().unwrap();
    // stock up to 15: 50 - 26 - 7.5 now, then (30 + 75) / 2
    assert_abs_diff_eq!(summary.upper_bound, 69.0, epsilon = 1e-3);

    let first = optimizer.policy().first_stage_solution().unwrap();
    assert_abs_diff_eq!(first.decisions[BUY], 13.0, epsilon = 1e-3);
    // a starting unit saves one purchase
    assert_abs_diff_eq!(first.shadow_prices[INITIAL_INVENTORY], 2.0, epsilon = 1e-3);
}

#[test]
fn test_seeded_runs_repeat() {
    let build = || {
        let process = StochasticProcess::geometric_brownian("demand", 0.0, 0.25)
            .unwrap()
            .with_initial_state("demand", 10.0)
            .unwrap()
            .with_seed(1)
            .with_discretization_samples(200);
        let run = OptimizerConfig {
            max_iterations: 5,
            ..config()
        };
        DynamicOptimizer::new(inventory(3, 12.0).build_problem().unwrap(), process, run).unwrap()
    };
    let a = build();
    let b = build();
    a.solve_blocking().unwrap();
    b.solve_blocking().unwrap();
    let bounds = |o: &DynamicOptimizer| {
        o.stats()
            .snapshot()
            .iter()
            .map(|s| (s.expected_reward, s.simulated_reward))
            .collect::<Vec<_>>()
    };
    let (sa, sb) = (bounds(&a), bounds(&b));
    assert_eq!(sa.len(), sb.len());
    for ((ua, la), (ub, lb)) in sa.iter().zip(&sb) {
        assert_abs_diff_eq!(ua, ub, epsilon = 1e-6);
        assert_abs_diff_eq!(la, lb, epsilon = 1e-6);
    }
}

#[test]
fn test_rewards_beyond_value_bound_fail_the_run() {
    // demand of a million units: selling it all is worth 2.5e6, above the default bound
    let params = InventoryParams {
        max_purchase: None,
        ..inventory(2, 0.0)
    };
    let optimizer = DynamicOptimizer::new(params.build_problem().unwrap(), constant_demand(1e6), config()).unwrap();
    match optimizer.solve_blocking() {
        Err(OptimizerError::ValueBoundActive { stage, bound, .. }) => {
            assert_eq!(stage, 0);
            assert_abs_diff_eq!(bound, 1e6);
        }
        other => panic!("expected the value bound to be reported, got {:?}", other),
    }
    assert_eq!(optimizer.status(), OptimizerStatus::Failed);
}

#[test]
fn test_large_rewards_solve_with_a_wider_value_bound() {
    let params = InventoryParams {
        max_purchase: None,
        ..inventory(2, 0.0)
    };
    let run = OptimizerConfig {
        value_bound: 1e7,
        ..config()
    };
    let optimizer = DynamicOptimizer::new(params.build_problem().unwrap(), constant_demand(1e6), run).unwrap();
    let summary = optimizer.solve_blocking().unwrap();
    assert_eq!(summary.termination, TerminationReason::BoundsClosed);
    // buy the whole demand up front: 5e6 in sales against 2.5e6 of cost and holding
    assert_abs_diff_eq!(summary.upper_bound, 2.5e6, epsilon = 10.0);
    let first = optimizer.policy().first_stage_solution().unwrap();
    assert_abs_diff_eq!(first.decisions[BUY], 1e6, epsilon = 1.0);
}

#[test]
fn test_unbounded_reward_is_reported() {
    let mut problem = DecisionProblem::new();
    let x = problem.add_variable(0, "x").unwrap();
    problem.add_objective_term(x * 1.0).unwrap();
    let optimizer = DynamicOptimizer::new(problem, constant_demand(10.0), config()).unwrap();
    match optimizer.solve_blocking() {
        Err(OptimizerError::Unbounded { stage, node }) => assert_eq!((stage, node), (0, 0)),
        other => panic!("expected unboundedness, got {:?}", other),
    }
    assert_eq!(optimizer.status(), OptimizerStatus::Failed);
}

#[test]
fn test_repeated_numerical_failures_abort() {
    // one interior-point step cannot solve anything, with or without the regularized retry
    let run = OptimizerConfig {
        solver_max_iter: 1,
        max_subproblem_failures: 2,
        ..config()
    };
    let optimizer = DynamicOptimizer::new(inventory(2, 12.0).build_problem().unwrap(), constant_demand(10.0), run)
        .unwrap();
    match optimizer.solve_blocking() {
        Err(OptimizerError::Numerical { stage, node, failures, .. }) => {
            assert_eq!((stage, node), (0, 0));
            assert_eq!(failures, 2);
        }
        other => panic!("expected a numerical failure, got {:?}", other),
    }
    assert_eq!(optimizer.status(), OptimizerStatus::Failed);
    assert!(optimizer.stats().is_empty());
    assert!(matches!(optimizer.policy().first_stage_solution(), Err(OptimizerError::NotReady(_))));
}

#[test]
fn test_iteration_limit_is_recorded() {
    let run = OptimizerConfig {
        max_iterations: 1,
        ..config()
    };
    let optimizer = DynamicOptimizer::new(inventory(3, 12.0).build_problem().unwrap(), constant_demand(10.0), run)
        .unwrap();
    let summary = optimizer.solve_blocking().unwrap();
    assert_eq!(summary.termination, TerminationReason::IterationLimit);
    assert_eq!(summary.iterations, 1);
    assert_eq!(optimizer.stats().len(), 1);
    assert_eq!(optimizer.status(), OptimizerStatus::Converged);
    assert!(optimizer.policy().first_stage_solution().is_ok());
}

#[test]
fn test_time_limit_is_recorded() {
    let run = OptimizerConfig {
        time_limit_secs: Some(1e-9),
        ..config()
    };
    let optimizer = DynamicOptimizer::new(inventory(3, 12.0).build_problem().unwrap(), constant_demand(10.0), run)
        .unwrap();
    let summary = optimizer.solve_blocking().unwrap();
    assert_eq!(summary.termination, TerminationReason::TimeLimit);
    assert_eq!(summary.iterations, 1);
}
