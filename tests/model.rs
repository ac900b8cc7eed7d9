use approx::assert_abs_diff_eq;

use stochastic_inventory::{
    DecisionProblem, DimensionConfig, ModelError, ProcessConfig, ProcessError, ProcessLaw, StochasticProcess,
};

#[test]
fn test_handle_from_another_problem_is_rejected() {
    let mut other = DecisionProblem::new();
    let foreign = other.add_variable(0, "x").unwrap();

    let mut problem = DecisionProblem::new();
    let y = problem.add_variable(0, "y").unwrap();
    let err = problem.add_constraint(y.leq(foreign)).unwrap_err();
    assert!(matches!(err, ModelError::UndeclaredVariable { .. }));
    assert!(problem.constraints().is_empty());
}

#[test]
fn test_forward_reference_is_rejected() {
    let mut problem = DecisionProblem::new();
    let now = problem.add_variable(0, "now").unwrap();
    let later = problem.add_variable(2, "later").unwrap();
    let err = problem.add_constraint_at(1, now.leq(later)).unwrap_err();
    assert_eq!(
        err,
        ModelError::ForwardReference {
            variable: "later".to_string(),
            variable_stage: 2,
            stage: 1,
        }
    );
}

#[test]
fn test_zero_volatility_paths_follow_the_recursion() {
    let mut gbm = StochasticProcess::geometric_brownian("demand", 0.1, 0.0)
        .unwrap()
        .with_initial_state("demand", 10.0)
        .unwrap()
        .with_seed(1);
    let paths = gbm.simulate(5, 3).unwrap();
    for sample in 0..3 {
        for stage in 0..5 {
            assert_abs_diff_eq!(paths.value(sample, stage, 0), 10.0 * (0.1 * stage as f64).exp(), epsilon = 1e-9);
        }
    }

    let mut ar = StochasticProcess::autoregressive("price", 20.0, vec![0.5], 0.0, false)
        .unwrap()
        .with_initial_state("price", 28.0)
        .unwrap();
    let paths = ar.simulate(4, 1).unwrap();
    let expected = [28.0, 24.0, 22.0, 21.0];
    for (stage, value) in expected.iter().enumerate() {
        assert_abs_diff_eq!(paths.value(0, stage, 0), *value, epsilon = 1e-9);
    }
}

#[test]
fn test_discretization_rows_are_distributions() {
    let config = ProcessConfig {
        dimensions: vec![
            DimensionConfig {
                name: "demand".to_string(),
                law: ProcessLaw::GeometricBrownian {
                    drift: 0.0,
                    sigma: 0.2,
                },
                initial_state: Some(10.0),
            },
            DimensionConfig {
                name: "price".to_string(),
                law: ProcessLaw::Autoregressive {
                    mean: 1.5,
                    coefficients: vec![0.6, 0.2],
                    sigma: 0.1,
                    log_transform: true,
                },
                initial_state: Some(4.0),
            },
        ],
        correlation: Some(vec![vec![1.0, -0.4], vec![-0.4, 1.0]]),
        seed: Some(17),
        discretization_samples: 400,
    };
    let mut process = StochasticProcess::new(config).unwrap();
    let lattice = process.discretize(4, 6).unwrap();

    assert_eq!(lattice.num_stages(), 4);
    assert_eq!(lattice.num_nodes(0), 1);
    assert_eq!(lattice.nodes(0)[0].values, vec![10.0, 4.0]);
    for t in 0..4 {
        assert!(lattice.num_nodes(t) <= 6);
        let total: f64 = lattice.nodes(t).iter().map(|n| n.probability).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
    }
    for t in 0..3 {
        for row in lattice.transitions(t) {
            assert_abs_diff_eq!(row.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        }
    }
}

#[test]
fn test_missing_initial_state_blocks_simulation() {
    let mut process = StochasticProcess::geometric_brownian("demand", 0.0, 0.1).unwrap();
    assert!(process.simulate(3, 2).is_err());
    assert!(matches!(process.discretize(3, 2), Err(ProcessError::NotConfigured(_))));
}

#[test]
fn test_explosive_autoregression_is_rejected() {
    let err = StochasticProcess::autoregressive("price", 0.0, vec![1.2], 0.1, false).unwrap_err();
    assert!(matches!(err, ModelError::NonStationary { .. }));
}
