use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use stochastic_inventory::config::RunConfig;
use stochastic_inventory::inventory::{BUY, INVENTORY, SELL};
use stochastic_inventory::process::{DimensionConfig, ProcessConfig, ProcessLaw};
use stochastic_inventory::reporting::{
    display_first_stage, display_progress, display_reward_distribution, display_stage_means, display_stats_table,
    display_summary,
};
use stochastic_inventory::{logging, DynamicOptimizer, InventoryParams, OptimizerConfig, OptimizerStatus, StochasticProcess};

/// Demo run when no config file is given: GBM demand around 10 units
fn default_run() -> RunConfig {
    RunConfig {
        optimizer: OptimizerConfig {
            num_nodes: 5,
            bound_sample_size: 200,
            max_iterations: 60,
            time_limit_secs: Some(120.0),
            rel_tolerance: 1e-3,
            seed: Some(42),
            ..OptimizerConfig::default()
        },
        process: ProcessConfig {
            dimensions: vec![DimensionConfig {
                name: "demand".to_string(),
                law: ProcessLaw::GeometricBrownian {
                    drift: 0.0,
                    sigma: 0.2,
                },
                initial_state: Some(10.0),
            }],
            correlation: None,
            seed: Some(7),
            discretization_samples: 1000,
        },
        inventory: InventoryParams::default(),
        simulation_samples: 1000,
    }
}

fn main() -> Result<()> {
    logging::init();

    let run = match std::env::args().nth(1) {
        Some(path) => RunConfig::from_json_file(&path).with_context(|| format!("loading {}", path))?,
        None => default_run(),
    };
    let params = &run.inventory;

    println!("╔══════════════════════════════════════════════════════════════════════════════╗");
    println!("║               MULTI-STAGE STOCHASTIC INVENTORY OPTIMIZATION                  ║");
    println!("╚══════════════════════════════════════════════════════════════════════════════╝\n");
    println!(
        "Stages: {} | Price: {:.2} | Cost: {:.2} | Holding: {:.2}/stage | Liquidation: {:.2}",
        params.num_stages, params.selling_price, params.purchase_cost, params.holding_cost, params.liquidation_price
    );
    println!("Initial inventory: {:.1}", params.initial_inventory);

    let problem = params.build_problem().context("building inventory problem")?;
    let process = StochasticProcess::new(run.process.clone()).context("building demand process")?;
    let optimizer = DynamicOptimizer::new(problem, process, run.optimizer.clone())?;

    optimizer.solve()?;
    let stats = optimizer.stats();
    let mut shown = 0;
    while optimizer.status() == OptimizerStatus::Running {
        thread::sleep(Duration::from_millis(200));
        for record in stats.snapshot().iter().skip(shown) {
            display_progress(record);
            shown += 1;
        }
    }
    let summary = optimizer.join()?;
    info!(iterations = summary.iterations, "solve finished");

    display_stats_table(&stats.snapshot());
    display_summary(&summary);

    let policy = optimizer.policy();
    display_first_stage(&policy.first_stage_solution()?);

    let result = policy.simulate(run.simulation_samples)?;
    display_reward_distribution(&result.reward_summary());
    display_stage_means(&result, &[SELL, BUY, INVENTORY]);

    Ok(())
}
