//! Console tables for the demo binary: the convergence log, the first-stage
//! decision and the simulated reward distribution.

use crate::models::{SimulationResult, SolutionStats, SolveSummary, StageDecision};
use crate::monte_carlo::SampleSummary;

fn banner(title: &str) {
    println!("\n╔══════════════════════════════════════════════════════════════════════════════╗");
    println!("║ {:<76} ║", title);
    println!("╚══════════════════════════════════════════════════════════════════════════════╝\n");
}

/// Iteration table: bound, simulated reward and gap
pub fn display_stats_table(stats: &[SolutionStats]) {
    banner("CONVERGENCE");
    println!(
        "{:>5} {:>14} {:>14} {:>10} {:>10} {:>7} {:>9} {:>8}",
        "iter", "bound", "simulated", "std err", "gap", "cuts", "solves", "secs"
    );
    for s in stats {
        println!(
            "{:>5} {:>14.4} {:>14.4} {:>10.4} {:>10.4} {:>7} {:>9} {:>8.2}",
            s.iteration,
            s.expected_reward,
            s.simulated_reward,
            s.std_error,
            s.gap(),
            s.cut_count,
            s.solves,
            s.elapsed_secs
        );
    }
}

/// One-line progress update while the optimizer runs
pub fn display_progress(stats: &SolutionStats) {
    println!(
        "  iteration {:>4}: bound {:.4} | simulated {:.4} ± {:.4}",
        stats.iteration, stats.expected_reward, stats.simulated_reward, stats.std_error
    );
}

pub fn display_summary(summary: &SolveSummary) {
    banner("OPTIMIZER RESULT");
    println!("Termination:      {:?}", summary.termination);
    println!("Iterations:       {}", summary.iterations);
    println!("Expected reward:  {:.4}", summary.upper_bound);
    println!(
        "Simulated reward: {:.4} ± {:.4} (std error)",
        summary.lower_bound, summary.std_error
    );
    println!("Cuts:             {}", summary.cut_count);
    println!("Elapsed:          {:.2}s", summary.elapsed_secs);
}

/// First-stage decisions and the value of carried state
pub fn display_first_stage(decision: &StageDecision) {
    banner("FIRST-STAGE DECISION");
    for (name, value) in &decision.decisions {
        println!("  {:<24} {:>12.4}", name, value);
    }
    println!("\n  Stage reward:  {:.4}", decision.reward);
    println!("  Future value:  {:.4}", decision.future_value);
    if !decision.shadow_prices.is_empty() {
        println!("\nShadow prices:");
        for (name, value) in &decision.shadow_prices {
            println!("  {:<24} {:>12.4}", name, value);
        }
    }
}

/// Distribution of total reward over simulated trajectories
pub fn display_reward_distribution(summary: &SampleSummary) {
    banner("SIMULATED POLICY REWARD");
    println!(
        "Samples: {} | Mean: {:.2} ± {:.2} (std dev)",
        summary.sample_size, summary.mean, summary.std_dev
    );
    println!("\nReward Distribution:");
    println!("  Minimum:          {:.2}", summary.min);
    println!("  10th Percentile:  {:.2}", summary.percentile_10);
    println!("  25th Percentile:  {:.2}", summary.percentile_25);
    println!("  Median (50th):    {:.2}", summary.percentile_50);
    println!("  75th Percentile:  {:.2}", summary.percentile_75);
    println!("  90th Percentile:  {:.2}", summary.percentile_90);
    println!("  Maximum:          {:.2}", summary.max);
}

/// Mean of each named decision per stage across the simulated samples
pub fn display_stage_means(result: &SimulationResult, names: &[&str]) {
    banner("MEAN DECISIONS PER STAGE");
    print!("{:>6}", "stage");
    for name in names {
        print!(" {:>14}", name);
    }
    println!();
    for stage in 0..result.num_stages {
        print!("{:>6}", stage);
        for name in names {
            let column = result.decision_column(stage, name);
            let mean = if column.is_empty() {
                f64::NAN
            } else {
                column.iter().sum::<f64>() / column.len() as f64
            };
            print!(" {:>14.3}", mean);
        }
        println!();
    }
}
