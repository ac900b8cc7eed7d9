//! Sample statistics for simulated rewards.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleSummary {
    pub sample_size: usize,
    pub mean: f64,
    pub std_dev: f64,
    /// Standard error of the mean
    pub std_error: f64,
    pub min: f64,
    pub max: f64,
    pub percentile_10: f64,
    pub percentile_25: f64,
    pub percentile_50: f64,
    pub percentile_75: f64,
    pub percentile_90: f64,
}

/// Summarize a sample; an empty sample gives all zeros.
pub fn summarize(values: &[f64]) -> SampleSummary {
    let n = values.len();
    if n == 0 {
        return SampleSummary {
            sample_size: 0,
            mean: 0.0,
            std_dev: 0.0,
            std_error: 0.0,
            min: 0.0,
            max: 0.0,
            percentile_10: 0.0,
            percentile_25: 0.0,
            percentile_50: 0.0,
            percentile_75: 0.0,
            percentile_90: 0.0,
        };
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mean = sorted.iter().sum::<f64>() / n as f64;
    // sample variance; a single draw has no spread estimate
    let variance = if n > 1 {
        sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
    } else {
        0.0
    };
    let std_dev = variance.sqrt();

    let percentile = |p: f64| {
        let index = ((p / 100.0) * (n as f64 - 1.0)).round() as usize;
        sorted[index.min(n - 1)]
    };

    SampleSummary {
        sample_size: n,
        mean,
        std_dev,
        std_error: std_dev / (n as f64).sqrt(),
        min: sorted[0],
        max: sorted[n - 1],
        percentile_10: percentile(10.0),
        percentile_25: percentile(25.0),
        percentile_50: percentile(50.0),
        percentile_75: percentile(75.0),
        percentile_90: percentile(90.0),
    }
}
