//! Stochastic process model driving the random variables of a problem.
//!
//! Sample paths follow the generative law exactly; the optimizer works on a
//! discretized [`Lattice`] built from a large batch of such paths.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, NotConfiguredError, ProcessError};
use crate::lattice::Lattice;

/// Generative law of one process dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessLaw {
    /// `x[t+1] = x[t] * exp(drift + sigma * e)`
    GeometricBrownian { drift: f64, sigma: f64 },
    /// `y[t] - mean = Σ φ_i (y[t-i] - mean) + sigma * e`, with `x = exp(y)` when log-transformed
    Autoregressive {
        mean: f64,
        coefficients: Vec<f64>,
        sigma: f64,
        #[serde(default)]
        log_transform: bool,
    },
}

impl ProcessLaw {
    fn sigma(&self) -> f64 {
        match self {
            ProcessLaw::GeometricBrownian { sigma, .. } => *sigma,
            ProcessLaw::Autoregressive { sigma, .. } => *sigma,
        }
    }

    fn is_log_transformed(&self) -> bool {
        matches!(
            self,
            ProcessLaw::Autoregressive {
                log_transform: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionConfig {
    pub name: String,
    pub law: ProcessLaw,
    #[serde(default)]
    pub initial_state: Option<f64>,
}

fn default_discretization_samples() -> usize {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub dimensions: Vec<DimensionConfig>,
    /// Correlation of the per-stage innovations across dimensions
    #[serde(default)]
    pub correlation: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Paths simulated to build the lattice
    #[serde(default = "default_discretization_samples")]
    pub discretization_samples: usize,
}

/// Sample trajectories indexed `[sample][stage][dimension]`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplePaths {
    pub names: Vec<String>,
    pub values: Vec<Vec<Vec<f64>>>,
}

impl SamplePaths {
    pub fn sample_size(&self) -> usize {
        self.values.len()
    }

    pub fn num_stages(&self) -> usize {
        self.values.first().map_or(0, |p| p.len())
    }

    pub fn path(&self, sample: usize) -> &[Vec<f64>] {
        &self.values[sample]
    }

    pub fn value(&self, sample: usize, stage: usize, dimension: usize) -> f64 {
        self.values[sample][stage][dimension]
    }

    pub fn dimension_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

#[derive(Debug, Clone)]
pub struct StochasticProcess {
    dimensions: Vec<DimensionConfig>,
    cholesky: Vec<Vec<f64>>,
    discretization_samples: usize,
    rng: StdRng,
}

impl StochasticProcess {
    pub fn new(config: ProcessConfig) -> Result<Self, ModelError> {
        if config.dimensions.is_empty() {
            return Err(ModelError::InvalidParameter(
                "process needs at least one dimension".to_string(),
            ));
        }
        for (i, dim) in config.dimensions.iter().enumerate() {
            if config.dimensions[..i].iter().any(|d| d.name == dim.name) {
                return Err(ModelError::InvalidParameter(format!(
                    "duplicate process dimension '{}'",
                    dim.name
                )));
            }
            validate_law(&dim.name, &dim.law)?;
            if let Some(x0) = dim.initial_state {
                validate_initial_state(dim, x0)?;
            }
        }
        if config.discretization_samples == 0 {
            return Err(ModelError::InvalidParameter(
                "discretization_samples must be positive".to_string(),
            ));
        }

        let n = config.dimensions.len();
        let cholesky = match &config.correlation {
            Some(corr) => cholesky_factor(corr, n)?,
            None => identity(n),
        };
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            dimensions: config.dimensions,
            cholesky,
            discretization_samples: config.discretization_samples,
            rng,
        })
    }

    /// Single-dimension geometric Brownian motion without an initial state.
    pub fn geometric_brownian(name: &str, drift: f64, sigma: f64) -> Result<Self, ModelError> {
        Self::new(ProcessConfig {
            dimensions: vec![DimensionConfig {
                name: name.to_string(),
                law: ProcessLaw::GeometricBrownian { drift, sigma },
                initial_state: None,
            }],
            correlation: None,
            seed: None,
            discretization_samples: default_discretization_samples(),
        })
    }

    /// Single-dimension AR(p) process without an initial state.
    pub fn autoregressive(
        name: &str,
        mean: f64,
        coefficients: Vec<f64>,
        sigma: f64,
        log_transform: bool,
    ) -> Result<Self, ModelError> {
        Self::new(ProcessConfig {
            dimensions: vec![DimensionConfig {
                name: name.to_string(),
                law: ProcessLaw::Autoregressive {
                    mean,
                    coefficients,
                    sigma,
                    log_transform,
                },
                initial_state: None,
            }],
            correlation: None,
            seed: None,
            discretization_samples: default_discretization_samples(),
        })
    }

    pub fn with_initial_state(mut self, name: &str, value: f64) -> Result<Self, ModelError> {
        self.set_initial_state(name, value)?;
        Ok(self)
    }

    pub fn set_initial_state(&mut self, name: &str, value: f64) -> Result<(), ModelError> {
        let dim = self
            .dimensions
            .iter_mut()
            .find(|d| d.name == name)
            .ok_or_else(|| ModelError::UnknownRandomVariable(name.to_string()))?;
        validate_initial_state(dim, value)?;
        dim.initial_state = Some(value);
        Ok(())
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_discretization_samples(mut self, samples: usize) -> Self {
        self.discretization_samples = samples.max(1);
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.dimensions.iter().map(|d| d.name.clone()).collect()
    }

    pub fn dimension_index(&self, name: &str) -> Option<usize> {
        self.dimensions.iter().position(|d| d.name == name)
    }

    pub fn num_dimensions(&self) -> usize {
        self.dimensions.len()
    }

    pub fn initial_state(&self) -> Result<Vec<f64>, NotConfiguredError> {
        self.dimensions
            .iter()
            .map(|d| {
                d.initial_state.ok_or_else(|| NotConfiguredError {
                    dimension: d.name.clone(),
                })
            })
            .collect()
    }

    /// Draw `sample_size` trajectories from the process's own random stream.
    pub fn simulate(&mut self, num_stages: usize, sample_size: usize) -> Result<SamplePaths, NotConfiguredError> {
        let mut rng = self.rng.clone();
        let paths = self.simulate_with(&mut rng, num_stages, sample_size);
        self.rng = rng;
        paths
    }

    pub fn simulate_with<R: Rng>(
        &self,
        rng: &mut R,
        num_stages: usize,
        sample_size: usize,
    ) -> Result<SamplePaths, NotConfiguredError> {
        let initial = self.initial_state()?;
        let values = (0..sample_size)
            .map(|_| self.simulate_path(rng, &initial, num_stages))
            .collect();
        Ok(SamplePaths {
            names: self.names(),
            values,
        })
    }

    /// Build the lattice the optimizer works on.
    pub fn discretize(&mut self, num_stages: usize, num_nodes: usize) -> Result<Lattice, ProcessError> {
        let mut rng = self.rng.clone();
        let lattice = self.discretize_with(&mut rng, num_stages, num_nodes);
        self.rng = rng;
        lattice
    }

    pub fn discretize_with<R: Rng>(
        &self,
        rng: &mut R,
        num_stages: usize,
        num_nodes: usize,
    ) -> Result<Lattice, ProcessError> {
        if num_nodes == 0 {
            return Err(ModelError::InvalidParameter("num_nodes must be positive".to_string()).into());
        }
        let paths = self.simulate_with(rng, num_stages, self.discretization_samples)?;
        Ok(Lattice::from_paths(&paths, num_nodes, rng))
    }

    fn simulate_path<R: Rng>(&self, rng: &mut R, initial: &[f64], num_stages: usize) -> Vec<Vec<f64>> {
        if num_stages == 0 {
            return Vec::new();
        }
        let n = self.dimensions.len();
        // working-scale history per dimension (log scale for transformed AR)
        let mut history: Vec<Vec<f64>> = self
            .dimensions
            .iter()
            .zip(initial)
            .map(|(d, &x0)| vec![if d.law.is_log_transformed() { x0.ln() } else { x0 }])
            .collect();

        let mut path = Vec::with_capacity(num_stages);
        path.push(initial.to_vec());

        for _ in 1..num_stages {
            let shocks = self.correlated_shocks(rng);
            let mut values = Vec::with_capacity(n);
            for (d, dim) in self.dimensions.iter().enumerate() {
                let hist = &mut history[d];
                let next = match &dim.law {
                    ProcessLaw::GeometricBrownian { drift, sigma } => {
                        let prev = hist[hist.len() - 1];
                        prev * (drift + sigma * shocks[d]).exp()
                    }
                    ProcessLaw::Autoregressive {
                        mean,
                        coefficients,
                        sigma,
                        ..
                    } => {
                        let first = hist[0];
                        let lagged: f64 = coefficients
                            .iter()
                            .enumerate()
                            .map(|(lag, phi)| {
                                let idx = hist.len() as isize - 1 - lag as isize;
                                let y = if idx >= 0 { hist[idx as usize] } else { first };
                                phi * (y - mean)
                            })
                            .sum();
                        mean + lagged + sigma * shocks[d]
                    }
                };
                hist.push(next);
                values.push(if dim.law.is_log_transformed() { next.exp() } else { next });
            }
            path.push(values);
        }
        path
    }

    fn correlated_shocks<R: Rng>(&self, rng: &mut R) -> Vec<f64> {
        let n = self.dimensions.len();
        let raw: Vec<f64> = (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
        (0..n)
            .map(|i| (0..=i).map(|j| self.cholesky[i][j] * raw[j]).sum())
            .collect()
    }
}

fn validate_law(name: &str, law: &ProcessLaw) -> Result<(), ModelError> {
    let sigma = law.sigma();
    if !sigma.is_finite() || sigma < 0.0 {
        return Err(ModelError::InvalidParameter(format!(
            "sigma for '{}' must be finite and non-negative, got {}",
            name, sigma
        )));
    }
    match law {
        ProcessLaw::GeometricBrownian { drift, .. } => {
            if !drift.is_finite() {
                return Err(ModelError::InvalidParameter(format!("drift for '{}' is not finite", name)));
            }
        }
        ProcessLaw::Autoregressive {
            mean, coefficients, ..
        } => {
            if !mean.is_finite() || coefficients.iter().any(|c| !c.is_finite()) {
                return Err(ModelError::InvalidParameter(format!(
                    "AR parameters for '{}' are not finite",
                    name
                )));
            }
            if !is_stationary(coefficients) {
                return Err(ModelError::NonStationary {
                    dimension: name.to_string(),
                    coefficients: coefficients.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_initial_state(dim: &DimensionConfig, value: f64) -> Result<(), ModelError> {
    let valid = match dim.law {
        _ if !value.is_finite() => false,
        ProcessLaw::GeometricBrownian { .. } => value >= 0.0,
        _ if dim.law.is_log_transformed() => value > 0.0,
        _ => true,
    };
    if valid {
        Ok(())
    } else {
        Err(ModelError::InvalidParameter(format!(
            "invalid initial state {} for '{}'",
            value, dim.name
        )))
    }
}

/// Step-down (inverse Levinson-Durbin) recursion: the AR polynomial is
/// stationary iff every reflection coefficient lies strictly inside (-1, 1).
pub fn is_stationary(coefficients: &[f64]) -> bool {
    let mut a = coefficients.to_vec();
    while let Some(&kappa) = a.last() {
        if kappa.abs() >= 1.0 {
            return false;
        }
        let k = a.len();
        let denom = 1.0 - kappa * kappa;
        let reduced: Vec<f64> = (0..k - 1)
            .map(|j| (a[j] + kappa * a[k - 2 - j]) / denom)
            .collect();
        a = reduced;
    }
    true
}

fn identity(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect()
}

fn cholesky_factor(corr: &[Vec<f64>], n: usize) -> Result<Vec<Vec<f64>>, ModelError> {
    let invalid = |msg: &str| ModelError::InvalidParameter(format!("correlation matrix {}", msg));
    if corr.len() != n || corr.iter().any(|row| row.len() != n) {
        return Err(invalid("has the wrong shape"));
    }
    for i in 0..n {
        if (corr[i][i] - 1.0).abs() > 1e-9 {
            return Err(invalid("must have a unit diagonal"));
        }
        for j in 0..i {
            if (corr[i][j] - corr[j][i]).abs() > 1e-9 || corr[i][j].abs() > 1.0 {
                return Err(invalid("must be symmetric with entries in [-1, 1]"));
            }
        }
    }
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let dot: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let d = corr[i][i] - dot;
                if d <= 0.0 {
                    return Err(invalid("is not positive definite"));
                }
                l[i][j] = d.sqrt();
            } else {
                l[i][j] = (corr[i][j] - dot) / l[j][j];
            }
        }
    }
    Ok(l)
}
