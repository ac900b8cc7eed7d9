//! Discretized scenario lattice: representative nodes per stage and the Markov
//! transition probabilities between consecutive stages.

use rand::Rng;
use serde::Serialize;

use crate::error::ModelError;
use crate::process::SamplePaths;

const KMEANS_MAX_ITERATIONS: usize = 50;
const ROW_SUM_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatticeNode {
    /// Representative value per process dimension
    pub values: Vec<f64>,
    /// Marginal probability of the node within its stage
    pub probability: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Lattice {
    names: Vec<String>,
    stages: Vec<Vec<LatticeNode>>,
    /// `transitions[t][i][j]`: probability of node `j` at `t + 1` given node `i` at `t`
    transitions: Vec<Vec<Vec<f64>>>,
    /// Per-stage, per-dimension spread used for nearest-node lookups
    scales: Vec<Vec<f64>>,
}

impl Lattice {
    /// Lattice from explicit nodes and transition matrices.
    pub fn new(
        names: Vec<String>,
        stages: Vec<Vec<LatticeNode>>,
        transitions: Vec<Vec<Vec<f64>>>,
    ) -> Result<Self, ModelError> {
        let invalid = |msg: String| ModelError::InvalidParameter(format!("lattice {}", msg));
        if stages.iter().any(|nodes| nodes.is_empty()) {
            return Err(invalid("stage without nodes".to_string()));
        }
        if transitions.len() + 1 != stages.len() && !(stages.is_empty() && transitions.is_empty()) {
            return Err(invalid(format!(
                "has {} stages but {} transition matrices",
                stages.len(),
                transitions.len()
            )));
        }
        for (t, nodes) in stages.iter().enumerate() {
            if nodes.iter().any(|n| n.values.len() != names.len()) {
                return Err(invalid(format!("node dimension mismatch at stage {}", t)));
            }
            if !is_distribution(nodes.iter().map(|n| n.probability), nodes.len()) {
                return Err(invalid(format!("node probabilities at stage {} are not a distribution", t)));
            }
        }
        for (t, matrix) in transitions.iter().enumerate() {
            if matrix.len() != stages[t].len() {
                return Err(invalid(format!("transition rows mismatch at stage {}", t)));
            }
            for row in matrix {
                if row.len() != stages[t + 1].len() || !is_distribution(row.iter().copied(), row.len()) {
                    return Err(invalid(format!("invalid transition row at stage {}", t)));
                }
            }
        }
        let scales = stages.iter().map(|nodes| spread(nodes.iter().map(|n| n.values.as_slice()), names.len())).collect();
        Ok(Self {
            names,
            stages,
            transitions,
            scales,
        })
    }

    /// Cluster each stage of `paths` into at most `num_nodes` nodes and count
    /// sample transitions between clusters.
    pub fn from_paths<R: Rng>(paths: &SamplePaths, num_nodes: usize, rng: &mut R) -> Self {
        let num_stages = paths.num_stages();
        let dims = paths.names.len();
        let mut stages = Vec::with_capacity(num_stages);
        let mut assignments: Vec<Vec<usize>> = Vec::with_capacity(num_stages);
        let mut scales = Vec::with_capacity(num_stages);

        for t in 0..num_stages {
            let points: Vec<&[f64]> = paths.values.iter().map(|p| p[t].as_slice()).collect();
            let scale = spread(points.iter().copied(), dims);
            let (centroids, assignment) = kmeans(&points, &scale, num_nodes, rng);
            let mut counts = vec![0usize; centroids.len()];
            for &a in &assignment {
                counts[a] += 1;
            }
            let total = points.len().max(1) as f64;
            stages.push(
                centroids
                    .into_iter()
                    .zip(&counts)
                    .map(|(values, &c)| LatticeNode {
                        values,
                        probability: c as f64 / total,
                    })
                    .collect::<Vec<_>>(),
            );
            assignments.push(assignment);
            scales.push(scale);
        }

        let transitions = (0..num_stages.saturating_sub(1))
            .map(|t| {
                let mut counts = vec![vec![0.0; stages[t + 1].len()]; stages[t].len()];
                for sample in 0..paths.sample_size() {
                    counts[assignments[t][sample]][assignments[t + 1][sample]] += 1.0;
                }
                for row in &mut counts {
                    let sum: f64 = row.iter().sum();
                    if sum > 0.0 {
                        row.iter_mut().for_each(|p| *p /= sum);
                    }
                }
                counts
            })
            .collect();

        Self {
            names: paths.names.clone(),
            stages,
            transitions,
            scales,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn nodes(&self, stage: usize) -> &[LatticeNode] {
        &self.stages[stage]
    }

    pub fn num_nodes(&self, stage: usize) -> usize {
        self.stages[stage].len()
    }

    /// Transition matrix from `stage` to `stage + 1`.
    pub fn transitions(&self, stage: usize) -> &[Vec<f64>] {
        &self.transitions[stage]
    }

    pub fn transition_row(&self, stage: usize, node: usize) -> &[f64] {
        &self.transitions[stage][node]
    }

    /// Markov walk through the lattice, one node index per stage.
    pub fn sample_path<R: Rng>(&self, rng: &mut R) -> Vec<usize> {
        let mut path: Vec<usize> = Vec::with_capacity(self.stages.len());
        for t in 0..self.stages.len() {
            let node = if t == 0 {
                let marginal: Vec<f64> = self.stages[0].iter().map(|n| n.probability).collect();
                draw(&marginal, rng)
            } else {
                draw(&self.transitions[t - 1][path[t - 1]], rng)
            };
            path.push(node);
        }
        path
    }

    /// Node of `stage` closest to `values` in standardized distance.
    pub fn nearest_node(&self, stage: usize, values: &[f64]) -> usize {
        let scale = &self.scales[stage];
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        for (i, node) in self.stages[stage].iter().enumerate() {
            let dist = distance(&node.values, values, scale);
            if dist < best_dist {
                best_dist = dist;
                best = i;
            }
        }
        best
    }
}

/// Entries in `[0, 1]` summing to one.
fn is_distribution(probabilities: impl Iterator<Item = f64>, len: usize) -> bool {
    let mut sum = 0.0;
    for p in probabilities {
        if !(0.0..=1.0).contains(&p) {
            return false;
        }
        sum += p;
    }
    (sum - 1.0).abs() <= ROW_SUM_TOLERANCE * len.max(1) as f64
}

fn draw<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    let u: f64 = rng.gen();
    let mut acc = 0.0;
    for (i, w) in weights.iter().enumerate() {
        acc += w;
        if u < acc {
            return i;
        }
    }
    // rounding: fall back to the last node with positive weight
    weights.iter().rposition(|w| *w > 0.0).unwrap_or(0)
}

fn spread<'a>(points: impl Iterator<Item = &'a [f64]>, dims: usize) -> Vec<f64> {
    let points: Vec<&[f64]> = points.collect();
    let n = points.len().max(1) as f64;
    (0..dims)
        .map(|d| {
            let mean = points.iter().map(|p| p[d]).sum::<f64>() / n;
            let var = points.iter().map(|p| (p[d] - mean).powi(2)).sum::<f64>() / n;
            let sd = var.sqrt();
            if sd > 1e-12 {
                sd
            } else {
                1.0
            }
        })
        .collect()
}

fn distance(a: &[f64], b: &[f64], scale: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .zip(scale)
        .map(|((x, y), s)| ((x - y) / s).powi(2))
        .sum()
}

/// Seeded k-means with k-means++ seeding. Returns centroids (ordered by value)
/// and the cluster of each point; empty clusters are dropped.
fn kmeans<R: Rng>(points: &[&[f64]], scale: &[f64], k: usize, rng: &mut R) -> (Vec<Vec<f64>>, Vec<usize>) {
    if points.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let dims = scale.len();
    let k = k.min(distinct_count(points, k));

    let mut centers: Vec<Vec<f64>> = vec![points[rng.gen_range(0..points.len())].to_vec()];
    while centers.len() < k {
        let weights: Vec<f64> = points
            .iter()
            .map(|p| {
                centers
                    .iter()
                    .map(|c| distance(c, p, scale))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            break;
        }
        let normalized: Vec<f64> = weights.iter().map(|w| w / total).collect();
        centers.push(points[draw(&normalized, rng)].to_vec());
    }

    let mut assignment = vec![usize::MAX; points.len()];
    for _ in 0..KMEANS_MAX_ITERATIONS {
        let mut changed = false;
        for (i, p) in points.iter().enumerate() {
            let nearest = centers
                .iter()
                .enumerate()
                .map(|(c, center)| (c, distance(center, p, scale)))
                .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
                .0;
            if assignment[i] != nearest {
                assignment[i] = nearest;
                changed = true;
            }
        }
        let mut sums = vec![vec![0.0; dims]; centers.len()];
        let mut counts = vec![0usize; centers.len()];
        for (p, &a) in points.iter().zip(&assignment) {
            counts[a] += 1;
            for d in 0..dims {
                sums[a][d] += p[d];
            }
        }
        for (c, center) in centers.iter_mut().enumerate() {
            if counts[c] > 0 {
                for d in 0..dims {
                    center[d] = sums[c][d] / counts[c] as f64;
                }
            }
        }
        if !changed {
            break;
        }
    }

    // drop empty clusters and order the rest by value
    let mut used: Vec<usize> = (0..centers.len())
        .filter(|c| assignment.iter().any(|a| a == c))
        .collect();
    used.sort_by(|&a, &b| {
        centers[a]
            .partial_cmp(&centers[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut remap = vec![0usize; centers.len()];
    for (new, &old) in used.iter().enumerate() {
        remap[old] = new;
    }
    let ordered = used.iter().map(|&c| centers[c].clone()).collect();
    let assignment = assignment.into_iter().map(|a| remap[a]).collect();
    (ordered, assignment)
}

/// Number of distinct points, counting no further than `limit`.
fn distinct_count(points: &[&[f64]], limit: usize) -> usize {
    let mut seen: Vec<&[f64]> = Vec::new();
    for p in points {
        if !seen.iter().any(|s| s == p) {
            seen.push(p);
            if seen.len() >= limit {
                break;
            }
        }
    }
    seen.len().max(1)
}
