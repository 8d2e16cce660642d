//! Lloyd's k-means for IVF centroid training.
//!
//! Training is deterministic: a seeded PRNG drives both the training-set
//! sample and the initial centroid shuffle, assignment ties break to the
//! lowest centroid index, and per-cluster sums accumulate in document order.
//! Re-running with identical inputs and parameters reproduces the centroid
//! buffer bit for bit.

use crate::distance::{find_closest, l2_distance};
use dann_core::{DannError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

/// Tuning knobs for the trainer.
#[derive(Debug, Clone)]
pub struct KmeansParams {
    /// Lloyd iterations per run.
    pub niter: usize,
    /// Number of independent runs; the run with the lowest total
    /// quantization error wins.
    pub nredo: usize,
    /// PRNG seed for sampling and seeding.
    pub seed: u64,
    /// Early-stop threshold on the maximum squared centroid shift.
    pub convergence_threshold: f32,
    /// Lower bound of the per-centroid sample budget.
    pub min_points_per_centroid: usize,
    /// Upper bound of the per-centroid sample budget.
    pub max_points_per_centroid: usize,
    /// Never sample more than this fraction of the raw input.
    pub max_sample_ratio: f32,
}

impl Default for KmeansParams {
    fn default() -> Self {
        Self {
            niter: 25,
            nredo: 1,
            seed: 1234,
            convergence_threshold: 1e-6,
            min_points_per_centroid: 39,
            max_points_per_centroid: 256,
            max_sample_ratio: 0.22,
        }
    }
}

impl KmeansParams {
    /// How many training vectors to draw from a raw input of size `n` when
    /// training `k` centroids.
    ///
    /// `clamp(min(n, k * points_per_centroid, floor(max_sample_ratio * n)),
    /// lower = k)` where `points_per_centroid` is drawn uniformly from
    /// `[min, max]` with the configured seed.
    pub fn sample_count(&self, n: usize, k: usize) -> usize {
        let (lo, hi) = if self.min_points_per_centroid <= self.max_points_per_centroid {
            (self.min_points_per_centroid, self.max_points_per_centroid)
        } else {
            (self.max_points_per_centroid, self.min_points_per_centroid)
        };

        let mut rng = StdRng::seed_from_u64(self.seed);
        let points_per_centroid = rng.gen_range(lo..=hi);

        let target = k.saturating_mul(points_per_centroid);
        let ratio_cap = (self.max_sample_ratio as f64 * n as f64).floor() as usize;

        n.min(target).min(ratio_cap).max(k)
    }

    /// Draws `sample_count(n, k)` training vectors from `data` without
    /// replacement (seeded shuffle of the index space).
    pub fn sample_training_set(&self, data: &[f32], dim: usize, k: usize) -> Vec<f32> {
        let n = data.len() / dim;
        let count = self.sample_count(n, k).min(n);

        let mut indices: Vec<usize> = (0..n).collect();
        let mut rng = StdRng::seed_from_u64(self.seed);
        indices.shuffle(&mut rng);
        indices.truncate(count);

        let mut sample = Vec::with_capacity(count * dim);
        for &idx in &indices {
            sample.extend_from_slice(&data[idx * dim..(idx + 1) * dim]);
        }
        sample
    }
}

/// Output of one training call.
#[derive(Debug, Clone)]
pub struct KmeansResult {
    /// Flat `k * dim` centroid buffer.
    pub centroids: Vec<f32>,
    /// Final assignment of each training vector to its centroid.
    pub assignments: Vec<usize>,
    /// Sum of squared distances from each training vector to its centroid.
    pub quantization_error: f32,
    /// Iterations executed by the winning run.
    pub iterations: usize,
}

/// Trains `k` centroids of dimension `dim` from a flat training buffer.
///
/// When `k` exceeds the number of training vectors the trainer runs with
/// `k_effective = n` and fills the remaining centroids by cycling through
/// the inputs; this is a caller bug and is logged.
pub fn train(dim: usize, k: usize, data: &[f32], params: &KmeansParams) -> Result<KmeansResult> {
    if dim == 0 {
        return Err(DannError::BadRequest("dimension must be > 0".into()));
    }
    if k == 0 {
        return Err(DannError::BadRequest("centroid count must be > 0".into()));
    }
    if data.is_empty() {
        return Err(DannError::BadRequest(
            "cannot train k-means on an empty training set".into(),
        ));
    }
    if data.len() % dim != 0 {
        return Err(DannError::BadRequest(format!(
            "training buffer length {} is not a multiple of dim {}",
            data.len(),
            dim
        )));
    }

    let n = data.len() / dim;
    let k_effective = k.min(n);
    if k_effective < k {
        warn!(
            requested_k = k,
            effective_k = k_effective,
            n = n,
            "fewer training vectors than centroids, padding with inputs"
        );
    }

    info!(n = n, k = k_effective, dim = dim, nredo = params.nredo, "training k-means");

    let mut best: Option<KmeansResult> = None;
    for redo in 0..params.nredo.max(1) {
        let run = run_lloyds(dim, k_effective, n, data, params, redo as u64)?;
        debug!(
            redo = redo,
            error = run.quantization_error,
            iterations = run.iterations,
            "k-means run complete"
        );
        let better = match &best {
            Some(b) => run.quantization_error < b.quantization_error,
            None => true,
        };
        if better {
            best = Some(run);
        }
    }

    let mut result = best.ok_or_else(|| DannError::Internal("k-means produced no runs".into()))?;

    // Pad out to the requested k by cycling through the inputs.
    if k_effective < k {
        for extra in k_effective..k {
            let src = extra % n;
            result
                .centroids
                .extend_from_slice(&data[src * dim..(src + 1) * dim]);
        }
    }

    Ok(result)
}

/// One seeded Lloyd run.
fn run_lloyds(
    dim: usize,
    k: usize,
    n: usize,
    data: &[f32],
    params: &KmeansParams,
    redo: u64,
) -> Result<KmeansResult> {
    // Seeded shuffle; the first k vectors seed the centroids. Each redo
    // perturbs the seed so runs are independent but reproducible.
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(redo));
    indices.shuffle(&mut rng);

    let mut centroids = Vec::with_capacity(k * dim);
    for &idx in indices.iter().take(k) {
        centroids.extend_from_slice(&data[idx * dim..(idx + 1) * dim]);
    }

    let mut prev_centroids = centroids.clone();
    let mut assignments = vec![0usize; n];
    let mut counts = vec![0usize; k];
    let mut sums = vec![0.0f32; k * dim];
    let mut iterations = 0usize;

    for t in 0..params.niter {
        iterations = t + 1;
        prev_centroids.copy_from_slice(&centroids);

        // Assignment step: ties break to the lowest centroid index.
        for (i, vector) in data.chunks_exact(dim).enumerate() {
            assignments[i] = find_closest(&centroids, vector, dim);
        }

        // Update step: per-cluster means accumulated in document order.
        counts.iter_mut().for_each(|c| *c = 0);
        sums.iter_mut().for_each(|s| *s = 0.0);
        for (i, vector) in data.chunks_exact(dim).enumerate() {
            let c = assignments[i];
            counts[c] += 1;
            let sum = &mut sums[c * dim..(c + 1) * dim];
            for d in 0..dim {
                sum[d] += vector[d];
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                // Empty cluster keeps its previous centroid.
                centroids[c * dim..(c + 1) * dim]
                    .copy_from_slice(&prev_centroids[c * dim..(c + 1) * dim]);
                continue;
            }
            let inv = 1.0 / counts[c] as f32;
            for d in 0..dim {
                centroids[c * dim + d] = sums[c * dim + d] * inv;
            }
        }

        if t > 0 {
            let mut max_shift = 0.0f32;
            for c in 0..k {
                let shift = l2_distance(
                    &prev_centroids[c * dim..(c + 1) * dim],
                    &centroids[c * dim..(c + 1) * dim],
                );
                if shift > max_shift {
                    max_shift = shift;
                }
            }
            debug!(iter = t + 1, max_shift = max_shift, "k-means iteration");
            if max_shift < params.convergence_threshold {
                info!(iterations = t + 1, max_shift = max_shift, "k-means converged");
                break;
            }
        }
    }

    // Final assignment against the final centroids, plus the error used to
    // pick the best redo.
    let mut quantization_error = 0.0f32;
    for (i, vector) in data.chunks_exact(dim).enumerate() {
        let c = find_closest(&centroids, vector, dim);
        assignments[i] = c;
        quantization_error += l2_distance(&centroids[c * dim..(c + 1) * dim], vector);
    }

    Ok(KmeansResult {
        centroids,
        assignments,
        quantization_error,
        iterations,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_train_two_clusters() {
        // The four-vector dataset splits cleanly into two clusters near
        // (0.15, 0.05) and (10.0, 10.0).
        let data = vec![0.1, 0.1, 0.2, 0.0, 9.8, 10.1, 10.2, 9.9];
        let result = train(2, 2, &data, &KmeansParams::default()).unwrap();
        assert_eq!(result.centroids.len(), 4);

        let expected = [[0.15f32, 0.05], [10.0, 10.0]];
        for target in &expected {
            let hit = result
                .centroids
                .chunks_exact(2)
                .any(|c| l2_distance(c, target) < 0.25);
            assert!(hit, "no centroid within 0.5 of {:?}: {:?}", target, result.centroids);
        }
    }

    #[test]
    fn test_train_single_point() {
        let data = vec![1.0, 2.0, 3.0];
        let result = train(3, 1, &data, &KmeansParams::default()).unwrap();
        assert_eq!(result.centroids, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_train_k_greater_than_n_pads() {
        let data = vec![1.0, 0.0, 0.0, 1.0];
        let result = train(2, 5, &data, &KmeansParams::default()).unwrap();
        // Output is always k * dim, padded by cycling through the inputs.
        assert_eq!(result.centroids.len(), 10);
    }

    #[test]
    fn test_train_empty_is_error() {
        assert!(train(3, 2, &[], &KmeansParams::default()).is_err());
    }

    #[test]
    fn test_train_ragged_buffer_is_error() {
        assert!(train(3, 1, &[1.0, 2.0], &KmeansParams::default()).is_err());
    }

    #[test]
    fn test_determinism() {
        let data: Vec<f32> = (0..400).map(|i| ((i * 37) % 101) as f32 * 0.1).collect();
        let params = KmeansParams::default();
        let a = train(4, 5, &data, &params).unwrap();
        let b = train(4, 5, &data, &params).unwrap();
        assert_eq!(a.centroids, b.centroids);
        assert_eq!(a.assignments, b.assignments);
    }

    #[test]
    fn test_final_assignments_agree_with_find_closest() {
        let data: Vec<f32> = (0..300).map(|i| ((i * 13) % 97) as f32).collect();
        let result = train(3, 4, &data, &KmeansParams::default()).unwrap();
        for (i, vector) in data.chunks_exact(3).enumerate() {
            assert_eq!(
                result.assignments[i],
                find_closest(&result.centroids, vector, 3)
            );
        }
    }

    #[test]
    fn test_sample_count_clamps() {
        let params = KmeansParams::default();

        // Small n: ratio cap dominates but the lower bound is k.
        assert_eq!(params.sample_count(10, 4), 4);

        // Large n with small k: k * points_per_centroid dominates, which is
        // at most k * max_points_per_centroid.
        let count = params.sample_count(1_000_000, 10);
        assert!(count >= 10 * params.min_points_per_centroid);
        assert!(count <= 10 * params.max_points_per_centroid);

        // Mid n: never more than the ratio cap.
        let count = params.sample_count(1000, 100);
        assert!(count <= 220);
        assert!(count >= 100);
    }

    #[test]
    fn test_sample_count_deterministic() {
        let params = KmeansParams::default();
        assert_eq!(params.sample_count(50_000, 16), params.sample_count(50_000, 16));
    }

    #[test]
    fn test_sample_training_set_size_and_determinism() {
        let dim = 2;
        let data: Vec<f32> = (0..2000).map(|i| i as f32).collect();
        let params = KmeansParams::default();
        let a = params.sample_training_set(&data, dim, 8);
        let b = params.sample_training_set(&data, dim, 8);
        assert_eq!(a, b);
        assert_eq!(a.len() / dim, params.sample_count(1000, 8));
    }

    #[test]
    fn test_nredo_keeps_best() {
        let data: Vec<f32> = (0..200)
            .map(|i| if i % 2 == 0 { (i % 20) as f32 } else { 100.0 + (i % 20) as f32 })
            .collect();
        let mut params = KmeansParams::default();
        params.nredo = 3;
        let multi = train(2, 4, &data, &params).unwrap();
        params.nredo = 1;
        let single = train(2, 4, &data, &params).unwrap();
        assert!(multi.quantization_error <= single.quantization_error + 1e-3);
    }
}
