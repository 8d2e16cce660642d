//! End-to-end tests for the distributed IVF index against a brute-force
//! baseline.

use dann_core::VectorId;
use dann_index::distance::top_k_flat;
use dann_index::{DistributedIvfIndex, IvfConfig, KmeansParams};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Gaussian-ish vectors via Box-Muller over a seeded PRNG.
fn gaussian_vectors(n: usize, dim: usize, seed: u64) -> (Vec<f32>, Vec<VectorId>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut vectors = Vec::with_capacity(n * dim);
    for _ in 0..(n * dim + 1) / 2 {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen_range(0.0..1.0);
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        vectors.push((radius * theta.cos()) as f32);
        vectors.push((radius * theta.sin()) as f32);
    }
    vectors.truncate(n * dim);
    let ids = (0..n as i64).map(VectorId).collect();
    (vectors, ids)
}

#[test]
fn test_training_vectors_find_themselves() {
    // 65536 Gaussian vectors at dim 64, nlist = 10: searching for any
    // stored vector with k = 1 and every centroid probed returns its own
    // id at distance zero.
    let dim = 64;
    let n = 65_536;
    let (vectors, ids) = gaussian_vectors(n, dim, 42);

    let mut index = DistributedIvfIndex::new(
        "e2e",
        IvfConfig::new(dim).with_nlist(10).with_shard_count(4),
    );
    index.build(&vectors, &ids).unwrap();
    assert!(index.is_trained());
    assert_eq!(index.len(), n);
    assert_eq!(index.nlist(), 10);

    for probe in (0..n).step_by(n / 50) {
        let query = &vectors[probe * dim..(probe + 1) * dim];
        let results = index
            .search_with_nprobe(query, 1, index.nlist())
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, VectorId(probe as i64), "probe {probe}");
        assert_eq!(results[0].distance, 0.0);
    }
}

#[test]
fn test_full_probe_equals_brute_force() {
    // With nprobe = nlist every posting is scanned, so the IVF answer must
    // match an exhaustive scan.
    let dim = 16;
    let n = 2000;
    let (vectors, ids) = gaussian_vectors(n, dim, 7);

    let mut index = DistributedIvfIndex::new(
        "full-probe",
        IvfConfig::new(dim).with_nlist(16).with_shard_count(5),
    );
    index.build(&vectors, &ids).unwrap();

    let mut rng = StdRng::seed_from_u64(99);
    for _ in 0..20 {
        let query: Vec<f32> = (0..dim).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let k = 25;

        let ivf = index.search_with_nprobe(&query, k, index.nlist()).unwrap();
        let brute = top_k_flat(&vectors, &ids, &query, dim, k);

        assert_eq!(ivf.len(), brute.len());
        for (a, b) in ivf.iter().zip(brute.iter()) {
            assert_eq!(a.id, b.id);
            assert!((a.distance - b.distance).abs() <= 1e-4 * (1.0 + b.distance));
        }
    }
}

#[test]
fn test_single_probe_scans_one_posting() {
    // nprobe = 1 only surfaces members of the query's own nearest posting.
    let dim = 8;
    let n = 500;
    let (vectors, ids) = gaussian_vectors(n, dim, 5);

    let mut index = DistributedIvfIndex::new(
        "single-probe",
        IvfConfig::new(dim).with_nlist(8).with_shard_count(3),
    );
    index.build(&vectors, &ids).unwrap();

    let query = &vectors[0..dim];
    let results = index.search_with_nprobe(query, n, 1).unwrap();
    // Strictly fewer results than the corpus: one posting only.
    assert!(!results.is_empty());
    assert!(results.len() < n);
    // The query's own vector lives in that posting.
    assert_eq!(results[0].id, VectorId(0));
}

#[test]
fn test_nlist_one_degenerates_to_flat_scan() {
    let dim = 4;
    let n = 64;
    let (vectors, ids) = gaussian_vectors(n, dim, 3);

    let mut index =
        DistributedIvfIndex::new("one-list", IvfConfig::new(dim).with_nlist(1).with_shard_count(2));
    index.build(&vectors, &ids).unwrap();

    let query = [0.0; 4];
    let ivf = index.search_with_nprobe(&query, 10, 1).unwrap();
    let brute = top_k_flat(&vectors, &ids, &query, dim, 10);
    assert_eq!(ivf.len(), brute.len());
    for (a, b) in ivf.iter().zip(brute.iter()) {
        assert_eq!(a.id, b.id);
    }
}

#[test]
fn test_custom_kmeans_params_plumbed_through() {
    let dim = 4;
    let n = 300;
    let (vectors, ids) = gaussian_vectors(n, dim, 11);

    let mut config = IvfConfig::new(dim).with_nlist(6);
    config.kmeans = KmeansParams {
        niter: 10,
        nredo: 2,
        seed: 777,
        ..KmeansParams::default()
    };
    let mut a = DistributedIvfIndex::new("a", config.clone());
    a.build(&vectors, &ids).unwrap();

    let mut b = DistributedIvfIndex::new("b", config);
    b.build(&vectors, &ids).unwrap();

    // Same seed and data: identical centroid tables and search results.
    assert_eq!(a.centroids(), b.centroids());
    let query = &vectors[..dim];
    assert_eq!(
        a.search_with_nprobe(query, 5, 3).unwrap(),
        b.search_with_nprobe(query, 5, 3).unwrap()
    );
}
