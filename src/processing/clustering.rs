use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

use crate::config::ClusteringConfig;
use crate::error::{Result, SortError};

// -----------------------------------------------------------------------------
// DIVISIVE K-MEANS
// -----------------------------------------------------------------------------

/// Safety cap on E/M iterations within one division step.
const MAX_LLOYD_ITERATIONS: usize = 100;

/// Finalized clustering of the feature vectors.
pub struct ClusterModel {
    /// Dense labels 1..=K, renumbered by descending cluster size.
    pub assignments: Vec<usize>,
    /// Centroids as rows, ordered to match the labels.
    pub centroids: DMatrix<f64>,
    pub sizes: Vec<usize>,
    /// Mean squared assignment distance of the winning repetition.
    pub mse: f64,
    /// Within-cluster scatter W.
    pub within: DMatrix<f64>,
    /// Between-cluster scatter B.
    pub between: DMatrix<f64>,
    /// Total scatter T = W + B.
    pub total: DMatrix<f64>,
}

impl ClusterModel {
    pub fn k(&self) -> usize {
        self.sizes.len()
    }
}

/// Clusters feature vectors into miniclusters by repeatedly doubling the
/// centroid set and running Lloyd iterations, never letting a singleton
/// cluster survive.
pub struct DivisiveKMeans {
    config: ClusteringConfig,
}

struct RunOutcome {
    assignments: Vec<usize>,
    centroids: Vec<DVector<f64>>,
    mse: f64,
}

impl DivisiveKMeans {
    pub fn new(config: ClusteringConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    pub fn fit(&self, data: &DMatrix<f64>) -> Result<ClusterModel> {
        let n = data.nrows();
        if n == 0 || data.ncols() == 0 {
            return Err(SortError::MissingInput("clustering"));
        }

        let divisions = self.divisions_for(n);
        let rows: Vec<DVector<f64>> = (0..n).map(|i| data.row(i).transpose()).collect();
        let norms: Vec<f64> = rows.iter().map(|r| r.norm_squared()).collect();
        let jitter = jitter_scale(&rows);
        let base_seed = self.config.seed.unwrap_or_else(|| rand::thread_rng().gen());

        // Repetitions share no mutable state; each gets its own seeded RNG.
        let runs: Vec<RunOutcome> = (0..self.config.reps)
            .into_par_iter()
            .map(|rep| {
                let rng = StdRng::seed_from_u64(base_seed.wrapping_add(rep as u64));
                run_once(&rows, &norms, divisions, jitter, &self.config, rng)
            })
            .collect();

        // Lowest final MSE wins, independent of scheduling order.
        let best = runs
            .into_iter()
            .min_by(|a, b| {
                a.mse
                    .partial_cmp(&b.mse)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or(SortError::MissingInput("clustering"))?;

        Ok(finalize(&rows, best))
    }

    /// K = 2^d with d = clamp(round(log2(N / target)), 4, 7) unless overridden.
    fn divisions_for(&self, n: usize) -> u32 {
        match self.config.divisions {
            Some(d) => d,
            None => {
                let ratio = n as f64 / self.config.target_cluster_size as f64;
                ratio.log2().round().clamp(4.0, 7.0) as u32
            }
        }
    }
}

/// Gaussian jitter scale for centroid duplication: large enough to break the
/// symmetry of a duplicated pair, small enough not to mis-seed.
fn jitter_scale(rows: &[DVector<f64>]) -> f64 {
    let n = rows.len();
    if n < 2 {
        return 0.0;
    }
    let dim = rows[0].len();
    // Per-row partial sums collected in index order keep the reduction
    // deterministic for seeded runs.
    let partials: Vec<f64> = (0..n - 1)
        .into_par_iter()
        .map(|i| {
            let mut sum = 0.0;
            for j in i + 1..n {
                sum += (&rows[i] - &rows[j]).norm();
            }
            sum
        })
        .collect();
    let total: f64 = partials.iter().sum();
    let pairs = (n * (n - 1) / 2) as f64;
    total / pairs / 100.0 / dim as f64
}

fn run_once(
    rows: &[DVector<f64>],
    norms: &[f64],
    divisions: u32,
    jitter: f64,
    config: &ClusteringConfig,
    mut rng: StdRng,
) -> RunOutcome {
    let n = rows.len();
    let normal = Normal::new(0.0, jitter.max(f64::MIN_POSITIVE))
        .expect("jitter scale is non-negative and finite");

    let mut centroids = vec![global_mean(rows)];
    let mut assignments = vec![0usize; n];
    let mut mse = f64::INFINITY;

    for step in 0..divisions {
        // Duplicate every centroid and perturb the copies.
        for idx in 0..centroids.len() {
            let mut copy = centroids[idx].clone();
            for v in copy.iter_mut() {
                *v += normal.sample(&mut rng);
            }
            centroids.push(copy);
        }

        // Earlier division steps settle with a looser reassignment threshold;
        // only the final step uses the configured one.
        let final_step = step + 1 == divisions;
        let reassign_threshold = if final_step {
            config.reassign_converge
        } else {
            config.reassign_converge.max(n / 100)
        };

        mse = lloyd(
            rows,
            norms,
            &mut centroids,
            &mut assignments,
            reassign_threshold,
            config.mse_converge,
        );
    }

    RunOutcome {
        assignments,
        centroids,
        mse,
    }
}

/// E/M iterations with singleton elimination and dual convergence criteria.
/// Returns the final mean squared assignment distance.
fn lloyd(
    rows: &[DVector<f64>],
    norms: &[f64],
    centroids: &mut Vec<DVector<f64>>,
    assignments: &mut Vec<usize>,
    reassign_threshold: usize,
    mse_tolerance: f64,
) -> f64 {
    let n = rows.len();
    let mut previous_mse = f64::INFINITY;
    let mut mse = f64::INFINITY;

    for _ in 0..MAX_LLOYD_ITERATIONS {
        // E-step: nearest centroid by squared Euclidean distance.
        let centroid_norms: Vec<f64> = centroids.iter().map(|c| c.norm_squared()).collect();
        let new_assignments: Vec<usize> = (0..n)
            .into_par_iter()
            .map(|i| nearest(&rows[i], norms[i], centroids, &centroid_norms, None).0)
            .collect();

        let moved = new_assignments
            .iter()
            .zip(assignments.iter())
            .filter(|(a, b)| a != b)
            .count();
        *assignments = new_assignments;

        eliminate_singletons(rows, norms, centroids, assignments);
        recompute_centroids(rows, centroids, assignments);

        mse = mean_squared_error(rows, norms, centroids, assignments);
        let fraction = if previous_mse.is_finite() && previous_mse > 0.0 {
            (previous_mse - mse).abs() / previous_mse
        } else {
            f64::INFINITY
        };
        if moved <= reassign_threshold || fraction <= mse_tolerance {
            break;
        }
        previous_mse = mse;
    }

    mse
}

/// Index and squared distance of the nearest centroid, optionally skipping one.
fn nearest(
    row: &DVector<f64>,
    row_norm: f64,
    centroids: &[DVector<f64>],
    centroid_norms: &[f64],
    skip: Option<usize>,
) -> (usize, f64) {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (j, centroid) in centroids.iter().enumerate() {
        if Some(j) == skip {
            continue;
        }
        let distance = squared_distance(row, row_norm, centroid, centroid_norms[j]);
        if distance < best_distance {
            best_distance = distance;
            best = j;
        }
    }
    (best, best_distance)
}

/// ||x||^2 + ||c||^2 - 2 x.c, clamped at zero against rounding.
fn squared_distance(row: &DVector<f64>, row_norm: f64, centroid: &DVector<f64>, centroid_norm: f64) -> f64 {
    let dot: f64 = row.iter().zip(centroid.iter()).map(|(a, b)| a * b).sum();
    (row_norm + centroid_norm - 2.0 * dot).max(0.0)
}

/// Reassign the member of any size-1 cluster to its next-best centroid and
/// drop the centroid, until no singleton remains. Clusters of undefined size
/// cannot feed the similarity statistics downstream.
fn eliminate_singletons(
    rows: &[DVector<f64>],
    norms: &[f64],
    centroids: &mut Vec<DVector<f64>>,
    assignments: &mut [usize],
) {
    loop {
        if centroids.len() <= 1 {
            return;
        }
        let mut counts = vec![0usize; centroids.len()];
        for &a in assignments.iter() {
            counts[a] += 1;
        }
        let Some(singleton) = counts.iter().position(|&c| c == 1) else {
            return;
        };
        let member = assignments
            .iter()
            .position(|&a| a == singleton)
            .expect("a size-1 cluster has exactly one member");

        let centroid_norms: Vec<f64> = centroids.iter().map(|c| c.norm_squared()).collect();
        let (next_best, _) = nearest(
            &rows[member],
            norms[member],
            centroids,
            &centroid_norms,
            Some(singleton),
        );
        assignments[member] = next_best;

        centroids.remove(singleton);
        for a in assignments.iter_mut() {
            if *a > singleton {
                *a -= 1;
            }
        }
    }
}

/// M-step: centroids become the means of their members; empty centroids are
/// dropped and the assignment indices remapped.
fn recompute_centroids(
    rows: &[DVector<f64>],
    centroids: &mut Vec<DVector<f64>>,
    assignments: &mut [usize],
) {
    let k = centroids.len();
    let dim = rows[0].len();
    let mut sums = vec![DVector::zeros(dim); k];
    let mut counts = vec![0usize; k];
    for (i, &a) in assignments.iter().enumerate() {
        sums[a] += &rows[i];
        counts[a] += 1;
    }

    let mut remap = vec![usize::MAX; k];
    let mut kept = Vec::with_capacity(k);
    for j in 0..k {
        if counts[j] > 0 {
            remap[j] = kept.len();
            kept.push(&sums[j] / counts[j] as f64);
        }
    }
    for a in assignments.iter_mut() {
        *a = remap[*a];
    }
    *centroids = kept;
}

fn mean_squared_error(
    rows: &[DVector<f64>],
    norms: &[f64],
    centroids: &[DVector<f64>],
    assignments: &[usize],
) -> f64 {
    let centroid_norms: Vec<f64> = centroids.iter().map(|c| c.norm_squared()).collect();
    let distances: Vec<f64> = (0..rows.len())
        .into_par_iter()
        .map(|i| {
            let a = assignments[i];
            squared_distance(&rows[i], norms[i], &centroids[a], centroid_norms[a])
        })
        .collect();
    distances.iter().sum::<f64>() / rows.len() as f64
}

fn global_mean(rows: &[DVector<f64>]) -> DVector<f64> {
    let mut mean = DVector::zeros(rows[0].len());
    for row in rows {
        mean += row;
    }
    mean / rows.len() as f64
}

/// Renumber clusters 1..=K by descending size and attach the scatter
/// decomposition.
fn finalize(rows: &[DVector<f64>], run: RunOutcome) -> ClusterModel {
    let k = run.centroids.len();
    let dim = rows[0].len();

    let mut sizes = vec![0usize; k];
    for &a in &run.assignments {
        sizes[a] += 1;
    }

    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| sizes[b].cmp(&sizes[a]).then(a.cmp(&b)));
    let mut remap = vec![0usize; k];
    for (new_index, &old) in order.iter().enumerate() {
        remap[old] = new_index;
    }

    let assignments: Vec<usize> = run.assignments.iter().map(|&a| remap[a] + 1).collect();
    let sizes: Vec<usize> = order.iter().map(|&old| sizes[old]).collect();
    let mut centroids = DMatrix::zeros(k, dim);
    for (new_index, &old) in order.iter().enumerate() {
        centroids
            .row_mut(new_index)
            .copy_from(&run.centroids[old].transpose());
    }

    let mean = global_mean(rows);
    let mut within = DMatrix::zeros(dim, dim);
    for (i, &label) in assignments.iter().enumerate() {
        let delta = &rows[i] - &run.centroids[order[label - 1]];
        within += &delta * delta.transpose();
    }
    let mut between = DMatrix::zeros(dim, dim);
    for (index, &old) in order.iter().enumerate() {
        let delta = &run.centroids[old] - &mean;
        between += (&delta * delta.transpose()) * sizes[index] as f64;
    }
    let mut total = DMatrix::zeros(dim, dim);
    for row in rows {
        let delta = row - &mean;
        total += &delta * delta.transpose();
    }

    ClusterModel {
        assignments,
        centroids,
        sizes,
        mse: run.mse,
        within,
        between,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_data(per_blob: usize, centers: &[(f64, f64)], sigma: f64, seed: u64) -> DMatrix<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, sigma).unwrap();
        let n = per_blob * centers.len();
        let mut data = DMatrix::zeros(n, 2);
        for (b, &(cx, cy)) in centers.iter().enumerate() {
            for i in 0..per_blob {
                let r = b * per_blob + i;
                data[(r, 0)] = cx + normal.sample(&mut rng);
                data[(r, 1)] = cy + normal.sample(&mut rng);
            }
        }
        data
    }

    fn config_with(divisions: Option<u32>, seed: u64) -> ClusteringConfig {
        ClusteringConfig {
            divisions,
            reps: 3,
            reassign_converge: 0,
            mse_converge: 1e-4,
            target_cluster_size: 25,
            seed: Some(seed),
        }
    }

    #[test]
    fn test_missing_input() {
        let clusterer = DivisiveKMeans::new(config_with(None, 1)).unwrap();
        let empty = DMatrix::<f64>::zeros(0, 2);
        assert!(matches!(
            clusterer.fit(&empty),
            Err(SortError::MissingInput(_))
        ));
    }

    #[test]
    fn test_two_blobs_separate_cleanly() {
        let data = blob_data(200, &[(0.0, 0.0), (10.0, 10.0)], 0.5, 42);
        let clusterer = DivisiveKMeans::new(config_with(Some(1), 7)).unwrap();
        let model = clusterer.fit(&data).unwrap();

        assert_eq!(model.k(), 2);
        assert_eq!(model.sizes.iter().sum::<usize>(), 400);

        // Count cross-blob leakage up to label swap.
        let first: Vec<usize> = model.assignments[..200].to_vec();
        let second: Vec<usize> = model.assignments[200..].to_vec();
        let majority_first = first.iter().filter(|&&a| a == first[0]).count();
        let leaked = (200 - majority_first)
            + second.iter().filter(|&&a| a == first[0]).count();
        assert!(
            (leaked as f64) / 400.0 < 0.01,
            "{} points leaked across blobs",
            leaked
        );
    }

    #[test]
    fn test_no_singleton_clusters() {
        for &divisions in &[4u32, 5, 6, 7] {
            let data = blob_data(60, &[(0.0, 0.0), (4.0, 0.0), (0.0, 4.0)], 1.0, 100 + divisions as u64);
            let clusterer = DivisiveKMeans::new(config_with(Some(divisions), 3)).unwrap();
            let model = clusterer.fit(&data).unwrap();
            assert!(
                model.sizes.iter().all(|&s| s >= 2),
                "divisions {} produced sizes {:?}",
                divisions,
                model.sizes
            );
        }
    }

    #[test]
    fn test_labels_dense_and_ordered_by_size() {
        let data = blob_data(100, &[(0.0, 0.0), (8.0, 8.0)], 1.5, 5);
        let clusterer = DivisiveKMeans::new(config_with(Some(3), 11)).unwrap();
        let model = clusterer.fit(&data).unwrap();

        let k = model.k();
        for label in 1..=k {
            assert!(model.assignments.iter().any(|&a| a == label));
        }
        assert!(model.assignments.iter().all(|&a| (1..=k).contains(&a)));
        for pair in model.sizes.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
    }

    #[test]
    fn test_scatter_decomposition() {
        let data = blob_data(80, &[(0.0, 0.0), (6.0, 2.0)], 1.0, 17);
        let clusterer = DivisiveKMeans::new(config_with(Some(2), 23)).unwrap();
        let model = clusterer.fit(&data).unwrap();

        let sum = &model.within + &model.between;
        assert!(
            (&sum - &model.total).norm() < 1e-6 * model.total.norm().max(1.0),
            "within + between deviates from total scatter"
        );
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let data = blob_data(90, &[(0.0, 0.0), (5.0, 5.0)], 1.0, 29);
        let clusterer = DivisiveKMeans::new(config_with(Some(2), 31)).unwrap();
        let a = clusterer.fit(&data).unwrap();
        let b = clusterer.fit(&data).unwrap();
        assert_eq!(a.assignments, b.assignments);
        assert_eq!(a.mse.to_bits(), b.mse.to_bits());
    }

    #[test]
    fn test_tiny_input_still_pairs_points() {
        // Two coincident points must end as one cluster of two, never two
        // singletons.
        let data = DMatrix::from_row_iterator(2, 2, [1.0, 1.0, 1.0, 1.0]);
        let clusterer = DivisiveKMeans::new(config_with(Some(1), 13)).unwrap();
        let model = clusterer.fit(&data).unwrap();
        assert_eq!(model.k(), 1);
        assert_eq!(model.sizes, vec![2]);
    }

    #[test]
    fn test_division_count_derivation() {
        let clusterer = DivisiveKMeans::new(ClusteringConfig {
            target_cluster_size: 75,
            ..ClusteringConfig::default()
        })
        .unwrap();
        // 1200/75 = 16 -> log2 = 4; 76800/75 = 1024 -> log2 = 10, clamped to 7.
        assert_eq!(clusterer.divisions_for(1200), 4);
        assert_eq!(clusterer.divisions_for(76_800), 7);
        assert_eq!(clusterer.divisions_for(10), 4);
    }
}
