use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::error::{Result, SortError};
use crate::processing::clustering::ClusterModel;

// -----------------------------------------------------------------------------
// CLUSTER SIMILARITY
// -----------------------------------------------------------------------------

/// Interface-energy matrix over miniclusters, stored upper-triangular.
///
/// Entries are unnormalized sums of exponentially decayed pointwise distances;
/// merges update them algebraically without touching the raw vectors.
pub struct SimilarityMatrix {
    /// Upper triangle including the diagonal, row-major: row a holds entries
    /// for partners a..K.
    energies: Vec<f64>,
    sizes: Vec<usize>,
    /// Cluster centroids as rows, kept aligned with the matrix through merges
    /// and relabeling.
    centroids: DMatrix<f64>,
    sigma: f64,
    k: usize,
}

impl SimilarityMatrix {
    /// Build from a finalized clustering; the scale is sqrt(trace(W)) / 10.
    pub fn from_model(features: &DMatrix<f64>, model: &ClusterModel) -> Result<Self> {
        let sigma = model.within.trace().max(0.0).sqrt() / 10.0;
        Self::from_labels(features, &model.assignments, model.centroids.clone(), sigma)
    }

    /// Build from explicit dense labels 1..=K and a fixed scale.
    pub fn from_labels(
        features: &DMatrix<f64>,
        assignments: &[usize],
        centroids: DMatrix<f64>,
        sigma: f64,
    ) -> Result<Self> {
        let n = features.nrows();
        if n == 0 || assignments.is_empty() {
            return Err(SortError::MissingInput("similarity"));
        }
        if assignments.len() != n {
            return Err(SortError::InvalidConfiguration(format!(
                "{} labels supplied for {} feature vectors",
                assignments.len(),
                n
            )));
        }
        if !(sigma > 0.0) || !sigma.is_finite() {
            return Err(SortError::InvalidConfiguration(format!(
                "similarity scale must be positive and finite, got {}",
                sigma
            )));
        }

        let k = *assignments
            .iter()
            .max()
            .expect("assignments are non-empty");
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); k];
        for (i, &label) in assignments.iter().enumerate() {
            if label == 0 || label > k {
                return Err(SortError::InvalidConfiguration(format!(
                    "label {} outside the dense range 1..={}",
                    label, k
                )));
            }
            members[label - 1].push(i);
        }
        for (index, m) in members.iter().enumerate() {
            if m.len() < 2 {
                return Err(SortError::SingletonCluster {
                    cluster: index + 1,
                    size: m.len(),
                });
            }
        }
        if centroids.nrows() != k {
            return Err(SortError::InvalidConfiguration(format!(
                "{} centroids supplied for {} clusters",
                centroids.nrows(),
                k
            )));
        }

        let rows: Vec<DVector<f64>> = (0..n).map(|i| features.row(i).transpose()).collect();
        let norms: Vec<f64> = rows.iter().map(|r| r.norm_squared()).collect();

        // Independent (a, b) entries, computed in parallel.
        let pairs: Vec<(usize, usize)> = (0..k)
            .flat_map(|a| (a..k).map(move |b| (a, b)))
            .collect();
        let energies: Vec<f64> = pairs
            .par_iter()
            .map(|&(a, b)| {
                if a == b {
                    within_energy(&members[a], &rows, &norms, sigma)
                } else {
                    cross_energy(&members[a], &members[b], &rows, &norms, sigma)
                }
            })
            .collect();

        Ok(Self {
            energies,
            sizes: members.iter().map(Vec::len).collect(),
            centroids,
            sigma,
            k,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn centroids(&self) -> &DMatrix<f64> {
        &self.centroids
    }

    fn index(&self, a: usize, b: usize) -> usize {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        // Row lo starts after the (k - r) entries of every earlier row r.
        lo * self.k - lo * (lo.saturating_sub(1)) / 2 - lo + hi
    }

    fn get(&self, a: usize, b: usize) -> f64 {
        self.energies[self.index(a, b)]
    }

    fn check(&self, cluster: usize) -> usize {
        assert!(
            cluster >= 1 && cluster <= self.k,
            "cluster id {} outside 1..={}",
            cluster,
            self.k
        );
        cluster - 1
    }

    /// Raw interface energy between clusters a and b (1-based ids, a == b for
    /// self-energy).
    pub fn energy(&self, a: usize, b: usize) -> f64 {
        let a = self.check(a);
        let b = self.check(b);
        self.get(a, b)
    }

    /// Pair-count normalized energy. Non-mutating.
    pub fn normalized(&self, a: usize, b: usize) -> f64 {
        let a0 = self.check(a);
        let b0 = self.check(b);
        if a0 == b0 {
            let n = self.sizes[a0] as f64;
            self.get(a0, b0) / (n * (n - 1.0) / 2.0)
        } else {
            self.get(a0, b0) / (self.sizes[a0] as f64 * self.sizes[b0] as f64)
        }
    }

    /// Connection strength: normalized energy at the interface relative to the
    /// self-similarity of both clusters. Zero on the diagonal.
    pub fn connection_strength(&self, a: usize, b: usize) -> f64 {
        if a == b {
            return 0.0;
        }
        let cross = self.normalized(a, b);
        2.0 * cross / (self.normalized(a, a) + self.normalized(b, b))
    }

    /// Merge cluster b into cluster a using the additive energy law; no
    /// distance is recomputed. Entry arithmetic is O(1) per affected pair; the
    /// triangular store is compacted afterwards.
    pub fn merge(&mut self, a: usize, b: usize) -> Result<()> {
        if a == b {
            return Err(SortError::InvalidConfiguration(format!(
                "cannot merge cluster {} with itself",
                a
            )));
        }
        if a < 1 || a > self.k || b < 1 || b > self.k {
            return Err(SortError::InvalidConfiguration(format!(
                "merge targets {} and {} outside 1..={}",
                a, b, self.k
            )));
        }
        let lo = a.min(b) - 1;
        let hi = a.max(b) - 1;
        let k_new = self.k - 1;

        // Map a compacted index back to the old numbering (hi removed).
        let unmap = |idx: usize| if idx >= hi { idx + 1 } else { idx };

        let mut energies = Vec::with_capacity(k_new * (k_new + 1) / 2);
        for i in 0..k_new {
            for j in i..k_new {
                let oi = unmap(i);
                let oj = unmap(j);
                let value = if oi == lo && oj == lo {
                    self.get(lo, lo) + self.get(hi, hi) + self.get(lo, hi)
                } else if oi == lo {
                    self.get(lo, oj) + self.get(hi, oj)
                } else if oj == lo {
                    self.get(oi, lo) + self.get(oi, hi)
                } else {
                    self.get(oi, oj)
                };
                energies.push(value);
            }
        }

        let merged_size = self.sizes[lo] + self.sizes[hi];
        let weighted = (self.centroids.row(lo) * self.sizes[lo] as f64
            + self.centroids.row(hi) * self.sizes[hi] as f64)
            / merged_size as f64;

        let mut centroids = DMatrix::zeros(k_new, self.centroids.ncols());
        for i in 0..k_new {
            let old = unmap(i);
            if old == lo {
                centroids.row_mut(i).copy_from(&weighted);
            } else {
                centroids.row_mut(i).copy_from(&self.centroids.row(old));
            }
        }

        self.sizes[lo] = merged_size;
        self.sizes.remove(hi);
        self.energies = energies;
        self.centroids = centroids;
        self.k = k_new;
        Ok(())
    }

    /// Relabel clusters 1..=K by greedy chaining over connection strengths and
    /// permute the stored matrix, sizes and centroids accordingly.
    ///
    /// The chain starts at the globally strongest pair (lower id visited
    /// first) and repeatedly moves to the strongest unvisited neighbor of the
    /// last-visited cluster, comparing the best partner above the diagonal
    /// (row) with the best below (column); on an exact tie the row partner
    /// wins. Returns the old-to-new id permutation.
    pub fn relabel(&mut self) -> Vec<usize> {
        let k = self.k;
        if k == 1 {
            return vec![1];
        }

        let mut visited = vec![false; k];
        let mut order = Vec::with_capacity(k);

        let (mut best_i, mut best_j, mut best) = (0, 1, f64::NEG_INFINITY);
        for i in 0..k {
            for j in i + 1..k {
                let value = self.connection_strength(i + 1, j + 1);
                if value > best {
                    best = value;
                    best_i = i;
                    best_j = j;
                }
            }
        }
        order.push(best_i);
        order.push(best_j);
        visited[best_i] = true;
        visited[best_j] = true;
        let mut last = best_j;

        while order.len() < k {
            let mut row_best: Option<(usize, f64)> = None;
            let mut col_best: Option<(usize, f64)> = None;
            for c in 0..k {
                if visited[c] || c == last {
                    continue;
                }
                let value = self.connection_strength(last + 1, c + 1);
                if c > last {
                    if row_best.map_or(true, |(_, v)| value > v) {
                        row_best = Some((c, value));
                    }
                } else if col_best.map_or(true, |(_, v)| value > v) {
                    col_best = Some((c, value));
                }
            }
            let next = match (row_best, col_best) {
                (Some((rc, rv)), Some((_, cv))) if rv >= cv => rc,
                (_, Some((cc, _))) => cc,
                (Some((rc, _)), None) => rc,
                (None, None) => break,
            };
            order.push(next);
            visited[next] = true;
            last = next;
        }

        // Visit order becomes the new numbering.
        let mut permutation = vec![0usize; k];
        for (new_index, &old) in order.iter().enumerate() {
            permutation[old] = new_index + 1;
        }

        let mut energies = vec![0.0; self.energies.len()];
        for a in 0..k {
            for b in a..k {
                let pa = permutation[a] - 1;
                let pb = permutation[b] - 1;
                let (lo, hi) = if pa <= pb { (pa, pb) } else { (pb, pa) };
                energies[lo * k - lo * (lo.saturating_sub(1)) / 2 - lo + hi] = self.get(a, b);
            }
        }
        let sizes: Vec<usize> = order.iter().map(|&old| self.sizes[old]).collect();
        let mut centroids = DMatrix::zeros(k, self.centroids.ncols());
        for (new_index, &old) in order.iter().enumerate() {
            centroids
                .row_mut(new_index)
                .copy_from(&self.centroids.row(old));
        }

        self.energies = energies;
        self.sizes = sizes;
        self.centroids = centroids;
        permutation
    }
}

/// Decayed distance between two feature vectors: exp(-||x - y|| / sigma).
/// The squared distance is clamped at zero before the square root so rounding
/// near zero cannot produce NaN.
fn decayed(
    rows: &[DVector<f64>],
    norms: &[f64],
    x: usize,
    y: usize,
    sigma: f64,
) -> f64 {
    let dot: f64 = rows[x].iter().zip(rows[y].iter()).map(|(a, b)| a * b).sum();
    let squared = (norms[x] + norms[y] - 2.0 * dot).max(0.0);
    (-squared.sqrt() / sigma).exp()
}

fn within_energy(members: &[usize], rows: &[DVector<f64>], norms: &[f64], sigma: f64) -> f64 {
    let mut sum = 0.0;
    for (i, &x) in members.iter().enumerate() {
        for &y in &members[i + 1..] {
            sum += decayed(rows, norms, x, y, sigma);
        }
    }
    sum
}

fn cross_energy(
    a: &[usize],
    b: &[usize],
    rows: &[DVector<f64>],
    norms: &[f64],
    sigma: f64,
) -> f64 {
    let mut sum = 0.0;
    for &x in a {
        for &y in b {
            sum += decayed(rows, norms, x, y, sigma);
        }
    }
    sum
}
