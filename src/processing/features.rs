use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SortError};

// -----------------------------------------------------------------------------
// DIMENSIONALITY REDUCTION
// -----------------------------------------------------------------------------

/// Cumulative squared-singular-value fraction a basis must explain before its
/// rank is accepted.
const VARIANCE_FRACTION: f64 = 0.95;

/// Variance-ranked orthogonal basis over flattened waveforms.
///
/// Fit is a full recomputation; there is no incremental update. Whenever the
/// waveform set grows, fit again.
pub struct WaveformBasis {
    mean: DVector<f64>,
    /// Basis vectors as columns, ordered by descending singular value.
    basis: DMatrix<f64>,
    singular_values: DVector<f64>,
    /// Component scores of the training waveforms, one row per event.
    scores: DMatrix<f64>,
    rank: usize,
}

impl WaveformBasis {
    pub fn fit(waveforms: &DMatrix<f64>) -> Result<Self> {
        let n = waveforms.nrows();
        let d = waveforms.ncols();
        if n == 0 || d == 0 {
            return Err(SortError::MissingInput("dimensionality reduction"));
        }

        let mut mean = DVector::zeros(d);
        for r in 0..n {
            mean += waveforms.row(r).transpose();
        }
        mean /= n as f64;

        let centered = DMatrix::from_fn(n, d, |r, c| waveforms[(r, c)] - mean[c]);
        let svd = centered.svd(true, true);
        let u = svd.u.expect("left singular vectors were requested");
        let v_t = svd.v_t.expect("right singular vectors were requested");
        let values = svd.singular_values;
        let m = values.len();

        // Order components by descending singular value; the decomposition
        // itself does not guarantee it.
        let mut order: Vec<usize> = (0..m).collect();
        order.sort_by(|&a, &b| {
            values[b]
                .partial_cmp(&values[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let singular_values = DVector::from_iterator(m, order.iter().map(|&j| values[j]));
        let basis = DMatrix::from_fn(d, m, |r, c| v_t[(order[c], r)]);
        let scores = DMatrix::from_fn(n, m, |r, c| u[(r, order[c])] * values[order[c]]);

        let total: f64 = singular_values.iter().map(|s| s * s).sum();
        let mut rank = m;
        if total > 0.0 {
            let mut cumulative = 0.0;
            for j in 0..m {
                cumulative += singular_values[j] * singular_values[j];
                if cumulative / total > VARIANCE_FRACTION {
                    rank = j + 1;
                    break;
                }
            }
        } else {
            // All waveforms identical; keep a single degenerate component.
            rank = 1;
        }

        Ok(Self {
            mean,
            basis,
            singular_values,
            scores,
            rank,
        })
    }

    /// Minimal rank whose cumulative squared singular values exceed 95% of the
    /// total.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn n_components(&self) -> usize {
        self.basis.ncols()
    }

    pub fn singular_values(&self) -> &DVector<f64> {
        &self.singular_values
    }

    /// Training scores truncated at the selected rank: the feature vectors fed
    /// to clustering, one row per event.
    pub fn features(&self) -> DMatrix<f64> {
        self.scores.columns(0, self.rank).into_owned()
    }

    /// Project a raw flattened waveform into the selected feature space.
    pub fn project(&self, flat: &DVector<f64>) -> DVector<f64> {
        self.project_rank(flat, self.rank)
    }

    /// Project at an explicit rank, up to the full component count.
    pub fn project_rank(&self, flat: &DVector<f64>, rank: usize) -> DVector<f64> {
        let r = rank.min(self.n_components());
        self.basis.columns(0, r).transpose() * (flat - &self.mean)
    }

    /// Invert a score vector back into waveform space at its own rank.
    pub fn reconstruct(&self, scores: &DVector<f64>) -> DVector<f64> {
        let r = scores.len().min(self.n_components());
        self.basis.columns(0, r) * scores.rows(0, r) + &self.mean
    }
}
