use nalgebra::DMatrix;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::processing::clustering::{ClusterModel, DivisiveKMeans};
use crate::processing::extraction::{SpikeEvent, Trial, WaveformExtractor};
use crate::processing::features::WaveformBasis;
use crate::processing::similarity::SimilarityMatrix;
use crate::utils::log::log_to_file;

// -----------------------------------------------------------------------------
// SORTING PIPELINE
// -----------------------------------------------------------------------------

/// Batch spike-sorting session: detect on appended trials, then run
/// reduce -> cluster -> aggregate over everything seen so far.
///
/// The extractor owns the session-frozen detection threshold; appending trials
/// through `&mut self` serializes that first write.
pub struct SpikeSorter {
    extractor: WaveformExtractor,
    clusterer: DivisiveKMeans,
    config: PipelineConfig,
}

/// Output of one full pipeline run.
pub struct SortResult {
    /// Per-event cluster ids 1..=K, in relabeled order.
    pub assignments: Vec<usize>,
    /// Rank selected by the dimensionality reducer.
    pub rank: usize,
    /// Clustering output with labels, sizes and centroids remapped through the
    /// relabeling permutation. The scatter matrices are permutation-invariant.
    pub model: ClusterModel,
    pub similarity: SimilarityMatrix,
    /// Old-to-new cluster id mapping produced by the relabeling pass.
    pub relabeling: Vec<usize>,
}

impl SpikeSorter {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            extractor: WaveformExtractor::new(config.detection.clone())?,
            clusterer: DivisiveKMeans::new(config.clustering.clone())?,
            config,
        })
    }

    /// Detect spikes in a trial and append them to the session.
    pub fn detect(&mut self, trial: &Trial) -> Result<usize> {
        let trial_id = self.extractor.trials_seen();
        let extracted = self.extractor.detect(trial)?;

        if self.config.verbose {
            println!(
                "trial {}: {} events ({} total)",
                trial_id,
                extracted,
                self.extractor.n_events()
            );
        }
        if self.config.enable_debug_logging {
            let message = format!(
                "trial: {}, events: {}, total_events: {}",
                trial_id,
                extracted,
                self.extractor.n_events()
            );
            log_to_file("spikesort.log", &message).expect("Failed to write to log file");
        }
        Ok(extracted)
    }

    pub fn events(&self) -> &[SpikeEvent] {
        self.extractor.events()
    }

    pub fn thresholds(&self) -> Option<&[f64]> {
        self.extractor.thresholds()
    }

    pub fn noise_covariance(&self) -> Result<DMatrix<f64>> {
        self.extractor.noise_covariance()
    }

    /// Run the batch stages over every event seen so far.
    pub fn run(&self) -> Result<SortResult> {
        let waveforms = self.extractor.waveform_matrix()?;

        // Reduce. The basis is refit from scratch on every run; it never
        // updates incrementally as trials are appended.
        let basis = WaveformBasis::fit(&waveforms)?;
        let features = basis.features();
        if self.config.verbose {
            println!(
                "reduced {} waveforms to rank {} of {}",
                waveforms.nrows(),
                basis.rank(),
                basis.n_components()
            );
        }

        // Cluster.
        let model = self.clusterer.fit(&features)?;
        if self.config.verbose {
            println!("clustered into {} miniclusters, mse {:.6}", model.k(), model.mse);
        }

        // Aggregate and relabel.
        let mut similarity = SimilarityMatrix::from_model(&features, &model)?;
        let relabeling = similarity.relabel();

        let assignments: Vec<usize> = model
            .assignments
            .iter()
            .map(|&label| relabeling[label - 1])
            .collect();
        let model = remap_model(model, &relabeling, &assignments);

        Ok(SortResult {
            assignments: assignments.clone(),
            rank: basis.rank(),
            model,
            similarity,
            relabeling,
        })
    }
}

/// Reorder a cluster model's labels, sizes and centroids by the relabeling
/// permutation. W, B and T are sums over all points and stay untouched.
fn remap_model(model: ClusterModel, relabeling: &[usize], assignments: &[usize]) -> ClusterModel {
    let k = model.k();
    let mut sizes = vec![0usize; k];
    let mut centroids = DMatrix::zeros(k, model.centroids.ncols());
    for old in 0..k {
        let new_index = relabeling[old] - 1;
        sizes[new_index] = model.sizes[old];
        centroids
            .row_mut(new_index)
            .copy_from(&model.centroids.row(old));
    }
    ClusterModel {
        assignments: assignments.to_vec(),
        centroids,
        sizes,
        mse: model.mse,
        within: model.within,
        between: model.between,
        total: model.total,
    }
}
