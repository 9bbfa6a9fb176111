use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::DetectionConfig;
use crate::error::{Result, SortError};

// -----------------------------------------------------------------------------
// EVENT DETECTION AND WAVEFORM EXTRACTION
// -----------------------------------------------------------------------------

/// Equal-length noise windows sampled per trial for the background covariance.
const NOISE_WINDOWS_PER_TRIAL: usize = 100;

/// One recording trial: a voltage matrix with samples as rows and channels as
/// columns.
#[derive(Debug, Clone)]
pub struct Trial {
    pub data: DMatrix<f64>,
    pub sampling_rate_hz: f64,
}

impl Trial {
    pub fn new(data: DMatrix<f64>, sampling_rate_hz: f64) -> Self {
        Self {
            data,
            sampling_rate_hz,
        }
    }

    pub fn n_samples(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_channels(&self) -> usize {
        self.data.ncols()
    }

    pub fn duration_s(&self) -> f64 {
        self.n_samples() as f64 / self.sampling_rate_hz
    }
}

/// A detected spike. Immutable once created; downstream stages only read it.
#[derive(Debug, Clone)]
pub struct SpikeEvent {
    /// Detection time within the trial, in seconds.
    pub time_s: f64,
    /// Index of the trial this event was detected in.
    pub trial: usize,
    /// Extracted snippet, window samples x channels.
    pub waveform: DMatrix<f64>,
    /// Detection time on the continuous cross-trial timeline.
    pub unwrapped_time_s: f64,
    /// Channel with the largest threshold-normalized negative excursion.
    pub origin_channel: usize,
}

/// Flatten a [samples x channels] window channel-major, each channel's samples
/// contiguous. The reducer and the noise covariance share this layout.
pub(crate) fn flatten_window(window: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_column_slice(window.as_slice())
}

/// Threshold-crossing detector for a sorting session.
///
/// The per-channel threshold is estimated from the first trial and frozen;
/// every appended trial reuses it verbatim.
pub struct WaveformExtractor {
    config: DetectionConfig,
    thresholds: Option<Vec<f64>>,
    n_channels: Option<usize>,
    trials_seen: usize,
    elapsed_s: f64,
    events: Vec<SpikeEvent>,
    noise_windows: Vec<DVector<f64>>,
    noise_rng: StdRng,
}

impl WaveformExtractor {
    pub fn new(config: DetectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            thresholds: None,
            n_channels: None,
            trials_seen: 0,
            elapsed_s: 0.0,
            events: Vec::new(),
            noise_windows: Vec::new(),
            noise_rng: StdRng::from_entropy(),
        })
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// The frozen per-channel thresholds, once the first trial has been seen.
    pub fn thresholds(&self) -> Option<&[f64]> {
        self.thresholds.as_deref()
    }

    pub fn events(&self) -> &[SpikeEvent] {
        &self.events
    }

    pub fn n_events(&self) -> usize {
        self.events.len()
    }

    pub fn trials_seen(&self) -> usize {
        self.trials_seen
    }

    /// Detect spikes in a trial and append them to the session.
    ///
    /// Returns the number of events extracted from this trial. A trial shorter
    /// than the extraction window contributes zero events, which is valid.
    pub fn detect(&mut self, trial: &Trial) -> Result<usize> {
        if (trial.sampling_rate_hz - self.config.sampling_rate_hz).abs() > f64::EPSILON {
            return Err(SortError::InvalidConfiguration(format!(
                "trial {} sampled at {} Hz but the session is configured for {} Hz",
                self.trials_seen, trial.sampling_rate_hz, self.config.sampling_rate_hz
            )));
        }
        match self.n_channels {
            None => self.n_channels = Some(trial.n_channels()),
            Some(c) if c != trial.n_channels() => {
                return Err(SortError::InvalidConfiguration(format!(
                    "trial {} has {} channels, session started with {}",
                    self.trials_seen,
                    trial.n_channels(),
                    c
                )))
            }
            Some(_) => {}
        }

        // Locked on first use, reused verbatim for appended trials.
        let thresholds = match &self.thresholds {
            Some(t) => t.clone(),
            None => {
                let t = self.estimate_thresholds(trial)?;
                self.thresholds = Some(t.clone());
                t
            }
        };

        let candidates = self.candidate_samples(trial, &thresholds);
        let kept = self.shadow_suppress(&candidates);

        let window = self.config.window_samples();
        let before = self.config.samples_before();
        let after = window - before;
        let n = trial.n_samples();
        let trial_id = self.trials_seen;

        let mut extracted = 0;
        for &i in &kept {
            // Too close to a trial boundary to fit the window.
            if i < before || i + after > n {
                continue;
            }
            let waveform = trial.data.rows(i - before, window).into_owned();
            let time_s = i as f64 / self.config.sampling_rate_hz;
            let origin_channel = self.origin_channel(trial, &thresholds, i);
            self.events.push(SpikeEvent {
                time_s,
                trial: trial_id,
                waveform,
                unwrapped_time_s: time_s + self.elapsed_s,
                origin_channel,
            });
            extracted += 1;
        }

        self.sample_noise_windows(trial);
        self.elapsed_s += trial.duration_s() + self.config.inter_trial_gap_s;
        self.trials_seen += 1;
        Ok(extracted)
    }

    fn estimate_thresholds(&self, trial: &Trial) -> Result<Vec<f64>> {
        let channels = trial.n_channels();
        match self.config.method.as_str() {
            "manual" => {
                let values = self
                    .config
                    .manual_thresholds
                    .clone()
                    .ok_or_else(|| {
                        SortError::InvalidConfiguration(
                            "method `manual` requires manual_thresholds".to_string(),
                        )
                    })?;
                if values.len() != channels {
                    return Err(SortError::InvalidConfiguration(format!(
                        "{} manual thresholds supplied for {} channels",
                        values.len(),
                        channels
                    )));
                }
                Ok(values)
            }
            "auto" => (0..channels)
                .map(|c| {
                    let column: Vec<f64> = trial.data.column(c).iter().copied().collect();
                    self.scaled_threshold(std_dev(&column), c)
                })
                .collect(),
            "mad" => (0..channels)
                .map(|c| {
                    let column: Vec<f64> = trial.data.column(c).iter().copied().collect();
                    self.scaled_threshold(mad(&column) / 0.6745, c)
                })
                .collect(),
            other => Err(SortError::UnknownDetectionMethod(other.to_string())),
        }
    }

    fn scaled_threshold(&self, estimate: f64, channel: usize) -> Result<f64> {
        if !estimate.is_finite() || estimate == 0.0 {
            return Err(SortError::NumericDegeneracy {
                trial: self.trials_seen,
                channel,
                method: self.config.method.clone(),
            });
        }
        Ok(-self.config.thresh * estimate)
    }

    /// Samples with a nonzero downward-crossing count summed across channels,
    /// in ascending order.
    fn candidate_samples(&self, trial: &Trial, thresholds: &[f64]) -> Vec<usize> {
        let n = trial.n_samples();
        if n < 2 {
            return Vec::new();
        }
        let mut crossings = vec![0u32; n];
        for c in 0..trial.n_channels() {
            let column = trial.data.column(c);
            let thr = thresholds[c];
            for i in 0..n - 1 {
                if column[i] > thr && column[i + 1] <= thr {
                    crossings[i] += 1;
                }
            }
        }
        (0..n).filter(|&i| crossings[i] > 0).collect()
    }

    /// Drop any candidate closer than the shadow period to the previously kept
    /// one.
    fn shadow_suppress(&self, candidates: &[usize]) -> Vec<usize> {
        let shadow = self.config.shadow_samples();
        let mut kept = Vec::with_capacity(candidates.len());
        let mut last: Option<usize> = None;
        for &i in candidates {
            if let Some(l) = last {
                if i - l < shadow {
                    continue;
                }
            }
            kept.push(i);
            last = Some(i);
        }
        kept
    }

    /// Within the jitter window after the crossing, the channel whose deepest
    /// excursion is largest relative to its own threshold.
    fn origin_channel(&self, trial: &Trial, thresholds: &[f64], i: usize) -> usize {
        let end = (i + self.config.jitter_samples()).min(trial.n_samples());
        let mut best_channel = 0;
        let mut best_score = f64::NEG_INFINITY;
        for c in 0..trial.n_channels() {
            let column = trial.data.column(c);
            let mut deepest = f64::INFINITY;
            for s in i..end {
                deepest = deepest.min(column[s]);
            }
            // Thresholds are negative, so deeper excursions score higher.
            let score = deepest / thresholds[c];
            if score > best_score {
                best_score = score;
                best_channel = c;
            }
        }
        best_channel
    }

    fn sample_noise_windows(&mut self, trial: &Trial) {
        let window = self.config.window_samples();
        let n = trial.n_samples();
        if n < window {
            return;
        }
        for _ in 0..NOISE_WINDOWS_PER_TRIAL {
            let start = self.noise_rng.gen_range(0..=n - window);
            let snippet = trial.data.rows(start, window).into_owned();
            self.noise_windows.push(flatten_window(&snippet));
        }
    }

    /// Covariance of randomly sampled background windows, flattened the same
    /// way as event waveforms.
    pub fn noise_covariance(&self) -> Result<DMatrix<f64>> {
        let m = self.noise_windows.len();
        if m < 2 {
            return Err(SortError::MissingInput("noise covariance"));
        }
        let d = self.noise_windows[0].len();
        let mut mean = DVector::zeros(d);
        for w in &self.noise_windows {
            mean += w;
        }
        mean /= m as f64;

        let mut cov = DMatrix::zeros(d, d);
        for w in &self.noise_windows {
            let centered = w - &mean;
            cov += &centered * centered.transpose();
        }
        cov /= (m - 1) as f64;
        Ok(cov)
    }

    /// All extracted waveforms flattened into an event x (samples * channels)
    /// matrix for the reducer.
    pub fn waveform_matrix(&self) -> Result<DMatrix<f64>> {
        if self.events.is_empty() {
            return Err(SortError::MissingInput("dimensionality reduction"));
        }
        let d = self.config.window_samples() * self.n_channels.unwrap_or(1);
        let mut matrix = DMatrix::zeros(self.events.len(), d);
        for (r, event) in self.events.iter().enumerate() {
            let flat = flatten_window(&event.waveform);
            matrix.row_mut(r).copy_from(&flat.transpose());
        }
        Ok(matrix)
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    var.sqrt()
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

fn mad(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut copy = values.to_vec();
    let med = median(&mut copy);
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    median(&mut deviations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::{Distribution, Normal};

    fn test_config(sampling_rate_hz: f64) -> DetectionConfig {
        DetectionConfig {
            method: "auto".to_string(),
            thresh: 4.0,
            manual_thresholds: None,
            window_size_ms: 20.0,
            cross_time_ms: 5.0,
            shadow_ms: 10.0,
            max_jitter_ms: 3.0,
            sampling_rate_hz,
            inter_trial_gap_s: 1.0,
        }
    }

    fn pulse_trial(seed: u64) -> Trial {
        let n = 2000;
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut samples: Vec<f64> = (0..n).map(|_| normal.sample(&mut rng)).collect();
        for &p in &[100usize, 500, 900, 1300, 1700] {
            samples[p] = -50.0;
        }
        Trial::new(DMatrix::from_row_iterator(n, 1, samples), 1000.0)
    }

    #[test]
    fn test_five_pulses_detected() {
        let mut extractor = WaveformExtractor::new(test_config(1000.0)).unwrap();
        let detected = extractor.detect(&pulse_trial(7)).unwrap();
        assert_eq!(detected, 5);

        let expected = [100.0, 500.0, 900.0, 1300.0, 1700.0];
        for (event, target) in extractor.events().iter().zip(expected.iter()) {
            let sample = event.time_s * 1000.0;
            assert!(
                (sample - target).abs() <= 1.0,
                "detection at sample {} too far from {}",
                sample,
                target
            );
        }
    }

    #[test]
    fn test_shadow_spacing_holds() {
        // A dense noise signal with a low manual threshold produces many
        // crossings; after suppression no two survivors may be closer than the
        // shadow period.
        let n = 5000;
        let mut rng = StdRng::seed_from_u64(11);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let samples: Vec<f64> = (0..n).map(|_| normal.sample(&mut rng)).collect();
        let trial = Trial::new(DMatrix::from_row_iterator(n, 1, samples), 1000.0);

        let mut config = test_config(1000.0);
        config.method = "manual".to_string();
        config.manual_thresholds = Some(vec![-1.0]);

        let mut extractor = WaveformExtractor::new(config.clone()).unwrap();
        extractor.detect(&trial).unwrap();
        assert!(extractor.n_events() > 1);

        let shadow = config.shadow_samples();
        let samples: Vec<i64> = extractor
            .events()
            .iter()
            .map(|e| (e.time_s * 1000.0).round() as i64)
            .collect();
        for pair in samples.windows(2) {
            assert!(
                pair[1] - pair[0] >= shadow as i64,
                "events at {} and {} violate the {}-sample shadow",
                pair[0],
                pair[1],
                shadow
            );
        }
    }

    #[test]
    fn test_threshold_frozen_across_appends() {
        let trial = pulse_trial(7);
        let mut extractor = WaveformExtractor::new(test_config(1000.0)).unwrap();
        extractor.detect(&trial).unwrap();
        let first: Vec<u64> = extractor
            .thresholds()
            .unwrap()
            .iter()
            .map(|t| t.to_bits())
            .collect();

        // Appending the same trial again must reuse the array bit-for-bit, not
        // re-estimate from the concatenated data.
        extractor.detect(&trial).unwrap();
        let second: Vec<u64> = extractor
            .thresholds()
            .unwrap()
            .iter()
            .map(|t| t.to_bits())
            .collect();
        assert_eq!(first, second);
        assert_eq!(extractor.n_events(), 10);
    }

    #[test]
    fn test_zero_variance_trial_is_degenerate() {
        let trial = Trial::new(DMatrix::zeros(500, 1), 1000.0);
        let mut extractor = WaveformExtractor::new(test_config(1000.0)).unwrap();
        assert!(matches!(
            extractor.detect(&trial),
            Err(SortError::NumericDegeneracy { trial: 0, .. })
        ));
    }

    #[test]
    fn test_short_trial_yields_zero_events() {
        let mut rng = StdRng::seed_from_u64(3);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let samples: Vec<f64> = (0..5).map(|_| normal.sample(&mut rng)).collect();
        let trial = Trial::new(DMatrix::from_row_iterator(5, 1, samples), 1000.0);

        let mut extractor = WaveformExtractor::new(test_config(1000.0)).unwrap();
        assert_eq!(extractor.detect(&trial).unwrap(), 0);
    }

    #[test]
    fn test_mad_threshold_value() {
        // Alternating +/-1 has MAD 1, so the estimate is 1/0.6745.
        let samples: Vec<f64> = (0..1000).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let trial = Trial::new(DMatrix::from_row_iterator(1000, 1, samples), 1000.0);

        let mut config = test_config(1000.0);
        config.method = "mad".to_string();
        let mut extractor = WaveformExtractor::new(config).unwrap();
        extractor.detect(&trial).unwrap();

        let expected = -4.0 / 0.6745;
        let got = extractor.thresholds().unwrap()[0];
        assert!((got - expected).abs() < 1e-12);
    }

    #[test]
    fn test_origin_channel_attribution() {
        let n = 600;
        let mut rng = StdRng::seed_from_u64(21);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut samples: Vec<f64> = (0..n * 2).map(|_| normal.sample(&mut rng)).collect();
        // Row-major layout: sample i, channel c at index i * 2 + c. The pulse
        // is much deeper on channel 1.
        samples[300 * 2] = -15.0;
        samples[300 * 2 + 1] = -60.0;
        let trial = Trial::new(DMatrix::from_row_iterator(n, 2, samples), 1000.0);

        let mut extractor = WaveformExtractor::new(test_config(1000.0)).unwrap();
        assert!(extractor.detect(&trial).unwrap() >= 1);
        let event = extractor
            .events()
            .iter()
            .min_by(|a, b| {
                let da = (a.time_s * 1000.0 - 300.0).abs();
                let db = (b.time_s * 1000.0 - 300.0).abs();
                da.partial_cmp(&db).unwrap()
            })
            .unwrap();
        assert_eq!(event.origin_channel, 1);
    }

    #[test]
    fn test_unwrapped_time_spans_trials() {
        let trial = pulse_trial(7);
        let duration = trial.duration_s();
        let mut extractor = WaveformExtractor::new(test_config(1000.0)).unwrap();
        extractor.detect(&trial).unwrap();
        extractor.detect(&trial).unwrap();

        let first = &extractor.events()[0];
        let again = &extractor.events()[5];
        assert_eq!(first.trial, 0);
        assert_eq!(again.trial, 1);
        assert!((again.unwrapped_time_s - (again.time_s + duration + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_noise_covariance_shape() {
        let trial = pulse_trial(7);
        let mut extractor = WaveformExtractor::new(test_config(1000.0)).unwrap();
        extractor.detect(&trial).unwrap();

        let cov = extractor.noise_covariance().unwrap();
        let d = extractor.config().window_samples();
        assert_eq!(cov.nrows(), d);
        assert_eq!(cov.ncols(), d);
        // Diagonal of a covariance matrix is non-negative.
        for i in 0..d {
            assert!(cov[(i, i)] >= 0.0);
        }
    }

    #[test]
    fn test_waveform_matrix_layout() {
        let trial = pulse_trial(7);
        let mut extractor = WaveformExtractor::new(test_config(1000.0)).unwrap();
        extractor.detect(&trial).unwrap();

        let matrix = extractor.waveform_matrix().unwrap();
        assert_eq!(matrix.nrows(), 5);
        assert_eq!(matrix.ncols(), extractor.config().window_samples());

        // The crossing sample sits `samples_before` into the window and holds
        // the pulse trough.
        let before = extractor.config().samples_before();
        assert!(matrix[(0, before + 1)] < -40.0);
    }
}
