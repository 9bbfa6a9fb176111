// src/config/mod.rs
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Result, SortError};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub detection: DetectionConfig,
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub enable_debug_logging: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection: DetectionConfig::default(),
            clustering: ClusteringConfig::default(),
            verbose: false,
            enable_debug_logging: false,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.detection.validate()?;
        self.clustering.validate()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfig {
    /// Noise estimator: "auto" (standard deviation), "mad"
    /// (median absolute deviation / 0.6745) or "manual" (explicit per-channel
    /// thresholds).
    pub method: String,
    /// Threshold multiplier for auto/mad; the threshold is -thresh * estimate.
    pub thresh: f64,
    /// Per-channel thresholds, required when method = "manual". Downward
    /// crossings, so each value must be negative.
    #[serde(default)]
    pub manual_thresholds: Option<Vec<f64>>,
    /// Extraction window length around a crossing.
    pub window_size_ms: f64,
    /// Portion of the window placed before the crossing sample.
    pub cross_time_ms: f64,
    /// Minimum enforced spacing between consecutive detections.
    pub shadow_ms: f64,
    /// Span after the crossing searched for the deepest excursion when
    /// attributing the origin channel.
    pub max_jitter_ms: f64,
    pub sampling_rate_hz: f64,
    /// Spacing inserted between trials on the unwrapped timeline.
    #[serde(default = "default_inter_trial_gap_s")]
    pub inter_trial_gap_s: f64,
}

fn default_inter_trial_gap_s() -> f64 {
    1.0
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            method: "auto".to_string(),
            thresh: 3.9,
            manual_thresholds: None,
            window_size_ms: 1.5,
            cross_time_ms: 0.6,
            shadow_ms: 0.75,
            max_jitter_ms: 0.6,
            sampling_rate_hz: 30_000.0,
            inter_trial_gap_s: default_inter_trial_gap_s(),
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<()> {
        match self.method.as_str() {
            "auto" | "mad" => {
                if !(self.thresh > 0.0) {
                    return Err(SortError::InvalidConfiguration(format!(
                        "thresh must be positive, got {}",
                        self.thresh
                    )));
                }
            }
            "manual" => match &self.manual_thresholds {
                None => {
                    return Err(SortError::InvalidConfiguration(
                        "method `manual` requires manual_thresholds".to_string(),
                    ))
                }
                Some(t) => {
                    if t.is_empty() || t.iter().any(|v| !(*v < 0.0)) {
                        return Err(SortError::InvalidConfiguration(
                            "manual_thresholds must be non-empty and strictly negative".to_string(),
                        ));
                    }
                }
            },
            other => return Err(SortError::UnknownDetectionMethod(other.to_string())),
        }

        if !(self.sampling_rate_hz > 0.0) {
            return Err(SortError::InvalidConfiguration(format!(
                "sampling_rate_hz must be positive, got {}",
                self.sampling_rate_hz
            )));
        }
        if self.window_samples() < 2 {
            return Err(SortError::InvalidConfiguration(format!(
                "window_size_ms {} spans fewer than two samples at {} Hz",
                self.window_size_ms, self.sampling_rate_hz
            )));
        }
        if self.cross_time_ms < 0.0 || self.samples_before() >= self.window_samples() {
            return Err(SortError::InvalidConfiguration(format!(
                "cross_time_ms {} does not fit inside window_size_ms {}",
                self.cross_time_ms, self.window_size_ms
            )));
        }
        if self.shadow_ms < 0.0 || self.max_jitter_ms < 0.0 || self.inter_trial_gap_s < 0.0 {
            return Err(SortError::InvalidConfiguration(
                "shadow_ms, max_jitter_ms and inter_trial_gap_s must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    fn ms_to_samples(&self, ms: f64) -> usize {
        (ms * 1e-3 * self.sampling_rate_hz).round() as usize
    }

    pub fn window_samples(&self) -> usize {
        self.ms_to_samples(self.window_size_ms)
    }

    pub fn samples_before(&self) -> usize {
        self.ms_to_samples(self.cross_time_ms)
    }

    pub fn samples_after(&self) -> usize {
        self.window_samples() - self.samples_before()
    }

    pub fn shadow_samples(&self) -> usize {
        self.ms_to_samples(self.shadow_ms)
    }

    pub fn jitter_samples(&self) -> usize {
        self.ms_to_samples(self.max_jitter_ms).max(1)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ClusteringConfig {
    /// Override for the number of division steps; when absent the step count
    /// is derived from the data size and target_cluster_size.
    #[serde(default)]
    pub divisions: Option<u32>,
    /// Independent clustering repetitions; the lowest-MSE run wins.
    pub reps: usize,
    /// Stop iterating once no more than this many vectors changed cluster.
    pub reassign_converge: usize,
    /// Stop iterating once the fractional MSE change drops below this.
    pub mse_converge: f64,
    /// Desired points per minicluster, used to pick the division count.
    pub target_cluster_size: usize,
    /// Base RNG seed for reproducible runs; entropy-seeded when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            divisions: None,
            reps: 3,
            reassign_converge: 0,
            mse_converge: 1e-3,
            target_cluster_size: 75,
            seed: None,
        }
    }
}

impl ClusteringConfig {
    pub fn validate(&self) -> Result<()> {
        if self.reps == 0 {
            return Err(SortError::InvalidConfiguration(
                "reps must be at least 1".to_string(),
            ));
        }
        if self.target_cluster_size == 0 {
            return Err(SortError::InvalidConfiguration(
                "target_cluster_size must be at least 1".to_string(),
            ));
        }
        if !(self.mse_converge >= 0.0) {
            return Err(SortError::InvalidConfiguration(format!(
                "mse_converge must be non-negative, got {}",
                self.mse_converge
            )));
        }
        if self.divisions == Some(0) {
            return Err(SortError::InvalidConfiguration(
                "divisions override must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    let config_str = fs::read_to_string(path)
        .map_err(|e| SortError::InvalidConfiguration(format!("failed to read config file: {}", e)))?;

    let config: PipelineConfig = serde_yaml::from_str(&config_str)
        .map_err(|e| SortError::InvalidConfiguration(format!("failed to parse config file: {}", e)))?;

    config.validate()?;
    Ok(config)
}

pub fn save_config<P: AsRef<Path>>(config: &PipelineConfig, path: P) -> Result<()> {
    let yaml = serde_yaml::to_string(config)
        .map_err(|e| SortError::InvalidConfiguration(format!("failed to serialize config: {}", e)))?;

    fs::write(path, yaml)
        .map_err(|e| SortError::InvalidConfiguration(format!("failed to write config file: {}", e)))
}
