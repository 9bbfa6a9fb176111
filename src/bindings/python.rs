use nalgebra::DMatrix;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::config::{load_config, PipelineConfig};
use crate::error::SortError;
use crate::processing::extraction::Trial;
use crate::processing::pipeline::SpikeSorter;

fn to_py_err(error: SortError) -> PyErr {
    PyValueError::new_err(error.to_string())
}

#[pyclass]
pub struct PySpikeSorter {
    sorter: SpikeSorter,
}

#[pymethods]
impl PySpikeSorter {
    /// Build a sorter from a YAML config file, or from defaults when no path
    /// is given.
    #[new]
    #[pyo3(signature = (config_path=None))]
    pub fn new(config_path: Option<String>) -> PyResult<Self> {
        let config = match config_path {
            Some(path) => load_config(path).map_err(to_py_err)?,
            None => PipelineConfig::default(),
        };
        Ok(Self {
            sorter: SpikeSorter::new(config).map_err(to_py_err)?,
        })
    }

    /// Detect spikes in one trial: rows are samples, columns are channels.
    /// Returns the number of events extracted.
    pub fn detect(&mut self, data: Vec<Vec<f64>>, sampling_rate_hz: f64) -> PyResult<usize> {
        let rows = data.len();
        let channels = data.first().map(|r| r.len()).unwrap_or(0);
        if data.iter().any(|r| r.len() != channels) {
            return Err(PyValueError::new_err("ragged trial: rows differ in length"));
        }
        let trial = Trial::new(
            DMatrix::from_fn(rows, channels, |r, c| data[r][c]),
            sampling_rate_hz,
        );
        self.sorter.detect(&trial).map_err(to_py_err)
    }

    /// The session-frozen per-channel thresholds, once a trial has been seen.
    pub fn thresholds(&self) -> Option<Vec<f64>> {
        self.sorter.thresholds().map(|t| t.to_vec())
    }

    /// Run reduce -> cluster -> aggregate over everything detected so far.
    /// Returns (assignments, unwrapped_times, cluster_count).
    pub fn run(&self) -> PyResult<(Vec<usize>, Vec<f64>, usize)> {
        let result = self.sorter.run().map_err(to_py_err)?;
        let times: Vec<f64> = self
            .sorter
            .events()
            .iter()
            .map(|e| e.unwrapped_time_s)
            .collect();
        Ok((result.assignments, times, result.model.k()))
    }
}

/// A Python module implemented in Rust.
#[pymodule]
pub fn spikesort(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PySpikeSorter>()?;
    Ok(())
}
