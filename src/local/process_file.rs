use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Instant;

use colored::Colorize;
use nalgebra::DMatrix;

use crate::config::load_config;
use crate::error::SortError;
use crate::processing::extraction::Trial;
use crate::processing::pipeline::SpikeSorter;

fn to_io_error(error: SortError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error.to_string())
}

/// Read one trial from a CSV file: one row per sample, one column per channel,
/// no header.
fn read_trial_csv(path: &str, sampling_rate_hz: f64) -> io::Result<Trial> {
    if !Path::new(path).exists() {
        eprintln!("Error: Trial file not found at path: {}", path);
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "Trial file not found",
        ));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(File::open(path)?);

    let mut samples: Vec<f64> = Vec::new();
    let mut channels = 0usize;
    for record in reader.records() {
        let record = record?;
        if channels == 0 {
            channels = record.len();
        } else if record.len() != channels {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("ragged CSV row: expected {} columns", channels),
            ));
        }
        for field in record.iter() {
            let value: f64 = field.trim().parse().map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("bad sample: {}", e))
            })?;
            samples.push(value);
        }
    }
    if channels == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty trial file"));
    }

    let rows = samples.len() / channels;
    Ok(Trial::new(
        DMatrix::from_row_iterator(rows, channels, samples),
        sampling_rate_hz,
    ))
}

/// Load a config, sort every trial file, print a summary and write the event
/// and cluster tables next to the working directory.
pub fn run(config_path: &str, trial_paths: &[String]) -> io::Result<()> {
    let config = load_config(config_path).map_err(to_io_error)?;
    let sampling_rate_hz = config.detection.sampling_rate_hz;
    let mut sorter = SpikeSorter::new(config).map_err(to_io_error)?;

    for path in trial_paths {
        let trial = read_trial_csv(path, sampling_rate_hz)?;
        let start = Instant::now();
        let extracted = sorter.detect(&trial).map_err(to_io_error)?;
        println!(
            "{} {} -> {} events in {:?}",
            "detected".green(),
            path,
            extracted,
            start.elapsed()
        );
    }

    let start = Instant::now();
    let result = sorter.run().map_err(to_io_error)?;
    println!(
        "{} {} events into {} clusters (rank {}, mse {:.6}) in {:?}",
        "sorted".green().bold(),
        result.assignments.len(),
        result.model.k(),
        result.rank,
        result.model.mse,
        start.elapsed()
    );

    for cluster in 1..=result.model.k() {
        println!(
            "  cluster {:>3}: {:>6} events, self-similarity {:.4}",
            cluster,
            result.model.sizes[cluster - 1],
            result.similarity.normalized(cluster, cluster)
        );
    }

    let mut events = csv::Writer::from_path("events.csv")?;
    events.write_record(["time_s", "unwrapped_time_s", "trial", "cluster", "origin_channel"])?;
    for (event, &cluster) in sorter.events().iter().zip(result.assignments.iter()) {
        events.write_record([
            event.time_s.to_string(),
            event.unwrapped_time_s.to_string(),
            event.trial.to_string(),
            cluster.to_string(),
            event.origin_channel.to_string(),
        ])?;
    }
    events.flush()?;

    let mut clusters = csv::Writer::from_path("clusters.csv")?;
    clusters.write_record(["cluster", "size", "self_similarity"])?;
    for cluster in 1..=result.model.k() {
        clusters.write_record([
            cluster.to_string(),
            result.model.sizes[cluster - 1].to_string(),
            result.similarity.normalized(cluster, cluster).to_string(),
        ])?;
    }
    clusters.flush()?;

    println!("wrote {} and {}", "events.csv".cyan(), "clusters.csv".cyan());
    Ok(())
}
