use thiserror::Error;

/// Errors surfaced by the sorting pipeline. Floating-point edge cases inside a
/// stage (near-zero negative squared distances) are corrected locally and never
/// reach this type.
#[derive(Debug, Error)]
pub enum SortError {
    #[error("unknown detection method `{0}` (expected `auto`, `manual` or `mad`)")]
    UnknownDetectionMethod(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("no input supplied to the {0} stage")]
    MissingInput(&'static str),

    #[error("cluster {cluster} has {size} member(s); self-energy needs at least two")]
    SingletonCluster { cluster: usize, size: usize },

    #[error(
        "trial {trial}, channel {channel}: zero variance makes `{method}` thresholding meaningless"
    )]
    NumericDegeneracy {
        trial: usize,
        channel: usize,
        method: String,
    },
}

pub type Result<T> = std::result::Result<T, SortError>;
