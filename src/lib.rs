pub mod config;
pub mod error;
pub mod local;
pub mod processing;
pub mod utils;

#[cfg(feature = "python")]
pub mod bindings;

pub use error::{Result, SortError};
