//! DeviceDetect Data Set Compiler
//!
//! This crate compiles a declarative data set source (components,
//! properties, profiles, training strings and hash graphs) into the DDS1
//! binary format read by `dd-core`.

pub mod builder;
pub mod source;

pub use builder::{build_data_set, BuildOptions};
pub use source::DataSetSource;

use dd_core::DataSetError;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Invalid source JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown {kind} '{name}'")]
    Unknown { kind: &'static str, name: String },
    #[error("Invalid source: {0}")]
    InvalidSource(String),
    #[error("No collision free hash table for a graph node of {0} substrings")]
    NoPerfectHash(usize),
    #[error("Source has neither pattern entries nor graphs")]
    NoEngine,
    #[error("Too large for the data set format: {0}")]
    TooLarge(String),
    #[error("Reading back the node tree failed: {0}")]
    DataSet(#[from] DataSetError),
}

/// Compile a JSON data set source.
pub fn compile_json(json: &str, options: &BuildOptions) -> Result<Vec<u8>, CompileError> {
    let source = DataSetSource::from_json(json)?;
    build_data_set(&source, options)
}
