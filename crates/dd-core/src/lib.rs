//! DeviceDetect Core Library
//!
//! This crate provides the matching engines for DeviceDetect device
//! detection: given request evidence (a User-Agent and/or Client Hint
//! headers) it identifies the device, platform and browser and returns the
//! requested property values.
//!
//! # Architecture
//!
//! Detection runs against a pre-compiled binary data set (DDS format) that
//! holds the property catalog, the profiles and the structures of two
//! engines. The data set is held in memory, memory mapped, or read lazily
//! through a bounded pool of file handles. Requests are synchronous and
//! share one reference-counted data set, which can be swapped out while
//! requests are in flight.
//!
//! # Modules
//!
//! - `hash`: rolling substring hash and CRC32
//! - `dataset`: DDS format, loader and the loaded [`DataSet`]
//! - `collection`: typed record collections over the data set bytes
//! - `evidence`: prefixed request evidence
//! - `pattern`: node tree / signature matching engine
//! - `graph`: perfect-hash graph matching engine
//! - `overrides`: profile and property overrides from evidence
//! - `results`: per-request results and property values
//! - `detector`: data set manager with hot reload
//! - `config`: detection configuration
//! - `types`: shared type definitions

pub mod collection;
pub mod config;
pub mod dataset;
pub mod detector;
pub mod evidence;
pub mod graph;
pub mod hash;
pub mod overrides;
pub mod pattern;
mod process;
pub mod results;
pub mod types;

// Re-export commonly used types
pub use config::{DetectionConfig, EngineKind, LoadMode};
pub use dataset::{ActiveEngine, DataSet, DataSetError};
pub use detector::DeviceDetector;
pub use evidence::{Evidence, EvidencePrefix};
pub use results::{DetectionResult, NoValueReason, Results};
pub use types::{GraphKind, MatchMethod, PropertyFlags, SignatureFlags};
