//! Error types for the flow meter.
//!
//! - [`enum@Error`] - Main error enum returned by every fallible operation
//! - [`CaptureError`] - Errors from opening or parsing a capture file
//! - [`SpillError`] - Errors from the on-disk spill store
//! - [`ConfigError`] - Errors from loading or validating configuration
//! - [`ExportError`] - Errors from writing flow records out
//!
//! Per-packet decoding problems are never errors; they are counted as skips.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for flow meter operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Error reading or parsing the capture file
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Error writing or reading spilled flow batches
    #[error("Spill error: {0}")]
    Spill(#[from] SpillError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Records could not be written
    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    /// A parallel worker died before handing back its partial table
    #[error("Worker {worker} panicked")]
    WorkerPanicked { worker: String },

    /// The worker pool could not be started
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Errors related to capture file reading.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// File not found
    #[error("File not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    /// Neither a pcap nor a pcapng file
    #[error("Invalid capture format: {reason}")]
    InvalidFormat { reason: String },

    /// The file framing broke in the middle of the capture
    #[error("Malformed capture at frame {frame}: {reason}")]
    Malformed { frame: u64, reason: String },

    /// Unsupported link type
    #[error("Unsupported link type: {link_type}")]
    UnsupportedLinkType { link_type: i32 },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to the spill store.
#[derive(Error, Debug)]
pub enum SpillError {
    /// Disk full, permissions, vanished temp dir
    #[error("I/O failure at packet {packet_index}: {source}")]
    Io {
        packet_index: u64,
        #[source]
        source: std::io::Error,
    },

    /// Batch could not be encoded or decoded
    #[error("Batch {batch} could not be serialized: {source}")]
    Encoding {
        batch: u64,
        #[source]
        source: bincode::Error,
    },
}

/// Errors related to configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("Cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors related to writing records.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
