//! Bidirectional flow feature extraction from packet captures.
//!
//! Packets are grouped into flows by 5-tuple, each flow keeps running
//! statistics while it is active, and every finished flow is turned into a
//! fixed-width [`FlowRecord`] of CICFlowMeter-style features.
//!
//! ```no_run
//! use flowmeter::{FeatureProcessor, MeterConfig};
//!
//! let mut processor = FeatureProcessor::new(MeterConfig::default())?;
//! let report = processor.process_file("capture.pcap")?;
//! println!("{} flows", report.records.len());
//! # Ok::<(), flowmeter::Error>(())
//! ```

pub mod capture;
pub mod cli;
pub mod config;
pub mod detection;
pub mod error;
pub mod export;
pub mod processor;
pub mod types;

pub use config::MeterConfig;
pub use error::{Error, Result};
pub use processor::{CancellationToken, FeatureProcessor, FlowRecord, ProcessingReport, RunStatus};
pub use types::{PacketRecord, ProcessingStats, Progress};
