//! Writers for finalized flow records.

pub mod csv;
pub mod jsonl;

use clap::ValueEnum;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::{ExportError, Result};
use crate::processor::FlowRecord;

pub use self::csv::{format_float, format_timestamp, write_csv};
pub use self::jsonl::write_jsonl;

/// Output file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExportFormat {
    /// Comma-separated values with a fixed header
    #[default]
    Csv,
    /// JSON Lines (one JSON object per flow)
    Jsonl,
}

impl ExportFormat {
    /// Infer export format from file extension.
    pub fn from_extension(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .and_then(|ext| match ext.as_str() {
                "csv" => Some(ExportFormat::Csv),
                "json" | "jsonl" | "ndjson" => Some(ExportFormat::Jsonl),
                _ => None,
            })
    }
}

pub fn write_records<W: Write>(writer: W, format: ExportFormat, records: &[FlowRecord]) -> Result<()> {
    match format {
        ExportFormat::Csv => write_csv(writer, records),
        ExportFormat::Jsonl => write_jsonl(writer, records),
    }
}

pub fn export_to_path<P: AsRef<Path>>(path: P, format: ExportFormat, records: &[FlowRecord]) -> Result<()> {
    let file = File::create(path.as_ref()).map_err(ExportError::from)?;
    write_records(file, format, records)
}
