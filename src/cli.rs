//! Command-line argument definitions.

use clap::Parser;
use std::path::PathBuf;

use crate::config::MeterConfig;
use crate::error::Result;
use crate::export::ExportFormat;
use crate::processor::SampleStorage;

/// Extract bidirectional flow features from a packet capture.
#[derive(Parser, Debug)]
#[command(name = "flowmeter")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// pcap or pcapng file to read
    #[arg(value_name = "PCAP")]
    pub pcap: PathBuf,

    /// Write records here instead of stdout
    #[arg(short = 'o', long = "output", value_name = "OUTPUT_FILE")]
    pub output: Option<PathBuf>,

    /// Output format (inferred from extension if not specified)
    #[arg(long = "format", value_enum, value_name = "FORMAT")]
    pub format: Option<ExportFormat>,

    /// TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Inactivity timeout in seconds
    #[arg(long = "timeout", value_name = "SECONDS")]
    pub timeout: Option<f64>,

    /// Packets per worker chunk
    #[arg(long = "chunk-size", value_name = "PACKETS")]
    pub chunk_size: Option<usize>,

    /// Active flows held in memory before spilling to disk
    #[arg(long = "max-flows", value_name = "FLOWS")]
    pub max_flows: Option<usize>,

    /// Worker threads (0 = one per core, 1 = sequential)
    #[arg(short = 'j', long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Keep every sample instead of running moments
    #[arg(long = "full-samples")]
    pub full_samples: bool,

    /// Close TCP flows on the first FIN or RST instead of waiting for the timeout
    #[arg(long = "terminate-on-fin")]
    pub terminate_on_fin: bool,

    /// Directory for spill files
    #[arg(long = "spill-dir", value_name = "DIR")]
    pub spill_dir: Option<PathBuf>,

    /// Run the NTP amplification check over the results
    #[arg(long = "detect")]
    pub detect: bool,

    /// Hide the progress line
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Config file (or defaults) with command-line overrides applied on top.
    pub fn meter_config(&self) -> Result<MeterConfig> {
        let mut config = match &self.config {
            Some(path) => MeterConfig::from_file(path)?,
            None => MeterConfig::default(),
        };

        if let Some(timeout) = self.timeout {
            config.inactivity_timeout_secs = timeout;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size_packets = chunk_size;
        }
        if let Some(max_flows) = self.max_flows {
            config.max_active_flows = max_flows;
        }
        if let Some(workers) = self.workers {
            config.parallel_workers = workers;
        }
        if self.full_samples {
            config.storage = SampleStorage::Full;
        }
        if self.terminate_on_fin {
            config.terminate_on_fin_rst = true;
        }
        if let Some(dir) = &self.spill_dir {
            config.spill_dir = Some(dir.clone());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn export_format(&self) -> ExportFormat {
        self.format
            .or_else(|| self.output.as_deref().and_then(ExportFormat::from_extension))
            .unwrap_or_default()
    }

    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_overrides_apply_on_defaults() {
        let args = Args::parse_from([
            "flowmeter",
            "capture.pcap",
            "--timeout",
            "15",
            "--workers",
            "1",
            "--full-samples",
            "--terminate-on-fin",
        ]);
        let config = args.meter_config().unwrap();
        assert_eq!(config.inactivity_timeout_secs, 15.0);
        assert_eq!(config.parallel_workers, 1);
        assert_eq!(config.storage, SampleStorage::Full);
        assert!(config.terminate_on_fin_rst);
        assert_eq!(config.chunk_size_packets, MeterConfig::default().chunk_size_packets);
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "inactivity_timeout_secs = 30.0\nchunk_size_packets = 500").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = Args::parse_from(["flowmeter", "x.pcap", "--config", path.as_str(), "--chunk-size", "2000"]);
        let config = args.meter_config().unwrap();
        assert_eq!(config.inactivity_timeout_secs, 30.0);
        assert_eq!(config.chunk_size_packets, 2000);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = Args::parse_from(["flowmeter", "x.pcap", "--timeout", "0"]);
        assert!(args.meter_config().is_err());
    }

    #[test]
    fn test_format_inference() {
        let args = Args::parse_from(["flowmeter", "x.pcap", "-o", "flows.jsonl"]);
        assert_eq!(args.export_format(), ExportFormat::Jsonl);
        let args = Args::parse_from(["flowmeter", "x.pcap", "-o", "flows.jsonl", "--format", "csv"]);
        assert_eq!(args.export_format(), ExportFormat::Csv);
        let args = Args::parse_from(["flowmeter", "x.pcap"]);
        assert_eq!(args.export_format(), ExportFormat::Csv);
    }
}
