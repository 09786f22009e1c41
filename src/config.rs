//! Configuration for a flow metering run.
//!
//! Every field has a default, so an empty TOML file (or none at all) is a
//! valid configuration. CLI flags are applied on top of whatever was loaded.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::processor::SampleStorage;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeterConfig {
    /// Seconds of silence after which a flow is finalized
    pub inactivity_timeout_secs: f64,

    /// Packets handed to a worker at a time
    pub chunk_size_packets: usize,

    /// Active flows kept in memory before the oldest half is spilled
    pub max_active_flows: usize,

    /// Approximate flow state budget in MiB, 0 disables the check
    pub max_memory_mb: u64,

    /// 0 = one per core, 1 = sequential
    pub parallel_workers: usize,

    /// Running moments or full sample lists
    pub storage: SampleStorage,

    /// Finalize TCP flows on the first FIN or RST instead of waiting for the
    /// timeout. Off by default: a normal teardown would otherwise split into
    /// the closed flow plus one-packet flows for the trailing FIN-ACK and ACK.
    pub terminate_on_fin_rst: bool,

    /// Progress callback and cancellation check granularity, in packets. The
    /// parallel engine reports once per absorbed chunk, so there the effective
    /// granularity is the larger of this and `chunk_size_packets`.
    pub progress_interval_packets: u64,

    /// How often idle flows are swept, in packets
    pub gc_interval_packets: u64,

    /// Where spill files go; the system temp dir when unset
    pub spill_dir: Option<PathBuf>,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 40.0,
            chunk_size_packets: 10_000,
            max_active_flows: 100_000,
            max_memory_mb: 1024,
            parallel_workers: 0,
            storage: SampleStorage::Moments,
            terminate_on_fin_rst: false,
            progress_interval_packets: 1000,
            gc_interval_packets: 1000,
            spill_dir: None,
        }
    }
}

impl MeterConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: MeterConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field, reason: &str| ConfigError::Invalid { field, reason: reason.to_string() };

        if !(self.inactivity_timeout_secs.is_finite() && self.inactivity_timeout_secs > 0.0) {
            return Err(invalid("inactivity_timeout_secs", "must be a positive number of seconds").into());
        }
        if self.chunk_size_packets == 0 {
            return Err(invalid("chunk_size_packets", "must be at least 1").into());
        }
        if self.max_active_flows == 0 {
            return Err(invalid("max_active_flows", "must be at least 1").into());
        }
        if self.progress_interval_packets == 0 {
            return Err(invalid("progress_interval_packets", "must be at least 1").into());
        }
        if self.gc_interval_packets == 0 {
            return Err(invalid("gc_interval_packets", "must be at least 1").into());
        }
        Ok(())
    }

    /// Resolved worker count, never 0.
    pub fn worker_count(&self) -> usize {
        match self.parallel_workers {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }

    pub fn memory_limit_bytes(&self) -> Option<u64> {
        (self.max_memory_mb > 0).then(|| self.max_memory_mb.saturating_mul(1024 * 1024))
    }
}
