use serde::Serialize;
use std::path::Path;
use tracing::info;

use super::engine::{self, RunStatus};
use super::publisher::{CancellationToken, ProgressCallback, ProgressPublisher};
use super::record::FlowRecord;
use super::table::FlowTable;
use crate::capture::{count_packets, CaptureReader};
use crate::config::MeterConfig;
use crate::error::Result;
use crate::types::{PacketRecord, ProcessingStats, Progress};

/// Everything a run produced. A cancelled run still carries every flow built
/// up to the stop point.
#[derive(Debug, Serialize)]
pub struct ProcessingReport {
    pub records: Vec<FlowRecord>,
    pub status: RunStatus,
    pub stats: ProcessingStats,
}

impl ProcessingReport {
    pub fn is_cancelled(&self) -> bool {
        self.status == RunStatus::Cancelled
    }
}

/// Streaming pipeline: packets in, finalized flow records out.
pub struct FeatureProcessor<'a> {
    config: MeterConfig,
    callback: Option<ProgressCallback<'a>>,
    token: CancellationToken,
}

impl<'a> FeatureProcessor<'a> {
    pub fn new(config: MeterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            callback: None,
            token: CancellationToken::new(),
        })
    }

    /// Called every `progress_interval_packets`; returning `false` stops the run.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&Progress) -> bool + 'a,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// Validates the whole file first, so a broken capture fails before any
    /// flow work, then streams it through the table.
    pub fn process_file<P: AsRef<Path>>(&mut self, path: P) -> Result<ProcessingReport> {
        let path = path.as_ref();
        let total = count_packets(path)?;
        info!(path = %path.display(), packets = total, "Capture validated");
        let reader = CaptureReader::open(path)?;
        self.process_packets(reader, total)
    }

    /// `total` only feeds progress reporting; 0 means unknown.
    pub fn process_packets<I>(&mut self, packets: I, total: u64) -> Result<ProcessingReport>
    where
        I: Iterator<Item = Result<PacketRecord>>,
    {
        let workers = self.config.worker_count();
        info!(
            packets = total,
            workers,
            timeout = self.config.inactivity_timeout_secs,
            storage = ?self.config.storage,
            "Starting flow extraction"
        );

        let callback = self
            .callback
            .as_mut()
            .map(|cb| Box::new(move |p: &Progress| cb(p)) as ProgressCallback<'_>);
        let mut publisher = ProgressPublisher::new(
            self.config.progress_interval_packets,
            total,
            callback,
            self.token.clone(),
        );
        let mut table = FlowTable::new(&self.config);

        let status = if workers <= 1 {
            engine::run_sequential(packets, &mut table, &mut publisher, &self.config)?
        } else {
            engine::run_parallel(packets, &mut table, &mut publisher, &self.config, workers)?
        };

        let processed = table.stats().packets_read;
        if status == RunStatus::Completed && publisher.last_published() != Some(processed) {
            publisher.publish(processed, table.memory_usage());
        }
        let elapsed = publisher.elapsed_secs();
        let (records, mut stats) = table.finish()?;
        stats.elapsed_secs = elapsed;

        info!(
            records = records.len(),
            packets = stats.packets_read,
            skipped = stats.packets_skipped(),
            spilled = stats.flows_spilled,
            ?status,
            elapsed_secs = elapsed,
            "Flow extraction finished"
        );
        Ok(ProcessingReport { records, status, stats })
    }
}
