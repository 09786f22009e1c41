//! On-disk store for finalized flows evicted under memory pressure.
//!
//! Each batch is written as a little-endian `u64` byte length followed by the
//! bincode encoding of a `Vec<FlowRecord>`. The backing file is an anonymous
//! temp file, so it disappears with the process whatever happens.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::record::FlowRecord;
use crate::error::{Result, SpillError};

pub struct SpillStore {
    dir: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    batches: u64,
    records: u64,
}

impl SpillStore {
    /// The file is only created once the first batch is written.
    pub fn new(dir: Option<&Path>) -> Self {
        Self {
            dir: dir.map(Path::to_path_buf),
            writer: None,
            batches: 0,
            records: 0,
        }
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.batches == 0
    }

    fn io_error(packet_index: u64) -> impl FnOnce(std::io::Error) -> SpillError {
        move |source| SpillError::Io { packet_index, source }
    }

    fn writer(&mut self, packet_index: u64) -> Result<&mut BufWriter<File>> {
        let writer = match self.writer {
            Some(ref mut writer) => writer,
            None => {
                let file = match &self.dir {
                    Some(dir) => tempfile::tempfile_in(dir),
                    None => tempfile::tempfile(),
                }
                .map_err(Self::io_error(packet_index))?;
                self.writer.insert(BufWriter::new(file))
            }
        };
        Ok(writer)
    }

    /// Appends one batch. `packet_index` is reported if the write fails.
    pub fn write_batch(&mut self, records: &[FlowRecord], packet_index: u64) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let batch = self.batches;
        let encoded = bincode::serialize(records).map_err(|source| SpillError::Encoding { batch, source })?;

        let writer = self.writer(packet_index)?;
        writer
            .write_all(&(encoded.len() as u64).to_le_bytes())
            .and_then(|_| writer.write_all(&encoded))
            .map_err(Self::io_error(packet_index))?;

        self.batches += 1;
        self.records += records.len() as u64;
        debug!(batch, records = records.len(), bytes = encoded.len(), "Spilled flow batch");
        Ok(())
    }

    /// Reads every batch back in write order and releases the file.
    pub fn drain(&mut self, packet_index: u64) -> Result<Vec<FlowRecord>> {
        let Some(writer) = self.writer.take() else {
            return Ok(Vec::new());
        };
        let mut file = writer.into_inner().map_err(|e| SpillError::Io {
            packet_index,
            source: e.into_error(),
        })?;
        file.seek(SeekFrom::Start(0)).map_err(Self::io_error(packet_index))?;

        let mut reader = BufReader::new(file);
        let mut records = Vec::with_capacity(self.records as usize);
        for batch in 0..self.batches {
            let mut len = [0u8; 8];
            reader.read_exact(&mut len).map_err(Self::io_error(packet_index))?;
            let mut buf = vec![0u8; u64::from_le_bytes(len) as usize];
            reader.read_exact(&mut buf).map_err(Self::io_error(packet_index))?;
            let decoded: Vec<FlowRecord> =
                bincode::deserialize(&buf).map_err(|source| SpillError::Encoding { batch, source })?;
            records.extend(decoded);
        }

        self.batches = 0;
        self.records = 0;
        Ok(records)
    }
}
