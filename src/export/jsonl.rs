use std::io::{BufWriter, Write};

use crate::error::{ExportError, Result};
use crate::processor::FlowRecord;

/// One JSON object per line, fields named as in the CSV header.
pub fn write_jsonl<W: Write>(writer: W, records: &[FlowRecord]) -> Result<()> {
    let mut out = BufWriter::new(writer);
    for record in records {
        serde_json::to_writer(&mut out, record).map_err(ExportError::from)?;
        out.write_all(b"\n").map_err(ExportError::from)?;
    }
    out.flush().map_err(ExportError::from)?;
    Ok(())
}
