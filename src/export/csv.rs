use chrono::DateTime;
use std::io::Write;

use crate::error::{ExportError, Result};
use crate::processor::{columns, FieldValue, FlowRecord};

/// Plain decimal inside `[1e-4, 1e6)`, `d.dddddde±XX` outside, `0` for zero
/// and for anything non-finite.
pub fn format_float(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return "0".to_string();
    }

    if (1e-4..1e6).contains(&value.abs()) {
        let fixed = format!("{:.6}", value);
        let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
        return match trimmed {
            "" | "-0" => "0".to_string(),
            other => other.to_string(),
        };
    }

    // `{:e}` gives "1.234568e7"; pad the exponent with an explicit sign
    let scientific = format!("{:.6e}", value);
    match scientific.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exponent.abs())
        }
        None => scientific,
    }
}

pub fn format_value(value: FieldValue) -> String {
    match value {
        FieldValue::Int(v) => v.to_string(),
        FieldValue::Float(v) => format_float(v),
    }
}

/// Start time as UTC wall clock with microseconds.
pub fn format_timestamp(timestamp: f64) -> String {
    if !timestamp.is_finite() {
        return "0".to_string();
    }
    let secs = timestamp.floor();
    let nanos = (((timestamp - secs) * 1e9).round() as u32).min(999_999_999);
    match DateTime::from_timestamp(secs as i64, nanos) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        None => format_float(timestamp),
    }
}

fn row(record: &FlowRecord) -> Vec<String> {
    let mut row = Vec::with_capacity(6 + record.features().len());
    row.push(record.src_ip.to_string());
    row.push(record.dst_ip.to_string());
    row.push(record.src_port.to_string());
    row.push(record.dst_port.to_string());
    row.push(record.protocol.to_string());
    row.push(format_timestamp(record.timestamp));
    row.extend(record.features().into_iter().map(|(_, value)| format_value(value)));
    row
}

/// Header plus one row per record.
pub fn write_csv<W: Write>(writer: W, records: &[FlowRecord]) -> Result<()> {
    let mut csv = ::csv::Writer::from_writer(writer);
    csv.write_record(columns()).map_err(ExportError::from)?;
    for record in records {
        csv.write_record(row(record)).map_err(ExportError::from)?;
    }
    csv.flush().map_err(ExportError::from)?;
    Ok(())
}
