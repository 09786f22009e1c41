use serde::Serialize;
use tracing::{info, warn};

use crate::processor::FlowRecord;
use crate::types::Protocol;

pub const NTP_PORT: u16 = 123;
/// Mean response size over mean request size above which traffic is flagged.
pub const AMPLIFICATION_THRESHOLD: f64 = 10.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NtpAmplification {
    pub detected: bool,
    pub ntp_flows: usize,
    pub request_count: u64,
    pub response_count: u64,
    pub avg_request_size: f64,
    pub avg_response_size: f64,
    pub amplification_ratio: f64,
}

impl NtpAmplification {
    pub fn message(&self) -> String {
        if self.ntp_flows == 0 {
            "No NTP traffic detected".to_string()
        } else if self.detected {
            format!(
                "Potential NTP amplification attack detected (amplification ratio: {:.1}x)",
                self.amplification_ratio
            )
        } else {
            "No NTP amplification attack detected".to_string()
        }
    }
}

/// Requests are packets toward port 123, responses packets from it. Sizes are
/// wire lengths.
pub fn detect_ntp_amplification(records: &[FlowRecord]) -> NtpAmplification {
    let mut result = NtpAmplification::default();
    let mut request_bytes = 0u64;
    let mut response_bytes = 0u64;

    for record in records {
        if record.protocol != Protocol::Udp.number() {
            continue;
        }
        // Forward is whichever side spoke first
        let (requests, responses) = if record.dst_port == NTP_PORT {
            ((record.tot_fwd_pkts, record.totlen_fwd_pkts), (record.tot_bwd_pkts, record.totlen_bwd_pkts))
        } else if record.src_port == NTP_PORT {
            ((record.tot_bwd_pkts, record.totlen_bwd_pkts), (record.tot_fwd_pkts, record.totlen_fwd_pkts))
        } else {
            continue;
        };
        result.ntp_flows += 1;
        result.request_count += requests.0;
        request_bytes += requests.1;
        result.response_count += responses.0;
        response_bytes += responses.1;
    }

    if result.request_count == 0 || result.response_count == 0 {
        info!(flows = result.ntp_flows, "{}", result.message());
        return result;
    }

    result.avg_request_size = request_bytes as f64 / result.request_count as f64;
    result.avg_response_size = response_bytes as f64 / result.response_count as f64;
    result.amplification_ratio = if result.avg_request_size > 0.0 {
        result.avg_response_size / result.avg_request_size
    } else {
        0.0
    };
    result.detected = result.amplification_ratio > AMPLIFICATION_THRESHOLD;

    if result.detected {
        warn!(
            ratio = result.amplification_ratio,
            requests = result.request_count,
            responses = result.response_count,
            "{}",
            result.message()
        );
    } else {
        info!(ratio = result.amplification_ratio, "{}", result.message());
    }
    result
}
