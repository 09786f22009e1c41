use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::net::IpAddr;

use super::flow::FlowAggregate;
use super::key::{FlowDirection, FlowKey};
use super::stats::Summary;

/// Durations at or below this many seconds count as zero for every rate.
pub const DURATION_EPSILON: f64 = 1e-9;

/// One numeric cell of a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Int(u64),
    Float(f64),
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

trait Sanitize {
    fn sanitize(&mut self);
}

impl Sanitize for u64 {
    fn sanitize(&mut self) {}
}

impl Sanitize for f64 {
    fn sanitize(&mut self) {
        if !self.is_finite() {
            *self = 0.0;
        }
    }
}

macro_rules! flow_record {
    ($($name:ident : $ty:ty),* $(,)?) => {
        /// Finalized feature vector of one flow. Times are in seconds, sizes in bytes.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct FlowRecord {
            pub src_ip: IpAddr,
            pub dst_ip: IpAddr,
            pub src_port: u16,
            pub dst_port: u16,
            pub protocol: u8,
            /// Flow start, seconds since the Unix epoch.
            pub timestamp: f64,
            $(pub $name: $ty,)*
        }

        /// Numeric columns, in output order, after the identity columns.
        pub const FEATURE_COLUMNS: &[&str] = &[$(stringify!($name)),*];

        impl FlowRecord {
            /// Every numeric column with its name, in output order.
            pub fn features(&self) -> Vec<(&'static str, FieldValue)> {
                vec![$((stringify!($name), FieldValue::from(self.$name))),*]
            }

            fn sanitize(&mut self) {
                self.timestamp.sanitize();
                $(self.$name.sanitize();)*
            }
        }
    };
}

// Order follows the reference CSV header; the trailing block holds the extra columns.
flow_record! {
    flow_duration: f64,
    flow_byts_s: f64,
    flow_pkts_s: f64,
    fwd_pkts_s: f64,
    bwd_pkts_s: f64,
    tot_fwd_pkts: u64,
    tot_bwd_pkts: u64,
    totlen_fwd_pkts: u64,
    totlen_bwd_pkts: u64,
    fwd_pkt_len_max: f64,
    fwd_pkt_len_min: f64,
    fwd_pkt_len_mean: f64,
    fwd_pkt_len_std: f64,
    bwd_pkt_len_max: f64,
    bwd_pkt_len_min: f64,
    bwd_pkt_len_mean: f64,
    bwd_pkt_len_std: f64,
    pkt_len_max: f64,
    pkt_len_min: f64,
    pkt_len_mean: f64,
    pkt_len_std: f64,
    pkt_len_var: f64,
    fwd_header_len: u64,
    bwd_header_len: u64,
    fwd_seg_size_min: u64,
    fwd_act_data_pkts: u64,
    flow_iat_mean: f64,
    flow_iat_max: f64,
    flow_iat_min: f64,
    flow_iat_std: f64,
    fwd_iat_tot: f64,
    fwd_iat_max: f64,
    fwd_iat_min: f64,
    fwd_iat_mean: f64,
    fwd_iat_std: f64,
    bwd_iat_tot: f64,
    bwd_iat_max: f64,
    bwd_iat_min: f64,
    bwd_iat_mean: f64,
    bwd_iat_std: f64,
    fwd_psh_flags: u64,
    bwd_psh_flags: u64,
    fwd_urg_flags: u64,
    bwd_urg_flags: u64,
    fin_flag_cnt: u64,
    syn_flag_cnt: u64,
    rst_flag_cnt: u64,
    psh_flag_cnt: u64,
    ack_flag_cnt: u64,
    urg_flag_cnt: u64,
    ece_flag_cnt: u64,
    down_up_ratio: f64,
    pkt_size_avg: f64,
    init_fwd_win_byts: u64,
    init_bwd_win_byts: u64,
    active_max: f64,
    active_min: f64,
    active_mean: f64,
    active_std: f64,
    idle_max: f64,
    idle_min: f64,
    idle_mean: f64,
    idle_std: f64,
    fwd_byts_b_avg: f64,
    fwd_pkts_b_avg: f64,
    bwd_byts_b_avg: f64,
    bwd_pkts_b_avg: f64,
    fwd_blk_rate_avg: f64,
    bwd_blk_rate_avg: f64,
    fwd_seg_size_avg: f64,
    bwd_seg_size_avg: f64,
    cwr_flag_count: u64,
    subflow_fwd_pkts: f64,
    subflow_bwd_pkts: f64,
    subflow_fwd_byts: f64,
    subflow_bwd_byts: f64,

    tot_pkts: u64,
    totlen_pkts: u64,
    fwd_byts_s: f64,
    bwd_byts_s: f64,
    fwd_pkt_len_var: f64,
    bwd_pkt_len_var: f64,
    flow_iat_var: f64,
    flow_iat_tot: f64,
    fwd_iat_var: f64,
    bwd_iat_var: f64,
    active_var: f64,
    active_tot: f64,
    idle_var: f64,
    idle_tot: f64,
    fwd_blk_cnt: u64,
    bwd_blk_cnt: u64,
    subflow_cnt: u64,
}

/// Identity columns that precede [`FEATURE_COLUMNS`].
pub const KEY_COLUMNS: &[&str] = &["src_ip", "dst_ip", "src_port", "dst_port", "protocol", "timestamp"];

/// Full header in output order.
pub fn columns() -> impl Iterator<Item = &'static str> {
    KEY_COLUMNS.iter().chain(FEATURE_COLUMNS.iter()).copied()
}

#[inline]
fn per_second(amount: f64, duration: f64) -> f64 {
    if duration <= DURATION_EPSILON {
        0.0
    } else {
        amount / duration
    }
}

#[inline]
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Turns a running aggregate into its immutable record. Pure: the same
/// aggregate always yields a bit-identical record, and no numeric field of the
/// result is ever NaN or infinite.
pub fn finalize(flow: &FlowAggregate) -> FlowRecord {
    let fwd = flow.direction(FlowDirection::Forward);
    let bwd = flow.direction(FlowDirection::Backward);
    let fwd_bulk = flow.bulk.state(FlowDirection::Forward);
    let bwd_bulk = flow.bulk.state(FlowDirection::Backward);

    let fwd_len = fwd.packet_sizes.summary();
    let bwd_len = bwd.packet_sizes.summary();
    let pkt_len = flow.packet_sizes.summary();
    let flow_iat = flow.flow_iat.summary();
    let fwd_iat = fwd.iat.summary();
    let bwd_iat = bwd.iat.summary();
    // Active and idle periods are both read off the combined IAT distribution
    let active: Summary = flow_iat;
    let idle: Summary = flow_iat;

    let duration = flow.duration();
    let tot_pkts = fwd.packet_count + bwd.packet_count;
    let totlen_pkts = fwd.byte_count + bwd.byte_count;
    let subflows = flow.subflow_count as f64;

    let mut record = FlowRecord {
        src_ip: flow.key.ip_a,
        dst_ip: flow.key.ip_b,
        src_port: flow.key.port_a,
        dst_port: flow.key.port_b,
        protocol: flow.key.protocol,
        timestamp: flow.flow_start_time,

        flow_duration: duration,
        flow_byts_s: per_second(totlen_pkts as f64, duration),
        flow_pkts_s: per_second(tot_pkts as f64, duration),
        fwd_pkts_s: per_second(fwd.packet_count as f64, duration),
        bwd_pkts_s: per_second(bwd.packet_count as f64, duration),
        tot_fwd_pkts: fwd.packet_count,
        tot_bwd_pkts: bwd.packet_count,
        totlen_fwd_pkts: fwd.byte_count,
        totlen_bwd_pkts: bwd.byte_count,
        fwd_pkt_len_max: fwd_len.max,
        fwd_pkt_len_min: fwd_len.min,
        fwd_pkt_len_mean: fwd_len.mean,
        fwd_pkt_len_std: fwd_len.std,
        bwd_pkt_len_max: bwd_len.max,
        bwd_pkt_len_min: bwd_len.min,
        bwd_pkt_len_mean: bwd_len.mean,
        bwd_pkt_len_std: bwd_len.std,
        pkt_len_max: pkt_len.max,
        pkt_len_min: pkt_len.min,
        pkt_len_mean: pkt_len.mean,
        pkt_len_std: pkt_len.std,
        pkt_len_var: pkt_len.variance,
        fwd_header_len: fwd.header_bytes,
        bwd_header_len: bwd.header_bytes,
        fwd_seg_size_min: fwd.min_segment_size.unwrap_or(0) as u64,
        fwd_act_data_pkts: fwd.data_packets,
        flow_iat_mean: flow_iat.mean,
        flow_iat_max: flow_iat.max,
        flow_iat_min: flow_iat.min,
        flow_iat_std: flow_iat.std,
        fwd_iat_tot: fwd_iat.total,
        fwd_iat_max: fwd_iat.max,
        fwd_iat_min: fwd_iat.min,
        fwd_iat_mean: fwd_iat.mean,
        fwd_iat_std: fwd_iat.std,
        bwd_iat_tot: bwd_iat.total,
        bwd_iat_max: bwd_iat.max,
        bwd_iat_min: bwd_iat.min,
        bwd_iat_mean: bwd_iat.mean,
        bwd_iat_std: bwd_iat.std,
        fwd_psh_flags: fwd.psh_count,
        bwd_psh_flags: bwd.psh_count,
        fwd_urg_flags: fwd.urg_count,
        bwd_urg_flags: bwd.urg_count,
        fin_flag_cnt: flow.flags.fin,
        syn_flag_cnt: flow.flags.syn,
        rst_flag_cnt: flow.flags.rst,
        psh_flag_cnt: flow.flags.psh,
        ack_flag_cnt: flow.flags.ack,
        urg_flag_cnt: flow.flags.urg,
        ece_flag_cnt: flow.flags.ece,
        down_up_ratio: ratio(fwd.packet_count as f64, bwd.packet_count as f64),
        pkt_size_avg: ratio(totlen_pkts as f64, tot_pkts as f64),
        init_fwd_win_byts: fwd.init_window.unwrap_or(0) as u64,
        init_bwd_win_byts: bwd.init_window.unwrap_or(0) as u64,
        active_max: active.max,
        active_min: active.min,
        active_mean: active.mean,
        active_std: active.std,
        idle_max: idle.max,
        idle_min: idle.min,
        idle_mean: idle.mean,
        idle_std: idle.std,
        fwd_byts_b_avg: fwd_bulk.average_bytes_per_bulk(),
        fwd_pkts_b_avg: fwd_bulk.average_packets_per_bulk(),
        bwd_byts_b_avg: bwd_bulk.average_bytes_per_bulk(),
        bwd_pkts_b_avg: bwd_bulk.average_packets_per_bulk(),
        fwd_blk_rate_avg: fwd_bulk.average_bulk_rate(),
        bwd_blk_rate_avg: bwd_bulk.average_bulk_rate(),
        fwd_seg_size_avg: ratio(fwd.payload_bytes as f64, fwd.packet_count as f64),
        bwd_seg_size_avg: ratio(bwd.payload_bytes as f64, bwd.packet_count as f64),
        cwr_flag_count: flow.flags.cwr,
        subflow_fwd_pkts: ratio(fwd.packet_count as f64, subflows),
        subflow_bwd_pkts: ratio(bwd.packet_count as f64, subflows),
        subflow_fwd_byts: ratio(fwd.byte_count as f64, subflows),
        subflow_bwd_byts: ratio(bwd.byte_count as f64, subflows),

        tot_pkts,
        totlen_pkts,
        fwd_byts_s: per_second(fwd.byte_count as f64, duration),
        bwd_byts_s: per_second(bwd.byte_count as f64, duration),
        fwd_pkt_len_var: fwd_len.variance,
        bwd_pkt_len_var: bwd_len.variance,
        flow_iat_var: flow_iat.variance,
        flow_iat_tot: flow_iat.total,
        fwd_iat_var: fwd_iat.variance,
        bwd_iat_var: bwd_iat.variance,
        active_var: active.variance,
        active_tot: active.total,
        idle_var: idle.variance,
        idle_tot: idle.total,
        fwd_blk_cnt: fwd_bulk.completed_bulk_count,
        bwd_blk_cnt: bwd_bulk.completed_bulk_count,
        subflow_cnt: flow.subflow_count,
    };
    record.sanitize();
    record
}

impl FlowRecord {
    pub fn key(&self) -> FlowKey {
        FlowKey::new(self.src_ip, self.dst_ip, self.src_port, self.dst_port, self.protocol)
    }

    /// Start time first, then endpoints, so output order is stable across runs.
    pub fn output_order(&self, other: &FlowRecord) -> Ordering {
        self.timestamp
            .total_cmp(&other.timestamp)
            .then_with(|| {
                (self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.protocol).cmp(&(
                    other.src_ip,
                    other.src_port,
                    other.dst_ip,
                    other.dst_port,
                    other.protocol,
                ))
            })
    }
}

pub fn sort_records(records: &mut [FlowRecord]) {
    records.sort_by(FlowRecord::output_order);
}
