use serde::{Deserialize, Serialize};

use super::bulk::BulkDetector;
use super::key::{FlowDirection, FlowKey};
use super::stats::{SampleStorage, Samples};
use crate::types::{PacketRecord, Protocol, TcpFlags};

/// Gap, in seconds, that separates two subflows of the same flow.
pub const SUBFLOW_TIMEOUT_SECS: f64 = 1.0;

/// Per-flag tallies. A packet carrying several flags bumps several counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagCounts {
    pub fin: u64,
    pub syn: u64,
    pub rst: u64,
    pub psh: u64,
    pub ack: u64,
    pub urg: u64,
    pub ece: u64,
    pub cwr: u64,
}

impl FlagCounts {
    pub fn observe(&mut self, flags: TcpFlags) {
        if flags.contains(TcpFlags::FIN) { self.fin += 1; }
        if flags.contains(TcpFlags::SYN) { self.syn += 1; }
        if flags.contains(TcpFlags::RST) { self.rst += 1; }
        if flags.contains(TcpFlags::PSH) { self.psh += 1; }
        if flags.contains(TcpFlags::ACK) { self.ack += 1; }
        if flags.contains(TcpFlags::URG) { self.urg += 1; }
        if flags.contains(TcpFlags::ECE) { self.ece += 1; }
        if flags.contains(TcpFlags::CWR) { self.cwr += 1; }
    }

    pub fn merge(&mut self, other: &FlagCounts) {
        self.fin += other.fin;
        self.syn += other.syn;
        self.rst += other.rst;
        self.psh += other.psh;
        self.ack += other.ack;
        self.urg += other.urg;
        self.ece += other.ece;
        self.cwr += other.cwr;
    }
}

/// Everything tracked separately for one direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionStats {
    pub packet_count: u64,
    pub byte_count: u64,
    pub payload_bytes: u64,
    pub header_bytes: u64,
    /// Packets with at least one byte of payload.
    pub data_packets: u64,
    /// Smallest payload among data packets.
    pub min_segment_size: Option<u32>,
    pub psh_count: u64,
    pub urg_count: u64,
    pub packet_sizes: Samples,
    /// Gaps between consecutive packets of this direction.
    pub iat: Samples,
    pub first_seen: Option<f64>,
    pub last_seen: Option<f64>,
    /// Window of the first TCP packet in this direction.
    pub init_window: Option<u16>,
}

impl DirectionStats {
    fn new(storage: SampleStorage) -> Self {
        Self {
            packet_count: 0,
            byte_count: 0,
            payload_bytes: 0,
            header_bytes: 0,
            data_packets: 0,
            min_segment_size: None,
            psh_count: 0,
            urg_count: 0,
            packet_sizes: Samples::new(storage),
            iat: Samples::new(storage),
            first_seen: None,
            last_seen: None,
            init_window: None,
        }
    }

    fn add_packet(&mut self, packet: &PacketRecord) {
        let ts = packet.timestamp;
        if let Some(prev) = self.last_seen {
            self.iat.push((ts - prev).max(0.0));
        }
        self.first_seen.get_or_insert(ts);
        self.last_seen = Some(self.last_seen.map_or(ts, |prev| prev.max(ts)));

        self.packet_count += 1;
        self.byte_count += packet.total_length as u64;
        self.payload_bytes += packet.payload_length as u64;
        self.header_bytes += packet.header_length() as u64;
        self.packet_sizes.push(packet.total_length as f64);

        if packet.payload_length > 0 {
            self.data_packets += 1;
            self.min_segment_size = Some(self.min_segment_size.map_or(packet.payload_length, |m| m.min(packet.payload_length)));
        }

        if packet.protocol == Protocol::Tcp {
            if self.init_window.is_none() {
                self.init_window = Some(packet.tcp_window);
            }
            if packet.tcp_flags.contains(TcpFlags::PSH) { self.psh_count += 1; }
            if packet.tcp_flags.contains(TcpFlags::URG) { self.urg_count += 1; }
        }
    }

    /// `later` holds packets that arrived after ours.
    fn merge(&mut self, later: &DirectionStats) {
        if let (Some(last), Some(first)) = (self.last_seen, later.first_seen) {
            // Gap across the seam between the two partial states
            self.iat.push((first - last).max(0.0));
        }
        self.iat.merge(&later.iat);
        self.packet_sizes.merge(&later.packet_sizes);

        self.packet_count += later.packet_count;
        self.byte_count += later.byte_count;
        self.payload_bytes += later.payload_bytes;
        self.header_bytes += later.header_bytes;
        self.data_packets += later.data_packets;
        self.min_segment_size = match (self.min_segment_size, later.min_segment_size) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.psh_count += later.psh_count;
        self.urg_count += later.urg_count;

        self.first_seen = self.first_seen.or(later.first_seen);
        self.last_seen = match (self.last_seen, later.last_seen) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.init_window = self.init_window.or(later.init_window);
    }

    fn heap_bytes(&self) -> usize {
        self.packet_sizes.heap_bytes() + self.iat.heap_bytes()
    }
}

/// Running state of one active flow. Every field exists from construction with
/// a zero default, so finalization never has to guess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowAggregate {
    pub key: FlowKey,

    // Flow duration
    pub flow_start_time: f64,
    pub last_seen_time: f64,

    /// Indexed by [`FlowDirection::index`].
    pub directions: [DirectionStats; 2],

    // Both directions combined
    pub packet_sizes: Samples,
    pub flow_iat: Samples,
    pub subflow_count: u64,

    pub flags: FlagCounts,
    pub bulk: BulkDetector,
}

impl FlowAggregate {
    pub fn new(key: FlowKey, first_packet: &PacketRecord, direction: FlowDirection, storage: SampleStorage) -> Self {
        let mut flow = Self {
            key,
            flow_start_time: first_packet.timestamp,
            last_seen_time: first_packet.timestamp,
            directions: [DirectionStats::new(storage), DirectionStats::new(storage)],
            packet_sizes: Samples::new(storage),
            flow_iat: Samples::new(storage),
            subflow_count: 0,
            flags: FlagCounts::default(),
            bulk: BulkDetector::default(),
        };
        flow.add_packet(first_packet, direction);
        flow
    }

    pub fn add_packet(&mut self, packet: &PacketRecord, direction: FlowDirection) {
        let ts = packet.timestamp;

        // Flow-level IAT and subflow split
        if self.packet_count() == 0 {
            self.subflow_count = 1;
        } else {
            let gap = (ts - self.last_seen_time).max(0.0);
            self.flow_iat.push(gap);
            if gap > SUBFLOW_TIMEOUT_SECS {
                self.subflow_count += 1;
            }
        }

        self.directions[direction.index()].add_packet(packet);
        self.packet_sizes.push(packet.total_length as f64);

        if packet.protocol == Protocol::Tcp {
            self.flags.observe(packet.tcp_flags);
        }

        self.bulk.on_packet(direction, ts, packet.payload_length);

        self.flow_start_time = self.flow_start_time.min(ts);
        self.last_seen_time = self.last_seen_time.max(ts);
    }

    /// Helper the table uses to expire idle flows.
    #[inline]
    pub fn is_expired(&self, now: f64, timeout: f64) -> bool {
        now - self.last_seen_time > timeout
    }

    #[inline]
    pub fn direction(&self, direction: FlowDirection) -> &DirectionStats {
        &self.directions[direction.index()]
    }

    pub fn packet_count(&self) -> u64 {
        self.directions[0].packet_count + self.directions[1].packet_count
    }

    pub fn byte_count(&self) -> u64 {
        self.directions[0].byte_count + self.directions[1].byte_count
    }

    pub fn duration(&self) -> f64 {
        (self.last_seen_time - self.flow_start_time).max(0.0)
    }

    /// Re-labels the aggregate as seen from the other endpoint.
    pub fn flip(&mut self) {
        self.key = self.key.reversed();
        self.directions.swap(0, 1);
        self.bulk.swap_directions();
    }

    /// Folds in a partial aggregate of the same conversation whose packets came
    /// after ours. A partial keyed from the other endpoint is flipped first, so
    /// the direction fixed by our first packet always wins.
    pub fn merge(&mut self, mut later: FlowAggregate) {
        if later.key != self.key && later.key.reversed() == self.key {
            later.flip();
        }

        let gap = (later.flow_start_time - self.last_seen_time).max(0.0);
        self.flow_iat.push(gap);
        self.flow_iat.merge(&later.flow_iat);
        self.packet_sizes.merge(&later.packet_sizes);
        self.subflow_count += later.subflow_count;
        if gap <= SUBFLOW_TIMEOUT_SECS && later.subflow_count > 0 {
            // The seam continues our last subflow instead of opening one
            self.subflow_count -= 1;
        }

        for (ours, theirs) in self.directions.iter_mut().zip(later.directions.iter()) {
            ours.merge(theirs);
        }
        self.flags.merge(&later.flags);
        self.bulk.merge(&later.bulk);

        self.flow_start_time = self.flow_start_time.min(later.flow_start_time);
        self.last_seen_time = self.last_seen_time.max(later.last_seen_time);
    }

    /// Rough footprint used for the spill threshold.
    pub fn approx_memory_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.packet_sizes.heap_bytes()
            + self.flow_iat.heap_bytes()
            + self.directions.iter().map(DirectionStats::heap_bytes).sum::<usize>()
    }
}
