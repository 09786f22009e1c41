use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Transport protocol carried by an IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl Protocol {
    pub fn from_number(number: u8) -> Self {
        match number {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            1 => Protocol::Icmp,
            n => Protocol::Other(n),
        }
    }

    /// IANA protocol number.
    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Icmp => 1,
            Protocol::Other(n) => n,
        }
    }

    /// TCP and UDP flows are keyed on ports, so a packet without its transport header is useless.
    pub fn requires_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

/// TCP control bits, same bit layout as the TCP header flag byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);
    pub const ECE: TcpFlags = TcpFlags(0x40);
    pub const CWR: TcpFlags = TcpFlags(0x80);

    pub const fn empty() -> Self {
        TcpFlags(0)
    }

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// FIN or RST, the two flags that may close a flow early.
    pub fn is_terminating(self) -> bool {
        self.contains(TcpFlags::FIN) || self.contains(TcpFlags::RST)
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

/// Normalized view of one captured packet, as handed over by a capture reader.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    /// Seconds, monotonic within a capture.
    pub timestamp: f64,
    /// `None` when the frame carried no decodable network layer.
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    /// `(src, dst)`; `None` when no TCP/UDP header was present.
    pub ports: Option<(u16, u16)>,
    pub protocol: Protocol,
    pub total_length: u32,
    pub payload_length: u32,
    /// Empty for anything but TCP.
    pub tcp_flags: TcpFlags,
    /// 0 for anything but TCP.
    pub tcp_window: u16,
}

impl PacketRecord {
    pub fn tcp(
        timestamp: f64,
        src: (IpAddr, u16),
        dst: (IpAddr, u16),
        total_length: u32,
        payload_length: u32,
        tcp_flags: TcpFlags,
        tcp_window: u16,
    ) -> Self {
        Self {
            timestamp,
            src_ip: Some(src.0),
            dst_ip: Some(dst.0),
            ports: Some((src.1, dst.1)),
            protocol: Protocol::Tcp,
            total_length,
            payload_length,
            tcp_flags,
            tcp_window,
        }
    }

    pub fn udp(timestamp: f64, src: (IpAddr, u16), dst: (IpAddr, u16), total_length: u32, payload_length: u32) -> Self {
        Self {
            timestamp,
            src_ip: Some(src.0),
            dst_ip: Some(dst.0),
            ports: Some((src.1, dst.1)),
            protocol: Protocol::Udp,
            total_length,
            payload_length,
            tcp_flags: TcpFlags::empty(),
            tcp_window: 0,
        }
    }

    pub fn icmp(timestamp: f64, src: IpAddr, dst: IpAddr, total_length: u32, payload_length: u32) -> Self {
        Self {
            timestamp,
            src_ip: Some(src),
            dst_ip: Some(dst),
            ports: None,
            protocol: Protocol::Icmp,
            total_length,
            payload_length,
            tcp_flags: TcpFlags::empty(),
            tcp_window: 0,
        }
    }

    /// A frame the reader could not place at the network layer (ARP, IPv6, garbage).
    pub fn non_ip(timestamp: f64, total_length: u32) -> Self {
        Self {
            timestamp,
            src_ip: None,
            dst_ip: None,
            ports: None,
            protocol: Protocol::Other(0),
            total_length,
            payload_length: 0,
            tcp_flags: TcpFlags::empty(),
            tcp_window: 0,
        }
    }

    /// Length of everything in front of the payload.
    pub fn header_length(&self) -> u32 {
        self.total_length.saturating_sub(self.payload_length)
    }
}

/// Why a packet was left out of flow accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoNetworkLayer,
    MissingTransport,
}

/// Snapshot handed to the progress callback.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Progress {
    pub packets_processed: u64,
    pub packets_total: u64,
    pub elapsed_secs: f64,
    /// Approximate bytes held by active flow state.
    pub memory_usage_bytes: u64,
}

/// Counters for one run; always returned alongside the records.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct ProcessingStats {
    pub packets_read: u64,
    pub packets_processed: u64,
    pub skipped_no_network: u64,
    pub skipped_missing_transport: u64,
    pub flows_created: u64,
    pub flows_expired: u64,
    pub flows_terminated: u64,
    pub flows_spilled: u64,
    pub spill_batches: u64,
    pub chunks_processed: u64,
    pub elapsed_secs: f64,
}

impl ProcessingStats {
    pub fn packets_skipped(&self) -> u64 {
        self.skipped_no_network + self.skipped_missing_transport
    }

    pub fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::NoNetworkLayer => self.skipped_no_network += 1,
            SkipReason::MissingTransport => self.skipped_missing_transport += 1,
        }
    }

    /// Folds counters from a worker into this one. Elapsed time is owned by the coordinator.
    pub fn absorb(&mut self, other: &ProcessingStats) {
        self.packets_read += other.packets_read;
        self.packets_processed += other.packets_processed;
        self.skipped_no_network += other.skipped_no_network;
        self.skipped_missing_transport += other.skipped_missing_transport;
        self.flows_created += other.flows_created;
        self.flows_expired += other.flows_expired;
        self.flows_terminated += other.flows_terminated;
        self.flows_spilled += other.flows_spilled;
        self.spill_batches += other.spill_batches;
        self.chunks_processed += other.chunks_processed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_contains_individual_bits() {
        let flags = TcpFlags::SYN | TcpFlags::ACK;
        assert!(flags.contains(TcpFlags::SYN));
        assert!(flags.contains(TcpFlags::ACK));
        assert!(!flags.contains(TcpFlags::FIN));
        assert!(!flags.contains(TcpFlags::empty()));
        assert!(!flags.is_terminating());
        assert!((flags | TcpFlags::RST).is_terminating());
    }

    #[test]
    fn test_protocol_numbers_round_trip() {
        for n in [1u8, 6, 17, 47] {
            assert_eq!(Protocol::from_number(n).number(), n);
        }
        assert!(Protocol::Tcp.requires_ports());
        assert!(!Protocol::Icmp.requires_ports());
    }

    #[test]
    fn test_header_length_saturates() {
        let mut pkt = PacketRecord::non_ip(0.0, 10);
        pkt.payload_length = 20;
        assert_eq!(pkt.header_length(), 0);
    }
}
