use etherparse::{LaxPacketHeaders, NetHeaders, TransportHeader};
use std::net::{IpAddr, Ipv4Addr};

use crate::error::CaptureError;
use crate::types::{PacketRecord, Protocol, TcpFlags};

/// Link layers the reader can place IPv4 on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    RawIp,
}

impl LinkType {
    pub fn from_code(code: i32) -> Result<Self, CaptureError> {
        match code {
            1 => Ok(LinkType::Ethernet),
            // LINKTYPE_RAW, LINKTYPE_IPV4 and the BSD DLT_RAW value
            101 | 228 | 12 => Ok(LinkType::RawIp),
            other => Err(CaptureError::UnsupportedLinkType { link_type: other }),
        }
    }
}

/// Decodes one captured frame. Never fails: anything that isn't IPv4 comes
/// back without addresses and gets skipped downstream.
pub fn decode_frame(link: LinkType, timestamp: f64, wire_len: u32, data: &[u8]) -> PacketRecord {
    // Lax parsing keeps whatever headers fit in a snaplen-truncated frame
    let parsed = match link {
        LinkType::Ethernet => LaxPacketHeaders::from_ethernet(data).ok(),
        LinkType::RawIp => LaxPacketHeaders::from_ip(data).ok(),
    };
    let Some(parsed) = parsed else {
        return PacketRecord::non_ip(timestamp, wire_len);
    };

    let ipv4 = match &parsed.net {
        Some(NetHeaders::Ipv4(ipv4, _)) => ipv4,
        _ => return PacketRecord::non_ip(timestamp, wire_len),
    };
    let src_ip = IpAddr::V4(Ipv4Addr::from(ipv4.source));
    let dst_ip = IpAddr::V4(Ipv4Addr::from(ipv4.destination));
    let ip_payload_len = (ipv4.total_len as u32).saturating_sub(ipv4.header_len() as u32);

    match &parsed.transport {
        Some(TransportHeader::Tcp(tcp)) => {
            let mut flags = TcpFlags::empty();
            for (set, flag) in [
                (tcp.fin, TcpFlags::FIN),
                (tcp.syn, TcpFlags::SYN),
                (tcp.rst, TcpFlags::RST),
                (tcp.psh, TcpFlags::PSH),
                (tcp.ack, TcpFlags::ACK),
                (tcp.urg, TcpFlags::URG),
                (tcp.ece, TcpFlags::ECE),
                (tcp.cwr, TcpFlags::CWR),
            ] {
                if set {
                    flags = flags | flag;
                }
            }
            let payload = ip_payload_len.saturating_sub(tcp.header_len() as u32);
            PacketRecord::tcp(
                timestamp,
                (src_ip, tcp.source_port),
                (dst_ip, tcp.destination_port),
                wire_len,
                payload,
                flags,
                tcp.window_size,
            )
        }
        Some(TransportHeader::Udp(udp)) => {
            let payload = ip_payload_len.saturating_sub(8);
            PacketRecord::udp(
                timestamp,
                (src_ip, udp.source_port),
                (dst_ip, udp.destination_port),
                wire_len,
                payload,
            )
        }
        Some(TransportHeader::Icmpv4(icmp)) => {
            let payload = ip_payload_len.saturating_sub(icmp.header_len() as u32);
            PacketRecord::icmp(timestamp, src_ip, dst_ip, wire_len, payload)
        }
        _ => {
            // Transport missing or not one we decode; TCP/UDP without ports is skipped later
            PacketRecord {
                timestamp,
                src_ip: Some(src_ip),
                dst_ip: Some(dst_ip),
                ports: None,
                protocol: Protocol::from_number(ipv4.protocol.0),
                total_length: wire_len,
                payload_length: ip_payload_len,
                tcp_flags: TcpFlags::empty(),
                tcp_window: 0,
            }
        }
    }
}
