use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::types::{PacketRecord, SkipReason};

/// Five-tuple of a flow. `ip_a:port_a` is the source of the first packet seen,
/// which fixes the forward direction for the lifetime of the flow.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Copy, Serialize, Deserialize)]
pub struct FlowKey {
    pub ip_a: IpAddr,
    pub ip_b: IpAddr,
    pub port_a: u16,
    pub port_b: u16,
    pub protocol: u8,
}

impl FlowKey {
    pub fn new(ip_a: IpAddr, ip_b: IpAddr, port_a: u16, port_b: u16, protocol: u8) -> Self {
        // No normalization here: sorting endpoints would flip direction on asymmetric flows
        Self { ip_a, ip_b, port_a, port_b, protocol }
    }

    /// Same conversation seen from the other end.
    pub fn reversed(&self) -> Self {
        Self {
            ip_a: self.ip_b,
            ip_b: self.ip_a,
            port_a: self.port_b,
            port_b: self.port_a,
            protocol: self.protocol,
        }
    }

    /// Key oriented the way the packet travels.
    pub fn from_packet(packet: &PacketRecord) -> Result<Self, SkipReason> {
        let (src_ip, dst_ip) = match (packet.src_ip, packet.dst_ip) {
            (Some(src), Some(dst)) => (src, dst),
            _ => return Err(SkipReason::NoNetworkLayer),
        };
        let (src_port, dst_port) = match packet.ports {
            Some(ports) if packet.protocol.requires_ports() => ports,
            None if packet.protocol.requires_ports() => return Err(SkipReason::MissingTransport),
            _ => (0, 0),
        };
        Ok(Self::new(src_ip, dst_ip, src_port, dst_port, packet.protocol.number()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowDirection {
    Forward,
    Backward,
}

impl FlowDirection {
    /// Slot in the per-direction arrays of an aggregate.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            FlowDirection::Forward => 0,
            FlowDirection::Backward => 1,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            FlowDirection::Forward => FlowDirection::Backward,
            FlowDirection::Backward => FlowDirection::Forward,
        }
    }
}

/// Finds the stored key a packet belongs to and its direction relative to it.
///
/// `exists` answers whether a key is present in the flow table. A packet whose
/// key is present as-is travels forward, one whose reversed key is present
/// travels backward, and a packet matching neither opens a new flow in the
/// forward direction. Packets without addresses (or without the transport
/// header their protocol needs) resolve to `None`.
pub fn resolve<F>(packet: &PacketRecord, exists: F) -> Option<(FlowKey, FlowDirection)>
where
    F: Fn(&FlowKey) -> bool,
{
    let key = FlowKey::from_packet(packet).ok()?;
    Some(orient(key, exists))
}

/// Orientation step of [`resolve`] for a key already built from a packet.
pub fn orient<F>(key: FlowKey, exists: F) -> (FlowKey, FlowDirection)
where
    F: Fn(&FlowKey) -> bool,
{
    if exists(&key) {
        return (key, FlowDirection::Forward);
    }
    let reversed = key.reversed();
    if exists(&reversed) {
        (reversed, FlowDirection::Backward)
    } else {
        (key, FlowDirection::Forward)
    }
}
