//! Builders for small capture files written to a temp dir.

#![allow(dead_code)]

use etherparse::PacketBuilder;
use std::path::PathBuf;
use tempfile::TempDir;

pub const LINKTYPE_ETHERNET: u32 = 1;
pub const LINKTYPE_RAW: u32 = 101;

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;

const SRC_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 1];
const DST_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 2];

pub type Endpoint = ([u8; 4], u16);

fn split_ts(ts: f64) -> (u32, u32) {
    let secs = ts.floor();
    let micros = ((ts - secs) * 1e6).round() as u32;
    (secs as u32, micros)
}

/// Legacy little-endian microsecond pcap.
pub struct PcapFile {
    link_type: u32,
    bytes: Vec<u8>,
    frames: usize,
}

impl PcapFile {
    pub fn new(link_type: u32) -> Self {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&65535u32.to_le_bytes());
        bytes.extend_from_slice(&link_type.to_le_bytes());
        Self { link_type, bytes, frames: 0 }
    }

    pub fn ethernet() -> Self {
        Self::new(LINKTYPE_ETHERNET)
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn frame(&mut self, ts: f64, data: &[u8]) -> &mut Self {
        let (secs, micros) = split_ts(ts);
        self.bytes.extend_from_slice(&secs.to_le_bytes());
        self.bytes.extend_from_slice(&micros.to_le_bytes());
        self.bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(data);
        self.frames += 1;
        self
    }

    pub fn tcp(&mut self, ts: f64, src: Endpoint, dst: Endpoint, flags: u8, payload_len: usize) -> &mut Self {
        let data = tcp_frame(self.link_type, src, dst, flags, payload_len);
        self.frame(ts, &data)
    }

    pub fn udp(&mut self, ts: f64, src: Endpoint, dst: Endpoint, payload_len: usize) -> &mut Self {
        let data = udp_frame(self.link_type, src, dst, payload_len);
        self.frame(ts, &data)
    }

    /// An ARP request: Ethernet without an IP layer.
    pub fn arp(&mut self, ts: f64) -> &mut Self {
        let mut data = Vec::new();
        data.extend_from_slice(&[0xff; 6]);
        data.extend_from_slice(&SRC_MAC);
        data.extend_from_slice(&0x0806u16.to_be_bytes());
        data.extend_from_slice(&[0, 1, 8, 0, 6, 4, 0, 1]);
        data.extend_from_slice(&[0; 20]);
        self.frame(ts, &data)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn write(&self, dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, &self.bytes).unwrap();
        path
    }
}

pub fn tcp_frame(link_type: u32, src: Endpoint, dst: Endpoint, flags: u8, payload_len: usize) -> Vec<u8> {
    let mut builder = ip_builder(link_type, src.0, dst.0).tcp(src.1, dst.1, 1000, 64240);
    if flags & FIN != 0 {
        builder = builder.fin();
    }
    if flags & SYN != 0 {
        builder = builder.syn();
    }
    if flags & RST != 0 {
        builder = builder.rst();
    }
    if flags & PSH != 0 {
        builder = builder.psh();
    }
    if flags & ACK != 0 {
        builder = builder.ack(1);
    }
    let payload = vec![0x61u8; payload_len];
    let mut data = Vec::with_capacity(builder.size(payload_len));
    builder.write(&mut data, &payload).unwrap();
    data
}

pub fn udp_frame(link_type: u32, src: Endpoint, dst: Endpoint, payload_len: usize) -> Vec<u8> {
    let builder = ip_builder(link_type, src.0, dst.0).udp(src.1, dst.1);
    let payload = vec![0x62u8; payload_len];
    let mut data = Vec::with_capacity(builder.size(payload_len));
    builder.write(&mut data, &payload).unwrap();
    data
}

fn ip_builder(link_type: u32, src: [u8; 4], dst: [u8; 4]) -> etherparse::PacketBuilderStep<etherparse::IpHeaders> {
    if link_type == LINKTYPE_ETHERNET {
        PacketBuilder::ethernet2(SRC_MAC, DST_MAC).ipv4(src, dst, 64)
    } else {
        PacketBuilder::ipv4(src, dst, 64)
    }
}

/// Minimal pcapng: section header, one interface, enhanced packet blocks.
pub struct PcapNgFile {
    bytes: Vec<u8>,
}

impl PcapNgFile {
    pub fn new(link_type: u16) -> Self {
        let mut bytes = Vec::new();
        // Section header block
        bytes.extend_from_slice(&0x0a0d0d0au32.to_le_bytes());
        bytes.extend_from_slice(&28u32.to_le_bytes());
        bytes.extend_from_slice(&0x1a2b3c4du32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&(-1i64).to_le_bytes());
        bytes.extend_from_slice(&28u32.to_le_bytes());
        // Interface description block, microsecond resolution by default
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&20u32.to_le_bytes());
        bytes.extend_from_slice(&link_type.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&20u32.to_le_bytes());
        Self { bytes }
    }

    pub fn frame(&mut self, ts: f64, data: &[u8]) -> &mut Self {
        let micros = (ts * 1e6).round() as u64;
        let padded = (data.len() + 3) & !3;
        let block_len = (32 + padded) as u32;
        self.bytes.extend_from_slice(&6u32.to_le_bytes());
        self.bytes.extend_from_slice(&block_len.to_le_bytes());
        self.bytes.extend_from_slice(&0u32.to_le_bytes());
        self.bytes.extend_from_slice(&((micros >> 32) as u32).to_le_bytes());
        self.bytes.extend_from_slice(&(micros as u32).to_le_bytes());
        self.bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(data);
        self.bytes.extend(std::iter::repeat(0u8).take(padded - data.len()));
        self.bytes.extend_from_slice(&block_len.to_le_bytes());
        self
    }

    /// Simple packet block: no interface id and no timestamp.
    pub fn simple(&mut self, data: &[u8]) -> &mut Self {
        let padded = (data.len() + 3) & !3;
        let block_len = (16 + padded) as u32;
        self.bytes.extend_from_slice(&3u32.to_le_bytes());
        self.bytes.extend_from_slice(&block_len.to_le_bytes());
        self.bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(data);
        self.bytes.extend(std::iter::repeat(0u8).take(padded - data.len()));
        self.bytes.extend_from_slice(&block_len.to_le_bytes());
        self
    }

    pub fn write(&self, dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, &self.bytes).unwrap();
        path
    }
}

pub fn client(last: u8, port: u16) -> Endpoint {
    ([10, 0, 0, last], port)
}

pub fn server(last: u8, port: u16) -> Endpoint {
    ([192, 168, 1, last], port)
}
