//! Offline capture reader over pcap and pcapng files.
//!
//! Framing is handled by `pcap_parser`; each frame is decoded into a
//! [`PacketRecord`] as it is pulled, so the whole file is never in memory.

use pcap_parser::pcapng::Block;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::decode::{decode_frame, LinkType};
use crate::error::{CaptureError, Result};
use crate::types::PacketRecord;

/// Parser buffer; must hold one whole block, so it covers snaplen 262144.
const BUFFER_SIZE: usize = 1 << 20;

/// Timestamp scale of one pcapng interface.
#[derive(Debug, Clone, Copy)]
struct Interface {
    link: LinkType,
    units_per_sec: f64,
    offset_secs: f64,
}

impl Interface {
    /// `if_tsresol`: high bit clear is a power of ten, set is a power of two.
    fn new(link: LinkType, tsresol: u8, tsoffset: i64) -> Self {
        let exponent = (tsresol & 0x7f) as i32;
        let units_per_sec = if tsresol & 0x80 == 0 { 10f64.powi(exponent) } else { 2f64.powi(exponent) };
        Self {
            link,
            units_per_sec,
            offset_secs: tsoffset as f64,
        }
    }
}

enum ReaderInner {
    Legacy {
        reader: LegacyPcapReader<File>,
        link: Option<LinkType>,
        nanosecond: bool,
    },
    Ng {
        reader: PcapNGReader<File>,
        interfaces: Vec<Interface>,
        /// Simple packet blocks carry no time; they inherit the previous packet's
        last_ts: f64,
    },
}

/// Streams [`PacketRecord`]s out of a capture file.
pub struct CaptureReader {
    inner: ReaderInner,
    path: PathBuf,
    frame: u64,
    done: bool,
}

impl CaptureReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CaptureError::FileNotFound { path: path.to_path_buf() }.into());
        }
        let mut file = File::open(path).map_err(CaptureError::Io)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic).map_err(|_| CaptureError::InvalidFormat {
            reason: "File too small for a capture header".into(),
        })?;
        file.seek(SeekFrom::Start(0)).map_err(CaptureError::Io)?;

        let inner = match u32::from_le_bytes(magic) {
            0x0a0d0d0a => {
                let reader = PcapNGReader::new(BUFFER_SIZE, file).map_err(|e| CaptureError::InvalidFormat {
                    reason: format!("Failed to parse pcapng: {}", e),
                })?;
                ReaderInner::Ng {
                    reader,
                    interfaces: Vec::new(),
                    last_ts: 0.0,
                }
            }
            0xa1b2c3d4 | 0xd4c3b2a1 | 0xa1b23c4d | 0x4d3cb2a1 => {
                let reader = LegacyPcapReader::new(BUFFER_SIZE, file).map_err(|e| CaptureError::InvalidFormat {
                    reason: format!("Failed to parse pcap: {}", e),
                })?;
                ReaderInner::Legacy { reader, link: None, nanosecond: false }
            }
            other => {
                return Err(CaptureError::InvalidFormat {
                    reason: format!("Unknown capture magic: 0x{:08x}", other),
                }
                .into())
            }
        };

        debug!(path = %path.display(), "Opened capture");
        Ok(Self {
            inner,
            path: path.to_path_buf(),
            frame: 0,
            done: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames read so far.
    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    fn malformed(&self, reason: String) -> CaptureError {
        CaptureError::Malformed { frame: self.frame + 1, reason }
    }

    fn next_packet(&mut self) -> std::result::Result<Option<PacketRecord>, CaptureError> {
        loop {
            let step = match &mut self.inner {
                ReaderInner::Legacy { reader, link, nanosecond } => match reader.next() {
                    Ok((offset, block)) => {
                        let out = match block {
                            PcapBlockOwned::LegacyHeader(header) => {
                                *link = Some(LinkType::from_code(header.network.0)?);
                                *nanosecond = header.is_nanosecond_precision();
                                None
                            }
                            PcapBlockOwned::Legacy(packet) => {
                                let scale = if *nanosecond { 1e-9 } else { 1e-6 };
                                let ts = packet.ts_sec as f64 + packet.ts_usec as f64 * scale;
                                let link = link.unwrap_or(LinkType::Ethernet);
                                Some(decode_frame(link, ts, packet.origlen, packet.data))
                            }
                            _ => None,
                        };
                        reader.consume(offset);
                        Ok(out)
                    }
                    Err(e) => Err(e),
                },
                ReaderInner::Ng { reader, interfaces, last_ts } => match reader.next() {
                    Ok((offset, block)) => {
                        let out = match block {
                            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                                // Interface ids restart with every section
                                interfaces.clear();
                                None
                            }
                            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                                let link = LinkType::from_code(idb.linktype.0)?;
                                interfaces.push(Interface::new(link, idb.if_tsresol, idb.if_tsoffset));
                                None
                            }
                            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                                let iface = interfaces
                                    .get(epb.if_id as usize)
                                    .copied()
                                    .unwrap_or_else(|| Interface::new(LinkType::Ethernet, 6, 0));
                                let raw = ((epb.ts_high as u64) << 32) | epb.ts_low as u64;
                                let ts = raw as f64 / iface.units_per_sec + iface.offset_secs;
                                *last_ts = ts;
                                Some(decode_frame(iface.link, ts, epb.origlen, epb.data))
                            }
                            PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                                let link = interfaces.first().map_or(LinkType::Ethernet, |i| i.link);
                                Some(decode_frame(link, *last_ts, spb.origlen, spb.data))
                            }
                            _ => None,
                        };
                        reader.consume(offset);
                        Ok(out)
                    }
                    Err(e) => Err(e),
                },
            };

            match step {
                Ok(Some(packet)) => {
                    self.frame += 1;
                    return Ok(Some(packet));
                }
                Ok(None) => continue,
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    let refilled = match &mut self.inner {
                        ReaderInner::Legacy { reader, .. } => reader.refill(),
                        ReaderInner::Ng { reader, .. } => reader.refill(),
                    };
                    if let Err(e) = refilled {
                        let reason = format!("refill failed: {}", e);
                        return Err(self.malformed(reason));
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    return Err(self.malformed(reason));
                }
            }
        }
    }
}

impl Iterator for CaptureReader {
    type Item = Result<PacketRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_packet() {
            Ok(Some(packet)) => Some(Ok(packet)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}

/// Reads the whole file once, counting frames. Any framing problem surfaces
/// here, before flow processing starts.
pub fn count_packets<P: AsRef<Path>>(path: P) -> Result<u64> {
    let mut reader = CaptureReader::open(path)?;
    for packet in reader.by_ref() {
        packet?;
    }
    let count = reader.frame_count();
    debug!(path = %reader.path().display(), frames = count, "Counted capture frames");
    Ok(count)
}
