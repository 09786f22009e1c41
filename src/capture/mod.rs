//! Offline packet source: capture-file framing plus header decoding.

pub mod decode;
pub mod reader;

pub use decode::{decode_frame, LinkType};
pub use reader::{count_packets, CaptureReader};
