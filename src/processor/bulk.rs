use serde::{Deserialize, Serialize};

/// Packets a clump needs before it counts as a bulk transfer.
pub const BULK_BOUND: u32 = 4;
/// Largest gap, in seconds, between two packets of the same clump.
pub const CLUMP_TIMEOUT: f64 = 1.0;

/// Bulk transfer tracking for one direction of a flow.
///
/// A clump is a run of payload-carrying packets in one direction. A clump is
/// open while `clump_packet_count > 0`; timestamps are never used as markers,
/// so captures starting at t=0 behave like any other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkState {
    pub last_clump_timestamp: f64,
    pub clump_start_time: f64,
    pub clump_packet_count: u32,
    pub clump_byte_count: u64,
    pub completed_bulk_count: u64,
    pub completed_bulk_packet_count: u64,
    pub completed_bulk_byte_count: u64,
    pub completed_bulk_duration: f64,
}

impl BulkState {
    /// Feeds one packet of this direction. `other_last_timestamp` is the last
    /// clump activity of the opposite direction; a reply seen after our clump
    /// opened breaks the clump.
    pub fn on_packet(&mut self, other_last_timestamp: f64, timestamp: f64, payload_size: u32) {
        if payload_size == 0 {
            return;
        }
        let payload = payload_size as u64;

        if self.is_open() && other_last_timestamp > self.clump_start_time {
            self.clump_packet_count = 0;
            self.clump_byte_count = 0;
        }

        if !self.is_open() || timestamp - self.last_clump_timestamp > CLUMP_TIMEOUT {
            // Fresh clump; an expired one is dropped without being committed
            self.open_clump(timestamp, payload);
            return;
        }

        self.clump_packet_count += 1;
        self.clump_byte_count += payload;

        if self.clump_packet_count == BULK_BOUND {
            self.completed_bulk_count += 1;
            self.completed_bulk_packet_count += self.clump_packet_count as u64;
            self.completed_bulk_byte_count += self.clump_byte_count;
            self.completed_bulk_duration += timestamp - self.clump_start_time;
        } else if self.clump_packet_count > BULK_BOUND {
            // Already committed: grow the same bulk transfer one packet at a time
            self.completed_bulk_packet_count += 1;
            self.completed_bulk_byte_count += payload;
            self.completed_bulk_duration += timestamp - self.last_clump_timestamp;
        }

        self.last_clump_timestamp = timestamp;
    }

    pub fn is_open(&self) -> bool {
        self.clump_packet_count > 0
    }

    fn open_clump(&mut self, timestamp: f64, payload: u64) {
        self.clump_start_time = timestamp;
        self.last_clump_timestamp = timestamp;
        self.clump_packet_count = 1;
        self.clump_byte_count = payload;
    }

    /// Adds the completed totals of a later partial state. The open clump of the
    /// later state wins; clumps straddling the seam are not stitched.
    pub fn merge(&mut self, later: &BulkState) {
        self.completed_bulk_count += later.completed_bulk_count;
        self.completed_bulk_packet_count += later.completed_bulk_packet_count;
        self.completed_bulk_byte_count += later.completed_bulk_byte_count;
        self.completed_bulk_duration += later.completed_bulk_duration;
        if later.is_open() {
            self.clump_start_time = later.clump_start_time;
            self.last_clump_timestamp = later.last_clump_timestamp;
            self.clump_packet_count = later.clump_packet_count;
            self.clump_byte_count = later.clump_byte_count;
        }
    }

    pub fn average_bytes_per_bulk(&self) -> f64 {
        if self.completed_bulk_count == 0 {
            return 0.0;
        }
        self.completed_bulk_byte_count as f64 / self.completed_bulk_count as f64
    }

    pub fn average_packets_per_bulk(&self) -> f64 {
        if self.completed_bulk_count == 0 {
            return 0.0;
        }
        self.completed_bulk_packet_count as f64 / self.completed_bulk_count as f64
    }

    /// Bytes per second across all completed bulks.
    pub fn average_bulk_rate(&self) -> f64 {
        if self.completed_bulk_count == 0 || self.completed_bulk_duration <= super::record::DURATION_EPSILON {
            return 0.0;
        }
        self.completed_bulk_byte_count as f64 / self.completed_bulk_duration
    }
}

/// Both directions; they have to see each other for cross-direction invalidation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkDetector {
    pub forward: BulkState,
    pub backward: BulkState,
}

impl BulkDetector {
    pub fn on_packet(&mut self, direction: super::FlowDirection, timestamp: f64, payload_size: u32) {
        match direction {
            super::FlowDirection::Forward => {
                let other = self.backward.last_clump_timestamp;
                self.forward.on_packet(other, timestamp, payload_size);
            }
            super::FlowDirection::Backward => {
                let other = self.forward.last_clump_timestamp;
                self.backward.on_packet(other, timestamp, payload_size);
            }
        }
    }

    pub fn state(&self, direction: super::FlowDirection) -> &BulkState {
        match direction {
            super::FlowDirection::Forward => &self.forward,
            super::FlowDirection::Backward => &self.backward,
        }
    }

    pub fn swap_directions(&mut self) {
        std::mem::swap(&mut self.forward, &mut self.backward);
    }

    pub fn merge(&mut self, later: &BulkDetector) {
        self.forward.merge(&later.forward);
        self.backward.merge(&later.backward);
    }
}
