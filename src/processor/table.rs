use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

use super::flow::FlowAggregate;
use super::key::{orient, FlowDirection, FlowKey};
use super::record::{finalize, sort_records, FlowRecord};
use super::spill::SpillStore;
use super::stats::SampleStorage;
use crate::config::MeterConfig;
use crate::error::Result;
use crate::types::{PacketRecord, ProcessingStats, Protocol};

/// Why a worker stopped feeding a partial aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// Still open when the chunk ended
    Open,
    /// FIN or RST seen
    Terminated,
    /// A later packet of the same key arrived after the inactivity timeout
    Expired,
}

/// One flow's packets from a single chunk, built without any knowledge of
/// the other chunks.
#[derive(Debug, Clone)]
pub struct PartialFlow {
    pub aggregate: FlowAggregate,
    pub closure: Closure,
}

/// The active flow map plus its garbage collection policy.
pub struct FlowTable {
    flows: HashMap<FlowKey, FlowAggregate>,
    /// Finalized records not yet handed out
    completed: Vec<FlowRecord>,
    spill: SpillStore,
    stats: ProcessingStats,

    timeout: f64,
    terminate_on_fin_rst: bool,
    max_active_flows: usize,
    memory_limit: Option<u64>,
    gc_interval: u64,
    storage: SampleStorage,

    /// Latest packet time seen, the reference for expiry sweeps
    clock: f64,
    since_gc: u64,
}

impl FlowTable {
    pub fn new(config: &MeterConfig) -> Self {
        Self {
            flows: HashMap::new(),
            completed: Vec::new(),
            spill: SpillStore::new(config.spill_dir.as_deref()),
            stats: ProcessingStats::default(),
            timeout: config.inactivity_timeout_secs,
            terminate_on_fin_rst: config.terminate_on_fin_rst,
            max_active_flows: config.max_active_flows,
            memory_limit: config.memory_limit_bytes(),
            gc_interval: config.gc_interval_packets,
            storage: config.storage,
            clock: f64::NEG_INFINITY,
            since_gc: 0,
        }
    }

    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    pub fn stats(&self) -> &ProcessingStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut ProcessingStats {
        &mut self.stats
    }

    pub fn get(&self, key: &FlowKey) -> Option<&FlowAggregate> {
        self.flows.get(key)
    }

    /// Approximate bytes held by active flows and unflushed records.
    pub fn memory_usage(&self) -> u64 {
        let flows: usize = self.flows.values().map(FlowAggregate::approx_memory_bytes).sum();
        let overhead = self.flows.capacity() * std::mem::size_of::<FlowKey>();
        let records = self.completed.capacity() * std::mem::size_of::<FlowRecord>();
        (flows + overhead + records) as u64
    }

    /// Routes one packet to its flow.
    pub fn process(&mut self, packet: &PacketRecord) -> Result<()> {
        self.stats.packets_read += 1;

        let key = match FlowKey::from_packet(packet) {
            Ok(key) => key,
            Err(reason) => {
                trace!(?reason, timestamp = packet.timestamp, "Skipping packet");
                self.stats.record_skip(reason);
                return Ok(());
            }
        };
        self.stats.packets_processed += 1;
        self.clock = self.clock.max(packet.timestamp);

        let (mut key, mut direction) = orient(key, |k| self.flows.contains_key(k));

        // A packet past the timeout closes the old flow and opens a new one
        if self.flows.get(&key).is_some_and(|f| f.is_expired(packet.timestamp, self.timeout)) {
            self.close(&key);
            self.stats.flows_expired += 1;
            if direction == FlowDirection::Backward {
                key = key.reversed();
                direction = FlowDirection::Forward;
            }
        }

        match self.flows.entry(key) {
            Entry::Occupied(e) => e.into_mut().add_packet(packet, direction),
            Entry::Vacant(e) => {
                e.insert(FlowAggregate::new(key, packet, direction, self.storage));
                self.stats.flows_created += 1;
            }
        }

        if self.terminate_on_fin_rst && packet.protocol == Protocol::Tcp && packet.tcp_flags.is_terminating() {
            self.close(&key);
            self.stats.flows_terminated += 1;
        }

        self.since_gc += 1;
        if self.since_gc >= self.gc_interval {
            self.maintain()?;
        } else if self.flows.len() > self.max_active_flows {
            self.spill_oldest()?;
        }
        Ok(())
    }

    /// Folds in a partial aggregate from a worker. Partials must arrive in
    /// chunk order, and in start time order within a chunk.
    pub fn absorb(&mut self, partial: PartialFlow) -> Result<()> {
        let PartialFlow { aggregate, closure } = partial;
        let (key, _) = orient(aggregate.key, |k| self.flows.contains_key(k));
        self.clock = self.clock.max(aggregate.last_seen_time);

        let continues = self
            .flows
            .get(&key)
            .map(|existing| aggregate.flow_start_time - existing.last_seen_time <= self.timeout);

        let key = match continues {
            Some(true) => {
                if let Some(existing) = self.flows.get_mut(&key) {
                    existing.merge(aggregate);
                }
                key
            }
            Some(false) => {
                self.close(&key);
                self.stats.flows_expired += 1;
                self.insert_new(aggregate)
            }
            None => self.insert_new(aggregate),
        };

        match closure {
            Closure::Open => {}
            Closure::Terminated => {
                self.close(&key);
                self.stats.flows_terminated += 1;
            }
            Closure::Expired => {
                self.close(&key);
                self.stats.flows_expired += 1;
            }
        }
        Ok(())
    }

    fn insert_new(&mut self, aggregate: FlowAggregate) -> FlowKey {
        let key = aggregate.key;
        self.flows.insert(key, aggregate);
        self.stats.flows_created += 1;
        key
    }

    fn close(&mut self, key: &FlowKey) {
        if let Some(flow) = self.flows.remove(key) {
            self.completed.push(finalize(&flow));
        }
    }

    /// Finalizes and removes every flow idle for longer than the timeout at `now`.
    pub fn expire_due(&mut self, now: f64) -> Vec<FlowRecord> {
        let timeout = self.timeout;
        let mut expired = Vec::new();
        self.flows.retain(|_, flow| {
            let keep = !flow.is_expired(now, timeout);
            if !keep {
                expired.push(finalize(flow));
            }
            keep
        });
        self.stats.flows_expired += expired.len() as u64;
        expired
    }

    /// Finalizes every active flow, leaving the table empty.
    pub fn flush_all(&mut self) -> Vec<FlowRecord> {
        self.flows.drain().map(|(_, flow)| finalize(&flow)).collect()
    }

    /// Periodic sweep: timeouts first, then the memory bounds.
    pub fn maintain(&mut self) -> Result<()> {
        self.since_gc = 0;
        if self.clock.is_finite() {
            let expired = self.expire_due(self.clock);
            if !expired.is_empty() {
                trace!(count = expired.len(), now = self.clock, "Expired idle flows");
            }
            self.completed.extend(expired);
        }

        let over_count = self.flows.len() > self.max_active_flows;
        let over_memory = self.memory_limit.is_some_and(|limit| self.memory_usage() > limit);
        if over_count || over_memory {
            self.spill_oldest()?;
        }
        Ok(())
    }

    /// Writes the least recently seen half of the table, plus anything already
    /// finalized, to the spill store.
    fn spill_oldest(&mut self) -> Result<()> {
        let mut by_age: Vec<(f64, FlowKey)> = self.flows.iter().map(|(k, f)| (f.last_seen_time, *k)).collect();
        by_age.sort_by(|a, b| a.0.total_cmp(&b.0));
        let evict = (by_age.len() / 2).max(1).min(by_age.len());

        let mut batch = std::mem::take(&mut self.completed);
        for (_, key) in by_age.into_iter().take(evict) {
            if let Some(flow) = self.flows.remove(&key) {
                batch.push(finalize(&flow));
            }
        }

        warn!(
            evicted = evict,
            remaining = self.flows.len(),
            packet = self.stats.packets_read,
            "Flow table over budget, spilling oldest flows"
        );
        self.spill.write_batch(&batch, self.stats.packets_read)?;
        self.stats.flows_spilled += evict as u64;
        self.stats.spill_batches = self.spill.batches();
        Ok(())
    }

    /// Ends the run: spilled batches, closed flows and every still-active flow,
    /// in output order.
    pub fn finish(mut self) -> Result<(Vec<FlowRecord>, ProcessingStats)> {
        let mut records = self.spill.drain(self.stats.packets_read)?;
        debug!(spilled = records.len(), closed = self.completed.len(), active = self.flows.len(), "Merging flow records");
        records.append(&mut self.completed);
        records.extend(self.flush_all());
        sort_records(&mut records);
        Ok((records, self.stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TcpFlags;
    use std::net::{IpAddr, Ipv4Addr};

    fn host(last: u8, port: u16) -> (IpAddr, u16) {
        (IpAddr::V4(Ipv4Addr::new(192, 168, 0, last)), port)
    }

    fn config() -> MeterConfig {
        MeterConfig {
            inactivity_timeout_secs: 10.0,
            gc_interval_packets: 1,
            ..Default::default()
        }
    }

    fn tcp(ts: f64, src: (IpAddr, u16), dst: (IpAddr, u16), flags: TcpFlags) -> PacketRecord {
        PacketRecord::tcp(ts, src, dst, 60, 0, flags, 1024)
    }

    #[test]
    fn test_reply_joins_flow_backward() {
        let mut table = FlowTable::new(&config());
        let (a, b) = (host(1, 5000), host(2, 80));
        table.process(&tcp(0.0, a, b, TcpFlags::SYN)).unwrap();
        table.process(&tcp(0.1, b, a, TcpFlags::SYN | TcpFlags::ACK)).unwrap();
        table.process(&tcp(0.2, a, b, TcpFlags::ACK)).unwrap();

        assert_eq!(table.active_flows(), 1);
        let key = FlowKey::new(a.0, b.0, a.1, b.1, 6);
        let flow = table.get(&key).unwrap();
        assert_eq!(flow.direction(FlowDirection::Forward).packet_count, 2);
        assert_eq!(flow.direction(FlowDirection::Backward).packet_count, 1);
    }

    #[test]
    fn test_skipped_packets_are_counted() {
        let mut table = FlowTable::new(&config());
        table.process(&PacketRecord::non_ip(0.0, 42)).unwrap();
        let mut truncated = tcp(0.0, host(1, 1), host(2, 2), TcpFlags::SYN);
        truncated.ports = None;
        table.process(&truncated).unwrap();

        let stats = table.stats();
        assert_eq!(stats.packets_read, 2);
        assert_eq!(stats.packets_processed, 0);
        assert_eq!(stats.skipped_no_network, 1);
        assert_eq!(stats.skipped_missing_transport, 1);
        assert_eq!(table.active_flows(), 0);
    }

    #[test]
    fn test_expire_due_boundary() {
        let mut table = FlowTable::new(&MeterConfig { gc_interval_packets: 1000, ..config() });
        table.process(&tcp(0.0, host(1, 1), host(2, 2), TcpFlags::ACK)).unwrap();
        assert!(table.expire_due(9.9).is_empty());
        assert_eq!(table.active_flows(), 1);
        let expired = table.expire_due(10.1);
        assert_eq!(expired.len(), 1);
        assert_eq!(table.active_flows(), 0);
        assert_eq!(table.stats().flows_expired, 1);
    }

    #[test]
    fn test_late_reply_opens_new_flow_in_its_own_direction() {
        let mut table = FlowTable::new(&MeterConfig { gc_interval_packets: 1000, ..config() });
        let (a, b) = (host(1, 5000), host(2, 80));
        table.process(&tcp(0.0, a, b, TcpFlags::ACK)).unwrap();
        table.process(&tcp(30.0, b, a, TcpFlags::ACK)).unwrap();

        let (records, stats) = table.finish().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(stats.flows_expired, 1);
        assert_eq!((records[1].src_ip, records[1].src_port), b);
        assert_eq!(records[1].tot_fwd_pkts, 1);
        assert_eq!(records[1].tot_bwd_pkts, 0);
    }

    #[test]
    fn test_fin_terminates_when_enabled() {
        let (a, b) = (host(1, 5000), host(2, 80));
        let packets = [
            tcp(0.0, a, b, TcpFlags::SYN),
            tcp(0.1, b, a, TcpFlags::FIN | TcpFlags::ACK),
            tcp(0.2, a, b, TcpFlags::ACK),
        ];

        let mut table = FlowTable::new(&MeterConfig { terminate_on_fin_rst: true, ..config() });
        for p in &packets {
            table.process(p).unwrap();
        }
        let (records, stats) = table.finish().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(stats.flows_terminated, 1);
        assert_eq!(records[0].fin_flag_cnt, 1);

        let mut table = FlowTable::new(&config());
        for p in &packets {
            table.process(p).unwrap();
        }
        let (records, stats) = table.finish().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(stats.flows_terminated, 0);
        assert_eq!(records[0].tot_pkts, 3);
    }

    #[test]
    fn test_spill_keeps_every_packet() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = FlowTable::new(&MeterConfig {
            max_active_flows: 4,
            gc_interval_packets: 1000,
            spill_dir: Some(dir.path().to_path_buf()),
            ..config()
        });
        for i in 0..20u16 {
            let pkt = PacketRecord::udp(i as f64 * 0.01, host(1, 1000 + i), host(2, 53), 70, 28);
            table.process(&pkt).unwrap();
            assert!(table.active_flows() <= 4);
        }
        let (records, stats) = table.finish().unwrap();
        assert_eq!(records.len(), 20);
        assert!(stats.spill_batches > 0);
        assert!(stats.flows_spilled > 0);
        assert_eq!(records.iter().map(|r| r.tot_pkts).sum::<u64>(), 20);
        assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_memory_bound_spills_full_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = FlowTable::new(&MeterConfig {
            max_memory_mb: 1,
            storage: SampleStorage::Full,
            gc_interval_packets: 1000,
            spill_dir: Some(dir.path().to_path_buf()),
            ..config()
        });
        // Roughly four samples per packet, well past 1 MiB across the run
        let total = 48_000u64;
        for i in 0..total {
            let port = 2000 + (i % 16) as u16;
            let pkt = PacketRecord::udp(i as f64 * 0.001, host(1, port), host(2, 53), 90, 48);
            table.process(&pkt).unwrap();
        }
        assert!(table.active_flows() <= 16);

        let (records, stats) = table.finish().unwrap();
        assert!(stats.flows_spilled > 0);
        assert!(stats.spill_batches > 0);
        assert_eq!(records.iter().map(|r| r.tot_pkts).sum::<u64>(), total);
        assert!(records.len() > 16);
    }

    #[test]
    fn test_memory_bound_disabled_keeps_flows_in_memory() {
        let mut table = FlowTable::new(&MeterConfig {
            max_memory_mb: 0,
            storage: SampleStorage::Full,
            gc_interval_packets: 100,
            ..config()
        });
        for i in 0..5_000u64 {
            let pkt = PacketRecord::udp(i as f64 * 0.001, host(1, 2000 + (i % 4) as u16), host(2, 53), 90, 48);
            table.process(&pkt).unwrap();
        }
        assert_eq!(table.active_flows(), 4);
        assert_eq!(table.stats().flows_spilled, 0);
    }

    #[test]
    fn test_spilled_flow_restarts_on_new_packet() {
        let mut table = FlowTable::new(&MeterConfig { max_active_flows: 1, gc_interval_packets: 1000, ..config() });
        let (a, b, c) = (host(1, 1), host(2, 2), host(3, 3));
        table.process(&PacketRecord::udp(0.0, a, b, 60, 18)).unwrap();
        table.process(&PacketRecord::udp(0.1, c, b, 60, 18)).unwrap();
        // a->b was the oldest and went to disk
        table.process(&PacketRecord::udp(0.2, a, b, 60, 18)).unwrap();

        let (records, _) = table.finish().unwrap();
        let ab: Vec<_> = records.iter().filter(|r| r.src_port == 1).collect();
        assert_eq!(ab.len(), 2);
        assert!(ab.iter().all(|r| r.tot_pkts == 1));
    }

    #[test]
    fn test_absorb_flips_reversed_partial() {
        let mut table = FlowTable::new(&config());
        let (a, b) = (host(1, 5000), host(2, 80));
        let first = tcp(0.0, a, b, TcpFlags::SYN);
        let reply = tcp(0.1, b, a, TcpFlags::SYN | TcpFlags::ACK);

        let key = FlowKey::new(a.0, b.0, a.1, b.1, 6);
        table
            .absorb(PartialFlow {
                aggregate: FlowAggregate::new(key, &first, FlowDirection::Forward, SampleStorage::Moments),
                closure: Closure::Open,
            })
            .unwrap();
        table
            .absorb(PartialFlow {
                aggregate: FlowAggregate::new(key.reversed(), &reply, FlowDirection::Forward, SampleStorage::Moments),
                closure: Closure::Open,
            })
            .unwrap();

        assert_eq!(table.active_flows(), 1);
        let flow = table.get(&key).unwrap();
        assert_eq!(flow.direction(FlowDirection::Forward).packet_count, 1);
        assert_eq!(flow.direction(FlowDirection::Backward).packet_count, 1);
        assert_eq!(flow.flow_iat.len(), 1);
    }

    #[test]
    fn test_absorb_gap_over_timeout_starts_new_flow() {
        let mut table = FlowTable::new(&config());
        let (a, b) = (host(1, 5000), host(2, 80));
        let key = FlowKey::new(a.0, b.0, a.1, b.1, 17);
        for ts in [0.0, 50.0] {
            let pkt = PacketRecord::udp(ts, a, b, 60, 18);
            table
                .absorb(PartialFlow {
                    aggregate: FlowAggregate::new(key, &pkt, FlowDirection::Forward, SampleStorage::Moments),
                    closure: Closure::Open,
                })
                .unwrap();
        }
        let (records, stats) = table.finish().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(stats.flows_created, 2);
        assert_eq!(stats.flows_expired, 1);
    }
}
