use crossbeam_channel::{bounded, unbounded};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, info};

use super::flow::FlowAggregate;
use super::key::{orient, FlowDirection, FlowKey};
use super::publisher::ProgressPublisher;
use super::table::{Closure, FlowTable, PartialFlow};
use crate::config::MeterConfig;
use crate::error::{Error, Result};
use crate::types::{PacketRecord, ProcessingStats, Protocol};

/// How a run ended. Cancellation is a valid outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

/// A worker's view of one chunk.
#[derive(Debug)]
pub struct ChunkResult {
    pub index: usize,
    /// Ordered by flow start time
    pub partials: Vec<PartialFlow>,
    /// Packet and skip counters only; flow counters belong to the table
    pub stats: ProcessingStats,
}

/// Pulls up to `size` packets off the reader. An empty chunk means end of input.
fn read_chunk<I>(packets: &mut I, size: usize) -> Result<Vec<PacketRecord>>
where
    I: Iterator<Item = Result<PacketRecord>>,
{
    let mut chunk = Vec::with_capacity(size);
    for packet in packets.by_ref().take(size) {
        chunk.push(packet?);
    }
    Ok(chunk)
}

/// Single-threaded path: every packet goes straight through the table in file order.
pub fn run_sequential<I>(
    mut packets: I,
    table: &mut FlowTable,
    publisher: &mut ProgressPublisher<'_>,
    config: &MeterConfig,
) -> Result<RunStatus>
where
    I: Iterator<Item = Result<PacketRecord>>,
{
    loop {
        let chunk = read_chunk(&mut packets, config.chunk_size_packets)?;
        if chunk.is_empty() {
            return Ok(RunStatus::Completed);
        }

        for packet in &chunk {
            table.process(packet)?;
            let processed = table.stats().packets_read;
            if !publisher.tick(processed, || table.memory_usage()) {
                info!(processed, "Run cancelled");
                return Ok(RunStatus::Cancelled);
            }
        }
        table.stats_mut().chunks_processed += 1;
        debug!(chunk = table.stats().chunks_processed, active = table.active_flows(), "Chunk processed");
    }
}

/// Builds partial aggregates for one chunk in isolation. No timeout sweep runs
/// here: a flow is only cut when one of its own packets arrives past the
/// timeout, which any other chunk would see the same way.
pub fn build_partials(index: usize, chunk: &[PacketRecord], config: &MeterConfig) -> ChunkResult {
    let timeout = config.inactivity_timeout_secs;
    let mut open: HashMap<FlowKey, FlowAggregate> = HashMap::new();
    let mut partials = Vec::new();
    let mut stats = ProcessingStats::default();

    for packet in chunk {
        stats.packets_read += 1;
        let key = match FlowKey::from_packet(packet) {
            Ok(key) => key,
            Err(reason) => {
                stats.record_skip(reason);
                continue;
            }
        };
        stats.packets_processed += 1;

        let (mut key, mut direction) = orient(key, |k| open.contains_key(k));
        if open.get(&key).is_some_and(|f| f.is_expired(packet.timestamp, timeout)) {
            if let Some(aggregate) = open.remove(&key) {
                partials.push(PartialFlow { aggregate, closure: Closure::Expired });
            }
            if direction == FlowDirection::Backward {
                key = key.reversed();
                direction = FlowDirection::Forward;
            }
        }

        match open.entry(key) {
            Entry::Occupied(e) => e.into_mut().add_packet(packet, direction),
            Entry::Vacant(e) => {
                e.insert(FlowAggregate::new(key, packet, direction, config.storage));
            }
        }

        if config.terminate_on_fin_rst && packet.protocol == Protocol::Tcp && packet.tcp_flags.is_terminating() {
            if let Some(aggregate) = open.remove(&key) {
                partials.push(PartialFlow { aggregate, closure: Closure::Terminated });
            }
        }
    }

    partials.extend(open.into_values().map(|aggregate| PartialFlow { aggregate, closure: Closure::Open }));
    partials.sort_by(|a, b| a.aggregate.flow_start_time.total_cmp(&b.aggregate.flow_start_time));
    stats.chunks_processed = 1;
    ChunkResult { index, partials, stats }
}

/// Parallel path: a pool of workers turns chunks into partial aggregates and
/// this thread stitches them into `table` strictly in chunk order.
pub fn run_parallel<I>(
    mut packets: I,
    table: &mut FlowTable,
    publisher: &mut ProgressPublisher<'_>,
    config: &MeterConfig,
    workers: usize,
) -> Result<RunStatus>
where
    I: Iterator<Item = Result<PacketRecord>>,
{
    let workers = workers.max(1);
    let max_in_flight = workers * 2;

    let outcome = crossbeam::scope(|scope| -> Result<RunStatus> {
        let (chunk_tx, chunk_rx) = bounded::<(usize, Vec<PacketRecord>)>(max_in_flight);
        let (result_tx, result_rx) = unbounded::<std::result::Result<ChunkResult, String>>();

        for i in 0..workers {
            let rx = chunk_rx.clone();
            let tx = result_tx.clone();
            let name = format!("flow-worker-{}", i);
            scope
                .builder()
                .name(name.clone())
                .spawn(move |_| {
                    debug!("{} started", name);
                    for (index, chunk) in rx.iter() {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| build_partials(index, &chunk, config)))
                            .map_err(|_| name.clone());
                        if tx.send(result).is_err() {
                            break;
                        }
                    }
                    debug!("{} stopping", name);
                })
                .map_err(Error::Spawn)?;
        }
        drop(chunk_rx);
        drop(result_tx);

        let mut pending: BTreeMap<usize, ChunkResult> = BTreeMap::new();
        let mut next_send = 0usize;
        let mut next_absorb = 0usize;
        let mut exhausted = false;

        loop {
            while !exhausted && next_send - next_absorb < max_in_flight {
                let chunk = read_chunk(&mut packets, config.chunk_size_packets)?;
                if chunk.is_empty() {
                    exhausted = true;
                    break;
                }
                if chunk_tx.send((next_send, chunk)).is_err() {
                    return Err(Error::WorkerPanicked { worker: "flow-worker pool".to_string() });
                }
                next_send += 1;
            }
            if next_absorb == next_send {
                return Ok(RunStatus::Completed);
            }

            let result = match result_rx.recv() {
                Ok(Ok(result)) => result,
                Ok(Err(worker)) => return Err(Error::WorkerPanicked { worker }),
                Err(_) => return Err(Error::WorkerPanicked { worker: "flow-worker pool".to_string() }),
            };
            pending.insert(result.index, result);

            // Out-of-order results wait until every earlier chunk is in
            while let Some(result) = pending.remove(&next_absorb) {
                next_absorb += 1;
                let partials = result.partials.len();
                table.stats_mut().absorb(&result.stats);
                for partial in result.partials {
                    table.absorb(partial)?;
                }
                table.maintain()?;
                debug!(chunk = result.index, partials, active = table.active_flows(), "Chunk merged");

                let processed = table.stats().packets_read;
                if !publisher.tick(processed, || table.memory_usage()) {
                    info!(processed, "Run cancelled");
                    return Ok(RunStatus::Cancelled);
                }
            }
        }
    });

    match outcome {
        Ok(status) => status,
        Err(_) => Err(Error::WorkerPanicked { worker: "flow-worker pool".to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::publisher::CancellationToken;
    use crate::types::TcpFlags;
    use std::net::{IpAddr, Ipv4Addr};

    fn host(last: u8, port: u16) -> (IpAddr, u16) {
        (IpAddr::V4(Ipv4Addr::new(10, 9, 8, last)), port)
    }

    /// A few interleaved conversations, the first reply of each landing in a
    /// different chunk than its request when chunks are small.
    fn traffic() -> Vec<PacketRecord> {
        let mut packets = Vec::new();
        for i in 0..30u32 {
            let ts = i as f64 * 0.05;
            let client = host(1 + (i % 3) as u8, 40000 + (i % 3) as u16);
            let server = host(100, 443);
            let flags = if i < 3 { TcpFlags::SYN } else { TcpFlags::ACK };
            if i % 2 == 0 {
                packets.push(PacketRecord::tcp(ts, client, server, 100 + i, 40 + i, flags, 1000));
            } else {
                packets.push(PacketRecord::tcp(ts, server, client, 1500, 1448, flags | TcpFlags::ACK, 2000));
            }
        }
        packets.push(PacketRecord::non_ip(2.0, 60));
        packets
    }

    fn config(chunk: usize) -> MeterConfig {
        MeterConfig {
            chunk_size_packets: chunk,
            inactivity_timeout_secs: 10.0,
            ..Default::default()
        }
    }

    fn run(chunk: usize, workers: usize) -> (Vec<crate::processor::FlowRecord>, ProcessingStats) {
        let config = config(chunk);
        let mut table = FlowTable::new(&config);
        let mut publisher = ProgressPublisher::new(1000, 0, None, CancellationToken::new());
        let packets = traffic().into_iter().map(Ok);
        let status = if workers == 1 {
            run_sequential(packets, &mut table, &mut publisher, &config).unwrap()
        } else {
            run_parallel(packets, &mut table, &mut publisher, &config, workers).unwrap()
        };
        assert_eq!(status, RunStatus::Completed);
        table.finish().unwrap()
    }

    #[test]
    fn test_chunk_keeps_flows_open() {
        let packets = traffic();
        let result = build_partials(0, &packets, &config(100));
        assert_eq!(result.partials.len(), 3);
        assert!(result.partials.iter().all(|p| p.closure == Closure::Open));
        assert_eq!(result.stats.packets_read, 31);
        assert_eq!(result.stats.skipped_no_network, 1);
        assert!(result
            .partials
            .windows(2)
            .all(|w| w[0].aggregate.flow_start_time <= w[1].aggregate.flow_start_time));
    }

    #[test]
    fn test_chunk_seals_terminated_flow() {
        let (a, b) = (host(1, 1000), host(2, 80));
        let packets = vec![
            PacketRecord::tcp(0.0, a, b, 60, 0, TcpFlags::SYN, 1),
            PacketRecord::tcp(0.1, b, a, 60, 0, TcpFlags::RST, 1),
            PacketRecord::tcp(0.2, a, b, 60, 0, TcpFlags::SYN, 1),
        ];
        let config = MeterConfig { terminate_on_fin_rst: true, ..config(10) };
        let result = build_partials(0, &packets, &config);
        let closures: Vec<_> = result.partials.iter().map(|p| p.closure).collect();
        assert_eq!(closures, vec![Closure::Terminated, Closure::Open]);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let (sequential, seq_stats) = run(1000, 1);
        for (chunk, workers) in [(4, 2), (7, 3), (1, 4)] {
            let (parallel, par_stats) = run(chunk, workers);
            assert_eq!(parallel.len(), sequential.len());
            assert_eq!(par_stats.packets_read, seq_stats.packets_read);
            assert_eq!(par_stats.packets_skipped(), seq_stats.packets_skipped());
            for (p, s) in parallel.iter().zip(&sequential) {
                assert_eq!(p.key(), s.key());
                assert_eq!((p.tot_fwd_pkts, p.tot_bwd_pkts), (s.tot_fwd_pkts, s.tot_bwd_pkts));
                assert_eq!((p.totlen_fwd_pkts, p.totlen_bwd_pkts), (s.totlen_fwd_pkts, s.totlen_bwd_pkts));
                assert_eq!(p.flow_duration, s.flow_duration);
                assert!((p.flow_iat_mean - s.flow_iat_mean).abs() < 1e-9);
                assert!((p.fwd_iat_tot - s.fwd_iat_tot).abs() < 1e-9);
                assert_eq!(p.init_bwd_win_byts, s.init_bwd_win_byts);
                assert_eq!(p.syn_flag_cnt, s.syn_flag_cnt);
            }
        }
    }

    #[test]
    fn test_sequential_cancel_returns_partial() {
        let config = config(5);
        let mut table = FlowTable::new(&config);
        let mut publisher = ProgressPublisher::new(10, 31, Some(Box::new(|p: &crate::types::Progress| p.packets_processed < 10)), CancellationToken::new());
        let status = run_sequential(traffic().into_iter().map(Ok), &mut table, &mut publisher, &config).unwrap();
        assert_eq!(status, RunStatus::Cancelled);
        let (records, stats) = table.finish().unwrap();
        assert_eq!(stats.packets_read, 10);
        assert_eq!(records.iter().map(|r| r.tot_pkts).sum::<u64>(), 10);
    }

    #[test]
    fn test_reader_error_stops_run() {
        let config = config(4);
        let mut table = FlowTable::new(&config);
        let mut publisher = ProgressPublisher::new(10, 0, None, CancellationToken::new());
        let mut packets: Vec<Result<PacketRecord>> = traffic().into_iter().take(6).map(Ok).collect();
        packets.push(Err(crate::error::CaptureError::Malformed { frame: 7, reason: "truncated".into() }.into()));
        let err = run_parallel(packets.into_iter(), &mut table, &mut publisher, &config, 2).unwrap_err();
        assert!(matches!(err, Error::Capture(_)));
    }
}
