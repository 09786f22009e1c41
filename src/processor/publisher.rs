use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::types::Progress;

/// Callback fed with progress snapshots. Returning `false` cancels the run.
pub type ProgressCallback<'a> = Box<dyn FnMut(&Progress) -> bool + 'a>;

/// Cooperative stop signal, shared between the caller and the pipeline.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Reports progress every `interval` packets and answers whether to go on.
pub struct ProgressPublisher<'a> {
    callback: Option<ProgressCallback<'a>>,
    token: CancellationToken,
    interval: u64,
    next_at: u64,
    total: u64,
    last_published: Option<u64>,
    started: Instant,
}

impl<'a> ProgressPublisher<'a> {
    pub fn new(interval: u64, total: u64, callback: Option<ProgressCallback<'a>>, token: CancellationToken) -> Self {
        let interval = interval.max(1);
        Self {
            callback,
            token,
            interval,
            next_at: interval,
            total,
            last_published: None,
            started: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Cheap between interval boundaries; `memory` is only evaluated when a
    /// snapshot is actually published.
    pub fn tick<F>(&mut self, processed: u64, memory: F) -> bool
    where
        F: FnOnce() -> u64,
    {
        if processed < self.next_at {
            return true;
        }
        self.next_at = (processed / self.interval + 1) * self.interval;
        self.publish(processed, memory())
    }

    /// Packet count of the most recent snapshot.
    pub fn last_published(&self) -> Option<u64> {
        self.last_published
    }

    /// Publishes unconditionally, used for the final snapshot.
    pub fn publish(&mut self, processed: u64, memory_usage_bytes: u64) -> bool {
        self.last_published = Some(processed);
        let progress = Progress {
            packets_processed: processed,
            packets_total: self.total,
            elapsed_secs: self.elapsed_secs(),
            memory_usage_bytes,
        };

        let keep_going = match self.callback.as_mut() {
            Some(callback) => callback(&progress),
            None => true,
        };
        if !keep_going {
            debug!(processed, "Progress callback requested cancellation");
            self.token.cancel();
        }
        !self.token.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
