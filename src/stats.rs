/// Session statistics tracking
///
/// Counts what the engine did with every message (delivered, buffered,
/// discarded, unroutable), gap activity, and dispatch latency.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::info;

use crate::sequencer::{Disposition, ProcessOutcome};

const WINDOW_SIZE: usize = 10000;

#[derive(Debug, Clone, Copy)]
pub struct LatencyStats {
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p99_us: u64,
}

impl LatencyStats {
    fn from_window(window: &VecDeque<u64>) -> Option<Self> {
        if window.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = window.iter().copied().collect();
        sorted.sort_unstable();

        Some(LatencyStats {
            min_us: sorted[0],
            max_us: sorted[sorted.len() - 1],
            mean_us: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_us: sorted[sorted.len() / 2],
            p99_us: sorted[(sorted.len() * 99) / 100],
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    start_time: Option<Instant>,
    total_messages: u64,
    total_bytes: u64,

    delivered: u64,
    buffered: u64,
    discarded: u64,
    replayed: u64,
    unroutable: u64,
    decode_failures: u64,

    // Gap tracking
    total_gaps: u32,
    gap_events: u32,
    gap_requests: u64,

    // Dispatch latencies (in microseconds)
    dispatch_latencies: VecDeque<u64>,
}

impl SyncStats {
    pub fn new() -> Self {
        SyncStats {
            dispatch_latencies: VecDeque::with_capacity(WINDOW_SIZE),
            ..Default::default()
        }
    }

    /// Record a transport read
    pub fn record_read(&mut self, size: usize) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
        self.total_bytes += size as u64;
    }

    /// Record what the sequencer did with one message
    pub fn record_outcome(&mut self, outcome: &ProcessOutcome) {
        self.total_messages += 1;
        match outcome.disposition {
            Disposition::Delivered => self.delivered += 1,
            Disposition::Buffered => self.buffered += 1,
            Disposition::Discarded => self.discarded += 1,
        }
        self.replayed += outcome.replayed as u64;
        self.discarded += outcome.discarded as u64;
    }

    pub fn record_unroutable(&mut self) {
        self.total_messages += 1;
        self.unroutable += 1;
    }

    pub fn record_decode_failure(&mut self) {
        self.total_messages += 1;
        self.decode_failures += 1;
    }

    pub fn record_gap(&mut self, gap_size: u32) {
        self.total_gaps = self.total_gaps.wrapping_add(gap_size);
        self.gap_events += 1;
    }

    pub fn record_gap_requests(&mut self, count: usize) {
        self.gap_requests += count as u64;
    }

    pub fn record_dispatch_latency(&mut self, micros: u64) {
        if self.dispatch_latencies.len() >= WINDOW_SIZE {
            self.dispatch_latencies.pop_front();
        }
        self.dispatch_latencies.push_back(micros);
    }

    /// Messages per second since the first read
    pub fn messages_per_sec(&self) -> f64 {
        match self.elapsed() {
            Some(elapsed) if elapsed.as_secs_f64() > 0.0 => self.total_messages as f64 / elapsed.as_secs_f64(),
            _ => 0.0,
        }
    }

    pub fn dispatch_latency_stats(&self) -> Option<LatencyStats> {
        LatencyStats::from_window(&self.dispatch_latencies)
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.start_time.map(|st| st.elapsed())
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn buffered(&self) -> u64 {
        self.buffered
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn replayed(&self) -> u64 {
        self.replayed
    }

    pub fn unroutable(&self) -> u64 {
        self.unroutable
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    pub fn total_gaps(&self) -> u32 {
        self.total_gaps
    }

    pub fn gap_events(&self) -> u32 {
        self.gap_events
    }

    pub fn gap_requests(&self) -> u64 {
        self.gap_requests
    }

    pub fn reset(&mut self) {
        *self = SyncStats::new();
    }

    /// Emit a summary at info level
    pub fn log_summary(&self) {
        info!(
            messages = self.total_messages,
            bytes = self.total_bytes,
            msgs_per_sec = self.messages_per_sec(),
            delivered = self.delivered,
            buffered = self.buffered,
            replayed = self.replayed,
            discarded = self.discarded,
            unroutable = self.unroutable,
            decode_failures = self.decode_failures,
            "feed sync statistics"
        );
        info!(
            total_gaps = self.total_gaps,
            gap_events = self.gap_events,
            gap_requests = self.gap_requests,
            "gap statistics"
        );
        if let Some(stats) = self.dispatch_latency_stats() {
            info!(
                min_us = stats.min_us,
                max_us = stats.max_us,
                mean_us = stats.mean_us,
                p50_us = stats.p50_us,
                p99_us = stats.p99_us,
                "dispatch latency"
            );
        }
    }
}
