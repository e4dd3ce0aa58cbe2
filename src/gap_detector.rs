/// Sequence number gap detection
///
/// Tracks the packet sequence of each real-time channel and detects gaps
/// indicating lost multicast packets. A detected range is held until the
/// recovery side takes it.

use std::net::Ipv4Addr;

use tracing::debug;

use crate::seq::{self, SEQ_RESET};

/// Index of a real-time channel inside a `GapDetector`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub usize);

/// Per-channel gap state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapInfo {
    pub address: Ipv4Addr,
    pub port: u16,
    /// Inclusive start of the last reported range
    pub range_start: u32,
    /// Inclusive end of the last reported range
    pub range_end: u32,
    /// 0 until the first observation
    pub last_seen_seq: u32,
    pending: Option<(u32, u32)>,
}

impl GapInfo {
    fn new(address: Ipv4Addr, port: u16) -> Self {
        GapInfo {
            address,
            port,
            range_start: 0,
            range_end: 0,
            last_seen_seq: SEQ_RESET,
            pending: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GapDetector {
    channels: Vec<GapInfo>,
    gaps: Vec<(u32, u32)>, // every detected (start, end), inclusive
    total_gap_count: u32,
}

impl GapDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&mut self, address: Ipv4Addr, port: u16) -> ChannelId {
        self.channels.push(GapInfo::new(address, port));
        ChannelId(self.channels.len() - 1)
    }

    /// Observe a packet sequence number on `channel`.
    /// Returns the newly missing range, if this observation revealed one.
    /// Channels not created by this detector are ignored.
    pub fn observe(&mut self, channel: ChannelId, seq_num: u32) -> Option<(u32, u32)> {
        let info = self.channels.get_mut(channel.0)?;

        if seq_num == SEQ_RESET {
            debug!(channel = channel.0, "channel sequence reset");
            *info = GapInfo::new(info.address, info.port);
            return None;
        }

        if info.last_seen_seq == SEQ_RESET {
            info.range_start = seq_num;
            info.range_end = seq_num;
            info.last_seen_seq = seq_num;
            return None;
        }

        let expected = seq::successor(info.last_seen_seq);
        if seq::is_after(seq_num, expected) {
            let start = expected;
            let end = seq::predecessor(seq_num);
            info.range_start = start;
            info.range_end = end;
            info.last_seen_seq = seq_num;
            info.pending = Some(match info.pending {
                Some((pending_start, _)) => (pending_start, end),
                None => (start, end),
            });

            let gap_size = seq_num.wrapping_sub(start);
            self.gaps.push((start, end));
            self.total_gap_count = self.total_gap_count.wrapping_add(gap_size);
            debug!(channel = channel.0, start, end, "gap detected");
            return Some((start, end));
        }

        info.range_start = seq_num;
        info.range_end = seq_num;
        if seq::is_after(seq_num, info.last_seen_seq) {
            info.last_seen_seq = seq_num;
        }
        None
    }

    /// Take the not-yet-requested missing range of `channel`, at most once
    pub fn take_detected_gap(&mut self, channel: ChannelId) -> Option<(u32, u32)> {
        self.channels.get_mut(channel.0)?.pending.take()
    }

    pub fn gap_info(&self, channel: ChannelId) -> Option<&GapInfo> {
        self.channels.get(channel.0)
    }

    /// Next sequence expected on `channel`; None before the first observation
    pub fn next_expected(&self, channel: ChannelId) -> Option<u32> {
        let info = self.channels.get(channel.0)?;
        (info.last_seen_seq != SEQ_RESET).then(|| seq::successor(info.last_seen_seq))
    }

    pub fn channels(&self) -> impl Iterator<Item = (ChannelId, &GapInfo)> {
        self.channels.iter().enumerate().map(|(i, info)| (ChannelId(i), info))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// All detected gaps as (start, end) tuples (inclusive)
    pub fn gaps(&self) -> &[(u32, u32)] {
        &self.gaps
    }

    /// Total number of missing sequence numbers
    pub fn total_gaps(&self) -> u32 {
        self.total_gap_count
    }

    /// Count of gap ranges detected
    pub fn gap_count(&self) -> usize {
        self.gaps.len()
    }

    /// Forget all sequence state, keeping the channel list
    pub fn reset(&mut self) {
        for info in &mut self.channels {
            *info = GapInfo::new(info.address, info.port);
        }
        self.gaps.clear();
        self.total_gap_count = 0;
    }

    /// Check if a specific sequence number fell in a detected gap
    pub fn is_in_gap(&self, seq_num: u32) -> bool {
        self.gaps
            .iter()
            .any(|&(start, end)| seq::is_before_or_eq(start, seq_num) && seq::is_before_or_eq(seq_num, end))
    }
}
