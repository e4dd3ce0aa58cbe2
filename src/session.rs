/// Feed session dispatch
///
/// The surface a readiness loop drives: one call per readable real-time,
/// snapshot, or gap-recovery buffer, plus a periodic tick. Per-message
/// problems are logged and counted here; only connection failures on the
/// recovery channel propagate.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::decoder::Decoder;
use crate::error::{Result, SyncError};
use crate::gap_detector::ChannelId;
use crate::recovery::{GapRecoveryCoordinator, RecoveryTransport};
use crate::registry::ItemRegistry;
use crate::sequencer::Origin;
use crate::sink::MessageSink;
use crate::stats::SyncStats;

pub struct FeedSession<T> {
    registry: ItemRegistry,
    recovery: GapRecoveryCoordinator<T>,
    stats: SyncStats,
}

impl<T: RecoveryTransport> FeedSession<T> {
    /// Register the configured items. A duplicate registration aborts startup.
    pub fn new(config: &SyncConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let registry = ItemRegistry::from_items(&config.items, config.verbose)?;
        let recovery = GapRecoveryCoordinator::from_config(transport, config);
        info!(
            items = registry.len(),
            channels = config.realtime_channels.len(),
            "feed session ready"
        );
        Ok(FeedSession {
            registry,
            recovery,
            stats: SyncStats::new(),
        })
    }

    pub fn connect_recovery(&mut self) -> Result<()> {
        self.recovery.login()
    }

    pub fn on_recovery_disconnect(&mut self) {
        self.recovery.on_disconnect();
    }

    /// One packet from a real-time channel. `packet_seq` is the channel-level
    /// sequence used for gap detection; the messages inside carry their own.
    /// Returns the number of messages decoded.
    pub fn on_realtime<S>(
        &mut self,
        channel: ChannelId,
        packet_seq: u32,
        packet: &[u8],
        sink: &mut S,
        now: Instant,
    ) -> Result<usize>
    where
        S: MessageSink + ?Sized,
    {
        self.stats.record_read(packet.len());

        let gaps_before = self.recovery.detector().gap_count();
        let requested = self.recovery.observe(channel, packet_seq, now);
        if self.recovery.detector().gap_count() > gaps_before {
            if let Some(&(start, end)) = self.recovery.detector().gaps().last() {
                self.stats.record_gap(end.wrapping_sub(start).wrapping_add(1));
            }
        }
        match requested {
            Ok(Some(_)) => self.stats.record_gap_requests(1),
            Ok(None) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(SyncError::UnknownChannel(id)) => warn!(channel = id, "packet on unknown channel"),
            Err(err) => debug!(channel = channel.0, error = %err, "gap not requested"),
        }

        Ok(self.dispatch(packet, Origin::Realtime, sink))
    }

    pub fn on_snapshot<S>(&mut self, packet: &[u8], sink: &mut S) -> usize
    where
        S: MessageSink + ?Sized,
    {
        self.stats.record_read(packet.len());
        self.dispatch(packet, Origin::Snapshot, sink)
    }

    /// Replies from the gap recovery server; sequenced like live updates
    pub fn on_gap_fill<S>(&mut self, packet: &[u8], sink: &mut S) -> usize
    where
        S: MessageSink + ?Sized,
    {
        self.stats.record_read(packet.len());
        self.dispatch(packet, Origin::GapFill, sink)
    }

    /// Called once per loop iteration with a coarse wall-clock reading
    pub fn on_tick(&mut self, now: Instant) -> Result<()> {
        match self.recovery.on_tick(now) {
            Ok(probes) => {
                self.stats.record_gap_requests(probes.len());
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                debug!(error = %err, "heartbeat probe skipped");
                Ok(())
            }
        }
    }

    fn dispatch<S>(&mut self, packet: &[u8], origin: Origin, sink: &mut S) -> usize
    where
        S: MessageSink + ?Sized,
    {
        let registry = &mut self.registry;
        let stats = &mut self.stats;
        let mut count = 0;

        let walked = Decoder::decode_stream(packet, |message| {
            count += 1;
            let started = Instant::now();
            match registry.route(message, origin, sink) {
                Ok(outcome) => stats.record_outcome(&outcome),
                Err(SyncError::UnroutableMessage { stream_id, domain }) => {
                    debug!(stream_id, ?domain, ?origin, "unroutable message");
                    stats.record_unroutable();
                }
                Err(err) => {
                    warn!(?origin, error = %err, "message not applied");
                    stats.record_decode_failure();
                }
            }
            stats.record_dispatch_latency(started.elapsed().as_micros() as u64);
            true
        });

        if let Err(err) = walked {
            warn!(?origin, decoded = count, error = %err, "dropping rest of malformed packet");
            self.stats.record_decode_failure();
        }

        count
    }

    /// Stop the session: release every buffered message undelivered
    pub fn teardown(&mut self) -> usize {
        let released = self.registry.teardown();
        self.recovery.on_disconnect();
        self.stats.log_summary();
        info!(released, "feed session torn down");
        released
    }

    pub fn registry(&self) -> &ItemRegistry {
        &self.registry
    }

    pub fn recovery(&self) -> &GapRecoveryCoordinator<T> {
        &self.recovery
    }

    pub fn recovery_mut(&mut self) -> &mut GapRecoveryCoordinator<T> {
        &mut self.recovery
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }
}
