/// Gap recovery coordination
///
/// Turns gaps found on the real-time channels into requests against the gap
/// recovery server, and probes each channel on a heartbeat so an outage of the
/// recovery server is noticed even while the feed looks healthy. Replies come
/// back as ordinary messages and go through the item sequencers as gap fills.

use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::gap_detector::{ChannelId, GapDetector};
use crate::seq;

/// Request/response side channel to the gap recovery server
pub trait RecoveryTransport {
    fn login(&mut self) -> io::Result<()>;
    fn send_request(&mut self, request: &GapRequest) -> io::Result<()>;
}

/// Ask the recovery server to replay `range_start..=range_end`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapRequest {
    pub address: Ipv4Addr,
    pub port: u16,
    pub range_start: u32,
    pub range_end: u32,
    pub request_stream_id: u32,
}

impl GapRequest {
    pub const ENCODED_LEN: usize = 18;

    /// Little-endian body: address[4] port u16 start u32 end u32 stream u32
    pub fn encode<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&self.address.octets())?;
        out.write_u16::<LittleEndian>(self.port)?;
        out.write_u32::<LittleEndian>(self.range_start)?;
        out.write_u32::<LittleEndian>(self.range_end)?;
        out.write_u32::<LittleEndian>(self.request_stream_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Start,
    LoggedIn,
}

/// Per-channel request pacing
#[derive(Debug, Clone, Default)]
struct ChannelPacing {
    last_requested: Option<u32>,
    last_request_at: Option<Instant>,
}

pub struct GapRecoveryCoordinator<T> {
    transport: T,
    state: RecoveryState,
    detector: GapDetector,
    pacing: Vec<ChannelPacing>,
    request_stream_id: u32,
    heartbeat_interval: Duration,
    requests_sent: u64,
}

impl<T: RecoveryTransport> GapRecoveryCoordinator<T> {
    pub fn new(transport: T, request_stream_id: u32, heartbeat_interval: Duration) -> Self {
        GapRecoveryCoordinator {
            transport,
            state: RecoveryState::Start,
            detector: GapDetector::new(),
            pacing: Vec::new(),
            request_stream_id,
            heartbeat_interval,
            requests_sent: 0,
        }
    }

    /// Coordinator with one channel per configured real-time group
    pub fn from_config(transport: T, config: &SyncConfig) -> Self {
        let mut coordinator = Self::new(transport, config.request_stream_id, config.heartbeat_interval());
        for channel in &config.realtime_channels {
            coordinator.add_channel(channel.address, channel.port);
        }
        coordinator
    }

    pub fn add_channel(&mut self, address: Ipv4Addr, port: u16) -> ChannelId {
        self.pacing.push(ChannelPacing::default());
        self.detector.add_channel(address, port)
    }

    /// Complete the login handshake. Requests are only sent once logged in.
    pub fn login(&mut self) -> Result<()> {
        if let Err(err) = self.transport.login() {
            warn!(error = %err, "gap recovery login failed");
            return Err(err.into());
        }
        info!("gap recovery channel logged in");
        self.state = RecoveryState::LoggedIn;
        Ok(())
    }

    pub fn on_disconnect(&mut self) {
        if self.state == RecoveryState::LoggedIn {
            info!("gap recovery channel disconnected");
        }
        self.state = RecoveryState::Start;
    }

    /// Feed one real-time packet sequence number and request any gap it reveals
    pub fn observe(&mut self, channel: ChannelId, seq_num: u32, now: Instant) -> Result<Option<GapRequest>> {
        if channel.0 >= self.pacing.len() {
            return Err(SyncError::UnknownChannel(channel.0));
        }
        self.detector.observe(channel, seq_num);
        match self.detector.take_detected_gap(channel) {
            Some((start, end)) => self.request_range(channel, start, end, now),
            None => Ok(None),
        }
    }

    /// Request a missing range on `channel`, skipping whatever part of it was
    /// already requested. Dropped, not queued, when not logged in.
    pub fn request_range(&mut self, channel: ChannelId, start: u32, end: u32, now: Instant) -> Result<Option<GapRequest>> {
        self.ensure_ready()?;
        let last_requested = self
            .pacing
            .get(channel.0)
            .ok_or(SyncError::UnknownChannel(channel.0))?
            .last_requested;

        let start = match last_requested {
            Some(marker) if !seq::is_after(end, marker) => {
                debug!(channel = channel.0, start, end, "range already requested");
                return Ok(None);
            }
            Some(marker) if seq::is_before_or_eq(start, marker) => seq::successor(marker),
            _ => start,
        };

        let request = self.build_request(channel, start, end);
        self.send(channel, &request, now)?;
        if let Some(pacing) = self.pacing.get_mut(channel.0) {
            pacing.last_requested = Some(end);
        }
        Ok(Some(request))
    }

    /// Heartbeat. Each channel without a request in the last interval gets a
    /// probe for its next expected sequence number.
    pub fn on_tick(&mut self, now: Instant) -> Result<Vec<GapRequest>> {
        self.ensure_ready()?;

        let due: Vec<(ChannelId, u32)> = self
            .detector
            .channels()
            .filter_map(|(id, _)| {
                let next = self.detector.next_expected(id)?;
                let idle = match self.pacing.get(id.0)?.last_request_at {
                    Some(at) => now.saturating_duration_since(at) >= self.heartbeat_interval,
                    None => true,
                };
                idle.then_some((id, next))
            })
            .collect();

        let mut sent = Vec::with_capacity(due.len());
        for (channel, next) in due {
            let request = self.build_request(channel, next, next);
            self.send(channel, &request, now)?;
            sent.push(request);
        }
        Ok(sent)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state != RecoveryState::LoggedIn {
            debug!("gap request skipped, recovery channel not logged in");
            return Err(SyncError::RecoveryChannelNotReady);
        }
        Ok(())
    }

    fn build_request(&self, channel: ChannelId, start: u32, end: u32) -> GapRequest {
        let (address, port) = self
            .detector
            .gap_info(channel)
            .map(|info| (info.address, info.port))
            .unwrap_or((Ipv4Addr::UNSPECIFIED, 0));
        GapRequest {
            address,
            port,
            range_start: start,
            range_end: end,
            request_stream_id: self.request_stream_id,
        }
    }

    fn send(&mut self, channel: ChannelId, request: &GapRequest, now: Instant) -> Result<()> {
        if let Err(err) = self.transport.send_request(request) {
            warn!(channel = channel.0, error = %err, "gap request send failed");
            return Err(err.into());
        }
        debug!(
            channel = channel.0,
            start = request.range_start,
            end = request.range_end,
            "gap request sent"
        );
        if let Some(pacing) = self.pacing.get_mut(channel.0) {
            pacing.last_request_at = Some(now);
        }
        self.requests_sent += 1;
        Ok(())
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn detector(&self) -> &GapDetector {
        &self.detector
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockTransport {
        sent: Vec<GapRequest>,
        fail_login: bool,
        fail_send: bool,
    }

    impl RecoveryTransport for MockTransport {
        fn login(&mut self) -> io::Result<()> {
            if self.fail_login {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            Ok(())
        }

        fn send_request(&mut self, request: &GapRequest) -> io::Result<()> {
            if self.fail_send {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
            }
            self.sent.push(request.clone());
            Ok(())
        }
    }

    fn coordinator() -> (GapRecoveryCoordinator<MockTransport>, ChannelId) {
        let mut c = GapRecoveryCoordinator::new(MockTransport::default(), 9, Duration::from_secs(1));
        let ch = c.add_channel(Ipv4Addr::new(235, 1, 1, 1), 30001);
        (c, ch)
    }

    #[test]
    fn test_requests_skipped_before_login() {
        let (mut c, ch) = coordinator();
        let now = Instant::now();
        c.observe(ch, 1, now).unwrap();
        let result = c.observe(ch, 5, now);
        assert!(matches!(result, Err(SyncError::RecoveryChannelNotReady)));
        assert!(c.transport().sent.is_empty());

        // dropped, not queued
        c.login().unwrap();
        assert_eq!(c.observe(ch, 6, now).unwrap(), None);
        assert!(c.transport().sent.is_empty());
    }

    #[test]
    fn test_gap_request_sent_once() {
        let (mut c, ch) = coordinator();
        c.login().unwrap();
        let now = Instant::now();
        c.observe(ch, 1, now).unwrap();
        let request = c.observe(ch, 5, now).unwrap().unwrap();
        assert_eq!((request.range_start, request.range_end), (2, 4));
        assert_eq!(request.request_stream_id, 9);
        assert_eq!(request.port, 30001);

        assert_eq!(c.request_range(ch, 2, 4, now).unwrap(), None);
        let clamped = c.request_range(ch, 3, 6, now).unwrap().unwrap();
        assert_eq!((clamped.range_start, clamped.range_end), (5, 6));
        assert_eq!(c.requests_sent(), 2);
    }

    #[test]
    fn test_heartbeat_probe() {
        let (mut c, ch) = coordinator();
        c.login().unwrap();
        let start = Instant::now();
        c.observe(ch, 10, start).unwrap();

        let probes = c.on_tick(start).unwrap();
        assert_eq!(probes.len(), 1);
        assert_eq!((probes[0].range_start, probes[0].range_end), (11, 11));

        // paced by the heartbeat interval
        assert!(c.on_tick(start + Duration::from_millis(500)).unwrap().is_empty());
        assert_eq!(c.on_tick(start + Duration::from_secs(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_recent_gap_request_defers_heartbeat() {
        let (mut c, ch) = coordinator();
        c.login().unwrap();
        let start = Instant::now();
        c.observe(ch, 1, start).unwrap();
        c.observe(ch, 4, start).unwrap().unwrap();
        assert!(c.on_tick(start + Duration::from_millis(200)).unwrap().is_empty());
    }

    #[test]
    fn test_no_probe_before_first_packet() {
        let (mut c, _) = coordinator();
        c.login().unwrap();
        assert!(c.on_tick(Instant::now()).unwrap().is_empty());
    }

    #[test]
    fn test_failures_are_connection_errors() {
        let mut c = GapRecoveryCoordinator::new(
            MockTransport {
                fail_login: true,
                ..MockTransport::default()
            },
            9,
            Duration::from_secs(1),
        );
        assert!(matches!(c.login(), Err(SyncError::Connection(_))));
        assert_eq!(c.state(), RecoveryState::Start);

        c.transport_mut().fail_login = false;
        c.transport_mut().fail_send = true;
        let ch = c.add_channel(Ipv4Addr::LOCALHOST, 1);
        c.login().unwrap();
        c.observe(ch, 1, Instant::now()).unwrap();
        assert!(matches!(c.observe(ch, 3, Instant::now()), Err(SyncError::Connection(_))));
        assert_eq!(c.requests_sent(), 0);
    }

    #[test]
    fn test_encode_request() {
        let request = GapRequest {
            address: Ipv4Addr::new(235, 1, 1, 1),
            port: 30001,
            range_start: 4,
            range_end: 6,
            request_stream_id: 9,
        };
        let mut buf = Vec::new();
        request.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), GapRequest::ENCODED_LEN);
        assert_eq!(&buf[..4], &[235, 1, 1, 1]);
        assert_eq!(&buf[4..6], &30001u16.to_le_bytes());
        assert_eq!(&buf[10..14], &6u32.to_le_bytes());
    }

    #[test]
    fn test_encode_reports_short_writer() {
        let request = GapRequest {
            address: Ipv4Addr::LOCALHOST,
            port: 1,
            range_start: 1,
            range_end: 2,
            request_stream_id: 3,
        };
        let mut short = [0u8; 10];
        let mut out = &mut short[..];
        assert!(request.encode(&mut out).is_err());
    }

    #[test]
    fn test_unknown_channel_is_an_error() {
        let (mut c, _) = coordinator();
        c.login().unwrap();
        let stray = ChannelId(7);
        assert!(matches!(c.observe(stray, 1, Instant::now()), Err(SyncError::UnknownChannel(7))));
        assert!(matches!(
            c.request_range(stray, 1, 2, Instant::now()),
            Err(SyncError::UnknownChannel(7))
        ));
        assert!(c.transport().sent.is_empty());
    }

    #[test]
    fn test_disconnect_requires_new_login() {
        let (mut c, _) = coordinator();
        c.login().unwrap();
        c.on_disconnect();
        assert_eq!(c.state(), RecoveryState::Start);
        assert!(matches!(c.on_tick(Instant::now()), Err(SyncError::RecoveryChannelNotReady)));
    }
}
