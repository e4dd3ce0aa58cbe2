/// Per-item sequencing state machine
///
/// Merges three sources for one item: the real-time feed, the (possibly
/// multi-part) snapshot, and gap-fill replays. Every inbound message is either
/// delivered to the sink now, held in the item's reorder buffer, or discarded
/// as already covered.
///
/// Valid flag combinations:
///   - `NotStarted`: nothing delivered, realtime buffered, both flags false
///   - `HaveSnapshot`: realtime buffered behind the snapshot, `snapshot_parts_pending`
///     true between parts
///   - `RealtimeStarted`: realtime delivered directly unless `snapshot_parts_pending`
///   - `DoneReordering`: buffer empty, `refresh_complete` true, everything bypasses

use tracing::{debug, trace, warn};

use crate::decoder::{DecodeError, MessageRef, OwnedMessage};
use crate::error::{Result, SyncError};
use crate::registry::ItemHandle;
use crate::reorder::{BufferedMessage, PopMode, ReorderBuffer};
use crate::seq::{self, SEQ_RESET};
use crate::sink::MessageSink;

/// Which channel a message arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Snapshot,
    Realtime,
    GapFill,
}

impl Origin {
    pub fn is_snapshot(self) -> bool {
        self == Origin::Snapshot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    NotStarted,
    HaveSnapshot,
    RealtimeStarted,
    DoneReordering,
}

/// What happened to the message handed to `process`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delivered,
    Buffered,
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub disposition: Disposition,
    /// Buffered messages released to the sink by this call
    pub replayed: usize,
    /// Buffered messages dropped as covered by this call
    pub discarded: usize,
}

/// Delivers messages for one `process` call and remembers the first failure.
/// A failure never stops the rest of the batch.
struct Delivery<'s, S: ?Sized> {
    sink: &'s mut S,
    handle: ItemHandle,
    first_error: Option<(u32, DecodeError)>,
    replayed: usize,
    discarded: usize,
}

impl<'s, S: MessageSink + ?Sized> Delivery<'s, S> {
    fn new(sink: &'s mut S, handle: ItemHandle) -> Self {
        Delivery {
            sink,
            handle,
            first_error: None,
            replayed: 0,
            discarded: 0,
        }
    }

    fn deliver(&mut self, message: &MessageRef<'_>) {
        if let Err(err) = self.sink.apply(&self.handle, message) {
            warn!(
                stream_id = message.stream_id(),
                seq = ?message.sequence(),
                error = %err,
                "apply failed"
            );
            self.first_error.get_or_insert((message.stream_id(), err));
        }
    }

    fn finish(self, disposition: Disposition) -> Result<ProcessOutcome> {
        match self.first_error {
            Some((stream_id, source)) => Err(SyncError::DecodeFailure { stream_id, source }),
            None => Ok(ProcessOutcome {
                disposition,
                replayed: self.replayed,
                discarded: self.discarded,
            }),
        }
    }
}

#[derive(Debug)]
pub struct ItemSequencer {
    handle: ItemHandle,
    state: ItemState,
    baseline_seq: u32,
    refresh_complete: bool,
    snapshot_parts_pending: bool,
    buffer: ReorderBuffer<OwnedMessage>,
}

impl ItemSequencer {
    pub fn new(handle: ItemHandle) -> Self {
        ItemSequencer {
            handle,
            state: ItemState::NotStarted,
            baseline_seq: 0,
            refresh_complete: false,
            snapshot_parts_pending: false,
            buffer: ReorderBuffer::new(),
        }
    }

    /// Single entry point for every inbound message of this item.
    ///
    /// `seq` is the message's extracted sequence number. Messages without one
    /// are never buffered. On a decode failure the whole batch decided by this
    /// call is still delivered and the first failure is returned.
    pub fn process<S>(
        &mut self,
        message: &MessageRef<'_>,
        origin: Origin,
        seq: Option<u32>,
        sink: &mut S,
    ) -> Result<ProcessOutcome>
    where
        S: MessageSink + ?Sized,
    {
        let mut out = Delivery::new(sink, self.handle);

        let disposition = match (self.state, seq) {
            (ItemState::DoneReordering, _) | (_, None) => {
                out.deliver(message);
                Disposition::Delivered
            }
            (ItemState::NotStarted, Some(seq)) => self.on_not_started(message, origin, seq, &mut out),
            (ItemState::HaveSnapshot, Some(seq)) => self.on_have_snapshot(message, origin, seq, &mut out),
            (ItemState::RealtimeStarted, Some(seq)) => {
                self.on_realtime_started(message, origin, seq, &mut out)
            }
        };

        out.finish(disposition)
    }

    fn on_not_started<S: MessageSink + ?Sized>(
        &mut self,
        message: &MessageRef<'_>,
        origin: Origin,
        seq: u32,
        out: &mut Delivery<'_, S>,
    ) -> Disposition {
        if !origin.is_snapshot() {
            // no reference point yet
            self.enqueue(message, seq);
            return Disposition::Buffered;
        }

        // buffered realtime up to the snapshot is already reflected in it
        while self.buffer.pop(PopMode::UpTo, seq).is_some() {
            out.discarded += 1;
        }
        self.baseline_seq = seq;
        self.transition(ItemState::HaveSnapshot);
        out.deliver(message);
        self.after_snapshot_part(message, out);
        Disposition::Delivered
    }

    fn on_have_snapshot<S: MessageSink + ?Sized>(
        &mut self,
        message: &MessageRef<'_>,
        origin: Origin,
        seq: u32,
        out: &mut Delivery<'_, S>,
    ) -> Disposition {
        if !origin.is_snapshot() {
            if seq::is_before_or_eq(seq, self.baseline_seq) {
                trace!(stream_id = self.handle.feed_stream_id(), seq, "covered by snapshot");
                return Disposition::Discarded;
            }
            self.enqueue(message, seq);
            return Disposition::Buffered;
        }

        // held-back realtime the part already reflects goes out before it;
        // the baseline tracks replayed realtime, not the part's own sequence
        let prior = self.baseline_seq;
        self.replay(PopMode::UpTo, seq, out);
        if seq::is_after(seq, prior) {
            self.baseline_seq = seq::successor(self.baseline_seq);
            self.transition(ItemState::RealtimeStarted);
        }
        out.deliver(message);
        self.after_snapshot_part(message, out);
        Disposition::Delivered
    }

    fn on_realtime_started<S: MessageSink + ?Sized>(
        &mut self,
        message: &MessageRef<'_>,
        origin: Origin,
        seq: u32,
        out: &mut Delivery<'_, S>,
    ) -> Disposition {
        if origin.is_snapshot() {
            self.apply_snapshot_part(message, seq, out);
            self.after_snapshot_part(message, out);
            return Disposition::Delivered;
        }

        if seq == SEQ_RESET {
            // the old sequence space is gone, including anything still held back
            out.discarded += self.buffer.drain_all();
            self.snapshot_parts_pending = false;
            self.baseline_seq = seq::successor(SEQ_RESET);
            debug!(stream_id = self.handle.feed_stream_id(), "sequence reset");
            out.deliver(message);
            return Disposition::Delivered;
        }

        if seq::is_before(seq, self.baseline_seq) {
            trace!(stream_id = self.handle.feed_stream_id(), seq, expected = self.baseline_seq, "duplicate");
            return Disposition::Discarded;
        }

        if self.snapshot_parts_pending {
            self.enqueue(message, seq);
            return Disposition::Buffered;
        }

        self.baseline_seq = seq::successor(seq);
        out.deliver(message);
        Disposition::Delivered
    }

    /// Interleave a later snapshot part with held-back realtime: older updates
    /// first, then the part, then updates carrying the part's own sequence.
    /// Parts only cover their own slice of the item, so the expected realtime
    /// sequence is left alone.
    fn apply_snapshot_part<S: MessageSink + ?Sized>(
        &mut self,
        message: &MessageRef<'_>,
        seq: u32,
        out: &mut Delivery<'_, S>,
    ) {
        self.replay(PopMode::Before, seq, out);
        out.deliver(message);
        self.replay(PopMode::UpTo, seq, out);
    }

    fn after_snapshot_part<S: MessageSink + ?Sized>(&mut self, message: &MessageRef<'_>, out: &mut Delivery<'_, S>) {
        if message.is_refresh_complete() {
            self.complete_refresh(out);
        } else {
            self.snapshot_parts_pending =
                self.state == ItemState::HaveSnapshot || !self.buffer.is_empty();
        }
    }

    fn complete_refresh<S: MessageSink + ?Sized>(&mut self, out: &mut Delivery<'_, S>) {
        self.refresh_complete = true;
        self.replay(PopMode::All, self.baseline_seq, out);
        self.snapshot_parts_pending = false;
        self.transition(ItemState::DoneReordering);
    }

    /// Release a prefix of the buffer. Entries that are no longer ahead of
    /// the delivery point are dropped so delivery stays strictly increasing.
    fn replay<S: MessageSink + ?Sized>(&mut self, mode: PopMode, bound: u32, out: &mut Delivery<'_, S>) {
        while let Some(buffered) = self.buffer.pop(mode, bound) {
            let seq = buffered.seq();
            if !self.is_ahead(seq) {
                trace!(stream_id = self.handle.feed_stream_id(), seq, "dropping covered buffered message");
                out.discarded += 1;
                continue;
            }
            self.baseline_seq = match self.state {
                ItemState::RealtimeStarted => seq::successor(seq),
                _ => seq,
            };
            out.replayed += 1;
            out.deliver(&buffered.into_message().as_message_ref());
        }
    }

    /// `baseline_seq` is "last covered" before realtime starts and
    /// "next expected" after.
    fn is_ahead(&self, seq: u32) -> bool {
        match self.state {
            ItemState::RealtimeStarted => !seq::is_before(seq, self.baseline_seq),
            _ => seq::is_after(seq, self.baseline_seq),
        }
    }

    fn enqueue(&mut self, message: &MessageRef<'_>, seq: u32) {
        trace!(stream_id = self.handle.feed_stream_id(), seq, state = ?self.state, "buffering");
        self.buffer.push(BufferedMessage::new(seq, message.to_owned_message()));
    }

    fn transition(&mut self, next: ItemState) {
        debug!(
            stream_id = self.handle.feed_stream_id(),
            from = ?self.state,
            to = ?next,
            baseline = self.baseline_seq,
            "item state change"
        );
        self.state = next;
    }

    /// Drop everything still buffered without delivering it
    pub fn teardown(&mut self) -> usize {
        let released = self.buffer.drain_all();
        if released > 0 {
            debug!(stream_id = self.handle.feed_stream_id(), released, "released undelivered messages");
        }
        released
    }

    pub fn handle(&self) -> &ItemHandle {
        &self.handle
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn baseline_seq(&self) -> u32 {
        self.baseline_seq
    }

    pub fn is_refresh_complete(&self) -> bool {
        self.refresh_complete
    }

    pub fn snapshot_parts_pending(&self) -> bool {
        self.snapshot_parts_pending
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Domain, MessageHeader, MessageType};

    const FEED: u32 = 100;
    const SNAP: u32 = 200;

    fn handle() -> ItemHandle {
        ItemHandle::new(0, FEED, SNAP, Domain::MarketPrice)
    }

    fn realtime(seq: u32) -> OwnedMessage {
        OwnedMessage::build(
            MessageHeader::sequenced(MessageType::Update, Domain::MarketPrice, FEED, seq),
            &[],
        )
        .unwrap()
    }

    fn snapshot(seq: u32, complete: bool) -> OwnedMessage {
        let hdr = MessageHeader::sequenced(MessageType::Refresh, Domain::MarketPrice, SNAP, seq);
        let hdr = if complete { hdr.with_refresh_complete() } else { hdr };
        OwnedMessage::build(hdr, &[]).unwrap()
    }

    /// Records (origin type, seq) for every apply call
    #[derive(Default)]
    struct Recorder {
        applied: Vec<(MessageType, u32)>,
        fail_on: Option<u32>,
    }

    impl MessageSink for Recorder {
        fn apply(&mut self, _item: &ItemHandle, message: &MessageRef<'_>) -> std::result::Result<(), DecodeError> {
            let seq = message.sequence().unwrap_or(0);
            if self.fail_on == Some(seq) && message.message_type() == MessageType::Update {
                return Err(DecodeError::Rejected);
            }
            self.applied.push((message.message_type(), seq));
            Ok(())
        }
    }

    fn feed(item: &mut ItemSequencer, sink: &mut Recorder, msg: &OwnedMessage, origin: Origin) -> Result<ProcessOutcome> {
        let view = msg.as_message_ref();
        item.process(&view, origin, view.sequence(), sink)
    }

    #[test]
    fn test_realtime_before_snapshot_is_buffered() {
        let mut item = ItemSequencer::new(handle());
        let mut sink = Recorder::default();
        for seq in 1..=3 {
            let out = feed(&mut item, &mut sink, &realtime(seq), Origin::Realtime).unwrap();
            assert_eq!(out.disposition, Disposition::Buffered);
        }
        assert!(sink.applied.is_empty());
        assert_eq!(item.buffered_len(), 3);
        assert_eq!(item.state(), ItemState::NotStarted);
    }

    #[test]
    fn test_incomplete_part_holds_realtime() {
        let mut item = ItemSequencer::new(handle());
        let mut sink = Recorder::default();
        feed(&mut item, &mut sink, &snapshot(3, false), Origin::Snapshot).unwrap();
        assert_eq!(item.state(), ItemState::HaveSnapshot);
        assert!(item.snapshot_parts_pending());

        let out = feed(&mut item, &mut sink, &realtime(3), Origin::Realtime).unwrap();
        assert_eq!(out.disposition, Disposition::Discarded);
        let out = feed(&mut item, &mut sink, &realtime(4), Origin::Realtime).unwrap();
        assert_eq!(out.disposition, Disposition::Buffered);
        assert_eq!(sink.applied, vec![(MessageType::Refresh, 3)]);
    }

    #[test]
    fn test_second_part_starts_realtime() {
        let mut item = ItemSequencer::new(handle());
        let mut sink = Recorder::default();
        feed(&mut item, &mut sink, &snapshot(3, false), Origin::Snapshot).unwrap();
        feed(&mut item, &mut sink, &realtime(4), Origin::Realtime).unwrap();
        feed(&mut item, &mut sink, &realtime(6), Origin::Realtime).unwrap();

        let out = feed(&mut item, &mut sink, &snapshot(5, false), Origin::Snapshot).unwrap();
        assert_eq!(out.replayed, 1);
        assert_eq!(item.state(), ItemState::RealtimeStarted);
        assert_eq!(item.baseline_seq(), 5);
        // 6 is still waiting for the next part
        assert!(item.snapshot_parts_pending());
        assert_eq!(item.buffered_len(), 1);

        // pending, so 7 queues behind 6
        let out = feed(&mut item, &mut sink, &realtime(7), Origin::Realtime).unwrap();
        assert_eq!(out.disposition, Disposition::Buffered);

        feed(&mut item, &mut sink, &snapshot(8, true), Origin::Snapshot).unwrap();
        assert_eq!(item.state(), ItemState::DoneReordering);
        assert_eq!(
            sink.applied,
            vec![
                (MessageType::Refresh, 3),
                (MessageType::Update, 4),
                (MessageType::Refresh, 5),
                (MessageType::Update, 6),
                (MessageType::Update, 7),
                (MessageType::Refresh, 8),
            ]
        );
    }

    #[test]
    fn test_realtime_at_part_seq_precedes_part() {
        let mut item = ItemSequencer::new(handle());
        let mut sink = Recorder::default();
        feed(&mut item, &mut sink, &snapshot(3, false), Origin::Snapshot).unwrap();
        feed(&mut item, &mut sink, &realtime(5), Origin::Realtime).unwrap();

        let out = feed(&mut item, &mut sink, &snapshot(5, false), Origin::Snapshot).unwrap();
        assert_eq!(out.replayed, 1);
        assert_eq!(
            sink.applied,
            vec![(MessageType::Refresh, 3), (MessageType::Update, 5), (MessageType::Refresh, 5)]
        );
        assert_eq!(item.state(), ItemState::RealtimeStarted);
        assert_eq!(item.baseline_seq(), 6);
    }

    #[test]
    fn test_later_part_keeps_uncovered_realtime() {
        let mut item = ItemSequencer::new(handle());
        let mut sink = Recorder::default();
        feed(&mut item, &mut sink, &snapshot(3, false), Origin::Snapshot).unwrap();
        feed(&mut item, &mut sink, &realtime(4), Origin::Realtime).unwrap();

        feed(&mut item, &mut sink, &snapshot(6, false), Origin::Snapshot).unwrap();
        assert_eq!(item.state(), ItemState::RealtimeStarted);
        assert_eq!(item.baseline_seq(), 5);
        assert!(!item.snapshot_parts_pending());

        let out = feed(&mut item, &mut sink, &realtime(5), Origin::Realtime).unwrap();
        assert_eq!(out.disposition, Disposition::Delivered);

        // a part ahead of realtime does not move the expected sequence either
        feed(&mut item, &mut sink, &snapshot(8, false), Origin::Snapshot).unwrap();
        assert_eq!(item.baseline_seq(), 6);
        let out = feed(&mut item, &mut sink, &realtime(6), Origin::Realtime).unwrap();
        assert_eq!(out.disposition, Disposition::Delivered);

        assert_eq!(
            sink.applied,
            vec![
                (MessageType::Refresh, 3),
                (MessageType::Update, 4),
                (MessageType::Refresh, 6),
                (MessageType::Update, 5),
                (MessageType::Refresh, 8),
                (MessageType::Update, 6),
            ]
        );
    }

    #[test]
    fn test_realtime_flows_when_nothing_pending() {
        let mut item = ItemSequencer::new(handle());
        let mut sink = Recorder::default();
        feed(&mut item, &mut sink, &snapshot(3, false), Origin::Snapshot).unwrap();
        feed(&mut item, &mut sink, &snapshot(5, false), Origin::Snapshot).unwrap();
        assert_eq!(item.state(), ItemState::RealtimeStarted);
        assert!(!item.snapshot_parts_pending());

        let out = feed(&mut item, &mut sink, &realtime(6), Origin::Realtime).unwrap();
        assert_eq!(out.disposition, Disposition::Delivered);
        let out = feed(&mut item, &mut sink, &realtime(6), Origin::GapFill).unwrap();
        assert_eq!(out.disposition, Disposition::Discarded);
        assert_eq!(item.baseline_seq(), 7);
    }

    #[test]
    fn test_sequence_reset_in_realtime() {
        let mut item = ItemSequencer::new(handle());
        let mut sink = Recorder::default();
        feed(&mut item, &mut sink, &snapshot(10, false), Origin::Snapshot).unwrap();
        feed(&mut item, &mut sink, &snapshot(12, false), Origin::Snapshot).unwrap();
        let out = feed(&mut item, &mut sink, &realtime(0), Origin::Realtime).unwrap();
        assert_eq!(out.disposition, Disposition::Delivered);
        assert_eq!(item.baseline_seq(), 1);
        let out = feed(&mut item, &mut sink, &realtime(1), Origin::Realtime).unwrap();
        assert_eq!(out.disposition, Disposition::Delivered);
    }

    #[test]
    fn test_unsequenced_bypasses_buffer() {
        let mut item = ItemSequencer::new(handle());
        let mut sink = Recorder::default();
        let status = OwnedMessage::build(
            MessageHeader::unsequenced(MessageType::Status, Domain::MarketPrice, FEED),
            &[],
        )
        .unwrap();
        let out = feed(&mut item, &mut sink, &status, Origin::Realtime).unwrap();
        assert_eq!(out.disposition, Disposition::Delivered);
        assert_eq!(item.state(), ItemState::NotStarted);
        assert_eq!(item.buffered_len(), 0);
    }

    #[test]
    fn test_out_of_order_buffer_entries_are_dropped() {
        let mut item = ItemSequencer::new(handle());
        let mut sink = Recorder::default();
        for seq in [4, 3, 5] {
            feed(&mut item, &mut sink, &realtime(seq), Origin::Realtime).unwrap();
        }
        let out = feed(&mut item, &mut sink, &snapshot(2, true), Origin::Snapshot).unwrap();
        assert_eq!(out.replayed, 2);
        assert_eq!(out.discarded, 1);
        assert_eq!(
            sink.applied,
            vec![(MessageType::Refresh, 2), (MessageType::Update, 4), (MessageType::Update, 5)]
        );
    }

    #[test]
    fn test_decode_failure_does_not_stop_replay() {
        let mut item = ItemSequencer::new(handle());
        let mut sink = Recorder {
            fail_on: Some(3),
            ..Recorder::default()
        };
        for seq in 3..=5 {
            feed(&mut item, &mut sink, &realtime(seq), Origin::Realtime).unwrap();
        }
        let err = feed(&mut item, &mut sink, &snapshot(2, true), Origin::Snapshot).unwrap_err();
        assert!(matches!(err, SyncError::DecodeFailure { stream_id: FEED, .. }));
        assert_eq!(item.state(), ItemState::DoneReordering);
        assert_eq!(item.buffered_len(), 0);
        assert_eq!(
            sink.applied,
            vec![(MessageType::Refresh, 2), (MessageType::Update, 4), (MessageType::Update, 5)]
        );
    }

    #[test]
    fn test_teardown_releases_buffer() {
        let mut item = ItemSequencer::new(handle());
        let mut sink = Recorder::default();
        for seq in 1..=4 {
            feed(&mut item, &mut sink, &realtime(seq), Origin::Realtime).unwrap();
        }
        assert_eq!(item.teardown(), 4);
        assert_eq!(item.buffered_len(), 0);
        assert!(sink.applied.is_empty());
    }
}
