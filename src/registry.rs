/// Item registry
///
/// Owns every `ItemSequencer` of a session and routes inbound messages to
/// them by stream id. Items are registered once during setup.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::ItemConfig;
use crate::decoder::MessageRef;
use crate::error::{Result, SyncError};
use crate::protocol::Domain;
use crate::sequencer::{ItemSequencer, Origin, ProcessOutcome};
use crate::sink::MessageSink;

/// Stable reference to a registered item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemHandle {
    index: usize,
    feed_stream_id: u32,
    snapshot_stream_id: u32,
    domain: Domain,
}

impl ItemHandle {
    pub(crate) fn new(index: usize, feed_stream_id: u32, snapshot_stream_id: u32, domain: Domain) -> Self {
        ItemHandle {
            index,
            feed_stream_id,
            snapshot_stream_id,
            domain,
        }
    }

    pub fn feed_stream_id(&self) -> u32 {
        self.feed_stream_id
    }

    pub fn snapshot_stream_id(&self) -> u32 {
        self.snapshot_stream_id
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }
}

#[derive(Debug, Default)]
pub struct ItemRegistry {
    items: Vec<ItemSequencer>,
    by_feed: HashMap<(u32, Domain), usize>,
    by_snapshot: HashMap<(u32, Domain), usize>,
    verbose: bool,
}

impl ItemRegistry {
    pub fn new(verbose: bool) -> Self {
        ItemRegistry {
            verbose,
            ..Default::default()
        }
    }

    /// Register every configured item, failing on the first duplicate
    pub fn from_items(items: &[ItemConfig], verbose: bool) -> Result<Self> {
        let mut registry = ItemRegistry::new(verbose);
        for item in items {
            registry.register(item.feed_stream_id, item.snapshot_stream_id, item.domain)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, feed_stream_id: u32, snapshot_stream_id: u32, domain: Domain) -> Result<ItemHandle> {
        if self.by_feed.contains_key(&(feed_stream_id, domain)) {
            return Err(SyncError::DuplicateRegistration {
                stream_id: feed_stream_id,
                domain,
                kind: "feed",
            });
        }
        if self.by_snapshot.contains_key(&(snapshot_stream_id, domain)) {
            return Err(SyncError::DuplicateRegistration {
                stream_id: snapshot_stream_id,
                domain,
                kind: "snapshot",
            });
        }

        let index = self.items.len();
        let handle = ItemHandle::new(index, feed_stream_id, snapshot_stream_id, domain);
        self.items.push(ItemSequencer::new(handle));
        self.by_feed.insert((feed_stream_id, domain), index);
        self.by_snapshot.insert((snapshot_stream_id, domain), index);

        debug!(feed_stream_id, snapshot_stream_id, ?domain, "registered item");
        Ok(handle)
    }

    pub fn lookup_by_feed_id(&self, id: u32, domain: Domain) -> Option<ItemHandle> {
        self.by_feed.get(&(id, domain)).map(|&i| *self.items[i].handle())
    }

    pub fn lookup_by_snapshot_id(&self, id: u32, domain: Domain) -> Option<ItemHandle> {
        self.by_snapshot.get(&(id, domain)).map(|&i| *self.items[i].handle())
    }

    pub fn item(&self, handle: &ItemHandle) -> &ItemSequencer {
        &self.items[handle.index]
    }

    pub fn item_mut(&mut self, handle: &ItemHandle) -> &mut ItemSequencer {
        &mut self.items[handle.index]
    }

    pub fn items(&self) -> impl Iterator<Item = &ItemSequencer> {
        self.items.iter()
    }

    /// Hand a message to the sequencer of the item it belongs to.
    ///
    /// Snapshot messages carry the snapshot stream id; everything else the
    /// feed stream id. Unknown streams go to `sink.passthrough` in verbose
    /// mode and are reported as `UnroutableMessage`.
    pub fn route<S>(&mut self, message: &MessageRef<'_>, origin: Origin, sink: &mut S) -> Result<ProcessOutcome>
    where
        S: MessageSink + ?Sized,
    {
        let stream_id = message.stream_id();
        let domain = message.domain();
        let handle = if origin.is_snapshot() {
            self.lookup_by_snapshot_id(stream_id, domain)
        } else {
            self.lookup_by_feed_id(stream_id, domain)
        };

        match handle {
            Some(handle) => self.items[handle.index].process(message, origin, message.sequence(), sink),
            None => {
                if self.verbose {
                    if let Err(err) = sink.passthrough(message) {
                        warn!(stream_id, error = %err, "passthrough decode failed");
                    }
                }
                Err(SyncError::UnroutableMessage { stream_id, domain })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Release every buffered message of every item; returns the total released
    pub fn teardown(&mut self) -> usize {
        self.items.iter_mut().map(ItemSequencer::teardown).sum()
    }
}
