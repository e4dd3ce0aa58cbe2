/// Session configuration
///
/// Everything the engine needs is passed in here at setup time; there is no
/// process-wide state. Loading from disk and CLI handling belong to the caller.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::protocol::Domain;

const DEFAULT_HEARTBEAT_MS: u64 = 1000;

fn default_heartbeat_ms() -> u64 {
    DEFAULT_HEARTBEAT_MS
}

/// One multicast group of the real-time feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub address: Ipv4Addr,
    pub port: u16,
}

/// One tracked item and the streams that carry it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemConfig {
    pub feed_stream_id: u32,
    pub snapshot_stream_id: u32,
    pub domain: Domain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Pass messages for unknown streams to the sink instead of dropping them
    #[serde(default)]
    pub verbose: bool,

    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,

    /// Stream id stamped on gap requests
    pub request_stream_id: u32,

    pub realtime_channels: Vec<ChannelConfig>,

    #[serde(default)]
    pub items: Vec<ItemConfig>,
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.realtime_channels.is_empty() {
            return Err(SyncError::Config("at least one realtime channel is required".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(SyncError::Config("heartbeat_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            verbose: false,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_MS,
            request_stream_id: 1,
            realtime_channels: Vec::new(),
            items: Vec::new(),
        }
    }
}
