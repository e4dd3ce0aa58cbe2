/// Engine error type
///
/// Only configuration problems found during setup and connection failures on
/// the recovery channel are fatal. Everything else is a per-message diagnostic.

use std::io;

use thiserror::Error;

use crate::decoder::DecodeError;
use crate::protocol::Domain;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("stream {stream_id} ({domain:?}) is already registered as a {kind} stream")]
    DuplicateRegistration {
        stream_id: u32,
        domain: Domain,
        kind: &'static str,
    },

    #[error("decode failed for stream {stream_id}: {source}")]
    DecodeFailure {
        stream_id: u32,
        #[source]
        source: DecodeError,
    },

    #[error("no item registered for stream {stream_id} ({domain:?})")]
    UnroutableMessage { stream_id: u32, domain: Domain },

    #[error("gap recovery channel is not logged in")]
    RecoveryChannelNotReady,

    #[error("unknown real-time channel {0}")]
    UnknownChannel(usize),

    #[error("recovery channel failure: {0}")]
    Connection(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the session should stop on this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::DuplicateRegistration { .. } | SyncError::Connection(_) | SyncError::Config(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SyncError::DuplicateRegistration {
            stream_id: 1,
            domain: Domain::MarketPrice,
            kind: "feed",
        }
        .is_fatal());
        assert!(!SyncError::RecoveryChannelNotReady.is_fatal());
        assert!(!SyncError::UnknownChannel(3).is_fatal());
        assert!(!SyncError::UnroutableMessage {
            stream_id: 1,
            domain: Domain::MarketPrice
        }
        .is_fatal());
        assert!(!SyncError::DecodeFailure {
            stream_id: 1,
            source: DecodeError::Rejected
        }
        .is_fatal());
    }
}
