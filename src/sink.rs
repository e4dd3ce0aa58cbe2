/// Delivery target for sequenced messages
///
/// The engine decides *when* a message may be applied; the sink decides what
/// applying it means (decode the payload, update a book, publish, ...).

use crate::decoder::{DecodeError, MessageRef};
use crate::registry::ItemHandle;

pub trait MessageSink {
    /// Decode and apply a message that belongs to `item`
    fn apply(&mut self, item: &ItemHandle, message: &MessageRef<'_>) -> Result<(), DecodeError>;

    /// Messages for unknown streams when verbose mode is on. Decode only.
    fn passthrough(&mut self, _message: &MessageRef<'_>) -> Result<(), DecodeError> {
        Ok(())
    }
}

impl<F> MessageSink for F
where
    F: FnMut(&ItemHandle, &MessageRef<'_>) -> Result<(), DecodeError>,
{
    fn apply(&mut self, item: &ItemHandle, message: &MessageRef<'_>) -> Result<(), DecodeError> {
        self(item, message)
    }
}
