//! Outgoing byte sinks for encoded frames.

use std::sync::{Arc, Mutex};

/// Destination for encoded frames, one per direction of a connection.
pub trait CommandSerializer {
    /// Queues one complete frame. Returns `false` once the transport is gone.
    fn serialize(&mut self, frame: &[u8]) -> bool;

    /// Pushes queued frames to the peer.
    fn flush(&mut self) -> bool {
        true
    }
}

/// In-memory serializer. Clones share the same buffer, so one clone can be
/// handed to a client while another is drained into a server.
#[derive(Debug, Clone, Default)]
pub struct CommandBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything serialized so far.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().expect("command buffer poisoned")
    }
}

impl CommandSerializer for CommandBuffer {
    fn serialize(&mut self, frame: &[u8]) -> bool {
        self.lock().extend_from_slice(frame);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_one_buffer() {
        let buffer = CommandBuffer::new();
        let mut writer = buffer.clone();
        assert!(writer.serialize(&[1, 2, 3]));
        assert!(writer.serialize(&[4]));
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.take(), vec![1, 2, 3, 4]);
        assert!(writer.flush());
        assert!(buffer.is_empty());
    }
}
