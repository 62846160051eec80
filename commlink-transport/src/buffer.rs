//! Receive accumulator shared by all transports

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Growing buffer of every byte received since it was last consumed
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    inner: Mutex<BytesMut>,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk: &[u8]) {
        self.inner.lock().extend_from_slice(chunk);
    }

    /// Snapshot of the accumulated bytes as text (invalid UTF-8 is replaced)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).into_owned()
    }

    /// Drain the accumulated bytes
    pub fn take(&self) -> Bytes {
        self.inner.lock().split().freeze()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_until_taken() {
        let buffer = ReceiveBuffer::new();
        buffer.append(b"PI");
        buffer.append(b"NG");
        assert_eq!(buffer.text(), "PING");
        assert_eq!(buffer.len(), 4);

        let taken = buffer.take();
        assert_eq!(&taken[..], b"PING");
        assert!(buffer.is_empty());

        buffer.append(b"x");
        buffer.clear();
        assert_eq!(buffer.text(), "");
    }
}
