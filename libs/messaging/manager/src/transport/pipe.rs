//! Physical pipes
//!
//! [`MessagePipe`] is the boundary to whatever moves bytes between processes.
//! [`ChannelPipe`] is the in-memory implementation: two crossbeam channels
//! cross-wired into a pair of endpoints.

use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{MessageManagerError, Result};

/// Ordered, reliable byte-frame pipe
pub trait MessagePipe: Send + Sync {
    fn send(&self, frame: Bytes) -> Result<()>;

    /// Next frame, `None` when nothing arrived within `timeout`
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Bytes>>;

    /// Next frame if one is already queued
    fn try_recv(&self) -> Result<Option<Bytes>>;
}

/// In-memory pipe endpoint
#[derive(Debug)]
pub struct ChannelPipe {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
}

impl ChannelPipe {
    /// Two connected endpoints
    pub fn pair() -> (ChannelPipe, ChannelPipe) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        (
            ChannelPipe { tx: a_tx, rx: a_rx },
            ChannelPipe { tx: b_tx, rx: b_rx },
        )
    }

    /// Frames waiting to be read
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

fn closed() -> MessageManagerError {
    MessageManagerError::transport("pipe closed by peer")
}

impl MessagePipe for ChannelPipe {
    fn send(&self, frame: Bytes) -> Result<()> {
        self.tx.send(frame).map_err(|_| closed())
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Bytes>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(closed()),
        }
    }

    fn try_recv(&self) -> Result<Option<Bytes>> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(closed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_is_cross_wired() {
        let (a, b) = ChannelPipe::pair();
        a.send(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(b.pending(), 1);
        assert_eq!(b.try_recv().unwrap(), Some(Bytes::from_static(b"hello")));
        assert_eq!(a.try_recv().unwrap(), None);
    }

    #[test]
    fn test_dropped_peer_reports_closed() {
        let (a, b) = ChannelPipe::pair();
        drop(b);
        assert!(a.send(Bytes::new()).is_err());
        assert!(a.recv_timeout(Duration::from_millis(1)).is_err());
    }
}
