//! Virtual stream lifecycle with half-close.
//!
//! `HalfClosedLocal` means this side has finished writing (its FIN_WRITE is
//! out) but may still read; `HalfClosedRemote` means the remote finished
//! writing and this side may still write. Both halves finished, or a
//! close/reset, lands in `Closed`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    pub fn can_write(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn can_read(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn is_closed(self) -> bool {
        self == StreamState::Closed
    }

    /// This side sent FIN_WRITE (or received FIN_READ, which forbids
    /// further writes just the same).
    pub fn after_local_fin(self) -> StreamState {
        match self {
            StreamState::Opening | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        }
    }

    /// The remote sent FIN_WRITE: no more inbound bytes after the buffer
    /// drains.
    pub fn after_remote_fin(self) -> StreamState {
        match self {
            StreamState::Opening | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        }
    }
}
