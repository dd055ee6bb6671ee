//! Module for the byte transport an adapter is reached through
//!
//! The diagnostic stack only needs a half duplex byte pipe with readiness checks.
//! Serial ports ([crate::hardware::serial]) and the test simulation
//! ([crate::hardware::simulation]) both implement [ByteChannel].

use std::sync::Arc;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Underlying IO Error with channel
    #[error("IO error: {0}")]
    IOError(
        #[from]
        #[source]
        Arc<std::io::Error>,
    ),
    /// The interface is not open
    #[error("channel's interface is not open")]
    InterfaceNotOpen,
    /// The channel has been closed by the other side
    #[error("channel was closed")]
    Closed,
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        Self::IOError(Arc::new(e))
    }
}

/// Bidirectional byte stream to an adapter.
///
/// All calls are made from the single context that owns the
/// [crate::hardware::elm327::CommandQueue]. Implementations must not block
/// for longer than a short poll interval.
pub trait ByteChannel: Send {
    /// Opens the stream. Called once, before any other I/O
    fn open(&mut self) -> ChannelResult<()>;

    /// Closes the stream and releases its resources
    fn close(&mut self) -> ChannelResult<()>;

    /// Returns true if the stream can accept more outbound bytes ("can write")
    fn has_space_available(&mut self) -> bool;

    /// Returns true if inbound bytes (or the end of the stream) are waiting ("bytes available")
    fn has_bytes_available(&mut self) -> bool;

    /// Writes as much of `buffer` as the stream accepts, returning the count written
    fn write(&mut self, buffer: &[u8]) -> ChannelResult<usize>;

    /// Reads into `buffer`, returning the count read. A return of 0 signals end of stream
    fn read(&mut self, buffer: &mut [u8]) -> ChannelResult<usize>;
}

impl<T: ByteChannel + ?Sized> ByteChannel for Box<T> {
    fn open(&mut self) -> ChannelResult<()> {
        (**self).open()
    }

    fn close(&mut self) -> ChannelResult<()> {
        (**self).close()
    }

    fn has_space_available(&mut self) -> bool {
        (**self).has_space_available()
    }

    fn has_bytes_available(&mut self) -> bool {
        (**self).has_bytes_available()
    }

    fn write(&mut self, buffer: &[u8]) -> ChannelResult<usize> {
        (**self).write(buffer)
    }

    fn read(&mut self, buffer: &mut [u8]) -> ChannelResult<usize> {
        (**self).read(buffer)
    }
}
