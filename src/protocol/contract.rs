//! The stream transport contract
// (c) 2024 Ross Younger

use bytes::Bytes;
use quinn_proto::StreamId;

use super::ErrorCode;

/// Outcome of pulling from the read side of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readable {
    /// A contiguous region of the stream
    Data {
        /// Position of the first byte within the stream
        offset: u64,
        /// The data
        bytes: Bytes,
    },
    /// Nothing more is available right now
    Blocked,
    /// The peer has finished sending (FIN)
    Finished,
}

/// Stream-level failures reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The stream does not exist, or that side of it is already closed
    #[error("stream is closed")]
    Closed,
    /// The peer asked us to stop sending
    #[error("peer stopped the stream (code {0})")]
    Stopped(u64),
    /// The peer abandoned its side of the stream
    #[error("peer reset the stream (code {0})")]
    Reset(u64),
    /// We have already closed our write side
    #[error("write side is already closed")]
    WriteSideClosed,
}

/// What the stream machinery needs from a multiplexed byte-stream transport
pub trait StreamTransport {
    /// Opens a new outgoing bidirectional stream, if the transport permits
    fn open_outgoing_stream(&mut self) -> Option<StreamId>;

    /// Offers `data` to the stream. Returns the number of bytes consumed, which may be fewer than
    /// offered (including zero) under flow control.
    ///
    /// If `fin` is set and all of `data` was consumed, the write side is finished.
    fn write(&mut self, id: StreamId, data: &[u8], fin: bool) -> Result<usize, StreamError>;

    /// Abruptly closes the write side of a stream
    fn close_write_side(&mut self, id: StreamId, code: ErrorCode);

    /// Pulls the next contiguous region of at most `max` bytes from the read side
    fn read(&mut self, id: StreamId, max: usize) -> Result<Readable, StreamError>;

    /// Asks the peer to stop sending on this stream
    fn stop_reading(&mut self, id: StreamId, code: ErrorCode);
}

/// Per-stream state common to both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCore {
    id: StreamId,
    write_side_open: bool,
    read_side_open: bool,
    /// Set once the transport no longer needs anything from our write side
    send_complete: bool,
}

impl StreamCore {
    /// Constructor
    #[must_use]
    pub fn new(id: StreamId) -> Self {
        Self {
            id,
            write_side_open: true,
            read_side_open: true,
            send_complete: false,
        }
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Records that all data written has been delivered, or that the peer does not want it
    pub fn mark_send_complete(&mut self) {
        self.write_side_open = false;
        self.send_complete = true;
    }

    /// Records that the read side can deliver nothing more
    pub fn mark_read_closed(&mut self) {
        self.read_side_open = false;
    }

    /// A stream is fully closed once both halves are closed and the transport is done with the write side
    #[must_use]
    pub fn is_fully_closed(&self) -> bool {
        !self.write_side_open && !self.read_side_open && self.send_complete
    }
}

/// A stream's view of its transport, bound to its own state.
///
/// This enforces the half-close rules: once the write side is closed nothing more
/// may be written, and once the read side is closed nothing more is pulled.
pub struct StreamIo<'a> {
    transport: &'a mut dyn StreamTransport,
    core: &'a mut StreamCore,
}

impl std::fmt::Debug for StreamIo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIo").field("core", &self.core).finish()
    }
}

impl<'a> StreamIo<'a> {
    /// Constructor
    pub fn new(transport: &'a mut dyn StreamTransport, core: &'a mut StreamCore) -> Self {
        Self { transport, core }
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.core.id
    }

    /// Whether we may still send on this stream
    #[must_use]
    pub fn write_side_open(&self) -> bool {
        self.core.write_side_open
    }

    /// Whether the peer may still send to us on this stream
    #[must_use]
    pub fn read_side_open(&self) -> bool {
        self.core.read_side_open
    }

    /// Offers data to the transport, returning the number of bytes consumed.
    ///
    /// If `fin` is set and everything was consumed, the write side is closed.
    pub fn write(&mut self, data: &[u8], fin: bool) -> Result<usize, StreamError> {
        if !self.core.write_side_open {
            return Err(StreamError::WriteSideClosed);
        }
        match self.transport.write(self.core.id, data, fin) {
            Ok(n) => {
                if fin && n == data.len() {
                    self.core.write_side_open = false;
                }
                Ok(n)
            }
            Err(e) => {
                // Whatever went wrong, nothing more can be sent.
                self.core.mark_send_complete();
                Err(e)
            }
        }
    }

    /// Finishes the write side without sending anything more
    pub fn finish(&mut self) -> Result<(), StreamError> {
        let _ = self.write(&[], true)?;
        Ok(())
    }

    /// Abruptly closes the write side, if it is still open
    pub fn close_write_side(&mut self, code: ErrorCode) {
        if self.core.write_side_open {
            self.transport.close_write_side(self.core.id, code);
        }
        self.core.mark_send_complete();
    }

    /// Pulls the next region of at most `max` bytes.
    ///
    /// The read side is closed on FIN or reset.
    pub fn read(&mut self, max: usize) -> Result<Readable, StreamError> {
        if !self.core.read_side_open {
            return Err(StreamError::Closed);
        }
        let result = self.transport.read(self.core.id, max);
        match result {
            Ok(Readable::Finished) | Err(_) => self.core.read_side_open = false,
            Ok(_) => (),
        }
        result
    }

    /// Stops the read side, if it is still open
    pub fn stop_reading(&mut self, code: ErrorCode) {
        if self.core.read_side_open {
            self.transport.stop_reading(self.core.id, code);
            self.core.read_side_open = false;
        }
    }
}
