//! The stream transport contract, over a live QUIC connection
// (c) 2024 Ross Younger

use quinn_proto::{Connection, Dir, FinishError, ReadError, StreamId, WriteError};
use tracing::trace;

use super::{ErrorCode, Readable, StreamError, StreamTransport};

/// Binds [`StreamTransport`] to a `quinn_proto::Connection` for the duration of an event
pub struct QuicTransport<'a> {
    conn: &'a mut Connection,
}

impl std::fmt::Debug for QuicTransport<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicTransport")
            .field("side", &self.conn.side())
            .finish_non_exhaustive()
    }
}

impl<'a> QuicTransport<'a> {
    /// Constructor
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }
}

impl StreamTransport for QuicTransport<'_> {
    fn open_outgoing_stream(&mut self) -> Option<StreamId> {
        self.conn.streams().open(Dir::Bi)
    }

    fn write(&mut self, id: StreamId, data: &[u8], fin: bool) -> Result<usize, StreamError> {
        let mut stream = self.conn.send_stream(id);
        let written = if data.is_empty() {
            0
        } else {
            match stream.write(data) {
                Ok(n) => n,
                Err(WriteError::Blocked) => 0,
                Err(WriteError::Stopped(code)) => {
                    return Err(StreamError::Stopped(code.into_inner()))
                }
                Err(WriteError::ClosedStream) => return Err(StreamError::Closed),
            }
        };
        if fin && written == data.len() {
            match stream.finish() {
                Ok(()) => trace!("{id}: finished"),
                Err(FinishError::Stopped(code)) => {
                    return Err(StreamError::Stopped(code.into_inner()))
                }
                Err(FinishError::ClosedStream) => return Err(StreamError::Closed),
            }
        }
        Ok(written)
    }

    fn close_write_side(&mut self, id: StreamId, code: ErrorCode) {
        if self.conn.send_stream(id).reset(code.into()).is_err() {
            trace!("{id}: reset on a closed stream");
        }
    }

    fn read(&mut self, id: StreamId, max: usize) -> Result<Readable, StreamError> {
        let mut stream = self.conn.recv_stream(id);
        let mut chunks = stream.read(true).map_err(|_| StreamError::Closed)?;
        let result = match chunks.next(max) {
            Ok(Some(chunk)) => Ok(Readable::Data {
                offset: chunk.offset,
                bytes: chunk.bytes,
            }),
            Ok(None) => Ok(Readable::Finished),
            Err(ReadError::Blocked) => Ok(Readable::Blocked),
            Err(ReadError::Reset(code)) => Err(StreamError::Reset(code.into_inner())),
        };
        // Flow control credit is returned to the peer on the next transmit
        let _ = chunks.finalize();
        result
    }

    fn stop_reading(&mut self, id: StreamId, code: ErrorCode) {
        if self.conn.recv_stream(id).stop(code.into()).is_err() {
            trace!("{id}: stop on a closed stream");
        }
    }
}
