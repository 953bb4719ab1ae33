//! Per-connection stream admission and dispatch
// (c) 2024 Ross Younger
//!
//! A [`Session`] owns the streams active on one connection. It decides whether new streams
//! may be created (open-stream ceiling, goaway, handshake state), routes transport events
//! to the stream they concern, and destroys each stream once the transport reports it
//! fully closed.
//!
//! Streams implement [`StreamHandler`]. Reads use a pull discipline: a stream woken by
//! "readable" pulls regions until the transport runs dry, or until it chooses to yield
//! by returning [`Drain::Paused`], in which case the session re-arms it for the next
//! event-loop step.

mod receive;
pub use receive::{CloseObserver, FileReceiveStream, TransferOutcome, TransferReport};

mod send;
pub use send::{FileSendStream, ServeOptions};

#[cfg(test)]
pub(crate) mod test;

use std::collections::{BTreeMap, VecDeque};

use quinn_proto::StreamId;
use tracing::{debug, trace, warn};

use crate::protocol::{ErrorCode, StreamCore, StreamIo, StreamTransport};

/// Result of a readable wakeup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// The stream pulled everything available (or can read no more)
    Drained,
    /// The stream stopped early and must be woken again
    Paused,
}

/// Behaviour of one stream. The transport side of the stream is passed in on each event.
pub trait StreamHandler {
    /// Data (or FIN) is available to be pulled
    fn on_readable(&mut self, io: &mut StreamIo<'_>) -> Drain;
    /// The stream has been opened, or the transport can accept more data after refusing some
    fn on_writable(&mut self, _io: &mut StreamIo<'_>) {}
    /// The stream is fully closed and is about to be destroyed. Called exactly once.
    fn on_close(&mut self) {}
}

/// Role-specific stream construction
pub trait StreamFactory {
    /// The kind of stream this role handles
    type Stream: StreamHandler;
    /// Constructs a handler for a peer-initiated stream, or refuses it
    fn create_incoming_stream(&mut self, id: StreamId) -> Option<Self::Stream>;
    /// Whether this side now wants to tell the peer it will accept no more streams
    fn goaway_due(&self) -> bool {
        false
    }
}

struct ActiveStream<S> {
    core: StreamCore,
    handler: S,
}

/// Stream admission policy and the set of live streams for one connection
pub struct Session<F: StreamFactory> {
    factory: F,
    streams: BTreeMap<StreamId, ActiveStream<F::Stream>>,
    max_open_streams: usize,
    respect_goaway: bool,
    encryption_established: bool,
    handshake_confirmed: bool,
    goaway_received: bool,
    goaway_sent: bool,
    rearmed: VecDeque<StreamId>,
}

impl<F: StreamFactory> std::fmt::Debug for Session<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .field("max_open_streams", &self.max_open_streams)
            .field("respect_goaway", &self.respect_goaway)
            .field("encryption_established", &self.encryption_established)
            .field("handshake_confirmed", &self.handshake_confirmed)
            .field("goaway_received", &self.goaway_received)
            .field("goaway_sent", &self.goaway_sent)
            .finish_non_exhaustive()
    }
}

impl<F: StreamFactory> Session<F> {
    /// Constructor
    pub fn new(factory: F, max_open_streams: usize, respect_goaway: bool) -> Self {
        Self {
            factory,
            streams: BTreeMap::new(),
            max_open_streams,
            respect_goaway,
            encryption_established: false,
            handshake_confirmed: false,
            goaway_received: false,
            goaway_sent: false,
            rearmed: VecDeque::new(),
        }
    }

    /// Creates and admits a new outgoing stream.
    ///
    /// Refused if encryption is not yet established, if the open-stream ceiling has been reached,
    /// or if the peer sent goaway and we respect it. In those cases `make` is not called and the
    /// transport is not touched.
    ///
    /// Once the transport has opened the stream, the handler is given its first writable event
    /// so it can send its request.
    pub fn create_outgoing_stream<M>(
        &mut self,
        transport: &mut dyn StreamTransport,
        make: M,
    ) -> Option<StreamId>
    where
        M: FnOnce() -> Option<F::Stream>,
    {
        if !self.encryption_established {
            debug!("cannot create a stream before encryption is established");
            return None;
        }
        if self.streams.len() >= self.max_open_streams {
            debug!(
                "cannot create a stream: {} of {} open",
                self.streams.len(),
                self.max_open_streams
            );
            return None;
        }
        if self.goaway_received && self.respect_goaway {
            debug!("cannot create a stream: peer has sent goaway");
            return None;
        }
        let mut handler = make()?;
        let Some(id) = transport.open_outgoing_stream() else {
            debug!("transport refused to open a stream");
            return None;
        };
        trace!("{id}: opened");
        let mut core = StreamCore::new(id);
        handler.on_writable(&mut StreamIo::new(transport, &mut core));
        let _ = self.streams.insert(id, ActiveStream { core, handler });
        self.reap(id);
        Some(id)
    }

    /// Admits (or rejects) a stream the peer has opened, then processes any data that came with it.
    ///
    /// Rejected streams are stopped and reset.
    pub fn create_incoming_stream(
        &mut self,
        transport: &mut dyn StreamTransport,
        id: StreamId,
    ) -> bool {
        let handler = if self.streams.len() >= self.max_open_streams {
            warn!("{id}: rejected, {} streams already open", self.streams.len());
            None
        } else if self.goaway_sent {
            debug!("{id}: rejected, goaway already sent");
            None
        } else {
            self.factory.create_incoming_stream(id)
        };
        let Some(handler) = handler else {
            transport.stop_reading(id, ErrorCode::Rejected);
            transport.close_write_side(id, ErrorCode::Rejected);
            return false;
        };
        trace!("{id}: accepted");
        let _ = self.streams.insert(
            id,
            ActiveStream {
                core: StreamCore::new(id),
                handler,
            },
        );
        self.on_readable(transport, id);
        true
    }

    /// Runs a closure against one live stream, then destroys the stream if that left it fully closed.
    ///
    /// Returns `None` if the stream is not live.
    pub fn with_stream<R>(
        &mut self,
        transport: &mut dyn StreamTransport,
        id: StreamId,
        f: impl FnOnce(&mut F::Stream, &mut StreamIo<'_>) -> R,
    ) -> Option<R> {
        let active = self.streams.get_mut(&id)?;
        let result = f(
            &mut active.handler,
            &mut StreamIo::new(transport, &mut active.core),
        );
        self.reap(id);
        Some(result)
    }

    /// Transport event: data is available on a stream
    ///
    /// Ignored once the stream's read side has closed.
    pub fn on_readable(&mut self, transport: &mut dyn StreamTransport, id: StreamId) {
        let drain = self.with_stream(transport, id, |handler, io| {
            if io.read_side_open() {
                handler.on_readable(io)
            } else {
                Drain::Drained
            }
        });
        if drain == Some(Drain::Paused) && !self.rearmed.contains(&id) {
            self.rearmed.push_back(id);
        }
    }

    /// Transport event: a stream may send again
    pub fn on_writable(&mut self, transport: &mut dyn StreamTransport, id: StreamId) {
        let _ = self.with_stream(transport, id, |handler, io| handler.on_writable(io));
    }

    /// Transport event: everything sent on a stream has been delivered
    pub fn on_send_complete(&mut self, id: StreamId) {
        if let Some(active) = self.streams.get_mut(&id) {
            active.core.mark_send_complete();
        }
        self.reap(id);
    }

    /// Transport event: the peer asked us to stop sending on a stream
    pub fn on_send_stopped(&mut self, id: StreamId, code: u64) {
        debug!("{id}: peer stopped the stream (code {code})");
        self.on_send_complete(id);
    }

    /// Wakes every stream that paused before draining its read side
    pub fn process_rearmed(&mut self, transport: &mut dyn StreamTransport) {
        let pending = std::mem::take(&mut self.rearmed);
        for id in pending {
            self.on_readable(transport, id);
        }
    }

    /// Whether any stream is waiting to be woken
    #[must_use]
    pub fn has_rearmed(&self) -> bool {
        !self.rearmed.is_empty()
    }

    /// The connection has gone. Every live stream is closed and destroyed.
    pub fn on_connection_lost(&mut self) {
        self.rearmed.clear();
        let streams = std::mem::take(&mut self.streams);
        for (id, mut active) in streams {
            trace!("{id}: closed by connection loss");
            active.handler.on_close();
        }
    }

    fn reap(&mut self, id: StreamId) {
        if !self
            .streams
            .get(&id)
            .is_some_and(|active| active.core.is_fully_closed())
        {
            return;
        }
        if let Some(mut active) = self.streams.remove(&id) {
            trace!("{id}: fully closed");
            active.handler.on_close();
        }
    }

    // STATE CHANGES ///////////////////////////////////////////////////////////////////

    /// The handshake has progressed far enough for application data to be protected
    pub fn on_encryption_established(&mut self) {
        self.encryption_established = true;
    }

    /// The handshake is complete
    pub fn on_handshake_confirmed(&mut self) {
        self.encryption_established = true;
        self.handshake_confirmed = true;
    }

    /// The peer will accept no more streams
    pub fn on_goaway(&mut self) {
        if !self.goaway_received {
            debug!("peer sent goaway");
        }
        self.goaway_received = true;
    }

    /// We have told the peer we will accept no more streams
    pub fn mark_goaway_sent(&mut self) {
        self.goaway_sent = true;
    }

    // QUERIES /////////////////////////////////////////////////////////////////////////

    /// Number of admitted streams that have not yet been destroyed
    #[must_use]
    pub fn open_stream_count(&self) -> usize {
        self.streams.len()
    }

    /// The open-stream ceiling
    #[must_use]
    pub fn max_open_streams(&self) -> usize {
        self.max_open_streams
    }

    /// Whether the peer has sent goaway
    #[must_use]
    pub fn goaway_received(&self) -> bool {
        self.goaway_received
    }

    /// Whether we have sent goaway
    #[must_use]
    pub fn goaway_sent(&self) -> bool {
        self.goaway_sent
    }

    /// Whether the handshake is complete
    #[must_use]
    pub fn is_handshake_confirmed(&self) -> bool {
        self.handshake_confirmed
    }

    /// Whether application data can be sent
    #[must_use]
    pub fn is_encryption_established(&self) -> bool {
        self.encryption_established
    }

    /// Whether the given stream has been destroyed (or never existed)
    #[must_use]
    pub fn is_closed_stream(&self, id: StreamId) -> bool {
        !self.streams.contains_key(&id)
    }

    /// Accessor
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.factory
    }
}
