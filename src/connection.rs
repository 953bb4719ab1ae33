//! Connection driver: pumps transport events into a session
// (c) 2024 Ross Younger

use std::time::Instant;

use bytes::Bytes;
use quinn_proto::{
    ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionStats, Dir, Endpoint, Event,
    StreamEvent, StreamId, VarInt,
};
use tracing::{debug, info, trace, warn};

use crate::{
    protocol::{QuicTransport, GOAWAY},
    reactor::Reactor,
    session::{Session, StreamFactory},
};

/// One QUIC connection and the session riding on it
pub struct Connection<F: StreamFactory> {
    handle: ConnectionHandle,
    quic: quinn_proto::Connection,
    session: Session<F>,
    lost: Option<ConnectionError>,
}

impl<F: StreamFactory> std::fmt::Debug for Connection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("remote", &self.quic.remote_address())
            .field("session", &self.session)
            .field("lost", &self.lost)
            .finish_non_exhaustive()
    }
}

impl<F: StreamFactory> Connection<F> {
    /// Constructor
    pub fn new(handle: ConnectionHandle, quic: quinn_proto::Connection, session: Session<F>) -> Self {
        Self {
            handle,
            quic,
            session,
            lost: None,
        }
    }

    /// The endpoint's handle for this connection
    #[must_use]
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Accessor
    #[must_use]
    pub fn session(&self) -> &Session<F> {
        &self.session
    }

    /// Why the connection was lost, if it has been
    #[must_use]
    pub fn lost(&self) -> Option<&ConnectionError> {
        self.lost.as_ref()
    }

    /// Transport statistics
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.quic.stats()
    }

    /// Passes on an event from the endpoint
    pub fn handle_event(&mut self, event: ConnectionEvent) {
        self.quic.handle_event(event);
    }

    /// Creates a stream through the session's admission policy
    pub fn create_outgoing_stream<M>(&mut self, make: M) -> Option<StreamId>
    where
        M: FnOnce() -> Option<F::Stream>,
    {
        let mut transport = QuicTransport::new(&mut self.quic);
        self.session.create_outgoing_stream(&mut transport, make)
    }

    /// Processes everything that is due: timers, endpoint bookkeeping, application events,
    /// re-armed streams, and an outbound goaway if the session wants one.
    pub fn drive(&mut self, endpoint: &mut Endpoint, now: Instant) {
        if self.quic.poll_timeout().is_some_and(|t| t <= now) {
            self.quic.handle_timeout(now);
        }
        while let Some(event) = self.quic.poll_endpoint_events() {
            if let Some(event) = endpoint.handle_event(self.handle, event) {
                self.quic.handle_event(event);
            }
        }
        while let Some(event) = self.quic.poll() {
            self.dispatch(event);
        }
        if self.lost.is_none() {
            self.session
                .process_rearmed(&mut QuicTransport::new(&mut self.quic));
            if !self.session.goaway_sent() && self.session.factory().goaway_due() {
                self.send_goaway();
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::HandshakeDataReady => trace!("handshake data ready"),
            Event::Connected => {
                debug!("connected to {}", self.quic.remote_address());
                self.session.on_handshake_confirmed();
            }
            Event::ConnectionLost { reason } => {
                match reason {
                    ConnectionError::LocallyClosed | ConnectionError::ApplicationClosed(_) => {
                        debug!("connection closed: {reason}");
                    }
                    _ => info!("connection lost: {reason}"),
                }
                self.lost = Some(reason);
                self.session.on_connection_lost();
            }
            Event::Stream(StreamEvent::Opened { dir: Dir::Bi }) => {
                while let Some(id) = self.quic.streams().accept(Dir::Bi) {
                    let mut transport = QuicTransport::new(&mut self.quic);
                    let _ = self.session.create_incoming_stream(&mut transport, id);
                }
            }
            Event::Stream(StreamEvent::Opened { dir: Dir::Uni }) => {
                warn!("peer opened a unidirectional stream; ignoring");
            }
            Event::Stream(StreamEvent::Readable { id }) => {
                self.session
                    .on_readable(&mut QuicTransport::new(&mut self.quic), id);
            }
            Event::Stream(StreamEvent::Writable { id }) => {
                self.session
                    .on_writable(&mut QuicTransport::new(&mut self.quic), id);
            }
            Event::Stream(StreamEvent::Finished { id }) => self.session.on_send_complete(id),
            Event::Stream(StreamEvent::Stopped { id, error_code }) => {
                self.session.on_send_stopped(id, error_code.into_inner());
            }
            Event::Stream(StreamEvent::Available { dir }) => trace!("{dir:?} stream available"),
            Event::DatagramReceived => {
                while let Some(datagram) = self.quic.datagrams().recv() {
                    if datagram == GOAWAY {
                        self.session.on_goaway();
                    } else {
                        debug!("ignoring unexpected datagram ({} bytes)", datagram.len());
                    }
                }
            }
            Event::DatagramsUnblocked => (),
        }
    }

    fn send_goaway(&mut self) {
        match self
            .quic
            .datagrams()
            .send(Bytes::from_static(GOAWAY), true)
        {
            Ok(()) => debug!("sent goaway"),
            Err(e) => warn!("could not send goaway: {e}"),
        }
        // Either way, no more streams are admitted
        self.session.mark_goaway_sent();
    }

    /// Sends everything the connection has ready, until the socket would block
    pub fn flush(&mut self, now: Instant, buf: &mut Vec<u8>, reactor: &mut Reactor) {
        while !reactor.is_blocked() {
            buf.clear();
            let Some(transmit) = self.quic.poll_transmit(now, 1, buf) else {
                break;
            };
            reactor.send(transmit.destination, &buf[..transmit.size]);
        }
    }

    /// Closes the connection and destroys any streams still open on it
    pub fn close(&mut self, now: Instant) {
        if self.lost.is_none() {
            self.quic
                .close(now, VarInt::from_u32(0), Bytes::from_static(b"done"));
            self.session.on_connection_lost();
        }
    }

    /// When the connection next needs attention, regardless of network activity
    #[must_use]
    pub fn next_timeout(&mut self) -> Option<Instant> {
        if self.session.has_rearmed() {
            return Some(Instant::now());
        }
        self.quic.poll_timeout()
    }

    /// Whether all state for the connection can be discarded
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.quic.is_drained()
    }
}
