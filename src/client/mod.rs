//! client-side (_initiator_) state machine and main loop
// (c) 2024 Ross Younger
//!
//! A [`Client`] owns one UDP socket, registered with a single-threaded [`Reactor`], and at most
//! one QUIC connection. Its blocking calls ([`Client::connect`], [`Client::wait_for_stream_to_close`]
//! and friends) all pump the same step: wait for the socket or a timer, feed any datagrams to the
//! endpoint, then let the connection process its events and flush what it has to send.

mod main_loop;
mod options;
mod progress;

#[allow(clippy::module_name_repetitions)]
pub use main_loop::client_main;
pub use options::Parameters;
pub(crate) use progress::MAX_UPDATE_FPS;

use std::{
    cell::RefCell,
    collections::VecDeque,
    io,
    net::SocketAddr,
    path::Path,
    rc::Rc,
    time::{Duration, Instant},
};

use anyhow::{Context as _, Result};
use bytes::BytesMut;
use indicatif::ProgressBar;
use quinn_proto::{ConnectionError, ConnectionStats, DatagramEvent, Endpoint, StreamId};
use tracing::{debug, error, info, trace, warn};

use crate::{
    connection::Connection,
    reactor::{Reactor, Readiness},
    session::{FileReceiveStream, Session, StreamFactory, TransferReport},
    transport,
    util::socket::bind_for_peer,
    Configuration,
};

/// The longest a blocking call waits in one step before rechecking its condition
const WAIT_STEP: Duration = Duration::from_millis(50);

/// Lifecycle of a [`Client`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ClientState {
    /// No socket yet
    Uninitialized,
    /// Socket bound and registered
    Initialized,
    /// Handshake in progress
    Connecting,
    /// Handshake complete; requests may be sent
    Connected,
    /// The connection has ended. The client may be initialized again.
    Closed,
}

/// The client never accepts streams opened by the server
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectIncoming;

impl StreamFactory for RejectIncoming {
    type Stream = FileReceiveStream;

    fn create_incoming_stream(&mut self, id: StreamId) -> Option<FileReceiveStream> {
        warn!("{id}: server tried to open a stream; rejecting");
        None
    }
}

/// Why a request could not be sent
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The client is not connected
    #[error("not connected")]
    NotConnected,
    /// The session would not admit another stream
    #[error("no stream available")]
    Refused,
    /// The local output file could not be opened
    #[error("cannot open output file: {0}")]
    Output(#[from] io::Error),
}

/// Single-threaded file fetch client
pub struct Client {
    config: Configuration,
    peer: SocketAddr,
    state: ClientState,
    reactor: Reactor,
    endpoint: Option<Endpoint>,
    connection: Option<Connection<RejectIncoming>>,
    error: Option<anyhow::Error>,
    reports: Rc<RefCell<VecDeque<TransferReport>>>,
    last_stats: Option<ConnectionStats>,
    buf: Vec<u8>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("connection", &self.connection)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Constructor. Nothing touches the network until [`Client::initialize`].
    pub fn new(config: Configuration, peer: SocketAddr) -> Result<Self> {
        Ok(Self {
            config,
            peer,
            state: ClientState::Uninitialized,
            reactor: Reactor::new()?,
            endpoint: None,
            connection: None,
            error: None,
            reports: Rc::default(),
            last_stats: None,
            buf: Vec::new(),
        })
    }

    /// Creates the UDP socket, tunes its buffers, and registers it with the reactor
    pub fn initialize(&mut self) -> Result<()> {
        anyhow::ensure!(
            matches!(self.state, ClientState::Uninitialized | ClientState::Closed),
            "client is already initialized ({})",
            self.state
        );
        self.reactor.deregister();
        let buffer = usize::try_from(self.config.udp_buffer).context("udp_buffer overflow")?;
        let socket = bind_for_peer(self.peer, buffer).context("creating client socket")?;
        let local = self.reactor.register(socket)?;
        self.endpoint = Some(Endpoint::new(
            transport::endpoint_config(&self.config),
            None,
            true,
            None,
        ));
        self.connection = None;
        self.state = ClientState::Initialized;
        debug!("client bound to {local}");
        Ok(())
    }

    /// Starts the handshake and blocks until it completes or fails.
    ///
    /// On failure, [`Client::connection_error`] holds the reason.
    pub fn connect(&mut self) -> bool {
        if self.state != ClientState::Initialized {
            warn!("cannot connect: client is {}", self.state);
            return false;
        }
        if let Err(e) = self.start_connect() {
            error!("{e:#}");
            self.error = Some(e);
            self.state = ClientState::Closed;
            return false;
        }
        while self.state == ClientState::Connecting {
            self.step(WAIT_STEP);
        }
        self.state == ClientState::Connected
    }

    fn start_connect(&mut self) -> Result<()> {
        let endpoint = self.endpoint.as_mut().context("client is not initialized")?;
        let client_config = transport::client_config(&self.config)?;
        let (handle, quic) = endpoint
            .connect(
                Instant::now(),
                client_config,
                self.peer,
                &self.config.server_name,
            )
            .context("starting connection")?;
        let max_streams = usize::try_from(self.config.max_streams).unwrap_or(usize::MAX);
        let session = Session::new(RejectIncoming, max_streams, self.config.respect_goaway);
        debug!("connecting to {} as {:?}", self.peer, handle);
        self.connection = Some(Connection::new(handle, quic, session));
        self.error = None;
        self.state = ClientState::Connecting;
        self.pump();
        Ok(())
    }

    /// Sends a request for a file.
    ///
    /// The output file is opened first; if that fails, the transport is not touched.
    /// When the stream closes, its [`TransferReport`] is queued for [`Client::take_reports`].
    pub fn request(
        &mut self,
        name: &str,
        finish: bool,
        progress: ProgressBar,
    ) -> Result<StreamId, RequestError> {
        if self.state != ClientState::Connected {
            return Err(RequestError::NotConnected);
        }
        let Some(conn) = self.connection.as_mut() else {
            return Err(RequestError::NotConnected);
        };
        let output_dir = Path::new(&self.config.output_dir);
        let read_budget = self.config.read_budget;
        let reports = Rc::clone(&self.reports);
        let mut open_error = None;
        let id = conn.create_outgoing_stream(|| {
            match FileReceiveStream::open(output_dir, name, finish, read_budget, progress) {
                Ok(mut stream) => {
                    stream.set_observer(Box::new(move |s| {
                        reports.borrow_mut().push_back(s.report());
                    }));
                    Some(stream)
                }
                Err(e) => {
                    open_error = Some(e);
                    None
                }
            }
        });
        conn.flush(Instant::now(), &mut self.buf, &mut self.reactor);
        match (id, open_error) {
            (Some(id), _) => {
                debug!("{id}: requested {name}");
                Ok(id)
            }
            (None, Some(e)) => Err(RequestError::Output(e)),
            (None, None) => Err(RequestError::Refused),
        }
    }

    /// Sends a request, reporting success as a bool
    pub fn send_request(&mut self, name: &str, finish: bool) -> bool {
        match self.request(name, finish, ProgressBar::hidden()) {
            Ok(_) => true,
            Err(e) => {
                warn!("request for {name} not sent: {e}");
                false
            }
        }
    }

    /// Requests each file in turn, then waits until no requests remain active.
    ///
    /// Returns whether at least one request was sent.
    pub fn send_requests_and_wait_for_response(&mut self, names: &[String]) -> bool {
        let mut any = false;
        for name in names {
            any |= self.send_request(name, true);
        }
        if any {
            while self.wait_for_events() {}
        }
        any
    }

    /// Runs one blocking step.
    ///
    /// Returns true while the connection is up with streams still open.
    pub fn wait_for_events(&mut self) -> bool {
        if self.state != ClientState::Connected {
            return false;
        }
        self.step(WAIT_STEP);
        self.state == ClientState::Connected && self.open_streams() > 0
    }

    /// Blocks until `predicate` holds over the session, or the connection drops.
    ///
    /// Returns the final value of the predicate.
    pub fn wait_until<P>(&mut self, predicate: P) -> bool
    where
        P: Fn(&Session<RejectIncoming>) -> bool,
    {
        loop {
            let Some(conn) = self.connection.as_ref() else {
                return false;
            };
            if predicate(conn.session()) {
                return true;
            }
            if !matches!(
                self.state,
                ClientState::Connecting | ClientState::Connected
            ) {
                return false;
            }
            self.step(WAIT_STEP);
        }
    }

    /// Blocks until the given stream has been destroyed
    pub fn wait_for_stream_to_close(&mut self, id: StreamId) -> bool {
        self.wait_until(|s| s.is_closed_stream(id))
    }

    /// Blocks until the handshake is confirmed
    pub fn wait_for_handshake_confirmed(&mut self) -> bool {
        self.wait_until(Session::is_handshake_confirmed)
    }

    /// Closes the connection (if any), and releases the socket
    pub fn disconnect(&mut self) {
        let now = Instant::now();
        if let Some(conn) = self.connection.as_mut() {
            if matches!(
                self.state,
                ClientState::Connecting | ClientState::Connected
            ) {
                info!("disconnecting from {}", self.peer);
                conn.close(now);
                conn.flush(now, &mut self.buf, &mut self.reactor);
            }
            self.last_stats = Some(conn.stats());
        }
        self.connection = None;
        self.endpoint = None;
        self.reactor.deregister();
        if self.state != ClientState::Uninitialized {
            self.state = ClientState::Closed;
        }
    }

    /// One pass of the event loop: wait, read, then drive the connection
    fn step(&mut self, max_wait: Duration) {
        let mut deadline = Instant::now() + max_wait;
        if let Some(t) = self.connection.as_mut().and_then(Connection::next_timeout) {
            deadline = deadline.min(t);
        }
        match self.reactor.wait(Some(deadline)) {
            Ok(Readiness::Readable) => self.on_readable(),
            Ok(Readiness::Writable) => self.reactor.on_writable(),
            Ok(Readiness::Timeout) => (),
            Err(e) => {
                error!("event wait failed: {e}");
                self.error = Some(anyhow::Error::new(e).context("waiting for network events"));
                self.disconnect();
                return;
            }
        }
        self.pump();
    }

    /// Hands every datagram that is immediately available to the endpoint
    fn on_readable(&mut self) {
        loop {
            match self.reactor.recv() {
                Ok(Some((peer, data))) => self.handle_datagram(peer, data),
                Ok(None) => break,
                Err(e) => {
                    warn!("receive failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, peer: SocketAddr, data: BytesMut) {
        let Some(endpoint) = self.endpoint.as_mut() else {
            return;
        };
        self.buf.clear();
        match endpoint.handle(Instant::now(), peer, None, None, data, &mut self.buf) {
            Some(DatagramEvent::ConnectionEvent(handle, event)) => {
                match self.connection.as_mut().filter(|c| c.handle() == handle) {
                    Some(conn) => conn.handle_event(event),
                    None => trace!("event for unknown connection {handle:?}"),
                }
            }
            Some(DatagramEvent::NewConnection(incoming)) => {
                debug!("refusing incoming connection from {peer}");
                let transmit = endpoint.refuse(incoming, &mut self.buf);
                self.reactor
                    .send(transmit.destination, &self.buf[..transmit.size]);
            }
            Some(DatagramEvent::Response(transmit)) => {
                self.reactor
                    .send(transmit.destination, &self.buf[..transmit.size]);
            }
            None => (),
        }
    }

    /// Lets the connection process whatever is due, then sends what it has ready
    fn pump(&mut self) {
        let now = Instant::now();
        if let (Some(endpoint), Some(conn)) = (self.endpoint.as_mut(), self.connection.as_mut())
        {
            conn.drive(endpoint, now);
            conn.flush(now, &mut self.buf, &mut self.reactor);
        }
        self.update_state();
    }

    fn update_state(&mut self) {
        let Some(conn) = self.connection.as_ref() else {
            return;
        };
        if let Some(reason) = conn.lost() {
            if self.state != ClientState::Closed {
                if !matches!(reason, ConnectionError::LocallyClosed) {
                    self.error = Some(anyhow::Error::from(reason.clone()));
                }
                self.state = ClientState::Closed;
            }
        } else if self.state == ClientState::Connecting && conn.session().is_handshake_confirmed()
        {
            info!("connected to {}", self.peer);
            self.state = ClientState::Connected;
        }
    }

    /// Why the connection failed or ended, if it did
    #[must_use]
    pub fn connection_error(&self) -> Option<&anyhow::Error> {
        self.error.as_ref()
    }

    /// Takes the reports of every transfer that has finished since the last call
    pub fn take_reports(&mut self) -> Vec<TransferReport> {
        self.reports.borrow_mut().drain(..).collect()
    }

    /// Transport statistics for the current (or most recent) connection
    #[must_use]
    pub fn stats(&self) -> Option<ConnectionStats> {
        self.connection.as_ref().map(Connection::stats).or(self.last_stats)
    }

    /// The current connection's session, if there is one
    #[must_use]
    pub fn session(&self) -> Option<&Session<RejectIncoming>> {
        self.connection.as_ref().map(Connection::session)
    }

    /// Accessor
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Whether the handshake has completed and the connection is still up
    #[must_use]
    pub fn connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Whether the session would admit another request right now
    #[must_use]
    pub fn can_send_request(&self) -> bool {
        self.connected()
            && self.session().is_some_and(|s| {
                s.open_stream_count() < s.max_open_streams()
                    && !(s.goaway_received() && self.config.respect_goaway)
            })
    }

    /// Whether the server has told us to go away
    #[must_use]
    pub fn goaway_received(&self) -> bool {
        self.session().is_some_and(Session::goaway_received)
    }

    /// Number of requests in flight
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.session().map_or(0, Session::open_stream_count)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if matches!(
            self.state,
            ClientState::Connecting | ClientState::Connected
        ) {
            self.disconnect();
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Client, ClientState, RejectIncoming, RequestError};
    use crate::{session::StreamFactory as _, Configuration};

    use quinn_proto::{Dir, Side, StreamId};
    use std::net::{SocketAddr, UdpSocket};

    fn unused_peer() -> SocketAddr {
        // Bind and release, so nothing is listening there
        let s = UdpSocket::bind("127.0.0.1:0").unwrap();
        s.local_addr().unwrap()
    }

    fn config() -> Configuration {
        let mut c = Configuration::system_default().clone();
        c.timeout = 1;
        c.udp_buffer = 1_000_000;
        c
    }

    #[test]
    fn rejects_server_streams() {
        let mut f = RejectIncoming;
        assert!(f
            .create_incoming_stream(StreamId::new(Side::Server, Dir::Bi, 0))
            .is_none());
    }

    #[test]
    fn requires_initialization() {
        let mut c = Client::new(config(), unused_peer()).unwrap();
        assert_eq!(c.state(), ClientState::Uninitialized);
        assert!(!c.connect());
        assert!(!c.send_request("x", true));
        assert!(matches!(
            c.request("x", true, indicatif::ProgressBar::hidden()),
            Err(RequestError::NotConnected)
        ));
        assert!(!c.wait_for_events());
        assert!(!c.wait_for_handshake_confirmed());
    }

    #[test]
    fn initialize_once() {
        let mut c = Client::new(config(), unused_peer()).unwrap();
        c.initialize().unwrap();
        assert_eq!(c.state(), ClientState::Initialized);
        assert!(c.initialize().is_err());
        c.disconnect();
        assert_eq!(c.state(), ClientState::Closed);
        c.initialize().unwrap();
    }

    #[test]
    fn handshake_times_out() {
        let mut c = Client::new(config(), unused_peer()).unwrap();
        c.initialize().unwrap();
        assert!(!c.connect());
        assert_eq!(c.state(), ClientState::Closed);
        let err = c.connection_error().unwrap();
        assert!(err.downcast_ref::<quinn_proto::ConnectionError>().is_some());
        assert!(!c.can_send_request());
    }
}
