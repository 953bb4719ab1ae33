//! server-side event loop
// (c) 2024 Ross Younger
//!
//! The server is single-threaded in the same way as the client: one UDP socket registered with
//! a [`Reactor`], and a QUIC endpoint which may carry many connections. Every stream a client
//! opens is a request, answered by a [`FileSendStream`].

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{Context as _, Result};
use bytes::BytesMut;
use quinn_proto::{ConnectionHandle, DatagramEvent, Endpoint, Incoming, StreamId};
use tracing::{debug, error_span, info, trace, warn};

use crate::{
    connection::Connection,
    reactor::{Reactor, Readiness},
    session::{FileSendStream, ServeOptions, Session, StreamFactory},
    transport,
    util::{socket::bind_all_interfaces, Credentials},
    Configuration,
};

/// How long the server waits for network activity before rechecking for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Creates a [`FileSendStream`] for each request on one connection.
///
/// Once `max_requests` requests have been admitted (if non-zero), further streams are refused
/// and the connection sends goaway.
#[derive(Debug)]
pub struct FileServer {
    options: Arc<ServeOptions>,
    max_requests: u64,
    requests: u64,
}

impl FileServer {
    /// Constructor. `max_requests` of 0 means unlimited.
    #[must_use]
    pub fn new(options: Arc<ServeOptions>, max_requests: u64) -> Self {
        Self {
            options,
            max_requests,
            requests: 0,
        }
    }

    /// Number of requests admitted so far
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests
    }
}

impl StreamFactory for FileServer {
    type Stream = FileSendStream;

    fn create_incoming_stream(&mut self, id: StreamId) -> Option<FileSendStream> {
        if self.goaway_due() {
            debug!("{id}: request limit of {} reached", self.max_requests);
            return None;
        }
        self.requests += 1;
        trace!("{id}: request {} on this connection", self.requests);
        Some(FileSendStream::new(Arc::clone(&self.options)))
    }

    fn goaway_due(&self) -> bool {
        self.max_requests != 0 && self.requests >= self.max_requests
    }
}

/// A file server on one UDP socket
pub struct Server {
    config: Configuration,
    reactor: Reactor,
    endpoint: Endpoint,
    connections: HashMap<ConnectionHandle, Connection<FileServer>>,
    options: Arc<ServeOptions>,
    local_addr: SocketAddr,
    buf: Vec<u8>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("options", &self.options)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Binds the configured port on all interfaces, IPv4 and IPv6, and prepares to accept
    /// connections
    pub fn bind(config: &Configuration, credentials: &Credentials) -> Result<Self> {
        let mut reactor = Reactor::new()?;
        let buffer = usize::try_from(config.udp_buffer).context("udp_buffer overflow")?;
        let socket = bind_all_interfaces(config.port, buffer)
            .with_context(|| format!("binding port {}", config.port))?;
        let local_addr = reactor.register(socket)?;
        let endpoint = Endpoint::new(
            transport::endpoint_config(config),
            Some(transport::server_config(config, credentials)?),
            true,
            None,
        );
        Ok(Self {
            config: config.clone(),
            reactor,
            endpoint,
            connections: HashMap::new(),
            options: Arc::new(ServeOptions::from(config)),
            local_addr,
            buf: Vec::new(),
        })
    }

    /// The address the server is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// One pass of the event loop
    pub fn step(&mut self, max_wait: Duration) -> Result<()> {
        let mut deadline = Instant::now() + max_wait;
        for conn in self.connections.values_mut() {
            if let Some(t) = conn.next_timeout() {
                deadline = deadline.min(t);
            }
        }
        match self
            .reactor
            .wait(Some(deadline))
            .context("waiting for network events")?
        {
            Readiness::Readable => self.on_readable(),
            Readiness::Writable => self.reactor.on_writable(),
            Readiness::Timeout => (),
        }
        self.drive_all();
        Ok(())
    }

    /// Serves until `stop` is set, then closes every connection
    pub fn run_until(&mut self, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            self.step(POLL_INTERVAL)?;
        }
        self.close_all();
        Ok(())
    }

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
        let now = Instant::now();
        self.buf.clear();
        match self
            .endpoint
            .handle(now, peer, None, None, data, &mut self.buf)
        {
            Some(DatagramEvent::ConnectionEvent(handle, event)) => {
                match self.connections.get_mut(&handle) {
                    Some(conn) => conn.handle_event(event),
                    None => trace!("event for unknown connection {handle:?}"),
                }
            }
            Some(DatagramEvent::NewConnection(incoming)) => self.accept(incoming, now),
            Some(DatagramEvent::Response(transmit)) => {
                self.reactor
                    .send(transmit.destination, &self.buf[..transmit.size]);
            }
            None => (),
        }
    }

    fn accept(&mut self, incoming: Incoming, now: Instant) {
        let remote = incoming.remote_address();
        self.buf.clear();
        match self.endpoint.accept(incoming, now, &mut self.buf, None) {
            Ok((handle, quic)) => {
                info!("connection from {remote}");
                let factory = FileServer::new(
                    Arc::clone(&self.options),
                    self.config.max_requests_per_connection,
                );
                let max_streams = usize::try_from(self.config.max_streams).unwrap_or(usize::MAX);
                let session = Session::new(factory, max_streams, self.config.respect_goaway);
                let _ = self
                    .connections
                    .insert(handle, Connection::new(handle, quic, session));
            }
            Err(e) => {
                warn!("refused connection from {remote}: {}", e.cause);
                if let Some(transmit) = e.response {
                    self.reactor
                        .send(transmit.destination, &self.buf[..transmit.size]);
                }
            }
        }
    }

    fn drive_all(&mut self) {
        let now = Instant::now();
        let endpoint = &mut self.endpoint;
        let reactor = &mut self.reactor;
        let buf = &mut self.buf;
        self.connections.retain(|handle, conn| {
            conn.drive(endpoint, now);
            conn.flush(now, buf, reactor);
            if conn.is_drained() {
                debug!(
                    "connection {handle:?} finished after {} requests",
                    conn.session().factory().requests()
                );
                false
            } else {
                true
            }
        });
    }

    fn close_all(&mut self) {
        let now = Instant::now();
        for conn in self.connections.values_mut() {
            conn.close(now);
            conn.flush(now, &mut self.buf, &mut self.reactor);
        }
    }
}

/// Server event loop. Runs until the process is killed.
#[allow(clippy::module_name_repetitions)]
pub fn server_main(config: &Configuration) -> Result<()> {
    let _span = error_span!("SERVER").entered();
    let credentials = Credentials::generate()?;
    if !config.cert_out.is_empty() {
        credentials.write_certificate(Path::new(&config.cert_out))?;
        info!("wrote server certificate to {}", config.cert_out);
    }
    let mut server = Server::bind(config, &credentials)?;
    info!(
        "serving files from {} on {}",
        config.root,
        server.local_addr()
    );
    server.run_until(&AtomicBool::new(false))
}
