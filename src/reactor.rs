//! Single-threaded readiness loop around one UDP socket
// (c) 2024 Ross Younger
//!
//! The [`Reactor`] owns a current-thread tokio runtime and one registered socket.
//! [`Reactor::wait`] is the only place the thread suspends: it blocks until the socket
//! is readable, until it is writable again after a send would have blocked, or until
//! a deadline passes. Everything else is non-blocking.

use std::{
    collections::VecDeque,
    io,
    net::{SocketAddr, UdpSocket as StdUdpSocket},
    time::Instant,
};

use anyhow::{Context as _, Result};
use bytes::BytesMut;
use tokio::{net::UdpSocket, runtime::Runtime};
use tracing::{debug, trace, warn};

/// Largest datagram we expect to receive
const MAX_DATAGRAM: usize = 65_536;

/// What woke up a [`Reactor::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// One or more datagrams can be read
    Readable,
    /// Deferred datagrams can now be sent
    Writable,
    /// The deadline passed
    Timeout,
}

/// Event reactor for a single UDP socket
#[derive(Debug)]
pub struct Reactor {
    runtime: Runtime,
    socket: Option<UdpSocket>,
    /// Datagrams deferred because the socket would have blocked
    pending: VecDeque<(SocketAddr, Vec<u8>)>,
    blocked: bool,
    recv_buf: Vec<u8>,
}

fn not_registered() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "no socket is registered")
}

impl Reactor {
    /// Constructor
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .context("creating event reactor")?;
        Ok(Self {
            runtime,
            socket: None,
            pending: VecDeque::new(),
            blocked: false,
            recv_buf: vec![0; MAX_DATAGRAM],
        })
    }

    /// Registers a socket for readiness events. Returns its local address.
    pub fn register(&mut self, socket: StdUdpSocket) -> Result<SocketAddr> {
        anyhow::ensure!(self.socket.is_none(), "a socket is already registered");
        socket.set_nonblocking(true)?;
        let socket = {
            let _guard = self.runtime.enter();
            UdpSocket::from_std(socket).context("registering socket")?
        };
        // tokio only tries a non-blocking send once it has seen write readiness
        self.runtime
            .block_on(socket.writable())
            .context("waiting for socket to become writable")?;
        let addr = socket.local_addr()?;
        debug!("registered socket {addr}");
        self.socket = Some(socket);
        Ok(addr)
    }

    /// Deregisters and closes the socket, discarding anything not yet sent
    pub fn deregister(&mut self) {
        if !self.pending.is_empty() {
            debug!("discarding {} unsent datagrams", self.pending.len());
        }
        self.pending.clear();
        self.blocked = false;
        if let Some(socket) = self.socket.take() {
            trace!("closing socket");
            drop(socket);
        }
    }

    /// Whether a socket is registered
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.socket.is_some()
    }

    /// Whether a send has been deferred until the socket is writable
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Blocks until something happens, or until `deadline` (if given)
    pub fn wait(&mut self, deadline: Option<Instant>) -> io::Result<Readiness> {
        let socket = self.socket.as_ref().ok_or_else(not_registered)?;
        let blocked = self.blocked;
        self.runtime.block_on(async {
            let timer = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d.into()).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                w = socket.writable(), if blocked => w.map(|()| Readiness::Writable),
                r = socket.readable() => r.map(|()| Readiness::Readable),
                () = timer => Ok(Readiness::Timeout),
            }
        })
    }

    /// Reads one datagram, if one is immediately available
    pub fn recv(&mut self) -> io::Result<Option<(SocketAddr, BytesMut)>> {
        let socket = self.socket.as_ref().ok_or_else(not_registered)?;
        loop {
            match socket.try_recv_from(&mut self.recv_buf) {
                Ok((n, peer)) => return Ok(Some((peer, BytesMut::from(&self.recv_buf[..n])))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // ICMP errors from earlier sends surface here; they are not fatal to the socket
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!("socket reported {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends a datagram, or defers it if the socket would block.
    ///
    /// Other send errors drop the datagram; the transport's loss recovery deals with it.
    pub fn send(&mut self, destination: SocketAddr, data: &[u8]) {
        if self.blocked {
            self.pending.push_back((destination, data.to_vec()));
            return;
        }
        let Some(socket) = self.socket.as_ref() else {
            warn!("dropping datagram: {}", not_registered());
            return;
        };
        match socket.try_send_to(data, destination) {
            Ok(_) => (),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("send would block; deferring");
                self.blocked = true;
                self.pending.push_back((destination, data.to_vec()));
            }
            Err(e) => warn!("dropping datagram to {destination}: {e}"),
        }
    }

    /// The socket is writable again: sends whatever was deferred
    pub fn on_writable(&mut self) {
        self.blocked = false;
        let Some(socket) = self.socket.as_ref() else {
            self.pending.clear();
            return;
        };
        while let Some((destination, data)) = self.pending.pop_front() {
            match socket.try_send_to(&data, destination) {
                Ok(_) => (),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.pending.push_front((destination, data));
                    self.blocked = true;
                    return;
                }
                Err(e) => warn!("dropping datagram to {destination}: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Reactor, Readiness};
    use pretty_assertions::assert_eq;
    use std::{
        net::UdpSocket,
        time::{Duration, Instant},
    };

    #[test]
    fn timeout() {
        let mut reactor = Reactor::new().unwrap();
        let _ = reactor
            .register(UdpSocket::bind("127.0.0.1:0").unwrap())
            .unwrap();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(reactor.wait(Some(deadline)).unwrap(), Readiness::Timeout);
        assert!(Instant::now() >= deadline);
        assert!(reactor.recv().unwrap().is_none());
    }

    #[test]
    fn send_and_receive() {
        let mut a = Reactor::new().unwrap();
        let mut b = Reactor::new().unwrap();
        let _ = a.register(UdpSocket::bind("127.0.0.1:0").unwrap()).unwrap();
        let b_addr = b.register(UdpSocket::bind("127.0.0.1:0").unwrap()).unwrap();
        a.send(b_addr, b"ping");
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(b.wait(Some(deadline)).unwrap(), Readiness::Readable);
        let (_, data) = b.recv().unwrap().unwrap();
        assert_eq!(&data[..], b"ping");
        assert!(b.recv().unwrap().is_none());
    }

    #[test]
    fn first_send_is_not_deferred() {
        let mut a = Reactor::new().unwrap();
        let _ = a.register(UdpSocket::bind("127.0.0.1:0").unwrap()).unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        a.send(b.local_addr().unwrap(), b"hello");
        assert!(!a.is_blocked());
        b.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn unregistered() {
        let mut reactor = Reactor::new().unwrap();
        assert!(reactor.wait(None).is_err());
        assert!(reactor.recv().is_err());
        let _ = reactor
            .register(UdpSocket::bind("127.0.0.1:0").unwrap())
            .unwrap();
        assert!(reactor.is_registered());
        reactor.deregister();
        assert!(!reactor.is_registered());
        assert!(!reactor.is_blocked());
    }
}
