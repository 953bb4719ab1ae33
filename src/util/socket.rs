//! UDP socket setup
// (c) 2024 Ross Younger

use crate::os::{Direction, SocketBuffers as _};
use human_repr::HumanCount as _;
use rustix::net::{sockopt, AddressFamily, SocketType};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use tracing::{debug, warn};

/// Grows one kernel buffer to at least `wanted` bytes, if the system allows it.
///
/// Returns the size actually in effect afterwards.
fn grow_buffer(socket: &UdpSocket, direction: Direction, wanted: usize) -> anyhow::Result<usize> {
    let initial = socket.buffer_size(direction)?;
    debug!("default {direction} buffer is {}", initial.human_count_bytes());
    if initial >= wanted {
        return Ok(initial);
    }
    let _ = socket.set_buffer_size(direction, wanted);
    if socket.buffer_size(direction)? < wanted {
        // Over the system limit. Privileged processes may exceed it.
        if let Err(e) = socket.force_buffer_size(direction, wanted) {
            debug!("forcing {direction} buffer size: {e}");
        }
    }
    socket.buffer_size(direction)
}

/// Sizes both kernel buffers of a socket for the given bandwidth-delay product.
///
/// Falling short is not an error, but returns a warning to show the user.
pub(crate) fn size_buffers(socket: &UdpSocket, wanted: usize) -> anyhow::Result<Option<String>> {
    let mut shortfalls = Vec::new();
    for direction in Direction::BOTH {
        let got = grow_buffer(socket, direction, wanted)?;
        if got < wanted {
            shortfalls.push(format!("{direction} {}", got.human_count_bytes()));
        }
    }
    if shortfalls.is_empty() {
        debug!("UDP buffers are at least {}", wanted.human_count_bytes());
        return Ok(None);
    }
    Ok(Some(format!(
        "Wanted {} UDP buffers but the kernel only allows {}. This may affect performance.",
        wanted.human_count_bytes(),
        shortfalls.join(", ")
    )))
}

/// Creates a UDP socket bound to an ephemeral port, of the same address family as `peer`,
/// and sizes its buffers.
pub(crate) fn bind_for_peer(peer: SocketAddr, buffer: usize) -> anyhow::Result<UdpSocket> {
    let addr = match peer.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    bind_with_buffers(SocketAddr::new(addr, 0), buffer)
}

/// Creates a UDP socket bound to the given address, and sizes its buffers.
///
/// A buffer shortfall is logged as a warning.
pub(crate) fn bind_with_buffers(addr: SocketAddr, buffer: usize) -> anyhow::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    if let Some(w) = size_buffers(&socket, buffer)? {
        warn!("{w}");
    }
    Ok(socket)
}

/// Creates an IPv6 UDP socket which also accepts IPv4 (as v4-mapped addresses)
fn dual_stack_socket() -> rustix::io::Result<UdpSocket> {
    let fd = rustix::net::socket(AddressFamily::INET6, SocketType::DGRAM, None)?;
    sockopt::set_ipv6_v6only(&fd, false)?;
    Ok(UdpSocket::from(fd))
}

/// Creates a UDP socket listening on `port` on every interface, IPv4 and IPv6 alike,
/// and sizes its buffers.
///
/// Falls back to IPv4 only if the system has no IPv6.
pub(crate) fn bind_all_interfaces(port: u16, buffer: usize) -> anyhow::Result<UdpSocket> {
    let socket = match dual_stack_socket() {
        Ok(socket) => {
            let addr = SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port);
            rustix::net::bind(&socket, &addr)?;
            socket
        }
        Err(e) => {
            debug!("IPv6 is unavailable ({e}); listening on IPv4 only");
            UdpSocket::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port))?
        }
    };
    if let Some(w) = size_buffers(&socket, buffer)? {
        warn!("{w}");
    }
    Ok(socket)
}
