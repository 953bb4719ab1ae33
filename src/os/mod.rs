//! OS abstraction layer
// (c) 2024 Ross Younger

use std::net::UdpSocket;

use anyhow::Result;
use rustix::net::sockopt;

#[cfg(not(unix))]
compile_error!("This OS is not yet supported");

/// Which kernel socket buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    /// `SO_SNDBUF`
    Send,
    /// `SO_RCVBUF`
    Receive,
}

impl Direction {
    /// Both directions, send first
    pub const BOTH: [Direction; 2] = [Direction::Send, Direction::Receive];
}

mod private {
    pub trait Sealed {}
    impl Sealed for super::UdpSocket {}
}

/// Kernel socket buffer sizing
///
/// **This is a sealed trait**: it is implemented only for `UdpSocket`.
pub trait SocketBuffers: private::Sealed {
    /// The buffer size the kernel will actually use.
    ///
    /// Linux allocates double what was asked for, and getsockopt reports the doubled figure;
    /// this undoes that.
    fn buffer_size(&self, direction: Direction) -> Result<usize>;

    /// Requests a buffer size, subject to the system limit
    fn set_buffer_size(&self, direction: Direction, size: usize) -> Result<()>;

    /// Requests a buffer size above the system limit. This needs privilege, and is
    /// quietly a no-op on platforms without `SO_SNDBUFFORCE`/`SO_RCVBUFFORCE`.
    fn force_buffer_size(&self, direction: Direction, size: usize) -> Result<()>;
}

impl SocketBuffers for UdpSocket {
    fn buffer_size(&self, direction: Direction) -> Result<usize> {
        let reported = match direction {
            Direction::Send => sockopt::socket_send_buffer_size(self)?,
            Direction::Receive => sockopt::socket_recv_buffer_size(self)?,
        };
        Ok(if cfg!(linux) { reported / 2 } else { reported })
    }

    fn set_buffer_size(&self, direction: Direction, size: usize) -> Result<()> {
        match direction {
            Direction::Send => sockopt::set_socket_send_buffer_size(self, size)?,
            Direction::Receive => sockopt::set_socket_recv_buffer_size(self, size)?,
        }
        Ok(())
    }

    #[allow(clippy::used_underscore_binding)]
    fn force_buffer_size(&self, _direction: Direction, _size: usize) -> Result<()> {
        #[cfg(linux)]
        match _direction {
            Direction::Send => sockopt::set_socket_send_buffer_size_force(self, _size)?,
            Direction::Receive => sockopt::set_socket_recv_buffer_size_force(self, _size)?,
        }
        Ok(())
    }
}
