//! qfetch protocol definitions
// (c) 2024 Ross Younger
//!
//! The protocol operates over QUIC bidirectional streams, one per file.
//! There is no framing, no header and no status code.
//!
//! * Client ➡️ Server: (initiates QUIC stream)
//! * C ➡️ S : the path of the requested file, as raw bytes, then FIN.
//! * S ➡️ C : the contents of the file, as raw bytes, then FIN.
//!
//! If the server cannot (or will not) serve the file, it sends an empty response.
//! The client determines completion solely from the FIN.
//!
//! A server which is not prepared to accept more streams on a connection sends a QUIC
//! datagram containing [`GOAWAY`]. A client which respects this opens no further streams
//! on that connection.
//!
//! The TLS ALPN identifier is [`ALPN`].
//!
//! The stream-level machinery is written against the [`StreamTransport`] contract,
//! which is implemented over a live QUIC connection by [`QuicTransport`].

mod contract;
pub use contract::{Readable, StreamCore, StreamError, StreamIo, StreamTransport};

mod quic;
pub use quic::QuicTransport;

/// ALPN protocol identifier
pub const ALPN: &[u8] = b"qfetch";

/// Payload of the connection-level datagram announcing that the sender will accept no further streams
pub const GOAWAY: &[u8] = b"GOAWAY";

/// Application error codes used when resetting or stopping streams
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[repr(u32)]
pub enum ErrorCode {
    /// The request was abandoned before it was complete
    Abandoned = 1,
    /// The stream was not admitted
    Rejected = 2,
    /// The receiver could not store the data
    Failed = 3,
}

impl From<ErrorCode> for quinn_proto::VarInt {
    fn from(value: ErrorCode) -> Self {
        quinn_proto::VarInt::from_u32(value as u32)
    }
}
