// (c) 2024 Ross Younger

#![allow(clippy::doc_markdown)]
//! `qfetch` is a minimal file fetch protocol over QUIC, with a single-threaded client.
//!
//! ## Overview
//!
//! * A client opens one bidirectional QUIC stream per file. It sends the file name as the
//!   entire request, then finishes its side of the stream.
//! * The server answers with the raw file bytes, then finishes its side. There are no headers,
//!   no status codes and no framing: a missing file is simply an empty response.
//! * The client writes each response to `_<name>` in its output directory.
//!
//! The [protocol] documentation contains the detail.
//!
//! ## Structure
//!
//! * [`session`] holds the protocol logic, independent of any transport:
//!   [`FileReceiveStream`](session::FileReceiveStream) (client side),
//!   [`FileSendStream`](session::FileSendStream) (server side, from memory-mapped files) and
//!   [`Session`](session::Session) (stream admission, goaway and handshake state).
//! * [`reactor`] is a single-threaded readiness loop around one UDP socket.
//! * [`connection`] pumps QUIC ([`quinn_proto`]) events into a session.
//! * [`client`] and [`server`] tie those together.
//!
//! ## Configuration
//!
//! See [config].
//!
//! ## 📖 Further reading
//!
//! * [Troubleshooting](doc::troubleshooting)

pub(crate) mod cli;
pub use cli::cli as main;
pub use cli::styles;

pub mod client;
pub use client::Parameters;

pub mod config;
pub use config::Configuration;

pub mod connection;
pub mod doc;
pub mod os;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod session;
pub mod transport;
pub mod util;

#[doc(hidden)]
pub use derive_deftly;
// Use the current version of derive_deftly here:
derive_deftly::template_export_semver_check!("0.14.0");
