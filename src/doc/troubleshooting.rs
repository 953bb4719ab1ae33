// (c) 2024 Ross Younger

//! ## 🕵️ Troubleshooting
//!
//! The `--debug` option reports information that may help you diagnose issues.
//!
//! This program also understands the `RUST_LOG` environment variable which might let you dig deeper.
//! Some possible settings for this variable are:
//!
//! * `qfetch=trace` outputs tracing-level output from this crate, including every stream event
//! * `trace` sets all the Rust components to trace mode, which includes an _awful lot_ of output from quinn-proto (the QUIC implementation).
//!
//! To capture a detailed log without flooding the console, use `--log-file` together with
//! `RUST_LOG_FILE_DETAIL`.
//!
//! ### The connection times out
//!
//! * Is the server running, and listening on the port you asked for? It logs its address on startup.
//! * Does a firewall block inbound UDP to the server?
//! * The server listens on IPv4 and IPv6 where the system supports both. If IPv6 is disabled it
//!   falls back to IPv4 only, and says so at debug level.
//!
//! ### The connection fails with a version mismatch
//!
//! Client and server each offer exactly one QUIC version (`--quic-version`, default 1).
//! They must agree. When checking a server, `--version-mismatch-ok` treats a mismatch as success.
//!
//! ### Downloaded files are empty
//!
//! The server answers a missing, unreadable or unsafe path (absolute, or climbing out with `..`)
//! with an empty response. Check the server's log, and its `--root`.
//!
//! ### Some requests fail after many transfers on one connection
//!
//! A server configured with `--max-requests-per-connection` sends goaway once that many requests
//! have been admitted, then refuses further streams. A client that respects goaway (the default)
//! reconnects and retries refused requests; with `--respect-goaway=false` they fail instead.
//!
//! ### Performance is poor
//!
//! * Set `--rx` (and `--tx` if it differs) to your real bandwidth, and `--rtt` to the real round-trip time.
//!   The flow-control windows are derived from their product.
//! * `--statistics` reports the measured RTT, lost packets and congestion events after a run.
//! * If the kernel refuses the requested UDP buffer size, a warning is logged at startup.
//!   On Linux, raise `net.core.rmem_max` and `net.core.wmem_max`.
