//! Configuration structure
// (c) 2024 Ross Younger

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use human_repr::{HumanCount as _, HumanDuration as _};
use serde::{Deserialize, Serialize};
use struct_field_names_as_array::FieldNamesAsSlice;

use crate::{
    cli::styles::{info, RESET},
    transport::CongestionController,
    util::{derive_deftly_template_Optionalify, TimeFormat},
};

use derive_deftly::Deftly;

/// Minimum bandwidth we will accept in either direction.
/// You have to have a limit somewhere; zero doesn't work. So I chose 1200 baud ...
pub(crate) const MINIMUM_BANDWIDTH: u64 = 150;

/// The default UDP port
pub(crate) const DEFAULT_PORT: u16 = 6121;

/// The set of configurable options supported by qfetch.
///
/// Client and server read the same structure; each uses the fields relevant to its role.
///
/// [More details about the configuration mechanism](crate::config).
///
/// ### Developer notes
/// There is no `default()`.
/// You can access the hard-wired configuration defaults through [`Configuration::system_default()`].
///
/// This structure uses the [Optionalify](derive_deftly_template_Optionalify) deftly macro to automatically
/// define the `Configuration_Optional` struct, which is the same but has all members of type `Option<whatever>`.
/// The CLI uses the `_Optional` version, with everything defaulting to `None`, so that
/// wherever the user does not provide a value, values from lower priority sources obtain.
///
// Maintainer note: None of the members of this struct should be Option<anything>.
#[derive(Deftly)]
#[derive_deftly(Optionalify)]
#[deftly(visibility = "pub(crate)")]
#[derive(Debug, Clone, PartialEq, Parser, Deserialize, Serialize, FieldNamesAsSlice)]
pub struct Configuration {
    // TRANSPORT PARAMETERS ============================================================================
    /// The maximum network bandwidth we expect receiving data FROM the remote system,
    /// in bytes per second. [default: 12500000]
    ///
    /// **Note that this is described in BYTES, not bits**;
    /// if (for example) you expect to fill a 1Gbit ethernet connection,
    /// 125000000 might be a suitable setting.
    #[arg(
        short('b'),
        long,
        help_heading("Network tuning"),
        display_order(1),
        value_name = "bytes"
    )]
    pub rx: u64,

    /// The maximum network bandwidth we expect sending data TO the remote system,
    /// if it is different from the bandwidth FROM the system.
    ///
    /// If not specified or 0, uses the value of `rx`.
    #[arg(
        short('B'),
        long,
        help_heading("Network tuning"),
        display_order(1),
        value_name = "bytes"
    )]
    pub tx: u64,

    /// The expected network Round Trip time to the remote system, in milliseconds.
    /// [default: 300]
    #[arg(
        short('r'),
        long,
        help_heading("Network tuning"),
        display_order(10),
        value_name("ms")
    )]
    pub rtt: u16,

    /// Specifies the congestion control algorithm to use.
    /// [default: cubic]
    #[arg(
        long,
        action,
        value_name = "algorithm",
        help_heading("Advanced network tuning"),
        display_order(0)
    )]
    pub congestion: CongestionController,

    /// _(Network wizards only!)_
    /// The initial value for the sending congestion control window, in bytes.
    /// If 0, the active congestion control algorithm decides.
    ///
    /// _Setting this value too high reduces performance!_
    #[arg(
        long,
        help_heading("Advanced network tuning"),
        value_name = "bytes",
        alias("cwnd"),
        display_order(0)
    )]
    pub initial_congestion_window: u64,

    /// Size of the UDP kernel buffers to request, in bytes. [default: 33554432]
    ///
    /// The kernel may refuse to grant buffers this large; if so, a warning is shown.
    #[arg(
        long,
        help_heading("Advanced network tuning"),
        value_name = "bytes",
        display_order(0)
    )]
    pub udp_buffer: u64,

    // CONNECTION ======================================================================================
    /// The UDP port the server listens on, and the client connects to. [default: 6121]
    ///
    /// In server mode, 0 means any free port.
    #[arg(short = 'p', long, help_heading("Connection"), display_order(0))]
    pub port: u16,

    /// Idle timeout for the QUIC connection [seconds; default 10]
    #[arg(
        short,
        long,
        value_name("sec"),
        help_heading("Connection"),
        display_order(0)
    )]
    pub timeout: u16,

    /// The QUIC version to offer when connecting. [default: 1]
    ///
    /// This may be given in decimal or as hex (`0xff00001d`).
    #[arg(
        long,
        value_name("version"),
        value_parser(parse_quic_version),
        help_heading("Connection"),
        display_order(0)
    )]
    pub quic_version: u32,

    /// The server name to present and verify during the TLS handshake. [default: localhost]
    #[arg(long, value_name("name"), help_heading("Connection"), display_order(0))]
    pub server_name: String,

    /// A server certificate (DER format) which the server must present.
    ///
    /// If empty, any server certificate is accepted. This is not secure.
    #[arg(long, value_name("FILE"), help_heading("Connection"), display_order(0))]
    pub server_cert: String,

    // STREAMS =========================================================================================
    /// The maximum number of streams each side allows to be open at once on a connection. [default: 100]
    #[arg(long, value_name("N"), help_heading("Streams"), display_order(0))]
    pub max_streams: u32,

    /// Whether the client stops opening new streams once the server has said it is going away.
    /// [default: true]
    #[arg(
        long,
        default_missing_value("true"), // required for a bool in Configuration, along with num_args and require_equals
        num_args(0..=1),
        require_equals(true),
        help_heading("Streams"),
        display_order(0)
    )]
    pub respect_goaway: bool,

    /// How many contiguous chunks a stream may read each time it is woken, before it yields
    /// to other streams. [default: 64]
    #[arg(long, value_name("N"), help_heading("Streams"), display_order(0))]
    pub read_budget: u32,

    // CLIENT ==========================================================================================
    /// Directory in which the client writes downloaded files. [default: .]
    ///
    /// A file fetched as `NAME` is written as `_NAME`, so fetching into the directory the
    /// server is serving does not clobber the original.
    #[arg(
        short = 'o',
        long,
        value_name("DIR"),
        help_heading("Client"),
        display_order(0)
    )]
    pub output_dir: String,

    // SERVER ==========================================================================================
    /// The directory the server serves files from. [default: .]
    ///
    /// Requests for absolute paths, or paths containing `..`, are refused.
    #[arg(long, value_name("DIR"), help_heading("Server"), display_order(0))]
    pub root: String,

    /// The largest part of a file the server maps into memory at once, in bytes. [default: 67108864]
    ///
    /// This is rounded down to a whole number of pages.
    #[arg(long, value_name("bytes"), help_heading("Server"), display_order(0))]
    pub map_window: u64,

    /// The longest request the server accepts, in bytes. [default: 4096]
    #[arg(long, value_name("bytes"), help_heading("Server"), display_order(0))]
    pub max_request_len: u32,

    /// The number of requests the server serves on one connection before it tells the client
    /// it is going away. 0 means unlimited. [default: 0]
    #[arg(long, value_name("N"), help_heading("Server"), display_order(0))]
    pub max_requests_per_connection: u64,

    /// If given, the server writes its certificate (DER format) to this file,
    /// for clients to use with `--server-cert`.
    #[arg(long, value_name("FILE"), help_heading("Server"), display_order(0))]
    pub cert_out: String,

    // OUTPUT ==========================================================================================
    /// Specifies the time format to use when printing messages to the console or to file
    /// [default: local]
    #[arg(
        short = 'T',
        long,
        value_name("FORMAT"),
        help_heading("Output"),
        next_line_help(true),
        display_order(0)
    )]
    pub time_format: TimeFormat,
}

/// Parses a QUIC version number, which may be given in decimal or hex
fn parse_quic_version(s: &str) -> Result<u32, String> {
    let result = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    };
    result.map_err(|e| format!("invalid QUIC version {s:?}: {e}"))
}

static SYSTEM_DEFAULT_CONFIG: LazyLock<Configuration> = LazyLock::new(|| Configuration {
    // Transport
    rx: 12_500_000,
    tx: 0,
    rtt: 300,
    congestion: CongestionController::Cubic,
    initial_congestion_window: 0,
    udp_buffer: 33_554_432,
    // Connection
    port: DEFAULT_PORT,
    timeout: 10,
    quic_version: 1,
    server_name: "localhost".into(),
    server_cert: String::new(),
    // Streams
    max_streams: 100,
    respect_goaway: true,
    read_budget: 64,
    // Client
    output_dir: ".".into(),
    // Server
    root: ".".into(),
    map_window: 64 * 1024 * 1024,
    max_request_len: 4096,
    max_requests_per_connection: 0,
    cert_out: String::new(),
    // Output
    time_format: TimeFormat::Local,
});

/// Minimum per-stream receive window
const MIN_STREAM_WINDOW: u64 = 6 * 1024 * 1024;
/// Minimum connection-wide receive window
const MIN_CONNECTION_WINDOW: u64 = 32 * 1024 * 1024;

impl Configuration {
    /// Computes the theoretical bandwidth-delay product for outbound data
    #[must_use]
    pub fn bandwidth_delay_product_tx(&self) -> u64 {
        self.tx() * u64::from(self.rtt) / 1000
    }
    /// Computes the theoretical bandwidth-delay product for inbound data
    #[must_use]
    pub fn bandwidth_delay_product_rx(&self) -> u64 {
        self.rx() * u64::from(self.rtt) / 1000
    }
    /// Receive bandwidth (accessor)
    #[must_use]
    pub fn rx(&self) -> u64 {
        self.rx
    }
    /// Transmit bandwidth (accessor)
    #[must_use]
    pub fn tx(&self) -> u64 {
        match self.tx {
            0 => self.rx(),
            tx => tx,
        }
    }
    /// RTT accessor as Duration
    #[must_use]
    pub fn rtt_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.rtt))
    }

    /// QUIC connection-wide receive window
    #[must_use]
    pub fn recv_window(&self) -> u64 {
        std::cmp::max(self.bandwidth_delay_product_rx(), MIN_CONNECTION_WINDOW)
    }

    /// QUIC per-stream receive window
    #[must_use]
    pub fn stream_recv_window(&self) -> u64 {
        std::cmp::max(self.bandwidth_delay_product_rx() / 4, MIN_STREAM_WINDOW)
    }

    /// QUIC send window
    #[must_use]
    pub fn send_window(&self) -> u64 {
        // There might be random added latency en route, so provide for a larger send window than theoretical.
        std::cmp::max(2 * self.bandwidth_delay_product_tx(), MIN_CONNECTION_WINDOW)
    }

    /// Accessor for `timeout`, as a Duration
    #[must_use]
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout.into())
    }

    /// Formats the transport-related options for display
    #[must_use]
    pub fn format_transport_config(&self) -> String {
        let iwind = match self.initial_congestion_window {
            0 => "<default>".to_string(),
            s => s.human_count_bytes().to_string(),
        };
        let (tx, rx) = (self.tx(), self.rx());
        format!(
            "rx {rx} ({rxbits}), tx {tx} ({txbits}), rtt {rtt}, congestion algorithm {congestion} with initial window {iwind}",
            tx = tx.human_count_bytes(),
            txbits = (tx * 8).human_count("bit"),
            rx = rx.human_count_bytes(),
            rxbits = (rx * 8).human_count("bit"),
            rtt = self.rtt_duration().human_duration(),
            congestion = self.congestion,
        )
    }

    /// Returns the system default settings
    #[must_use]
    pub fn system_default() -> &'static Self {
        &SYSTEM_DEFAULT_CONFIG
    }
}

// VALIDATION ------------------------------------------------------------

impl Configuration {
    /// Performs additional validation checks on a configuration object
    pub(crate) fn try_validate(&self) -> Result<()> {
        let rtt = self.rtt;
        let rx = self.rx();
        if rx < MINIMUM_BANDWIDTH {
            anyhow::bail!(
                "The receive bandwidth ({INFO}rx {rx}{RESET}B) is too small; it must be at least {MINIMUM_BANDWIDTH}",
                INFO = info()
            );
        }
        if rx.checked_mul(rtt.into()).is_none() {
            anyhow::bail!(
                "The receive bandwidth delay product calculation ({INFO}rx {rx}{RESET}B x {INFO}rtt {rtt}{RESET}ms) overflowed",
                INFO = info()
            );
        }

        let tx = self.tx;
        if tx != 0 && tx < MINIMUM_BANDWIDTH {
            anyhow::bail!(
                "The transmit bandwidth ({INFO}tx {tx}{RESET}B) is too small; it must be at least {MINIMUM_BANDWIDTH}",
                INFO = info(),
            );
        }
        if tx.checked_mul(rtt.into()).is_none() {
            anyhow::bail!(
                "The transmit bandwidth delay product calculation ({INFO}tx {tx}{RESET}B x {INFO}rtt {rtt}{RESET}ms) overflowed",
                INFO = info(),
            );
        }
        if usize::try_from(self.udp_buffer).is_err() {
            anyhow::bail!("udp_buffer size overflowed usize");
        }
        if self.max_streams == 0 {
            anyhow::bail!("{INFO}max_streams{RESET} must be at least 1", INFO = info());
        }
        if self.read_budget == 0 {
            anyhow::bail!("{INFO}read_budget{RESET} must be at least 1", INFO = info());
        }
        if self.max_request_len == 0 {
            anyhow::bail!(
                "{INFO}max_request_len{RESET} must be at least 1",
                INFO = info()
            );
        }
        if self.map_window == 0 {
            anyhow::bail!("{INFO}map_window{RESET} must be at least 1", INFO = info());
        }
        Ok(())
    }

    /// Performs additional validation checks on the configuration.
    pub(crate) fn validate(self) -> Result<Self>
    where
        Self: std::marker::Sized,
    {
        self.try_validate()?;
        Ok(self)
    }
}
