//! Configures the QUIC transport layer from user settings
// (c) 2024 Ross Younger

use std::{sync::Arc, time::Duration};

use anyhow::{Context as _, Result};
use human_repr::HumanCount as _;
use quinn_proto::{
    congestion::{BbrConfig, CubicConfig},
    crypto::rustls::{QuicClientConfig, QuicServerConfig},
    ClientConfig, EndpointConfig, IdleTimeout, ServerConfig, TransportConfig, VarInt,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{util::Credentials, Configuration};

/// Keepalive interval for the QUIC connection
pub(crate) const PROTOCOL_KEEPALIVE: Duration = Duration::from_secs(5);

/// Selects the congestion control algorithm to use.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
    clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CongestionController {
    /// The congestion algorithm TCP uses. This is good for most cases.
    #[default]
    Cubic,
    /// (Use with caution!) An experimental algorithm created by Google,
    /// which increases goodput in some situations
    /// (particularly long and fat connections where the intervening
    /// buffers are shallow). However this comes at the cost of having
    /// more data in-flight, and much greater packet retransmission.
    /// See
    /// `https://blog.apnic.net/2020/01/10/when-to-use-and-not-use-bbr/`
    /// for more discussion.
    Bbr,
}

/// Specifies whether to configure to maximise transmission throughput, receive throughput, or both.
/// Specifying `Both` for a one-way data transfer will work, but wastes kernel memory.
#[derive(Copy, Clone, Debug, PartialEq, strum::Display)]
pub enum ThroughputMode {
    /// We expect to send a lot but not receive
    Tx,
    /// We expect to receive a lot but not send much
    Rx,
    /// We expect to send and receive, or we don't know
    Both,
}

/// Creates a `quinn_proto::TransportConfig` for the endpoint setup
///
/// The server admits up to `max_streams` concurrent client-initiated streams.
/// The client admits none, as the protocol is strictly client-initiated.
pub fn create_config(
    params: &Configuration,
    mode: ThroughputMode,
    is_server: bool,
) -> Result<Arc<TransportConfig>> {
    let mut config = TransportConfig::default();
    let incoming_streams = if is_server {
        VarInt::from_u32(params.max_streams)
    } else {
        VarInt::from_u32(0)
    };
    let _ = config
        .max_concurrent_bidi_streams(incoming_streams)
        .max_concurrent_uni_streams(0u8.into())
        .keep_alive_interval(Some(PROTOCOL_KEEPALIVE))
        .max_idle_timeout(Some(
            IdleTimeout::try_from(params.timeout_duration())
                .context("idle timeout out of range")?,
        ))
        .initial_rtt(2 * params.rtt_duration());

    let udp_buf =
        usize::try_from(params.udp_buffer).context("udp_buffer size overflowed usize")?;

    match mode {
        ThroughputMode::Tx | ThroughputMode::Both => {
            let _ = config
                .send_window(params.send_window())
                .datagram_send_buffer_size(udp_buf);
        }
        ThroughputMode::Rx => (),
    }

    match mode {
        ThroughputMode::Rx | ThroughputMode::Both => {
            let rwnd: VarInt = params.recv_window().try_into()?;
            let swnd: VarInt = params.stream_recv_window().try_into()?;
            let _ = config
                .receive_window(rwnd)
                .stream_receive_window(swnd) // essential; quinn defaults to 100Mbits x 100ms
                .datagram_receive_buffer_size(Some(udp_buf));
        }
        ThroughputMode::Tx => (),
    }

    let window = params.initial_congestion_window;
    match params.congestion {
        CongestionController::Cubic => {
            let mut cubic = CubicConfig::default();
            if window != 0 {
                let _ = cubic.initial_window(window);
            }
            let _ = config.congestion_controller_factory(Arc::new(cubic));
        }
        CongestionController::Bbr => {
            let mut bbr = BbrConfig::default();
            if window != 0 {
                let _ = bbr.initial_window(window);
            }
            let _ = config.congestion_controller_factory(Arc::new(bbr));
        }
    }

    debug!(
        "Final network configuration: {}",
        params.format_transport_config()
    );
    trace!("Quinn network configuration: {config:?}");

    let send_data = if mode == ThroughputMode::Rx {
        ""
    } else {
        &format!(
            "; send window {}, send buffer {}",
            params.send_window().human_count_bytes(),
            udp_buf.human_count_bytes()
        )
    };
    let recv_data = if mode == ThroughputMode::Tx {
        ""
    } else {
        &format!(
            "; recv window {} (per stream {}), recv buffer {}",
            params.recv_window().human_count_bytes(),
            params.stream_recv_window().human_count_bytes(),
            udp_buf.human_count_bytes()
        )
    };
    debug!("Buffer configuration: mode {mode}{send_data}{recv_data}");

    Ok(config.into())
}

/// Endpoint configuration, offering only the configured QUIC version
pub(crate) fn endpoint_config(params: &Configuration) -> Arc<EndpointConfig> {
    let mut config = EndpointConfig::default();
    let _ = config.supported_versions(vec![params.quic_version]);
    Arc::new(config)
}

/// Client-side connection configuration: TLS, transport tuning and QUIC version
pub(crate) fn client_config(params: &Configuration) -> Result<ClientConfig> {
    let pinned = if params.server_cert.is_empty() {
        None
    } else {
        Some(std::path::Path::new(&params.server_cert))
    };
    let tls = crate::util::client_tls_config(pinned)?;
    let crypto = QuicClientConfig::try_from(tls).context("unusable TLS client configuration")?;
    let mut config = ClientConfig::new(Arc::new(crypto));
    let _ = config
        .transport_config(create_config(params, ThroughputMode::Rx, false)?)
        .version(params.quic_version);
    Ok(config)
}

/// Server-side connection configuration: TLS with the given credentials, and transport tuning
pub(crate) fn server_config(
    params: &Configuration,
    credentials: &Credentials,
) -> Result<Arc<ServerConfig>> {
    let tls = crate::util::server_tls_config(credentials)?;
    let crypto = QuicServerConfig::try_from(tls).context("unusable TLS server configuration")?;
    let mut config = ServerConfig::with_crypto(Arc::new(crypto));
    let _ = config.transport_config(create_config(params, ThroughputMode::Tx, true)?);
    Ok(Arc::new(config))
}

#[cfg(test)]
mod test {
    use super::{create_config, CongestionController, ThroughputMode};
    use crate::Configuration;
    use std::str::FromStr as _;

    #[test]
    fn congestion_names() {
        assert_eq!(
            CongestionController::from_str("bbr").unwrap(),
            CongestionController::Bbr
        );
        assert_eq!(CongestionController::Cubic.to_string(), "cubic");
        assert!(CongestionController::from_str("reno").is_err());
    }

    #[test]
    fn all_modes() {
        let mut cfg = Configuration::system_default().clone();
        for mode in [ThroughputMode::Tx, ThroughputMode::Rx, ThroughputMode::Both] {
            let _ = create_config(&cfg, mode, true).unwrap();
        }
        cfg.congestion = CongestionController::Bbr;
        cfg.initial_congestion_window = 12345;
        let _ = create_config(&cfg, ThroughputMode::Both, false).unwrap();
    }

    #[test]
    fn client_and_server_configs() {
        let cfg = Configuration::system_default();
        let creds = crate::util::Credentials::generate().unwrap();
        let _ = super::server_config(cfg, &creds).unwrap();
        let _ = super::client_config(cfg).unwrap();
    }
}
