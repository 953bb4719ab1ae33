//! End of run statistics
// (c) 2024 Ross Younger

use human_repr::{HumanCount, HumanDuration, HumanThroughput};
use quinn_proto::ConnectionStats;
use std::{fmt::Display, time::Duration};
use tracing::{info, warn};

use crate::config::Configuration;

/// What a client run achieved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RunSummary {
    /// Files fetched in full
    pub(crate) files: usize,
    /// Payload bytes written to disk
    pub(crate) bytes: u64,
    /// Wall-clock time from first connection attempt to last disconnection
    pub(crate) elapsed: Duration,
    /// Connections used (goaway causes reconnections)
    pub(crate) connections: u32,
}

impl RunSummary {
    /// Average payload rate in bytes per second, if one can be computed
    pub(crate) fn rate(&self) -> Option<f64> {
        if self.elapsed.is_zero() {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let bytes = self.bytes as f64;
        Some(bytes / self.elapsed.as_secs_f64())
    }
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{files} file{s}, {bytes} in {time}",
            files = self.files,
            s = if self.files == 1 { "" } else { "s" },
            bytes = self.bytes.human_count_bytes(),
            time = self.elapsed.human_duration(),
        )?;
        if let Some(rate) = self.rate() {
            write!(f, " ({})", rate.human_throughput_bytes())?;
        }
        if self.connections > 1 {
            write!(f, " over {} connections", self.connections)?;
        }
        Ok(())
    }
}

/// Logs the end-of-run summary, and the transport statistics of the last connection
pub(crate) fn process_statistics(
    summary: &RunSummary,
    stats: Option<&ConnectionStats>,
    config: &Configuration,
    show_statistics: bool,
) {
    if summary.files > 0 {
        info!("Fetched {summary}");
    }
    let Some(stats) = stats else {
        return;
    };
    let path = &stats.path;
    if show_statistics {
        info!(
            "{tx} datagrams sent, {rx} received; path MTU {mtu}, RTT {rtt}, congestion window {cwnd}",
            tx = stats.udp_tx.datagrams.human_count_bare(),
            rx = stats.udp_rx.datagrams.human_count_bare(),
            mtu = path.current_mtu,
            rtt = path.rtt.human_duration(),
            cwnd = path.cwnd.human_count_bytes(),
        );
    }
    if path.congestion_events > 0 {
        warn!("{} congestion events", path.congestion_events.human_count_bare());
    }
    if path.lost_packets > 0 && path.sent_packets > 0 {
        #[allow(clippy::cast_precision_loss)]
        let pct = 100. * path.lost_packets as f64 / path.sent_packets as f64;
        warn!(
            "Lost {lost} of {sent} packets ({pct:.2}%, {bytes})",
            lost = path.lost_packets.human_count_bare(),
            sent = path.sent_packets.human_count_bare(),
            bytes = path.lost_bytes.human_count_bytes(),
        );
    }
    if let Some(suggested) = rtt_advice(path.rtt, config) {
        warn!(
            "Measured RTT {measured:?} exceeds the configured {configured}ms; for better performance try --rtt {suggested}",
            measured = path.rtt,
            configured = config.rtt,
        );
    }
}

/// Suggests a better `--rtt` when the measured RTT is more than 10% above the configured one
fn rtt_advice(measured: Duration, config: &Configuration) -> Option<u128> {
    (measured > config.rtt_duration() * 11 / 10).then(|| measured.as_millis() + 1)
}

#[cfg(test)]
mod tests {
    use super::{rtt_advice, RunSummary};
    use crate::Configuration;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::time::Duration;

    fn summary(files: usize, bytes: u64, secs: u64, connections: u32) -> RunSummary {
        RunSummary {
            files,
            bytes,
            elapsed: Duration::from_secs(secs),
            connections,
        }
    }

    #[test]
    fn no_time_no_rate() {
        let s = summary(1, 1234, 0, 1);
        assert!(s.rate().is_none());
        assert!(s.to_string().starts_with("1 file, 1.2kB in "));
        assert!(!s.to_string().contains("/s"));
    }

    #[rstest]
    #[case(summary(1, 42, 1, 1), "1 file, 42B in 1s (42B/s)")]
    #[case(summary(3, 20_000_000, 1, 1), "3 files, 20MB in 1s (20MB/s)")]
    #[case(summary(5, 1234, 1, 3), "5 files, 1.2kB in 1s (1.2kB/s) over 3 connections")]
    fn display(#[case] s: RunSummary, #[case] expect: &str) {
        assert_eq!(s.to_string(), expect);
    }

    #[test]
    fn rtt_within_tolerance() {
        let mut config = Configuration::system_default().clone();
        config.rtt = 100;
        assert_eq!(rtt_advice(Duration::from_millis(105), &config), None);
        assert_eq!(rtt_advice(Duration::from_millis(110), &config), None);
        assert_eq!(rtt_advice(Duration::from_millis(150), &config), Some(151));
    }
}
