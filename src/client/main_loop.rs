//! Main client mode event loop
// (c) 2024 Ross Younger

use std::{
    collections::VecDeque,
    net::{SocketAddr, ToSocketAddrs as _},
    time::{Duration, Instant},
};

use anyhow::{Context as _, Result};
use indicatif::{MultiProgress, ProgressBar};
use quinn_proto::ConnectionError;
use tracing::{debug, error, info, trace_span, warn};

use super::{progress::progress_style, Client, Parameters, RequestError};
use crate::{
    session::{TransferOutcome, TransferReport},
    util::stats::{process_statistics, RunSummary},
    Configuration,
};

/// Running totals for a client run
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    completed: usize,
    failed: usize,
    bytes: u64,
}

impl Tally {
    /// Accounts for one finished transfer. Returns true if the server rejected it.
    fn record(
        &mut self,
        report: TransferReport,
        backlog: &mut VecDeque<String>,
        retry: bool,
    ) -> bool {
        let rejected = report.outcome == TransferOutcome::Rejected;
        match report.outcome {
            TransferOutcome::Complete => {
                debug!("{} -> {:?}: {} bytes", report.name, report.path, report.bytes);
                self.completed += 1;
                self.bytes += report.bytes;
            }
            TransferOutcome::Rejected if retry => {
                debug!("{} was rejected; will retry", report.name);
                backlog.push_back(report.name);
            }
            TransferOutcome::Rejected => {
                warn!("{}: server rejected the request", report.name);
                self.failed += 1;
            }
            TransferOutcome::Failed(msg) => {
                error!("{}: {msg}", report.name);
                self.failed += 1;
            }
            TransferOutcome::Aborted => {
                warn!("{}: transfer did not complete", report.name);
                self.failed += 1;
            }
        }
        rejected
    }
}

/// Why a connection stopped being useful
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    /// Nothing left to fetch
    Finished,
    /// The server sent goaway (or started rejecting requests) and all our streams have drained
    GoAway,
    /// The connection dropped
    Lost,
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("looking up {host}"))?
        .next()
        .with_context(|| format!("no address found for {host}"))
}

/// Issues requests from the backlog as the session admits them, until there is nothing more
/// to do on this connection.
///
/// A rejected request means the server is going away, even if its goaway datagram was lost,
/// so no more requests are issued on the connection.
fn run_connection(
    client: &mut Client,
    backlog: &mut VecDeque<String>,
    tally: &mut Tally,
    progress: &ProgressBar,
    respect_goaway: bool,
) -> Ending {
    let mut draining = false;
    loop {
        while !draining && client.can_send_request() {
            let Some(name) = backlog.pop_front() else {
                break;
            };
            match client.request(&name, true, progress.clone()) {
                Ok(_) => (),
                Err(RequestError::Output(e)) => {
                    error!("{name}: {e}");
                    tally.failed += 1;
                }
                Err(e) => {
                    debug!("{name} deferred: {e}");
                    backlog.push_front(name);
                    break;
                }
            }
        }
        for report in client.take_reports() {
            draining |= tally.record(report, backlog, respect_goaway) && respect_goaway;
        }
        progress.set_message(format!(
            "{} done, {} active, {} queued",
            tally.completed,
            client.open_streams(),
            backlog.len()
        ));

        if backlog.is_empty() && client.open_streams() == 0 {
            return Ending::Finished;
        }
        if !client.connected() {
            return Ending::Lost;
        }
        if (draining || (respect_goaway && client.goaway_received())) && client.open_streams() == 0
        {
            return Ending::GoAway;
        }
        let _ = client.wait_for_events();
    }
}

fn is_version_mismatch(client: &Client) -> bool {
    client
        .connection_error()
        .and_then(|e| e.downcast_ref::<ConnectionError>())
        .is_some_and(|e| matches!(e, ConnectionError::VersionMismatch))
}

/// Main client mode event loop
///
/// # Return value
/// `true` if every requested file was fetched.
///
// Caution: As we are using ProgressBar, anything to be printed to console should go via tracing or progress.println() !
#[allow(clippy::module_name_repetitions)]
pub fn client_main(
    config: &Configuration,
    display: &MultiProgress,
    parameters: &Parameters,
) -> Result<bool> {
    let _guard = trace_span!("CLIENT").entered();
    anyhow::ensure!(!parameters.files.is_empty(), "no files to fetch");
    let peer = resolve(&parameters.host, config.port)?;
    let mut backlog: VecDeque<String> = parameters.backlog().into();
    let requested = backlog.len();

    let progress = if parameters.quiet {
        ProgressBar::hidden()
    } else {
        display.add(ProgressBar::no_length().with_style(progress_style()?))
    };
    progress.enable_steady_tick(Duration::from_millis(150));

    let mut client = Client::new(config.clone(), peer)?;
    let mut tally = Tally::default();
    let started = Instant::now();
    let mut connections = 0;

    loop {
        client.initialize()?;
        progress.set_message(format!("Connecting to {peer}"));
        if !client.connect() {
            progress.finish_and_clear();
            if parameters.version_mismatch_ok && is_version_mismatch(&client) {
                info!(
                    "server at {peer} does not support QUIC version {:#x}",
                    config.quic_version
                );
                return Ok(true);
            }
            match client.connection_error() {
                Some(e) => error!("could not connect to {peer}: {e:#}"),
                None => error!("could not connect to {peer}"),
            }
            return Ok(false);
        }
        connections += 1;

        let completed_before = tally.completed;
        let ending = run_connection(
            &mut client,
            &mut backlog,
            &mut tally,
            &progress,
            config.respect_goaway,
        );
        match ending {
            Ending::Finished => break,
            Ending::GoAway if tally.completed > completed_before => {
                info!("server sent goaway; reconnecting for {} more", backlog.len());
                client.disconnect();
            }
            Ending::GoAway => {
                error!("server sent goaway without completing any request; giving up");
                tally.failed += backlog.len();
                break;
            }
            Ending::Lost => {
                if let Some(e) = client.connection_error() {
                    error!("connection lost: {e:#}");
                }
                tally.failed += backlog.len();
                break;
            }
        }
    }
    let elapsed = started.elapsed();
    client.disconnect();
    progress.finish_and_clear();

    if !parameters.quiet {
        let summary = RunSummary {
            files: tally.completed,
            bytes: tally.bytes,
            elapsed,
            connections,
        };
        process_statistics(
            &summary,
            client.stats().as_ref(),
            config,
            parameters.statistics,
        );
    }
    if tally.failed == 0 {
        debug!("fetched {} of {requested} files", tally.completed);
    } else {
        error!(
            "{} of {requested} requests failed",
            tally.failed.min(requested)
        );
    }
    Ok(tally.failed == 0)
}
