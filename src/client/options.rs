//! Options specific to qfetch client-mode
// (c) 2024 Ross Younger

use clap::Parser;

#[derive(Debug, Parser, Clone, Default)]
#[allow(clippy::struct_excessive_bools)]
/// Client-side options which may be provided on the command line, but are not persistent configuration options.
pub struct Parameters {
    /// Enable detailed debug output
    ///
    /// This has the same effect as setting `RUST_LOG=qfetch=debug` in the environment.
    /// If present, `RUST_LOG` overrides this option.
    #[arg(short, long, action, help_heading("Debug"), display_order(0))]
    pub debug: bool,

    /// Log to a file
    ///
    /// By default the log receives everything printed to stderr.
    /// To override this behaviour, set the environment variable `RUST_LOG_FILE_DETAIL` (same semantics as `RUST_LOG`).
    #[arg(
        short('l'),
        long,
        action,
        value_name("FILE"),
        help_heading("Output"),
        next_line_help(true),
        display_order(0)
    )]
    pub log_file: Option<String>,

    /// Quiet mode
    ///
    /// Switches off progress display and statistics; reports only errors
    #[arg(short, long, action, conflicts_with("debug"), help_heading("Output"))]
    pub quiet: bool,

    /// Show additional transfer statistics
    #[arg(
        short = 's',
        long,
        alias("stats"),
        action,
        conflicts_with("quiet"),
        help_heading("Output"),
        display_order(0)
    )]
    pub statistics: bool,

    /// The server to fetch from
    #[arg(
        short = 'H',
        long,
        default_value("127.0.0.1"),
        value_name("HOST"),
        help_heading("Request")
    )]
    pub host: String,

    /// Fetch the list of files this many times
    #[arg(
        short = 'n',
        long,
        default_value_t = 1,
        value_name("N"),
        value_parser(clap::value_parser!(u32).range(1..)),
        help_heading("Request")
    )]
    pub requests: u32,

    /// Treat a QUIC version mismatch with the server as success
    ///
    /// This is useful when probing which versions a server supports.
    #[arg(long, action, help_heading("Request"))]
    pub version_mismatch_ok: bool,

    /// The files to fetch. Each is written to `_<name>` in the output directory.
    #[arg(value_name = "FILE")]
    pub files: Vec<String>,
}

impl Parameters {
    /// The full list of requests to make, in order
    #[must_use]
    pub fn backlog(&self) -> Vec<String> {
        let mut result = Vec::with_capacity(self.files.len() * self.requests as usize);
        for _ in 0..self.requests {
            result.extend(self.files.iter().cloned());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_debug_option() {
        let params = Parameters::parse_from(["test", "--debug"]);
        assert!(params.debug);
    }

    #[test]
    fn test_log_file_option() {
        let params = Parameters::parse_from(["test", "--log-file", "log.txt"]);
        assert_eq!(params.log_file, Some("log.txt".to_string()));
    }

    #[test]
    fn test_quiet_option() {
        let params = Parameters::parse_from(["test", "--quiet"]);
        assert!(params.quiet);
    }

    #[test]
    fn test_quiet_conflicts_with_debug() {
        assert!(Parameters::try_parse_from(["test", "--quiet", "--debug"]).is_err());
    }

    #[test]
    fn test_statistics_option() {
        let params = Parameters::parse_from(["test", "--stats"]);
        assert!(params.statistics);
    }

    #[test]
    fn test_defaults() {
        let params = Parameters::parse_from(["test"]);
        assert_eq!(params.host, "127.0.0.1");
        assert_eq!(params.requests, 1);
        assert!(params.files.is_empty());
        assert!(!params.version_mismatch_ok);
    }

    #[test]
    fn test_zero_requests_refused() {
        assert!(Parameters::try_parse_from(["test", "-n", "0", "a"]).is_err());
    }

    #[test]
    fn test_backlog_repeats_in_order() {
        let params = Parameters::parse_from(["test", "-n", "2", "a", "b"]);
        assert_eq!(params.backlog(), ["a", "b", "a", "b"]);
    }
}
