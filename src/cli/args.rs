//! Command-line argument definitions
// (c) 2024 Ross Younger

use std::ffi::OsString;

use clap::Parser;

use crate::{client::Parameters, config::Configuration_Optional};

#[derive(Debug, Parser, Clone)]
#[command(
    author,
    version,
    about,
    before_help = "e.g.   qfetch --host server.example.com some/file other/file",
    infer_long_args(true),
    arg_required_else_help(true),
    help_template(
        "\
{name} version {version}
{about-with-newline}
{usage-heading} {usage}
{before-help}
{all-args}{after-help}
"
    ),
    styles=super::styles::CLAP_STYLES)]
#[command(help_expected = true)]
pub(crate) struct CliArgs {
    // MODE SELECTION ======================================================================
    /// Operates in server mode, serving files from `--root` on `--port`
    #[arg(long, help_heading("Modes"), display_order(0))]
    pub(crate) server: bool,

    /// Outputs the configuration, then exits.
    #[arg(long, help_heading("Configuration"), display_order(0))]
    pub(crate) show_config: bool,

    // CONFIGURATION =======================================================================
    #[command(flatten)]
    /// The set of options which may be set in the environment or on the command line
    pub(crate) config: Configuration_Optional,

    // CLIENT-ONLY OPTIONS =================================================================
    #[command(flatten)]
    /// Options that apply to the client only, and are not configuration
    pub(crate) client_params: Parameters,
}

impl CliArgs {
    /// Sets up and executes our parser
    pub(crate) fn custom_parse<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::try_parse_from(args)
    }

    /// Which mode we are running in
    pub(crate) fn mode(&self) -> MainMode {
        if self.server {
            MainMode::Server
        } else if self.show_config {
            MainMode::ShowConfig
        } else {
            MainMode::Client
        }
    }
}

/// What the binary is going to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub(crate) enum MainMode {
    /// Serve files
    Server,
    /// Fetch files
    Client,
    /// Print the configuration
    ShowConfig,
}

#[cfg(test)]
mod test {
    use super::{CliArgs, MainMode};
    use clap::CommandFactory as _;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::custom_parse(args.iter().copied()).unwrap()
    }

    #[test]
    fn command_is_consistent() {
        CliArgs::command().debug_assert();
        let cmd = CliArgs::command();
        for id in ["server", "show_config", "files", "port", "root"] {
            assert!(cmd.get_arguments().any(|a| *a.get_id() == *id), "{id}");
        }
    }

    #[test]
    fn modes() {
        assert_eq!(parse(&["qfetch", "--server"]).mode(), MainMode::Server);
        assert_eq!(parse(&["qfetch", "--show-config"]).mode(), MainMode::ShowConfig);
        assert_eq!(parse(&["qfetch", "a"]).mode(), MainMode::Client);
    }

    #[test]
    fn config_and_params_together() {
        let args = parse(&["qfetch", "--rtt", "42", "-n", "3", "--host", "::1", "f1", "f2"]);
        assert_eq!(args.config.rtt, Some(42));
        assert_eq!(args.config.port, None);
        assert_eq!(args.client_params.requests, 3);
        assert_eq!(args.client_params.host, "::1");
        assert_eq!(args.client_params.files, ["f1", "f2"]);
    }

    #[test]
    fn no_arguments_shows_help() {
        let e = CliArgs::custom_parse(["qfetch"]).unwrap_err();
        assert_eq!(
            e.kind(),
            clap::error::ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }
}
