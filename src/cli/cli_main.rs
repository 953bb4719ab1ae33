//! Main CLI for qfetch
// (c) 2024 Ross Younger

use std::ffi::OsString;
use std::process::ExitCode;

use super::args::{CliArgs, MainMode};
use crate::{
    cli::styles::{configure_colours, error, RESET},
    client::{client_main, MAX_UPDATE_FPS},
    config::{Configuration, Manager},
    server::server_main,
    util::{setup_tracing, tracing_is_initialised, Console, LogSettings},
};

use anstream::{eprintln, println};
use anyhow::Result;
use indicatif::{MultiProgress, ProgressDrawTarget};

/// Main CLI entrypoint
///
/// Call this from `main`, passing the arguments to use.
/// Normally you will call `cli(std::env::args_os())` but you can pass in alternate arguments for CLI testing.
#[must_use]
#[allow(clippy::match_bool)] // improved readability
pub fn cli<I, T>(args: I) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    cli_inner(args)
        .inspect_err(|e| {
            if tracing_is_initialised() {
                tracing::error!("{e:#}");
            } else {
                eprintln!("{ERROR}Error:{RESET} {e:#}", ERROR = error());
            }
        })
        .map_or(ExitCode::FAILURE, |success| match success {
            true => ExitCode::SUCCESS,
            false => ExitCode::FAILURE,
        })
}

/// Inner CLI logic
///
/// # Return
/// true indicates success. false indicates a failure where the callee has output to stderr.
fn cli_inner<I, T>(args: I) -> Result<bool>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    configure_colours();
    let Some(args) = parse_args(args)? else {
        return Ok(true); // help/version shown; exit
    };
    let config_manager = Manager::try_from(&args)?;

    match args.mode() {
        MainMode::ShowConfig => show_config(&config_manager),
        MainMode::Server => run_server(&config_manager, &args),
        MainMode::Client => run_client(&config_manager, &args),
    }
}

fn parse_args<I, T>(args: I) -> Result<Option<CliArgs>>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    use clap::error::ErrorKind::{DisplayHelp, DisplayVersion};
    match CliArgs::custom_parse(args) {
        Ok(args) => Ok(Some(args)),
        Err(e) if matches!(e.kind(), DisplayHelp | DisplayVersion) => {
            e.print()?;
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn show_config(config_manager: &Manager) -> Result<bool> {
    println!("{}", config_manager.to_display_adapter::<Configuration>());
    let _ = config_manager.validated_configuration()?;
    Ok(true)
}

fn run_server(config_manager: &Manager, args: &CliArgs) -> Result<bool> {
    let config = config_manager.validated_configuration()?;
    setup_tracing(&LogSettings::new(
        &args.client_params,
        Console::Stderr,
        config.time_format,
    ))?; // to provoke error: set RUST_LOG=[
    server_main(&config)?;
    Ok(true)
}

fn run_client(config_manager: &Manager, args: &CliArgs) -> Result<bool> {
    let config = config_manager.validated_configuration()?;
    let display =
        MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(MAX_UPDATE_FPS));
    setup_tracing(&LogSettings::new(
        &args.client_params,
        Console::Progress(display.clone()),
        config.time_format,
    ))?;
    // this mode may return false
    client_main(&config, &display, &args.client_params)
}
