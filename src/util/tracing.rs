//! Log output setup
// (c) 2024 Ross Younger

use std::{
    fs::File,
    io::Write,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    sync::{Arc, Mutex},
};

use anyhow::Context as _;
use indicatif::MultiProgress;
use serde::{de, Deserialize, Serialize};
use strum::VariantNames as _;
use tracing_subscriber::{
    fmt::{
        format::Writer,
        time::{ChronoLocal, ChronoUtc, FormatTime},
        writer::BoxMakeWriter,
    },
    prelude::*,
    EnvFilter, Registry,
};

use crate::{cli::styles::maybe_strip_color, Parameters};

static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Controls what gets logged to the console
const STANDARD_ENV_VAR: &str = "RUST_LOG";
/// Controls what gets logged to the log file, if there is one
const LOG_FILE_DETAIL_ENV_VAR: &str = "RUST_LOG_FILE_DETAIL";

type BoxedLayer = Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync>;

/// The level at which we log our own events, given the user's choice of verbosity
pub(crate) fn trace_level(args: &Parameters) -> &'static str {
    if args.debug {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        "info"
    }
}

/// Selects the format of time stamps in output messages
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
    clap::ValueEnum,
    Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "kebab-case")]
pub enum TimeFormat {
    /// Local time, as "year-month-day HH:MM:SS"
    #[default]
    Local,
    /// UTC, as "year-month-day HH:MM:SS"
    Utc,
    /// Local time in [RFC 3339](https://datatracker.ietf.org/doc/html/rfc3339) format, e.g. `2010-03-14T18:32:03+01:00`
    Rfc3339,
}

impl<'de> Deserialize<'de> for TimeFormat {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        // strum is set up to parse lowercase only
        s.to_ascii_lowercase()
            .parse()
            .map_err(|_| de::Error::unknown_variant(&s, TimeFormat::VARIANTS))
    }
}

/// Timestamp source for a log layer
#[derive(Debug)]
enum Timestamps {
    Local(ChronoLocal),
    Utc(ChronoUtc),
}

impl From<TimeFormat> for Timestamps {
    fn from(format: TimeFormat) -> Self {
        match format {
            TimeFormat::Local => Self::Local(ChronoLocal::new("%Y-%m-%d %H:%M:%SL".into())),
            TimeFormat::Utc => Self::Utc(ChronoUtc::new("%Y-%m-%d %H:%M:%SZ".into())),
            TimeFormat::Rfc3339 => Self::Local(ChronoLocal::rfc_3339()),
        }
    }
}

impl FormatTime for Timestamps {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        match self {
            Self::Local(t) => t.format_time(w),
            Self::Utc(t) => t.format_time(w),
        }
    }
}

/// Where console log output goes
#[derive(Debug, Clone)]
pub(crate) enum Console {
    /// Straight to stderr
    Stderr,
    /// Through the progress display, so log lines do not tear up the progress bars
    Progress(MultiProgress),
    /// Nowhere
    #[allow(dead_code)] // used by tests
    Off,
}

/// Everything needed to set up logging for one run
#[derive(Debug, Clone)]
pub(crate) struct LogSettings {
    /// Level for our own events, when the environment does not say otherwise
    pub(crate) level: &'static str,
    pub(crate) console: Console,
    /// Also log to this file
    pub(crate) file: Option<PathBuf>,
    pub(crate) time_format: TimeFormat,
    /// Whether console output may contain colour codes
    pub(crate) colour: bool,
}

impl LogSettings {
    /// Settings derived from the command line
    pub(crate) fn new(params: &Parameters, console: Console, time_format: TimeFormat) -> Self {
        Self {
            level: trace_level(params),
            console,
            file: params.log_file.as_ref().map(PathBuf::from),
            time_format,
            colour: crate::cli::styles::use_colours(),
        }
    }

    /// The filter for our own events when the environment does not provide one.
    /// Problems quinn-proto notices are always worth seeing.
    fn default_filter(&self) -> anyhow::Result<EnvFilter> {
        Ok(EnvFilter::try_new(format!(
            "qfetch={},quinn_proto=warn",
            self.level
        ))?)
    }

    /// Reads a filter from the environment, falling back to the default filter if the
    /// variable is unset. Returns whether the environment was used.
    fn filter(&self, key: &str) -> anyhow::Result<(EnvFilter, bool)> {
        match std::env::var(key) {
            Err(_) => Ok((self.default_filter()?, false)),
            Ok(directives) => {
                let filter = EnvFilter::try_new(&directives).with_context(|| {
                    format!("{key} (set in environment) was not understood")
                })?;
                Ok((filter, true))
            }
        }
    }

    fn layer(
        &self,
        writer: BoxMakeWriter,
        filter: EnvFilter,
        show_target: bool,
        ansi: bool,
    ) -> BoxedLayer {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(show_target)
            .with_ansi(ansi)
            .with_timer(Timestamps::from(self.time_format))
            .with_writer(writer)
            .with_filter(filter)
            .boxed()
    }

    /// Builds the log layers without installing them
    fn layers(&self) -> anyhow::Result<Vec<BoxedLayer>> {
        let mut layers = Vec::new();

        // When logging only ourselves, the target is noise.
        let (filter, from_env) = self.filter(STANDARD_ENV_VAR)?;
        match &self.console {
            Console::Off => (),
            Console::Stderr => layers.push(self.layer(
                BoxMakeWriter::new(std::io::stderr),
                filter,
                from_env,
                self.colour,
            )),
            Console::Progress(display) => layers.push(self.layer(
                BoxMakeWriter::new(ProgressWriter::wrap(display.clone())),
                filter,
                from_env,
                self.colour,
            )),
        }

        if let Some(path) = &self.file {
            let file = File::create(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let key = if std::env::var_os(LOG_FILE_DETAIL_ENV_VAR).is_some() {
                LOG_FILE_DETAIL_ENV_VAR
            } else {
                STANDARD_ENV_VAR
            };
            let (filter, from_env) = self.filter(key)?;
            layers.push(self.layer(BoxMakeWriter::new(Arc::new(file)), filter, from_env, false));
        }
        Ok(layers)
    }
}

/// Installs the global log subscriber.
///
/// By default only our own events are logged, at the configured level. `RUST_LOG` overrides this.
///
/// This takes effect once per process; later calls are ignored with a warning.
/// If it fails, logging is not set up, so the caller must report the error some other way.
pub(crate) fn setup(settings: &LogSettings) -> anyhow::Result<()> {
    if TRACING_INITIALIZED.swap(true, Ordering::Relaxed) {
        tracing::warn!("logging was already set up (ignoring)");
        return Ok(());
    }
    let layers = settings.layers()?;
    tracing_subscriber::registry().with(layers).init();
    Ok(())
}

/// Whether the global log subscriber has been installed
pub(crate) fn is_initialized() -> bool {
    TRACING_INITIALIZED.load(Ordering::Relaxed)
}

/// Logs everything to stderr, for tests which want to see the log.
///
/// This modifies global state, so tests calling it should run in a fork.
#[cfg(test)]
pub(crate) fn setup_tracing_for_tests() {
    let _ = setup(&LogSettings {
        level: "trace",
        console: Console::Stderr,
        file: None,
        time_format: TimeFormat::Local,
        colour: false,
    });
}

/// Sends log lines through a `MultiProgress` so they appear above the progress bars
struct ProgressWriter(MultiProgress);

impl ProgressWriter {
    fn wrap(display: MultiProgress) -> Mutex<Self> {
        Mutex::new(Self(display))
    }
}

impl Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = std::str::from_utf8(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        // println supplies its own newline
        let msg = maybe_strip_color(msg.trim_end_matches('\n'));
        if self.0.is_hidden() {
            eprintln!("{msg}");
        } else {
            self.0.println(msg)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use indicatif::{MultiProgress, ProgressDrawTarget};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use rusty_fork::rusty_fork_test;
    use tempfile::TempDir;

    use super::{setup, trace_level, Console, LogSettings, TimeFormat};
    use crate::Parameters;

    fn settings(console: Console, file: Option<PathBuf>) -> LogSettings {
        LogSettings {
            level: "info",
            console,
            file,
            time_format: TimeFormat::Utc,
            colour: false,
        }
    }

    #[rstest]
    #[case(true, true, "debug")]
    #[case(true, false, "debug")]
    #[case(false, true, "error")]
    #[case(false, false, "info")]
    fn trace_levels(#[case] debug: bool, #[case] quiet: bool, #[case] expected: &str) {
        let p = Parameters {
            debug,
            quiet,
            ..Default::default()
        };
        assert_eq!(trace_level(&p), expected);
    }

    #[test]
    fn settings_from_parameters() {
        let p = Parameters {
            quiet: true,
            log_file: Some("out.log".into()),
            ..Default::default()
        };
        let s = LogSettings::new(&p, Console::Off, TimeFormat::Rfc3339);
        assert_eq!(s.level, "error");
        assert_eq!(s.file, Some(PathBuf::from("out.log")));
        assert_eq!(s.time_format, TimeFormat::Rfc3339);
    }

    #[test]
    fn console_layer_via_progress() {
        let mp = MultiProgress::with_draw_target(ProgressDrawTarget::hidden());
        let layers = settings(Console::Progress(mp), None).layers().unwrap();
        assert_eq!(layers.len(), 1);
    }

    #[test]
    fn console_and_file_layers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.log");
        let layers = settings(Console::Stderr, Some(path.clone()))
            .layers()
            .unwrap();
        assert_eq!(layers.len(), 2);
        assert!(path.exists());
    }

    #[test]
    fn unwritable_log_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("no").join("such").join("dir.log");
        assert!(settings(Console::Off, Some(path)).layers().is_err());
    }

    #[test]
    fn invalid_level_is_an_error() {
        let mut s = settings(Console::Off, None);
        s.level = "invalid_level";
        assert!(s.layers().is_err());
    }

    #[rstest]
    #[case("RFC3339", TimeFormat::Rfc3339)]
    #[case("utc", TimeFormat::Utc)]
    #[case("Local", TimeFormat::Local)]
    fn time_format_is_case_insensitive(#[case] input: &str, #[case] expected: TimeFormat) {
        use figment::{providers::Serialized, Figment};
        #[derive(serde::Deserialize)]
        struct Holder {
            tf: TimeFormat,
        }
        let f = Figment::new().merge(Serialized::default("tf", input));
        assert_eq!(f.extract::<Holder>().unwrap().tf, expected);
    }

    #[test]
    fn progress_writer_hidden() {
        use std::io::Write as _;
        let mp = MultiProgress::with_draw_target(ProgressDrawTarget::hidden());
        let mux = super::ProgressWriter::wrap(mp);
        let mut writer = mux.lock().unwrap();
        let msg = "Test message\n";
        assert_eq!(writer.write(msg.as_bytes()).unwrap(), msg.len());
        writer.flush().unwrap();
    }

    // these touch global state, so run in forks
    rusty_fork_test! {
        #[test]
        fn setup_twice_is_harmless() {
            let s = settings(Console::Off, None);
            setup(&s).unwrap();
            setup(&s).unwrap();
            assert!(super::is_initialized());
        }

        #[test]
        fn environment_overrides_level() {
            std::env::set_var("RUST_LOG", "trace");
            let (_, from_env) = settings(Console::Off, None).filter("RUST_LOG").unwrap();
            assert!(from_env);
            std::env::set_var("RUST_LOG", "[[[");
            assert!(settings(Console::Off, None).filter("RUST_LOG").is_err());
        }
    }
}
