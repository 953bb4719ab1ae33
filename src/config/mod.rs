// (c) 2024 Ross Younger
//! # 📖 Configuration management
//!
//! qfetch obtains run-time configuration from the following sources, in order:
//! 1. Command-line options
//! 2. Environment variables, named for the option with the prefix `QFETCH_`
//!    (for example `QFETCH_MAX_STREAMS=10` or `QFETCH_ROOT=/srv/files`)
//! 3. Hard-wired defaults
//!
//! Each option may appear in multiple places, but only the first match is used.
//!
//! ## Configurable options
//!
//! The set of supported fields is the [Configuration] structure.
//!
//! On the command line, options must be specified in kebab-case.
//! In environment variables they are in SHOUTY_SNAKE_CASE.
//!
//! * `qfetch --show-config` outputs a list of supported fields, their current values, and where each value came from.
//! * For an explanation of each field, refer to `qfetch --help` .

mod manager;
pub use manager::Manager;

mod prettyprint;

pub(crate) mod structure;
pub use structure::Configuration;
pub(crate) use structure::Configuration_Optional;

mod sysdefault;
use sysdefault::SystemDefault;

/// Prefix for environment variables which set configuration options
pub const ENV_PREFIX: &str = "QFETCH_";
