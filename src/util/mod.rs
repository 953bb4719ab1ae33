//! General utility code that didn't fit anywhere else
//!
//! Note that most of this module is not exported.
// (c) 2024 Ross Younger

mod cert;
pub use cert::Credentials;
pub(crate) use cert::{client_tls_config, server_tls_config};

pub(crate) mod mmap;
pub(crate) mod socket;
pub(crate) mod stats;

pub(crate) mod tracing;
pub use tracing::TimeFormat;
pub(crate) use tracing::{
    is_initialized as tracing_is_initialised, setup as setup_tracing, Console, LogSettings,
};

mod optionalify;
pub use optionalify::derive_deftly_template_Optionalify;
