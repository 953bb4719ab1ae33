//! Configuration source wrangling
// (c) 2024 Ross Younger

use super::{Configuration, ENV_PREFIX};
use crate::cli::CliArgs;

use anyhow::Result;
use figment::{providers::Env, Figment, Provider};
use serde::Deserialize;

/// Processes and merges all possible configuration sources.
///
/// In increasing order of priority: system defaults, environment variables
/// (`QFETCH_<FIELD>`), command line.
#[derive(Debug, Default)]
pub struct Manager {
    /// Configuration data
    pub(super) data: Figment,
}

impl Manager {
    /// Constructor. Optionally reads the environment.
    #[must_use]
    pub fn new(apply_env: bool) -> Self {
        let mut new1 = Self {
            data: Figment::new(),
        };
        if apply_env {
            new1.merge_provider(Env::prefixed(ENV_PREFIX));
        }
        new1
    }

    /// General constructor for production use.
    ///
    /// Reads the environment and applies the system defaults.
    #[must_use]
    pub fn standard() -> Self {
        let mut new1 = Self::new(true);
        new1.apply_system_default();
        new1
    }

    /// Testing/internal constructor, does not apply environment; DOES apply system default.
    #[must_use]
    #[cfg(test)]
    pub(crate) fn without_env() -> Self {
        let mut new1 = Self::new(false);
        new1.apply_system_default();
        new1
    }

    /// Merges in a data set, which is some sort of [figment::Provider](https://docs.rs/figment/latest/figment/trait.Provider.html).
    /// This uses figment's `merge` operation, which prefers to _replace_ existing items.
    ///
    /// Within qfetch, we use [crate::util::derive_deftly_template_Optionalify] to implement Provider for [Configuration].
    pub fn merge_provider<T>(&mut self, provider: T)
    where
        T: Provider,
    {
        let f = std::mem::take(&mut self.data);
        self.data = f.merge(provider); // in the error case, this leaves the provider in a fused state
    }

    /// Applies the system default settings, at a lower priority than everything else
    pub fn apply_system_default(&mut self) {
        let f = std::mem::take(&mut self.data);
        self.data = f.join(super::SystemDefault {});
    }

    /// Attempts to extract a particular struct from the data.
    ///
    /// Within qfetch, `T` is usually [Configuration], but it isn't intrinsically required to be.
    pub(crate) fn get<'de, T>(&self) -> Result<T, figment::Error>
    where
        T: Deserialize<'de>,
    {
        self.data.extract_lossy::<T>()
    }

    /// Extracts the working configuration and performs additional validation checks on it.
    pub fn validated_configuration(&self) -> Result<Configuration> {
        let working = self.get::<Configuration>()?;
        working.validate()
    }
}

impl TryFrom<&CliArgs> for Manager {
    type Error = anyhow::Error;

    fn try_from(args: &CliArgs) -> Result<Self, Self::Error> {
        let mut mgr = Manager::standard();
        mgr.merge_provider(args.config.clone());
        Ok(mgr)
    }
}
