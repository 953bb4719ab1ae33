//! System default configuration provider
// (c) 2024 Ross Younger

use crate::Configuration;
use figment::{providers::Serialized, Metadata, Provider};

/// A [`figment::Provider`](https://docs.rs/figment/latest/figment/trait.Provider.html) that holds
/// the set of system default options
pub(super) struct SystemDefault {}

impl SystemDefault {
    const META_NAME: &str = "default";
}

impl Provider for SystemDefault {
    fn metadata(&self) -> Metadata {
        figment::Metadata::named(Self::META_NAME)
    }

    fn data(
        &self,
    ) -> std::result::Result<
        figment::value::Map<figment::Profile, figment::value::Dict>,
        figment::Error,
    > {
        Serialized::defaults(Configuration::system_default()).data()
    }
}

#[cfg(test)]
mod test {
    use crate::{config::Manager, Configuration};
    use pretty_assertions::assert_eq;

    #[test]
    fn system_default_applies() {
        let mut mgr = Manager::new(false);
        let defs = Configuration::system_default();

        mgr.apply_system_default();
        let cfg = mgr.get::<Configuration>().unwrap();
        assert_eq!(cfg.rx, defs.rx);
        assert_eq!(cfg.port, defs.port);
        assert_eq!(cfg.max_streams, defs.max_streams);
        assert_eq!(cfg.root, defs.root);
    }

    #[test]
    fn system_default_is_lowest_priority() {
        let mut mgr = Manager::new(false);
        mgr.merge_provider(figment::providers::Serialized::default("port", 1234u16));
        mgr.apply_system_default();
        let cfg = mgr.get::<Configuration>().unwrap();
        assert_eq!(cfg.port, 1234);
    }
}
