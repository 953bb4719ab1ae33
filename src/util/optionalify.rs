//! Template for the command-line layer of the configuration
// (c) 2024 Ross Younger

#![allow(meta_variable_misuse)] // false positives in these macro definitions

use derive_deftly::define_derive_deftly;

define_derive_deftly! {
    /// Derives `{Name}_Optional`: the same struct with every field wrapped in `Option`,
    /// so that a command line need only mention the options the user actually set.
    ///
    /// The derived struct is a [`figment::Provider`](https://docs.rs/figment/latest/figment/trait.Provider.html)
    /// named `command-line` which yields only the fields that are `Some`. Each value's source is
    /// reported as the `--kebab-case` option that set it.
    ///
    /// Attributes written after `#[derive_deftly(Optionalify)]` are copied to the derived struct,
    /// which also derives `Default`. It has the original's visibility unless
    /// `#[deftly(visibility = ...)]` says otherwise.
    export Optionalify for struct, expect items:
    ${define OPTIONAL_TYPE ${paste $tdeftype _Optional}}

    /// Every field of the original, optional
    #[allow(non_camel_case_types)]
    ${tattrs}
    #[derive(Default)]
    ${if tmeta(visibility) {
        ${tmeta(visibility) as token_stream}
    } else {
        ${tvis}
    }}
    struct $OPTIONAL_TYPE {
        $(
            ${fattrs}
            ${fvis} $fname: Option<$ftype>,
        )
    }

    impl figment::Provider for $OPTIONAL_TYPE {
        fn metadata(&self) -> figment::Metadata {
            figment::Metadata::named("command-line").interpolater(|_profile, path| {
                use heck::ToKebabCase as _;
                path.last()
                    .map_or_else(|| "command line".into(), |key| format!("--{}", key.to_kebab_case()))
            })
        }

        fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
            let mut given = figment::value::Dict::new();
            $(
                if let Some(v) = &self.${fname} {
                    let _ = given.insert(stringify!($fname).into(), figment::value::Value::serialize(v)?);
                }
            )
            Ok(figment::Profile::Global.collect(given))
        }
    }
}

#[allow(clippy::module_name_repetitions)]
pub use derive_deftly_template_Optionalify;

#[cfg(test)]
mod test {
    use super::derive_deftly_template_Optionalify;
    use derive_deftly::Deftly;
    use figment::{providers::Serialized, Figment, Provider as _};
    use pretty_assertions::assert_eq;

    #[derive(Deftly)]
    #[derive_deftly(Optionalify)]
    #[derive(PartialEq, Debug, serde::Serialize, serde::Deserialize)]
    struct Limits {
        max_streams: u32,
        root: String,
    }

    #[test]
    fn only_given_fields_override() {
        let defaults = Limits {
            max_streams: 100,
            root: "/srv".into(),
        };
        let given = Limits_Optional {
            max_streams: Some(4),
            ..Default::default()
        };
        assert!(given.root.is_none());

        let merged: Limits = Figment::new()
            .merge(Serialized::defaults(defaults))
            .merge(given)
            .extract()
            .unwrap();
        assert_eq!(
            merged,
            Limits {
                max_streams: 4,
                root: "/srv".into(),
            }
        );
    }

    #[test]
    fn source_is_the_option_name() {
        let given = Limits_Optional {
            max_streams: Some(4),
            root: None,
        };
        assert_eq!(given.metadata().name, "command-line");
        let figment = Figment::new().merge(given);
        let value = figment.find_value("max_streams").unwrap();
        let meta = figment.get_metadata(value.tag()).unwrap();
        let path = ["max_streams".to_string()];
        assert_eq!(
            meta.interpolate(&figment::Profile::Global, &path),
            "--max-streams"
        );
        assert!(figment.find_value("root").is_err());
    }
}
