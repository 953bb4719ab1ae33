//! `--show-config` output
// (c) 2024 Ross Younger

use super::{Manager, ENV_PREFIX};
use crate::cli::styles::use_colours;

use figment::{value::Value, Metadata};
use heck::{ToKebabCase as _, ToShoutySnakeCase as _};
use std::fmt::Display;
use struct_field_names_as_array::FieldNamesAsSlice;
use tabled::{
    settings::{object::Columns, style::Style, Color},
    Table, Tabled,
};

/// One row of the configuration table
#[derive(Tabled)]
struct Row {
    #[tabled(rename = "Option")]
    option: String,
    #[tabled(rename = "Environment")]
    env: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Source")]
    source: String,
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(_, s) if s.is_empty() => "(unset)".into(),
        Value::String(_, s) => s.clone(),
        Value::Char(_, c) => c.to_string(),
        Value::Bool(_, b) => b.to_string(),
        Value::Num(_, n) => n
            .to_u128()
            .map(|u| u.to_string())
            .or_else(|| n.to_i128().map(|i| i.to_string()))
            .or_else(|| n.to_f64().map(|f| f.to_string()))
            .unwrap_or_else(|| "?".into()),
        Value::Empty(..) => "(none)".into(),
        Value::Dict(_, dict) => format!("{} entries", dict.len()),
        Value::Array(_, items) => items.iter().map(render_value).collect::<Vec<_>>().join(","),
    }
}

/// Where a value came from: `default`, `environment` or the command-line option that set it
fn render_source(meta: Option<&Metadata>) -> String {
    let Some(meta) = meta else {
        return String::new();
    };
    if meta.name.contains("environment") {
        return "environment".into();
    }
    meta.source
        .as_ref()
        .map_or_else(|| meta.name.to_string(), ToString::to_string)
}

/// Renders the resolved configuration of a [`Manager`] as a table
#[derive(Debug)]
pub struct DisplayAdapter<'a> {
    source: &'a Manager,
    /// Fields to show, in declaration order
    fields: &'static [&'static str],
}

impl Manager {
    /// Creates a `DisplayAdapter` showing every field of `T`.
    #[must_use]
    pub fn to_display_adapter<T: FieldNamesAsSlice>(&self) -> DisplayAdapter<'_> {
        DisplayAdapter {
            source: self,
            fields: T::FIELD_NAMES_AS_SLICE,
        }
    }
}

impl Display for DisplayAdapter<'_> {
    /// N.B. This uses CLI styling.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = &self.source.data;
        let rows = self.fields.iter().filter_map(|field| {
            let value = data.find_value(field).ok()?;
            Some(Row {
                option: format!("--{}", field.to_kebab_case()),
                env: format!("{ENV_PREFIX}{}", field.to_shouty_snake_case()),
                value: render_value(&value),
                source: render_source(data.get_metadata(value.tag())),
            })
        });
        let mut table = Table::new(rows);
        let _ = table.with(Style::sharp());
        if use_colours() {
            let _ = table.modify(Columns::first(), Color::FG_CYAN);
        }
        write!(f, "{table}")
    }
}
