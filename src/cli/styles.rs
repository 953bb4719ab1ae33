// (c) 2024 Ross Younger
//! CLI output styling
//!
//! Styles for console output, and a `RESET` constant to return to the default.
//! Every style collapses to the empty style when colours are disabled.

use anstream::ColorChoice;
use anstyle::{AnsiColor, Color, Style};
use clap::builder::styling::Styles;
use std::borrow::Cow;
use std::io::IsTerminal as _;

const fn fg(colour: AnsiColor) -> Style {
    Style::new().fg_color(Some(Color::Ansi(colour)))
}

const ERROR: Style = fg(AnsiColor::Red).bold();
const WARNING: Style = fg(AnsiColor::Yellow).bold();
const INFO: Style = fg(AnsiColor::Cyan);
const HEADER: Style = fg(AnsiColor::Yellow).underline();

/// Resets styling to default. This is a re-export of [`anstyle::Reset`].
pub use anstyle::Reset as RESET;

// clap reads the CLICOLOR environment variables itself
pub(crate) const CLAP_STYLES: Styles = Styles::styled()
    .usage(HEADER)
    .header(HEADER)
    .literal(Style::new().bold())
    .invalid(WARNING)
    .error(ERROR)
    .valid(INFO.bold().underline())
    .placeholder(INFO);

fn if_coloured(style: Style) -> Style {
    if use_colours() {
        style
    } else {
        Style::new()
    }
}

/// Style for error messages
#[must_use]
pub fn error() -> Style {
    if_coloured(ERROR)
}

/// Style for warnings
#[must_use]
pub fn warning() -> Style {
    if_coloured(WARNING)
}

/// Style for highlighting names and values
#[must_use]
pub fn info() -> Style {
    if_coloured(INFO)
}

/// Are we configured to use terminal colours?
#[must_use]
pub fn use_colours() -> bool {
    console::colors_enabled()
}

/// Decides the colour mode following <https://bixense.com/clicolors/> and <https://no-color.org/>.
///
/// `NO_COLOR` beats `CLICOLOR_FORCE`, which beats `CLICOLOR=0`; otherwise colour follows
/// whether stderr is a terminal.
fn colour_wanted(
    no_color: Option<&str>,
    clicolor_force: Option<&str>,
    clicolor: Option<&str>,
    is_terminal: bool,
) -> bool {
    let set = |v: Option<&str>| v.is_some_and(|s| !s.is_empty() && s != "0");
    if no_color.is_some_and(|s| !s.is_empty()) {
        false
    } else if set(clicolor_force) {
        true
    } else if clicolor == Some("0") {
        false
    } else {
        is_terminal
    }
}

/// Sets the process-wide colour mode from the environment.
pub(crate) fn configure_colours() {
    let var = |key| std::env::var(key).ok();
    let state = colour_wanted(
        var("NO_COLOR").as_deref(),
        var("CLICOLOR_FORCE").as_deref(),
        var("CLICOLOR").as_deref(),
        std::io::stderr().is_terminal(),
    );
    console::set_colors_enabled(state);
    console::set_colors_enabled_stderr(state);
    if state {
        ColorChoice::Always
    } else {
        ColorChoice::Never
    }
    .write_global();
}

/// Removes ANSI styling from a string if colours are disabled
pub(crate) fn maybe_strip_color(s: &str) -> Cow<'_, str> {
    if use_colours() {
        s.into()
    } else {
        console::strip_ansi_codes(s)
    }
}
