//! Progress bar styling
// (c) 2024 Ross Younger

use indicatif::ProgressStyle;

/// Maximum update frequency we will use for the progress display
pub(crate) const MAX_UPDATE_FPS: u8 = 20;

/// Responses carry no length, so the display shows a running total and rate rather than a bar.
///
/// ```text
/// ⠙ Fetching 3 of 10 [4 active] 123.4 MB @ 45.6 MB/s (2s)
/// ```
const PROGRESS_TEMPLATE: &str =
    "{spinner} {wide_msg} {decimal_bytes:.cyan} @ {decimal_bytes_per_sec} ({elapsed})";

/// Indicatif style for the client's progress line
pub(crate) fn progress_style() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::with_template(PROGRESS_TEMPLATE)?)
}

#[cfg(test)]
mod tests {
    #[test]
    fn template_parses() {
        let _ = super::progress_style().unwrap();
    }
}
