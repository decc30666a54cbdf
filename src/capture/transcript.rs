//! Final transcript cleanup

use std::sync::LazyLock;

use regex::Regex;

/// Hesitation tokens, with optional elongation and trailing punctuation
static FILLER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(u+m+|u+h+|e+r+m*|h+m+)[,.…]*$").expect("valid regex")
});

/// Drop filler tokens and collapse whitespace
///
/// Works on whole tokens so words like "summary" or "hum" survive.
#[must_use]
pub fn normalize_transcript(text: &str) -> String {
    text.split_whitespace()
        .filter(|token| !FILLER.is_match(token))
        .collect::<Vec<_>>()
        .join(" ")
}
