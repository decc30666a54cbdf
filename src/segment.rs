//! Sentence-boundary segmentation for streamed replies
//!
//! Splits the growing reply text into sentences that are complete enough to
//! hand to speech synthesis while the rest of the reply is still streaming.
//!
//! A boundary is either a hard newline, or a run of `.`, `!`, `?` followed by
//! a single whitespace character. Terminators at the very end of the buffer
//! wait for the next chunk, so the same text always produces the same units
//! no matter how the network split it into frames.
//!
//! Abbreviations ("Mr.", "U.S.") and citations are not special-cased.

use std::sync::LazyLock;

use regex::Regex;

/// Whitespace directly before punctuation, e.g. `"word ,"` or `"end ."`
static SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+([,!.?;:])").expect("valid regex"));

/// Split `buffer` into completed sentence units and the unfinished remainder.
///
/// Units keep their terminating punctuation and the single whitespace
/// character that closed them. Concatenating the units and the remainder
/// yields `buffer` unchanged.
#[must_use]
pub fn segment_completed_sentences(buffer: &str) -> (Vec<String>, String) {
    let mut units = Vec::new();
    let mut start = 0;
    let mut chars = buffer.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c == '\n' {
            let end = i + c.len_utf8();
            units.push(buffer[start..end].to_string());
            start = end;
            continue;
        }

        if !is_terminator(c) {
            continue;
        }

        // Swallow the whole terminator run ("...", "?!")
        while chars.next_if(|&(_, next)| is_terminator(next)).is_some() {}

        match chars.peek() {
            Some(&(j, ws)) if ws.is_whitespace() => {
                let end = j + ws.len_utf8();
                chars.next();
                units.push(buffer[start..end].to_string());
                start = end;
            }
            // Run ends the buffer: wait for the next chunk to decide
            None => break,
            // "3.50", "e.g.x": not a boundary
            Some(_) => {}
        }
    }

    (units, buffer[start..].to_string())
}

/// Flush the tail of a finished stream as a final unit, if it has content
#[must_use]
pub fn finish_segment(remainder: &str) -> Option<String> {
    if remainder.trim().is_empty() {
        None
    } else {
        Some(remainder.to_string())
    }
}

/// Remove stray whitespace before punctuation inside a unit
///
/// Streaming backends often emit tokens like `"word"`, `" ."`; the renderer
/// should not pause before the period.
#[must_use]
pub fn tidy_sentence(unit: &str) -> String {
    SPACE_BEFORE_PUNCT.replace_all(unit, "$1").into_owned()
}

const fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}
