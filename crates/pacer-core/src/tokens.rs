//! Character-based token estimation and preview helpers.
//!
//! The engine never sees real tokenizer output; it guards context size with
//! the conventional chars/4 proxy, rounded up, which overestimates slightly
//! for prose and keeps the guard conservative.

use crate::types::ManagedMessage;

/// Estimate the token footprint of `text` as `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

/// Estimate the token footprint of a full request: instructions plus every
/// message in the window.
pub fn estimate_request_tokens(instructions: &str, messages: &[ManagedMessage]) -> u64 {
    let mut total = estimate_tokens(instructions);
    for message in messages {
        total += estimate_tokens(&message.text);
    }
    total
}

/// Truncate `text` to at most `max_chars` characters, appending `...` when
/// anything was cut. Operates on characters, never mid-codepoint.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Single-line preview: collapse newlines, then truncate. Used for tool
/// argument/result previews in records and condensed context blocks.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.replace(['\n', '\r'], " ");
    truncate_chars(flat.trim(), max_chars)
}
