//! Prompt template substitution for iterative loops.
//!
//! `{{previous}}` (whitespace inside the braces allowed) is replaced with the
//! prior iteration's output. This is the only place that knows the syntax.

use regex::{NoExpand, Regex};
use std::sync::LazyLock;

static PREVIOUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*previous\s*\}\}").unwrap());

/// Substitute `{{previous}}` in `template`.
///
/// With no previous output (the first iteration) the placeholder is removed.
/// The output is inserted literally; `$` in it is not treated as a group
/// reference.
pub fn substitute_previous(template: &str, previous: Option<&str>) -> String {
    PREVIOUS_RE
        .replace_all(template, NoExpand(previous.unwrap_or("")))
        .into_owned()
}

/// Whether `template` mentions `{{previous}}`.
pub fn has_previous(template: &str) -> bool {
    PREVIOUS_RE.is_match(template)
}
