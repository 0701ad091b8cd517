//! Helpers for sanitizing data before it enters tracing span attributes or
//! object-storage keys.
//!
//! Source URLs may carry credentials or signed query strings, so span fields
//! only ever see the redacted form.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

static RE_UNSAFE_KEY_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap());
static RE_REPEATED_DASHES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").unwrap());

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Strips userinfo and query string from a URL.
///
/// - `https://user:pw@host/a.pdf?sig=x` → `https://****@host/a.pdf`
/// - `https://host/a.pdf` → `https://host/a.pdf` (no change)
pub fn redact_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);

    if let Some(scheme_end) = without_query.find("://") {
        let after_scheme = &without_query[scheme_end + 3..];
        let authority_end = after_scheme.find('/').unwrap_or(after_scheme.len());
        if let Some(at_pos) = after_scheme[..authority_end].find('@') {
            let scheme = &without_query[..scheme_end + 3];
            let after_at = &after_scheme[at_pos + 1..];
            return format!("{}****@{}", scheme, after_at);
        }
    }

    without_query.to_string()
}

/// Returns a short deterministic hash of a URL for correlating log lines
/// without exposing it.
pub fn hash_url(url: &str) -> String {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Turns a title or filename into a safe object-key filename ending in `.pdf`.
///
/// Spaces and slashes become dashes, anything else outside `[A-Za-z0-9._-]`
/// is collapsed into a dash.
pub fn storage_filename(name: &str) -> String {
    let trimmed = name.trim();
    let base = trimmed
        .strip_suffix(".pdf")
        .or_else(|| trimmed.strip_suffix(".PDF"))
        .unwrap_or(trimmed);

    let replaced = base.replace([' ', '/', '\\'], "-");
    let cleaned = RE_UNSAFE_KEY_CHARS.replace_all(&replaced, "-");
    let collapsed = RE_REPEATED_DASHES.replace_all(&cleaned, "-");
    let stem = collapsed.trim_matches(|c: char| c == '-' || c == '.');

    if stem.is_empty() {
        "document.pdf".to_string()
    } else {
        format!("{}.pdf", stem)
    }
}
