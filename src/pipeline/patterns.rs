//! Extraction pattern resolution.
//!
//! Each processor gets exactly one compiled pattern at construction:
//! a valid custom pattern, else the built-in default for its name, else the
//! generic 4–8 character alphanumeric token.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

/// Built-in pattern for Cloudflare verification mails (six digits).
pub const CLOUDFLARE_PATTERN: &str = r"\b\d{6}\b";

/// Built-in pattern for Perplexity sign-in mails (numeric or hyphenated).
pub const PERPLEXITY_PATTERN: &str = r"(?:\d{5,6}|[a-zA-Z0-9]+-[a-zA-Z0-9]+)";

/// Fallback for processors without a custom or named pattern.
pub const GENERIC_PATTERN: &str = r"\b[a-zA-Z0-9]{4,8}\b";

/// Where a resolved pattern came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternSource {
    Custom,
    NamedDefault,
    Generic,
}

/// Built-in default for a processor name, if any (case-insensitive).
pub fn named_default(name: &str) -> Option<&'static str> {
    match name.to_lowercase().as_str() {
        "cloudflare" => Some(CLOUDFLARE_PATTERN),
        "perplexity" => Some(PERPLEXITY_PATTERN),
        _ => None,
    }
}

/// Resolve the extraction pattern for a processor.
///
/// A custom pattern that fails to compile is logged and skipped, never
/// surfaced as an error.
pub fn resolve_pattern(name: &str, custom: Option<&str>) -> (Regex, PatternSource) {
    if let Some(custom) = custom.map(str::trim).filter(|p| !p.is_empty()) {
        match Regex::new(custom) {
            Ok(re) => return (re, PatternSource::Custom),
            Err(e) => warn!(
                service = %name,
                pattern = %custom,
                error = %e,
                "Invalid custom code pattern, using default"
            ),
        }
    }

    if let Some(re) = named_default(name).and_then(|p| Regex::new(p).ok()) {
        return (re, PatternSource::NamedDefault);
    }

    (GENERIC.clone(), PatternSource::Generic)
}

static GENERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(GENERIC_PATTERN).expect("literal pattern"));
