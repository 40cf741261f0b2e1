//! Code extraction from message bodies.
//!
//! Two strategies:
//! - `Generic`: optionally drop the leading header block, then take the first
//!   match of the processor's resolved pattern.
//! - `MarkerGated`: find an anchor phrase first (case-insensitive, any of
//!   several language variants) and only search the text after it. No marker
//!   means no code, even if something code-shaped appears elsewhere.

use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::ProcessorConfig;
use crate::pipeline::patterns::{PatternSource, resolve_pattern};

/// Sentinel placed into templates when no code could be extracted.
pub const NOT_FOUND_CODE: &str = "Not found";

/// Anchor phrases preceding the code in Perplexity sign-in mails.
pub const PERPLEXITY_MARKERS: &[&str] = &["directly:", "directamente:"];

/// Processor whose body is matched without stripping headers.
const UNSTRIPPED_PROCESSOR: &str = "cloudflare";

/// Processor that uses marker-gated extraction by default.
const MARKER_GATED_PROCESSOR: &str = "perplexity";

static NUMERIC_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{5,6})\b").expect("literal pattern"));

static HYPHENATED_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([a-zA-Z0-9]+-[a-zA-Z0-9]+)\b").expect("literal pattern"));

/// Result of an extraction attempt. Always renders to a usable string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Found(String),
    NotFound,
}

impl Extraction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Found(code) => code,
            Self::NotFound => NOT_FOUND_CODE,
        }
    }

}

impl fmt::Display for Extraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a processor looks for its code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionStrategy {
    Generic,
    MarkerGated { markers: Vec<String> },
}

impl ExtractionStrategy {
    /// Configured markers win; otherwise the built-in tag for the name.
    pub fn for_processor(name: &str, config: &ProcessorConfig) -> Self {
        let markers: Vec<String> = config
            .code_markers
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();

        if !markers.is_empty() {
            Self::MarkerGated { markers }
        } else if name.eq_ignore_ascii_case(MARKER_GATED_PROCESSOR) {
            Self::MarkerGated {
                markers: PERPLEXITY_MARKERS.iter().map(|m| m.to_string()).collect(),
            }
        } else {
            Self::Generic
        }
    }
}

/// Per-processor extractor: one resolved pattern, one strategy.
#[derive(Debug, Clone)]
pub struct CodeExtractor {
    service: String,
    pattern: Regex,
    pattern_source: PatternSource,
    strategy: ExtractionStrategy,
    marker_patterns: Vec<Regex>,
    strip_headers: bool,
}

impl CodeExtractor {
    /// Resolve pattern, strategy and header handling for a configured processor.
    pub fn for_processor(name: &str, config: &ProcessorConfig) -> Self {
        let (pattern, pattern_source) = resolve_pattern(name, config.code_pattern.as_deref());
        let strip_headers = config
            .strip_headers
            .unwrap_or_else(|| !name.eq_ignore_ascii_case(UNSTRIPPED_PROCESSOR));
        let strategy = ExtractionStrategy::for_processor(name, config);
        let marker_patterns = match &strategy {
            ExtractionStrategy::Generic => Vec::new(),
            ExtractionStrategy::MarkerGated { markers } => {
                markers.iter().filter_map(|m| marker_pattern(name, m)).collect()
            }
        };

        Self {
            service: name.to_string(),
            pattern,
            pattern_source,
            strategy,
            marker_patterns,
            strip_headers,
        }
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn pattern_source(&self) -> PatternSource {
        self.pattern_source
    }

    pub fn strategy(&self) -> &ExtractionStrategy {
        &self.strategy
    }

    pub fn strips_headers(&self) -> bool {
        self.strip_headers
    }

    /// Extract a code from already-decoded message text.
    pub fn extract(&self, text: &str) -> Extraction {
        let body = if self.strip_headers {
            strip_headers(text)
        } else {
            text
        };

        match &self.strategy {
            ExtractionStrategy::Generic => self.extract_generic(body),
            ExtractionStrategy::MarkerGated { markers } => self.extract_after_marker(body, markers),
        }
    }

    fn extract_generic(&self, body: &str) -> Extraction {
        if let Some(m) = self.pattern.find(body) {
            info!(service = %self.service, code = %m.as_str(), "Code extracted successfully");
            return Extraction::Found(m.as_str().to_string());
        }

        warn!(
            service = %self.service,
            pattern = %self.pattern,
            text_preview = %truncate(body, 200),
            "Code not found in email"
        );
        Extraction::NotFound
    }

    fn extract_after_marker(&self, body: &str, markers: &[String]) -> Extraction {
        let Some(window) = text_after_marker(body, &self.marker_patterns) else {
            warn!(
                service = %self.service,
                markers = ?markers,
                "No extraction marker found in email"
            );
            return Extraction::NotFound;
        };

        let candidates: [(&str, &Regex, usize); 3] = [
            ("numeric", &NUMERIC_CODE, 1),
            ("hyphenated", &HYPHENATED_CODE, 1),
            ("fallback", &self.pattern, 0),
        ];

        for (format, re, group) in candidates {
            if let Some(code) = re
                .captures(window)
                .and_then(|caps| caps.get(group))
                .map(|m| m.as_str().to_string())
            {
                info!(service = %self.service, format, code = %code, "Code extracted after marker");
                return Extraction::Found(code);
            }
        }

        warn!(
            service = %self.service,
            text_preview = %truncate(window, 300),
            "Code not found after marker"
        );
        Extraction::NotFound
    }
}

/// Case-insensitive literal matcher for one marker phrase.
fn marker_pattern(service: &str, marker: &str) -> Option<Regex> {
    match Regex::new(&format!("(?i){}", regex::escape(marker))) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(service = %service, marker = %marker, error = %e, "Unusable extraction marker");
            None
        }
    }
}

/// Text following the first marker found. Markers are tried in order and
/// matched case-insensitively (Unicode-aware).
fn text_after_marker<'a>(body: &'a str, markers: &[Regex]) -> Option<&'a str> {
    markers.iter().find_map(|marker| {
        marker.find(body).map(|m| {
            debug!(marker = %marker, "Extraction marker found");
            &body[m.end()..]
        })
    })
}

/// Drop everything up to and including the first blank line (LF-LF or
/// CRLF-CRLF). Text without a blank line is returned unchanged.
pub fn strip_headers(text: &str) -> &str {
    let lf = text.find("\n\n").map(|i| i + 2);
    let crlf = text.find("\r\n\r\n").map(|i| i + 4);

    let end = match (lf, crlf) {
        (Some(a), Some(b)) => {
            // Whichever blank line starts first.
            if a - 2 < b - 4 { a } else { b }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return text,
    };
    &text[end..]
}

/// Undo quoted-printable transfer encoding. On failure the original text is
/// returned and a warning logged.
pub fn decode_transfer_encoding(text: &str) -> Cow<'_, str> {
    if !text.contains('=') {
        return Cow::Borrowed(text);
    }

    match quoted_printable::decode(text.as_bytes(), quoted_printable::ParseMode::Robust) {
        Ok(bytes) => Cow::Owned(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            warn!(error = %e, "Failed to decode quoted-printable");
            Cow::Borrowed(text)
        }
    }
}

/// Truncate to at most `max` bytes on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> Cow<'_, str> {
    if s.len() <= max {
        return Cow::Borrowed(s);
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}...", &s[..end]))
}
