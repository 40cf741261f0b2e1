//! Configuration-driven processor: match filter, extractor and template.
//!
//! One concrete type covers every configured service. Behavior differences
//! (pattern, marker gating, header stripping) live in the `CodeExtractor`
//! built at construction, so nothing is re-resolved per message.

use std::sync::Arc;

use tracing::{debug, info};

use crate::channels::Notifier;
use crate::channels::email_types::Message;
use crate::config::{ProcessorConfig, ServiceConfig};
use crate::error::NotifyError;
use crate::pipeline::extractor::{CodeExtractor, Extraction, decode_transfer_encoding};

/// A named processor bound to its resolved extractor and the shared notifier.
pub struct Processor {
    name: String,
    config: ProcessorConfig,
    extractor: CodeExtractor,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("name", &self.name)
            .field("email_from", &self.config.email_from)
            .field("email_subject", &self.config.email_subject)
            .field("notifier", &self.notifier.name())
            .finish_non_exhaustive()
    }
}

impl Processor {
    pub fn new(service: &ServiceConfig, notifier: Arc<dyn Notifier>) -> Self {
        let extractor = CodeExtractor::for_processor(&service.name, &service.config);
        debug!(
            processor = %service.name,
            pattern = %extractor.pattern(),
            source = ?extractor.pattern_source(),
            strategy = ?extractor.strategy(),
            "Resolved extraction pattern"
        );

        Self {
            name: service.name.clone(),
            config: service.config.clone(),
            extractor,
            notifier,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sender substring this processor filters on (may be empty).
    pub fn sender_filter(&self) -> &str {
        &self.config.email_from
    }

    /// Sender contains the configured substring AND the subject contains at
    /// least one configured subject substring. Case-sensitive.
    pub fn should_process(&self, message: &Message) -> bool {
        message.from.contains(self.config.email_from.as_str())
            && self
                .config
                .email_subject
                .iter()
                .any(|s| message.subject.contains(s.as_str()))
    }

    /// Decode, extract, format and notify. Returns the extraction outcome on
    /// successful delivery; delivery errors are passed through unchanged.
    pub async fn process(&self, message: &Message) -> Result<Extraction, NotifyError> {
        info!(
            processor = %self.name,
            uid = message.uid,
            subject = %message.subject,
            from = %message.from,
            "Processing email"
        );

        let text = decode_transfer_encoding(&message.text);
        let code = self.extractor.extract(&text);
        let body = format_template(&self.config.telegram_message, &[code.as_str()]);

        self.notifier
            .notify(&self.config.telegram_chat_id, &body)
            .await?;

        info!(processor = %self.name, uid = message.uid, "Email processed");
        Ok(code)
    }
}

/// Fill `%s` placeholders positionally. `%%` renders a literal `%`,
/// placeholders without an argument render empty and surplus arguments are
/// dropped. Any other `%` is copied through.
pub fn format_template(template: &str, args: &[&str]) -> String {
    let extra: usize = args.iter().map(|a| a.len()).sum();
    let mut out = String::with_capacity(template.len() + extra);
    let mut args = args.iter();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('s') => {
                chars.next();
                if let Some(arg) = args.next() {
                    out.push_str(arg);
                }
            }
            Some('%') => {
                chars.next();
                out.push('%');
            }
            _ => out.push('%'),
        }
    }

    out
}
