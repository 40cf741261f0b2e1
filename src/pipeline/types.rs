//! Shared types for the processing pipeline.

use crate::error::NotifyError;
use crate::pipeline::extractor::Extraction;

// ── Dispatch outcome ────────────────────────────────────────────────

/// What happened to one message handed to the registry.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// No processor matched; the message is left untouched.
    Ignored,
    /// A processor handled the message and the notification was delivered.
    Processed {
        processor: String,
        extraction: Extraction,
        /// Whether the read-policy allows flagging the message as seen.
        mark_read: bool,
    },
    /// The matching processor failed to deliver its notification.
    Failed {
        processor: String,
        error: NotifyError,
    },
    /// Not processed: shutdown was requested first, or the task died.
    Aborted,
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Processed { .. } => "processed",
            Self::Failed { .. } => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Only successful processing by an allowlisted processor marks read.
    pub fn should_mark_read(&self) -> bool {
        matches!(
            self,
            Self::Processed {
                mark_read: true,
                ..
            }
        )
    }

    /// Name of the processor that handled the message, if any.
    pub fn processor(&self) -> Option<&str> {
        match self {
            Self::Processed { processor, .. } | Self::Failed { processor, .. } => Some(processor),
            Self::Ignored | Self::Aborted => None,
        }
    }
}

// ── Batch outcome ───────────────────────────────────────────────────

/// Per-message result of `ProcessorRegistry::process_batch`.
#[derive(Debug)]
pub struct BatchOutcome {
    pub uid: u32,
    pub outcome: DispatchOutcome,
}

impl BatchOutcome {
    pub fn mark_read(&self) -> bool {
        self.outcome.should_mark_read()
    }
}
