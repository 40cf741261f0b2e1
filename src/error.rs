//! Error types for the automation hub.

use std::fmt;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No configuration file found (searched: {searched})")]
    NotFound { searched: String },

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The step of a mailbox session that was running when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Connect,
    Authenticate,
    SelectFolder,
    Search,
    Fetch,
    Store,
    Logout,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connect => "connect",
            Self::Authenticate => "authenticate",
            Self::SelectFolder => "select folder",
            Self::Search => "search",
            Self::Fetch => "fetch",
            Self::Store => "store flags",
            Self::Logout => "logout",
        };
        f.write_str(label)
    }
}

/// Mailbox (IMAP) session errors. All of them abandon the current tick.
#[derive(Debug, thiserror::Error)]
#[error("IMAP {stage} failed: {reason}")]
pub struct MailboxError {
    pub stage: SessionStage,
    pub reason: String,
}

impl MailboxError {
    pub fn new(stage: SessionStage, reason: impl fmt::Display) -> Self {
        Self {
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Invalid chat ID {destination:?}: {reason}")]
    InvalidDestination { destination: String, reason: String },

    #[error("Request to {channel} failed: {reason}")]
    Transport { channel: String, reason: String },

    #[error("{channel} rejected the message (HTTP {status}): {body}")]
    Rejected {
        channel: String,
        status: u16,
        body: String,
    },

    #[error("Failed to send message after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<NotifyError>,
    },
}

impl NotifyError {
    /// Whether a later attempt could plausibly succeed.
    ///
    /// Transport failures, rate limiting and server errors are transient;
    /// a bad chat ID or an API rejection of the payload is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidDestination { .. } | Self::RetriesExhausted { .. } => false,
        }
    }
}

/// Inbound webhook errors.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Invalid request body: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Processing failed: {0}")]
    Delivery(#[from] NotifyError),
}
