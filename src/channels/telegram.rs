//! Telegram notifier — delivers notifications through the Bot API.
//!
//! One `sendMessage` call per chunk, Markdown first with a plain-text
//! fallback, and bounded exponential-backoff retries for transient failures.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{error, info, warn};

use crate::channels::Notifier;
use crate::config::TelegramConfig;
use crate::error::{ConfigError, NotifyError};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How many times a chunk is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay after the given (1-based) failed attempt: base, 2×base, 4×base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

impl From<&TelegramConfig> for RetryPolicy {
    fn from(config: &TelegramConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_ms),
        }
    }
}

/// Telegram Bot API notifier.
pub struct TelegramNotifier {
    bot_token: SecretString,
    api_base: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            api_base: crate::config::DEFAULT_TELEGRAM_API_BASE.to_string(),
            retry: RetryPolicy::default(),
            client: reqwest::Client::new(),
        }
    }

    /// Build from the `telegram` config section.
    pub fn from_config(config: &TelegramConfig) -> Result<Self, ConfigError> {
        let token = config
            .bot_token
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "telegram.bot_token".into(),
                hint: "Set it in the config file or via AUTOMATION_TELEGRAM_BOT_TOKEN.".into(),
            })?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "telegram".into(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            bot_token: SecretString::from(token.expose_secret().to_owned()),
            api_base: config.api_base.clone(),
            retry: RetryPolicy::from(config),
            client,
        })
    }

    /// Point the notifier at a different Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base.trim_end_matches('/'),
            self.bot_token.expose_secret()
        )
    }

    /// Send one chunk, retrying transient failures with exponential backoff.
    async fn send_with_retry(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match self.send_message_chunk(chat_id, text).await {
                Ok(()) => {
                    info!(chat_id, attempt, "Telegram message sent successfully");
                    return Ok(());
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                error!(chat_id, attempt, error = %err, "Telegram rejected the message");
                return Err(err);
            }

            warn!(
                chat_id,
                attempt,
                max_attempts,
                error = %err,
                "Failed to send Telegram message"
            );

            if attempt >= max_attempts {
                error!(
                    chat_id,
                    attempts = max_attempts,
                    error = %err,
                    "Failed to send Telegram message after retries"
                );
                return Err(NotifyError::RetriesExhausted {
                    attempts: max_attempts,
                    last: Box::new(err),
                });
            }

            let backoff = self.retry.backoff(attempt);
            info!(?backoff, "Retrying Telegram message send");
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self.post_send_message(&markdown_body).await?;
        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        let markdown_err = markdown_resp.text().await.unwrap_or_default();
        if markdown_status != reqwest::StatusCode::BAD_REQUEST {
            return Err(NotifyError::Rejected {
                channel: "telegram".into(),
                status: markdown_status.as_u16(),
                body: markdown_err,
            });
        }

        warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self.post_send_message(&plain_body).await?;

        if !plain_resp.status().is_success() {
            let plain_status = plain_resp.status();
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                channel: "telegram".into(),
                status: plain_status.as_u16(),
                body: format!("markdown: {markdown_err}; plain: {plain_err}"),
            });
        }

        Ok(())
    }

    async fn post_send_message(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, NotifyError> {
        self.client
            .post(self.api_url("sendMessage"))
            .json(body)
            .send()
            .await
            // The request URL embeds the bot token.
            .map_err(|e| NotifyError::Transport {
                channel: "telegram".into(),
                reason: e.without_url().to_string(),
            })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn notify(&self, destination: &str, text: &str) -> Result<(), NotifyError> {
        let chat_id = parse_chat_id(destination)?;

        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_with_retry(chat_id, &chunk).await?;
        }
        Ok(())
    }
}

fn parse_chat_id(destination: &str) -> Result<i64, NotifyError> {
    destination
        .trim()
        .parse::<i64>()
        .map_err(|e| NotifyError::InvalidDestination {
            destination: destination.to_string(),
            reason: e.to_string(),
        })
}

/// Split text into chunks of at most `max_len` bytes, preferring newline
/// then space boundaries.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut end = max_len;
        while end > 0 && !remaining.is_char_boundary(end) {
            end -= 1;
        }

        let chunk = &remaining[..end];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            // Don't split at position 0 (infinite loop guard)
            .filter(|&i| i > 0)
            .unwrap_or(end);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> TelegramNotifier {
        TelegramNotifier::new(SecretString::from("123:abc".to_string()))
    }

    #[test]
    fn telegram_notifier_name() {
        assert_eq!(notifier().name(), "telegram");
    }

    #[test]
    fn telegram_api_url() {
        assert_eq!(
            notifier().api_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn telegram_api_url_custom_base_trailing_slash() {
        let n = notifier().with_api_base("http://127.0.0.1:9999/");
        assert_eq!(
            n.api_url("sendMessage"),
            "http://127.0.0.1:9999/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn retry_policy_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn retry_policy_from_config() {
        let config = TelegramConfig {
            max_attempts: 5,
            retry_base_ms: 250,
            ..TelegramConfig::default()
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
    }

    #[test]
    fn from_config_requires_token() {
        let config = TelegramConfig::default();
        assert!(TelegramNotifier::from_config(&config).is_err());
    }

    #[test]
    fn chat_id_parsing() {
        assert_eq!(parse_chat_id("123456").unwrap(), 123456);
        assert_eq!(parse_chat_id("-1001234567890").unwrap(), -1001234567890);
        assert!(matches!(
            parse_chat_id("@channel"),
            Err(NotifyError::InvalidDestination { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_chat_id_fails_without_request() {
        let n = notifier().with_api_base("http://127.0.0.1:1");
        let err = n.notify("not-a-number", "hello").await.unwrap_err();
        assert!(matches!(err, NotifyError::InvalidDestination { .. }));
    }

    // ── split_message ───────────────────────────────────────────────

    #[test]
    fn split_message_short() {
        let chunks = split_message("Hello", 4096);
        assert_eq!(chunks, vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(4096);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4096);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(2000));
        assert_eq!(chunks[1], "b".repeat(3000));
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        // 4-byte emoji straddling the limit must not be cut in half.
        let msg = format!("{}{}", "a".repeat(4094), "📥".repeat(3));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(4094));
        assert_eq!(chunks[1], "📥".repeat(3));
    }
}
