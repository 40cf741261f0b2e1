//! Mailbox session: IMAP over TLS, one authenticated session per tick.
//!
//! The ingestion loop only talks to the `MailboxConnector` / `MailboxSession`
//! traits. `ImapConnector` is the production implementation on `async-imap`
//! with rustls and the webpki root store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_imap::types::Fetch;
use async_trait::async_trait;
use futures::StreamExt;
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

use crate::channels::email_types::{Message, address_from_parts, decode_header_value};
use crate::config::EmailConfig;
use crate::error::{ConfigError, MailboxError, SessionStage};

/// Folder every session selects.
pub const INBOX: &str = "INBOX";

/// Envelope, flags and the text section. `BODY.PEEK` leaves `\Seen` alone.
const FETCH_QUERY: &str = "(UID FLAGS ENVELOPE BODY.PEEK[TEXT])";

const SEEN_FLAG_QUERY: &str = "+FLAGS (\\Seen)";

/// Upper bound for TCP connect + TLS handshake + greeting.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ── Traits ──────────────────────────────────────────────────────────

/// Opens a fresh session that is connected, authenticated and has INBOX
/// selected.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// One selected-folder session. Owned by a single tick.
#[async_trait]
pub trait MailboxSession: Send {
    /// UIDs of unread messages, optionally narrowed to a sender substring.
    async fn search_unseen(&mut self, sender: Option<&str>) -> Result<Vec<u32>, MailboxError>;

    /// Stream the given messages into `sink` as they arrive.
    /// Returns how many messages were handed over.
    async fn fetch(
        &mut self,
        uids: &[u32],
        sink: mpsc::Sender<Message>,
    ) -> Result<usize, MailboxError>;

    /// Add `\Seen` to the given messages.
    async fn mark_seen(&mut self, uids: &[u32]) -> Result<(), MailboxError>;

    async fn logout(&mut self) -> Result<(), MailboxError>;
}

// ── IMAP implementation ─────────────────────────────────────────────

type ImapStream = TlsStream<TcpStream>;

/// Connection settings for the production IMAP mailbox.
pub struct ImapConnector {
    host: String,
    port: u16,
    username: String,
    password: SecretString,
}

impl ImapConnector {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password,
        }
    }

    /// Build from the `email` section. Requires host, username and password.
    pub fn from_config(config: &EmailConfig) -> Result<Self, ConfigError> {
        if !config.is_enabled() {
            return Err(ConfigError::MissingRequired {
                key: "email.host".into(),
                hint: "Set it in the config file or via AUTOMATION_EMAIL_HOST.".into(),
            });
        }
        if config.username.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "email.username".into(),
                hint: "Set it in the config file or via AUTOMATION_EMAIL_USERNAME.".into(),
            });
        }
        let Some(password) = &config.password else {
            return Err(ConfigError::MissingRequired {
                key: "email.password".into(),
                hint: "Set it in the config file or via AUTOMATION_EMAIL_PASSWORD.".into(),
            });
        };

        Ok(Self::new(
            config.host.trim(),
            config.port,
            config.username.trim(),
            SecretString::from(password.expose_secret().to_owned()),
        ))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn connect_tls(&self) -> Result<ImapStream, MailboxError> {
        let tls = tls_connector()?;
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| MailboxError::new(SessionStage::Connect, e))?;

        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| MailboxError::new(SessionStage::Connect, e))?;

        tls.connect(server_name, tcp)
            .await
            .map_err(|e| MailboxError::new(SessionStage::Connect, format!("TLS handshake: {e}")))
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn open(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        debug!(host = %self.host, port = self.port, "Connecting to IMAP server");

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, self.connect_tls())
            .await
            .map_err(|_| MailboxError::new(SessionStage::Connect, "timed out"))??;

        let client = async_imap::Client::new(stream);
        let mut session = client
            .login(&self.username, self.password.expose_secret())
            .await
            .map_err(|(e, _)| MailboxError::new(SessionStage::Authenticate, e))?;

        if let Err(e) = session.select(INBOX).await {
            // Already authenticated: try to leave cleanly before giving up.
            if let Err(logout_err) = session.logout().await {
                debug!(error = %logout_err, "Logout after failed select also failed");
            }
            return Err(MailboxError::new(SessionStage::SelectFolder, e));
        }

        debug!(host = %self.host, "IMAP session ready");
        Ok(Box::new(ImapSession { session }))
    }
}

/// Authenticated IMAP session with INBOX selected.
pub struct ImapSession {
    session: async_imap::Session<ImapStream>,
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn search_unseen(&mut self, sender: Option<&str>) -> Result<Vec<u32>, MailboxError> {
        let query = search_query(sender);
        let uids = self
            .session
            .uid_search(&query)
            .await
            .map_err(|e| MailboxError::new(SessionStage::Search, e))?;

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        debug!(query = %query, count = uids.len(), "IMAP search complete");
        Ok(uids)
    }

    async fn fetch(
        &mut self,
        uids: &[u32],
        sink: mpsc::Sender<Message>,
    ) -> Result<usize, MailboxError> {
        if uids.is_empty() {
            return Ok(0);
        }

        let stream = self
            .session
            .uid_fetch(uid_set(uids), FETCH_QUERY)
            .await
            .map_err(|e| MailboxError::new(SessionStage::Fetch, e))?;
        let mut stream = std::pin::pin!(stream);

        let mut delivered = 0;
        let mut receiver_open = true;
        while let Some(item) = stream.next().await {
            let fetch = item.map_err(|e| MailboxError::new(SessionStage::Fetch, e))?;
            let Some(message) = message_from_fetch(&fetch) else {
                continue;
            };
            // Keep draining after the consumer is gone so the connection stays usable.
            if receiver_open {
                if sink.send(message).await.is_err() {
                    debug!("Message consumer closed, draining fetch response");
                    receiver_open = false;
                } else {
                    delivered += 1;
                }
            }
        }

        Ok(delivered)
    }

    async fn mark_seen(&mut self, uids: &[u32]) -> Result<(), MailboxError> {
        if uids.is_empty() {
            return Ok(());
        }

        let stream = self
            .session
            .uid_store(uid_set(uids), SEEN_FLAG_QUERY)
            .await
            .map_err(|e| MailboxError::new(SessionStage::Store, e))?;
        let mut stream = std::pin::pin!(stream);

        while let Some(item) = stream.next().await {
            item.map_err(|e| MailboxError::new(SessionStage::Store, e))?;
        }

        info!(count = uids.len(), "Marked emails as read");
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), MailboxError> {
        self.session
            .logout()
            .await
            .map_err(|e| MailboxError::new(SessionStage::Logout, e))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// rustls client on the ring provider with the webpki root store.
fn tls_connector() -> Result<TlsConnector, MailboxError> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config =
        rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| MailboxError::new(SessionStage::Connect, e))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Build a `Message` from a FETCH response. Responses without a UID are skipped.
fn message_from_fetch(fetch: &Fetch) -> Option<Message> {
    let Some(uid) = fetch.uid else {
        warn!(seq = fetch.message, "Fetched message without UID, skipping");
        return None;
    };

    let envelope = fetch.envelope();
    let subject = envelope
        .and_then(|e| e.subject.as_deref())
        .map(decode_header_value)
        .unwrap_or_default();
    let from = envelope
        .and_then(|e| e.from.as_ref())
        .and_then(|addrs| addrs.first())
        .map(|addr| address_from_parts(addr.mailbox.as_deref(), addr.host.as_deref()))
        .unwrap_or_default();
    let text = fetch
        .text()
        .map(|t| String::from_utf8_lossy(t).into_owned())
        .unwrap_or_default();

    Some(Message::new(uid, from, subject, text))
}

/// `UNSEEN` or `UNSEEN FROM "<sender>"`.
pub fn search_query(sender: Option<&str>) -> String {
    match sender.map(str::trim).filter(|s| !s.is_empty()) {
        Some(sender) => format!("UNSEEN FROM {}", imap_quote(sender)),
        None => "UNSEEN".to_string(),
    }
}

/// IMAP quoted string with `\` and `"` escaped.
pub fn imap_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '\\' || c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Comma-separated UID set, sorted and deduplicated.
pub fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
