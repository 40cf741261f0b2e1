//! Email-specific types — the fetched `Message` and envelope helpers.

use mail_parser::MessageParser;

/// A fetched mailbox entry, reduced to what the processors look at.
///
/// Built once per fetched message and discarded at the end of the tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Mailbox UID; stable for the lifetime of the session.
    pub uid: u32,
    /// Decoded subject line.
    pub subject: String,
    /// Sender address (`mailbox@host`) of the first From entry.
    pub from: String,
    /// Raw `BODY[TEXT]` section, possibly still transfer-encoded.
    pub text: String,
}

impl Message {
    pub fn new(
        uid: u32,
        from: impl Into<String>,
        subject: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            uid,
            subject: subject.into(),
            from: from.into(),
            text: text.into(),
        }
    }
}

/// Decode an envelope header value that may carry RFC 2047 encoded words
/// (`=?UTF-8?B?...?=`).
pub fn decode_header_value(raw: &[u8]) -> String {
    let mut block = Vec::with_capacity(raw.len() + 16);
    block.extend_from_slice(b"Subject: ");
    block.extend_from_slice(raw);
    block.extend_from_slice(b"\r\n\r\n");

    MessageParser::default()
        .parse(&block)
        .and_then(|parsed| parsed.subject().map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(raw).trim().to_string())
}

/// Join an envelope address's mailbox and host parts.
pub fn address_from_parts(mailbox: Option<&[u8]>, host: Option<&[u8]>) -> String {
    let mailbox = mailbox.map(String::from_utf8_lossy).unwrap_or_default();
    let host = host.map(String::from_utf8_lossy).unwrap_or_default();
    match (mailbox.is_empty(), host.is_empty()) {
        (true, true) => String::new(),
        (false, true) => mailbox.into_owned(),
        _ => format!("{mailbox}@{host}"),
    }
}
