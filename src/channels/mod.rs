//! I/O boundaries: outbound notifications and the mailbox.

pub mod channel;
pub mod email;
pub mod email_poller;
pub mod email_types;
pub mod telegram;

pub use channel::*;
pub use email::{ImapConnector, MailboxConnector, MailboxSession};
pub use email_poller::{TickReport, poll_once, spawn_email_poller};
pub use email_types::Message;
pub use telegram::{RetryPolicy, TelegramNotifier};
