//! Ingestion loop: one mailbox session per tick.
//!
//! Each tick:
//! 1. Opens a session (connect, login, select INBOX)
//! 2. Searches unread mail, one search per distinct sender filter when every
//!    processor has one, and unions the UIDs
//! 3. Fetches the messages while dispatching the ones already received
//! 4. Flags the allowlisted successes as seen, then logs out
//!
//! Session failures abandon the tick; the next timer fire tries again.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::channels::email::{MailboxConnector, MailboxSession};
use crate::error::MailboxError;
use crate::pipeline::registry::ProcessorRegistry;
use crate::pipeline::types::DispatchOutcome;

/// Messages buffered between the fetch stream and the dispatcher.
const FETCH_BUFFER: usize = 16;

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// UIDs returned by the search union.
    pub found: usize,
    pub processed: usize,
    pub ignored: usize,
    pub failed: usize,
    pub marked_read: usize,
}

impl TickReport {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Processed { .. } => self.processed += 1,
            DispatchOutcome::Ignored => self.ignored += 1,
            DispatchOutcome::Failed { .. } | DispatchOutcome::Aborted => self.failed += 1,
        }
    }
}

/// Spawn the background ingestion loop.
///
/// The first tick fires one `period` after start. Ticks run to completion
/// before the next one is scheduled. Setting `shutdown` to `true` (or
/// dropping its sender) stops the loop and abandons a running tick.
pub fn spawn_email_poller(
    registry: Arc<ProcessorRegistry>,
    connector: Arc<dyn MailboxConnector>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = period.as_secs(),
            processors = registry.processors().len(),
            "Email poller started"
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }

            tokio::select! {
                result = poll_once(&registry, connector.as_ref()) => match result {
                    Ok(report) if report.found > 0 => info!(
                        found = report.found,
                        processed = report.processed,
                        ignored = report.ignored,
                        failed = report.failed,
                        marked_read = report.marked_read,
                        "Email poll complete"
                    ),
                    Ok(_) => debug!("No new emails"),
                    Err(e) => error!(stage = %e.stage, error = %e, "Email poll failed"),
                },
                _ = wait_for_shutdown(&mut shutdown) => {
                    warn!("Shutdown requested during email poll, abandoning tick");
                    break;
                }
            }
        }

        info!("Email poller shutting down");
    })
}

/// Resolves once shutdown is requested or the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Run a single tick against a fresh session.
pub async fn poll_once(
    registry: &ProcessorRegistry,
    connector: &dyn MailboxConnector,
) -> Result<TickReport, MailboxError> {
    let mut session = connector.open().await?;
    let result = run_session(registry, session.as_mut()).await;

    if let Err(e) = session.logout().await {
        warn!(error = %e, "IMAP logout failed");
    }

    result
}

async fn run_session(
    registry: &ProcessorRegistry,
    session: &mut dyn MailboxSession,
) -> Result<TickReport, MailboxError> {
    let uids = search_union(registry, session).await?;
    if uids.is_empty() {
        return Ok(TickReport::default());
    }
    info!(count = uids.len(), "Found unread emails");

    let (tx, mut rx) = mpsc::channel(FETCH_BUFFER);
    let found = uids.len();

    let producer = session.fetch(&uids, tx);
    let consumer = async {
        let mut report = TickReport {
            found,
            ..TickReport::default()
        };
        let mut to_mark = Vec::new();
        while let Some(message) = rx.recv().await {
            let outcome = registry.handle(&message).await;
            report.record(&outcome);
            if outcome.should_mark_read() {
                to_mark.push(message.uid);
            }
        }
        (report, to_mark)
    };

    let (fetched, (mut report, to_mark)) = tokio::join!(producer, consumer);

    // The connection is free again once the fetch stream is done; flag the
    // handled messages even if the stream broke part-way.
    let marked = session.mark_seen(&to_mark).await;
    if let Err(e) = fetched {
        if let Err(mark_err) = &marked {
            warn!(error = %mark_err, "Failed to mark processed emails as read");
        }
        return Err(e);
    }
    marked?;
    report.marked_read = to_mark.len();

    Ok(report)
}

/// Unread UIDs, narrowed per sender when every processor has a sender filter.
async fn search_union(
    registry: &ProcessorRegistry,
    session: &mut dyn MailboxSession,
) -> Result<Vec<u32>, MailboxError> {
    let Some(senders) = registry.sender_filters() else {
        return session.search_unseen(None).await;
    };

    let mut uids = BTreeSet::new();
    for sender in &senders {
        let found = session.search_unseen(Some(sender.as_str())).await?;
        debug!(sender = %sender, count = found.len(), "Searched unread emails");
        uids.extend(found);
    }
    Ok(uids.into_iter().collect())
}
