//! Processor registry: ordered first-match dispatch and the read policy.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::channels::Notifier;
use crate::channels::email_types::Message;
use crate::config::EmailConfig;
use crate::pipeline::processor::Processor;
use crate::pipeline::types::{BatchOutcome, DispatchOutcome};

/// Processors whose successful runs flag the source message as seen.
/// Everything else stays unread so the original mail remains visible.
pub const DEFAULT_MARK_READ_PROCESSORS: &[&str] = &["cloudflare", "perplexity"];

/// Case-insensitive allowlist of processor names that may mark read.
#[derive(Debug, Clone)]
pub struct ReadPolicy {
    allowed: HashSet<String>,
}

impl ReadPolicy {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: names
                .into_iter()
                .map(|n| n.as_ref().trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    pub fn allows(&self, processor: &str) -> bool {
        self.allowed.contains(&processor.to_lowercase())
    }
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MARK_READ_PROCESSORS)
    }
}

/// Ordered processor list. Read-only after construction.
#[derive(Debug)]
pub struct ProcessorRegistry {
    processors: Vec<Processor>,
    read_policy: ReadPolicy,
}

impl ProcessorRegistry {
    pub fn new(processors: Vec<Processor>, read_policy: ReadPolicy) -> Self {
        Self {
            processors,
            read_policy,
        }
    }

    /// Build one processor per configured service, in configuration order.
    pub fn from_config(config: &EmailConfig, notifier: Arc<dyn Notifier>) -> Self {
        let processors: Vec<Processor> = config
            .services
            .iter()
            .map(|service| {
                info!(
                    processor = %service.name,
                    from = %service.config.email_from,
                    subjects = ?service.config.email_subject,
                    "Registered email processor"
                );
                Processor::new(service, notifier.clone())
            })
            .collect();

        let read_policy = match &config.mark_read_processors {
            Some(names) => ReadPolicy::new(names),
            None => ReadPolicy::default(),
        };

        Self::new(processors, read_policy)
    }

    pub fn processors(&self) -> &[Processor] {
        &self.processors
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn read_policy(&self) -> &ReadPolicy {
        &self.read_policy
    }

    /// First processor in configuration order that accepts the message.
    pub fn dispatch(&self, message: &Message) -> Option<&Processor> {
        self.processors.iter().find(|p| p.should_process(message))
    }

    /// Distinct sender filters for narrowing the unread search.
    ///
    /// `None` when there are no processors or any processor has an empty
    /// sender filter, since that processor could match any sender.
    pub fn sender_filters(&self) -> Option<Vec<String>> {
        if self.processors.is_empty() {
            return None;
        }

        let mut seen = HashSet::new();
        let mut filters = Vec::new();
        for p in &self.processors {
            let filter = p.sender_filter().trim();
            if filter.is_empty() {
                return None;
            }
            if seen.insert(filter) {
                filters.push(filter.to_string());
            }
        }
        Some(filters)
    }

    /// Dispatch and process a single message.
    pub async fn handle(&self, message: &Message) -> DispatchOutcome {
        let Some(processor) = self.dispatch(message) else {
            info!(
                uid = message.uid,
                subject = %message.subject,
                from = %message.from,
                "Email ignored, no processor matched"
            );
            return DispatchOutcome::Ignored;
        };

        match processor.process(message).await {
            Ok(extraction) => DispatchOutcome::Processed {
                processor: processor.name().to_string(),
                extraction,
                mark_read: self.read_policy.allows(processor.name()),
            },
            Err(e) => {
                error!(
                    processor = %processor.name(),
                    uid = message.uid,
                    subject = %message.subject,
                    error = %e,
                    "Failed to process email"
                );
                DispatchOutcome::Failed {
                    processor: processor.name().to_string(),
                    error: e,
                }
            }
        }
    }

    /// Process every message on its own task and wait for all of them.
    ///
    /// Returns one outcome per input message, in input order. Messages whose
    /// task starts after shutdown was signalled come back `Aborted`. The
    /// mailbox is never touched; callers act on `BatchOutcome::mark_read`.
    pub async fn process_batch(
        self: &Arc<Self>,
        messages: Vec<Message>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<BatchOutcome> {
        let uids: Vec<u32> = messages.iter().map(|m| m.uid).collect();
        let mut slots: Vec<Option<DispatchOutcome>> = uids.iter().map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (index, message) in messages.into_iter().enumerate() {
            let registry = Arc::clone(self);
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                if *shutdown.borrow() {
                    return (index, DispatchOutcome::Aborted);
                }
                (index, registry.handle(&message).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => error!(error = %e, "Batch processing task failed"),
            }
        }

        let outcomes: Vec<BatchOutcome> = uids
            .into_iter()
            .zip(slots)
            .map(|(uid, slot)| BatchOutcome {
                uid,
                outcome: slot.unwrap_or(DispatchOutcome::Aborted),
            })
            .collect();

        let failed = outcomes
            .iter()
            .filter(|o| matches!(o.outcome, DispatchOutcome::Failed { .. }))
            .count();
        if failed > 0 {
            warn!(total = outcomes.len(), failed, "Batch finished with failures");
        } else {
            info!(total = outcomes.len(), "Batch finished");
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessorConfig, ServiceConfig};
    use crate::pipeline::extractor::Extraction;
    use crate::testing::RecordingNotifier;

    fn service(name: &str, from: &str, subject: &str, chat: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.into(),
            config: ProcessorConfig {
                email_from: from.into(),
                email_subject: vec![subject.into()],
                telegram_chat_id: chat.into(),
                telegram_message: format!("{name}: %s"),
                ..ProcessorConfig::default()
            },
        }
    }

    fn email_config(services: Vec<ServiceConfig>) -> EmailConfig {
        EmailConfig {
            services,
            ..EmailConfig::default()
        }
    }

    fn registry(services: Vec<ServiceConfig>, notifier: Arc<RecordingNotifier>) -> ProcessorRegistry {
        ProcessorRegistry::from_config(&email_config(services), notifier)
    }

    fn cloudflare_message(uid: u32) -> Message {
        Message::new(
            uid,
            "noreply@notify.cloudflare.com",
            "yourdomain.com code",
            "Your code is 482913",
        )
    }

    // ── Read policy ─────────────────────────────────────────────────

    #[test]
    fn default_read_policy_is_the_fixed_allowlist() {
        let policy = ReadPolicy::default();
        assert!(policy.allows("cloudflare"));
        assert!(policy.allows("Perplexity"));
        assert!(!policy.allows("github"));
    }

    #[test]
    fn configured_read_policy_replaces_default() {
        let mut cfg = email_config(vec![]);
        cfg.mark_read_processors = Some(vec!["GitHub".into()]);
        let reg = ProcessorRegistry::from_config(&cfg, Arc::new(RecordingNotifier::default()));
        assert!(reg.read_policy().allows("github"));
        assert!(!reg.read_policy().allows("cloudflare"));
    }

    // ── Dispatch ────────────────────────────────────────────────────

    #[test]
    fn dispatch_is_first_match() {
        let reg = registry(
            vec![
                service("cloudflare", "cloudflare.com", "code", "1"),
                service("catchall", "cloudflare.com", "yourdomain", "2"),
            ],
            Arc::new(RecordingNotifier::default()),
        );
        let p = reg.dispatch(&cloudflare_message(1)).unwrap();
        assert_eq!(p.name(), "cloudflare");
    }

    #[test]
    fn dispatch_none_when_nothing_matches() {
        let reg = registry(
            vec![service("cloudflare", "cloudflare.com", "code", "1")],
            Arc::new(RecordingNotifier::default()),
        );
        let msg = Message::new(1, "someoneelse@example.com", "yourdomain.com code", "");
        assert!(reg.dispatch(&msg).is_none());
    }

    #[tokio::test]
    async fn handle_only_invokes_first_matching_processor() {
        let notifier = Arc::new(RecordingNotifier::default());
        let reg = registry(
            vec![
                service("cloudflare", "cloudflare.com", "code", "1"),
                service("catchall", "cloudflare.com", "yourdomain", "2"),
            ],
            notifier.clone(),
        );

        let outcome = reg.handle(&cloudflare_message(1)).await;
        assert!(outcome.should_mark_read());
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "1");
    }

    #[tokio::test]
    async fn handle_success_outside_allowlist_keeps_unread() {
        let notifier = Arc::new(RecordingNotifier::default());
        let reg = registry(
            vec![service("github", "github.com", "verification", "9")],
            notifier.clone(),
        );
        let msg = Message::new(1, "noreply@github.com", "Your verification code", "H: x\n\nab12cd is your code");

        match reg.handle(&msg).await {
            DispatchOutcome::Processed {
                processor,
                mark_read,
                extraction,
            } => {
                assert_eq!(processor, "github");
                assert!(!mark_read);
                assert_eq!(extraction, Extraction::Found("ab12cd".into()));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn handle_failure_is_reported() {
        let reg = registry(
            vec![service("cloudflare", "cloudflare.com", "code", "1")],
            Arc::new(RecordingNotifier::failing()),
        );
        let outcome = reg.handle(&cloudflare_message(1)).await;
        assert_eq!(outcome.label(), "failed");
        assert!(!outcome.should_mark_read());
    }

    // ── Sender filters ──────────────────────────────────────────────

    #[test]
    fn sender_filters_are_deduplicated_in_order() {
        let reg = registry(
            vec![
                service("a", "x.com", "s", "1"),
                service("b", "y.com", "s", "1"),
                service("c", "x.com", "t", "1"),
            ],
            Arc::new(RecordingNotifier::default()),
        );
        assert_eq!(
            reg.sender_filters(),
            Some(vec!["x.com".to_string(), "y.com".to_string()])
        );
    }

    #[test]
    fn any_empty_sender_filter_disables_narrowing() {
        let reg = registry(
            vec![service("a", "x.com", "s", "1"), service("b", "", "s", "1")],
            Arc::new(RecordingNotifier::default()),
        );
        assert_eq!(reg.sender_filters(), None);
    }

    #[test]
    fn no_processors_means_no_filters() {
        let reg = registry(vec![], Arc::new(RecordingNotifier::default()));
        assert!(reg.is_empty());
        assert_eq!(reg.sender_filters(), None);
    }

    // ── Batch ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn batch_returns_outcomes_in_input_order() {
        let notifier = Arc::new(RecordingNotifier::default());
        let reg = Arc::new(registry(
            vec![service("cloudflare", "cloudflare.com", "code", "1")],
            notifier.clone(),
        ));
        let (_tx, rx) = watch::channel(false);

        let messages = vec![
            cloudflare_message(10),
            Message::new(11, "x@example.com", "hello", ""),
            cloudflare_message(12),
        ];
        let outcomes = reg.process_batch(messages, rx).await;

        let uids: Vec<u32> = outcomes.iter().map(|o| o.uid).collect();
        assert_eq!(uids, vec![10, 11, 12]);
        assert!(outcomes[0].mark_read());
        assert_eq!(outcomes[1].outcome.label(), "ignored");
        assert!(outcomes[2].mark_read());
        assert_eq!(notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn batch_after_shutdown_processes_nothing() {
        let notifier = Arc::new(RecordingNotifier::default());
        let reg = Arc::new(registry(
            vec![service("cloudflare", "cloudflare.com", "code", "1")],
            notifier.clone(),
        ));
        let (_tx, rx) = watch::channel(true);

        let outcomes = reg.process_batch(vec![cloudflare_message(1)], rx).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].outcome.label(), "aborted");
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_empty() {
        let reg = Arc::new(registry(vec![], Arc::new(RecordingNotifier::default())));
        let (_tx, rx) = watch::channel(false);
        assert!(reg.process_batch(vec![], rx).await.is_empty());
    }
}
