//! Hub context — the explicitly constructed state shared by every component.

use std::sync::Arc;

use crate::channels::email::ImapConnector;
use crate::channels::telegram::TelegramNotifier;
use crate::channels::Notifier;
use crate::config::HubConfig;
use crate::error::ConfigError;
use crate::pipeline::registry::ProcessorRegistry;

/// Loaded configuration plus the single notifier instance.
///
/// Built once in `main` and handed to the registry, the ingestion loop and
/// the webhook routes, so both notification paths share one delivery policy.
#[derive(Clone)]
pub struct HubContext {
    pub config: Arc<HubConfig>,
    pub notifier: Arc<dyn Notifier>,
}

impl HubContext {
    pub fn new(config: Arc<HubConfig>, notifier: Arc<dyn Notifier>) -> Self {
        Self { config, notifier }
    }

    /// Build the production context with a Telegram notifier.
    pub fn from_config(config: HubConfig) -> Result<Self, ConfigError> {
        let notifier = TelegramNotifier::from_config(&config.telegram)?;
        Ok(Self::new(Arc::new(config), Arc::new(notifier)))
    }

    /// Processors for the configured services, bound to the shared notifier.
    pub fn processor_registry(&self) -> ProcessorRegistry {
        ProcessorRegistry::from_config(&self.config.email, Arc::clone(&self.notifier))
    }

    /// IMAP connector, or `None` when no mailbox host is configured.
    pub fn mailbox_connector(&self) -> Result<Option<ImapConnector>, ConfigError> {
        if !self.config.email.is_enabled() {
            return Ok(None);
        }
        ImapConnector::from_config(&self.config.email).map(Some)
    }
}
