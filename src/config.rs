//! Configuration types.
//!
//! The hub is configured from a single YAML document (server address, mailbox
//! credentials, processor definitions, webhook definitions), with a handful of
//! `AUTOMATION_*` environment variables taking precedence for deployment
//! secrets. The document is read once at startup; there is no hot reload.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Poll period used when `email.polling_interval` is missing or zero.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// IMAPS port.
pub const DEFAULT_IMAP_PORT: u16 = 993;

pub const DEFAULT_SERVER_ADDRESS: &str = "0.0.0.0:8080";

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

pub const DEFAULT_SEND_ATTEMPTS: u32 = 3;

pub const DEFAULT_RETRY_BASE_MS: u64 = 1000;

/// Env var naming an explicit config file path.
pub const CONFIG_PATH_ENV: &str = "AUTOMATION_CONFIG";

const CONFIG_SEARCH_DIRS: &[&str] = &["/app/configs", "./configs", "/app", "."];
const CONFIG_FILE_NAMES: &[&str] = &["config.yaml", "config.yml"];

/// Root configuration document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub server: ServerConfig,
    pub email: EmailConfig,
    pub telegram: TelegramConfig,
    pub hook: Vec<WebhookConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the webhook server. Accepts `":8080"` shorthand.
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_SERVER_ADDRESS.to_string(),
        }
    }
}

/// Mailbox connection settings plus the ordered processor definitions.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    /// IMAP host. Empty disables mailbox polling.
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<SecretString>,
    /// Seconds between ticks.
    pub polling_interval: u64,
    /// Processors allowed to mark their source message read after success.
    /// `None` means the built-in allowlist.
    pub mark_read_processors: Option<Vec<String>>,
    /// Processor definitions, in dispatch order.
    pub services: Vec<ServiceConfig>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_IMAP_PORT,
            username: String::new(),
            password: None,
            polling_interval: DEFAULT_POLL_INTERVAL_SECS,
            mark_read_processors: None,
            services: Vec::new(),
        }
    }
}

impl EmailConfig {
    pub fn is_enabled(&self) -> bool {
        !self.host.trim().is_empty()
    }

    pub fn poll_interval(&self) -> Duration {
        if self.polling_interval == 0 {
            Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)
        } else {
            Duration::from_secs(self.polling_interval)
        }
    }
}

/// One named processor definition.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub config: ProcessorConfig,
}

/// Match filters, notification template and extraction overrides for a processor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Substring that must appear in the sender address.
    pub email_from: String,
    /// At least one of these must appear in the subject.
    #[serde(deserialize_with = "one_or_many")]
    pub email_subject: Vec<String>,
    pub telegram_chat_id: String,
    /// Notification text; `%s` receives the extracted code.
    pub telegram_message: String,
    /// Custom extraction regex. Invalid patterns fall back to the defaults.
    pub code_pattern: Option<String>,
    /// Anchor phrases; when non-empty the code is only searched after one of them.
    pub code_markers: Vec<String>,
    /// Whether to drop the leading header block before matching.
    pub strip_headers: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<SecretString>,
    pub api_base: String,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
            max_attempts: DEFAULT_SEND_ATTEMPTS,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
        }
    }
}

/// One inbound webhook route.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub config: WebhookProcessorConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookProcessorConfig {
    pub telegram_chat_id: String,
    /// Notification text; `%s` placeholders receive the payload name and path.
    pub telegram_message: String,
}

/// Accept either `email_subject: "x"` or `email_subject: ["x", "y"]`.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl HubConfig {
    /// Locate, parse, override from the environment, and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let path = locate_config(explicit)?;
        tracing::info!(path = %path.display(), "Loading configuration");

        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Parse a YAML document. Does not validate.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply `AUTOMATION_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("AUTOMATION_SERVER_ADDRESS") {
            self.server.address = address;
        }
        if let Some(host) = lookup("AUTOMATION_EMAIL_HOST") {
            self.email.host = host;
        }
        if let Some(port) = lookup("AUTOMATION_EMAIL_PORT") {
            self.email.port = port.parse().map_err(|e| ConfigError::InvalidValue {
                key: "AUTOMATION_EMAIL_PORT".into(),
                message: format!("{e}"),
            })?;
        }
        if let Some(username) = lookup("AUTOMATION_EMAIL_USERNAME") {
            self.email.username = username;
        }
        if let Some(password) = lookup("AUTOMATION_EMAIL_PASSWORD") {
            self.email.password = Some(SecretString::from(password));
        }
        if let Some(interval) = lookup("AUTOMATION_EMAIL_POLLING_INTERVAL") {
            self.email.polling_interval =
                interval.parse().map_err(|e| ConfigError::InvalidValue {
                    key: "AUTOMATION_EMAIL_POLLING_INTERVAL".into(),
                    message: format!("{e}"),
                })?;
        }
        if let Some(token) =
            lookup("AUTOMATION_TELEGRAM_BOT_TOKEN").or_else(|| lookup("TELEGRAM_BOT_TOKEN"))
        {
            self.telegram.bot_token = Some(SecretString::from(token));
        }
        Ok(())
    }

    /// Normalize shorthand values and reject documents the hub cannot run with.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.server.address = normalize_listen_address(&self.server.address);

        let mut names = HashSet::new();
        for service in &self.email.services {
            let name = service.name.trim().to_lowercase();
            if name.is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: "email.services[].name".into(),
                    hint: "Every processor needs a name.".into(),
                });
            }
            if !names.insert(name) {
                return Err(ConfigError::InvalidValue {
                    key: "email.services".into(),
                    message: format!("duplicate processor name {:?}", service.name),
                });
            }
            if service.config.email_subject.iter().all(|s| s.is_empty()) {
                return Err(ConfigError::MissingRequired {
                    key: format!("email.services.{}.config.email_subject", service.name),
                    hint: "A processor without subject filters can never match.".into(),
                });
            }
        }

        let mut paths = HashSet::new();
        for hook in &self.hook {
            if !hook.path.starts_with('/') {
                return Err(ConfigError::InvalidValue {
                    key: format!("hook.{}.path", hook.name),
                    message: format!("{:?} must start with '/'", hook.path),
                });
            }
            if let Some(problem) = route_path_problem(&hook.path) {
                return Err(ConfigError::InvalidValue {
                    key: format!("hook.{}.path", hook.name),
                    message: format!("{:?} {problem}", hook.path),
                });
            }
            if hook.path == "/health" {
                return Err(ConfigError::InvalidValue {
                    key: format!("hook.{}.path", hook.name),
                    message: "\"/health\" is reserved".into(),
                });
            }
            if !paths.insert(hook.path.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: "hook".into(),
                    message: format!("duplicate webhook path {:?}", hook.path),
                });
            }
        }

        let needs_telegram = !self.email.services.is_empty() || !self.hook.is_empty();
        if needs_telegram && self.telegram.bot_token.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "telegram.bot_token".into(),
                hint: "Set it in the config file or via AUTOMATION_TELEGRAM_BOT_TOKEN.".into(),
            });
        }

        if self.telegram.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "telegram.max_attempts".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Resolve the config file: an explicit path wins, otherwise the first
/// `config.yaml`/`config.yml` in the search directories.
pub fn locate_config(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return if path.is_file() {
            Ok(path)
        } else {
            Err(ConfigError::NotFound {
                searched: path.display().to_string(),
            })
        };
    }

    let candidates: Vec<PathBuf> = CONFIG_SEARCH_DIRS
        .iter()
        .flat_map(|dir| CONFIG_FILE_NAMES.iter().map(move |f| Path::new(dir).join(f)))
        .collect();

    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or_else(|| ConfigError::NotFound {
            searched: candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
}

/// Why a webhook path cannot be registered as a literal route, if it can't.
/// Route parameters and wildcards are not supported.
fn route_path_problem(path: &str) -> Option<&'static str> {
    if path.contains(['{', '}']) {
        return Some("must not contain '{' or '}'");
    }
    if path.contains('*') {
        return Some("must not contain '*'");
    }
    if path.split('/').any(|segment| segment.starts_with(':')) {
        return Some("segments must not start with ':'");
    }
    None
}

/// `":8080"` (Go style) binds all interfaces.
fn normalize_listen_address(address: &str) -> String {
    let address = address.trim();
    if address.is_empty() {
        DEFAULT_SERVER_ADDRESS.to_string()
    } else if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}
