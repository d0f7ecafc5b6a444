//! Newsletter configuration.
//!
//! Loaded from a TOML file, then overridden from `NEWSLETTER_*` environment
//! variables. Body and entry HTML fall back to the template files in
//! `paths.templates_dir` when left empty; unreadable templates leave the value
//! empty and only log a warning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::mailer::{ConnectOptions, Credentials, OutboundMessage, SmtpEndpoint};

/// Default SMTP host (ProtonMail submission).
pub const DEFAULT_SMTP_HOST: &str = "smtp.protonmail.ch";

/// Default SMTP port.
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Default per-connection timeout in seconds.
pub const DEFAULT_SMTP_TIMEOUT_SECS: u64 = 30;

/// Default EHLO name.
pub const DEFAULT_HELO_NAME: &str = "localhost";

/// Default sender display name.
pub const DEFAULT_SENDER_NAME: &str = "JellyfinNewsletter@donotreply";

/// Default subject line.
pub const DEFAULT_SUBJECT: &str = "Jellyfin Newsletter";

/// Body template file name inside `templates_dir`.
pub const BODY_TEMPLATE_FILE: &str = "template_modern_body.html";

/// Entry template file name inside `templates_dir`.
pub const ENTRY_TEMPLATE_FILE: &str = "template_modern_entry.html";

/// Complete newsletter configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsletterConfig {
    /// Verbose logging for the binary.
    pub debug_mode: bool,
    pub smtp: SmtpSettings,
    pub email: EmailSettings,
    pub library: LibrarySettings,
    pub paths: PathSettings,
}

/// SMTP server settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// TLS on connect when true, STARTTLS otherwise.
    pub use_ssl: bool,
    pub timeout_secs: u64,
    pub helo_name: String,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_SMTP_HOST.to_string(),
            port: DEFAULT_SMTP_PORT,
            username: String::new(),
            password: String::new(),
            use_ssl: true,
            timeout_secs: DEFAULT_SMTP_TIMEOUT_SECS,
            helo_name: DEFAULT_HELO_NAME.to_string(),
        }
    }
}

impl std::fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("use_ssl", &self.use_ssl)
            .field("timeout_secs", &self.timeout_secs)
            .field("helo_name", &self.helo_name)
            .finish()
    }
}

/// Message content settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
    pub to_addr: String,
    pub sender_name: String,
    pub subject: String,
    /// Final HTML body.
    pub body: String,
    /// HTML fragment for a single library entry. Loaded for content builders;
    /// the job itself sends `body` only.
    pub entry: String,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            to_addr: String::new(),
            sender_name: DEFAULT_SENDER_NAME.to_string(),
            subject: DEFAULT_SUBJECT.to_string(),
            body: String::new(),
            entry: String::new(),
        }
    }
}

/// Which libraries contribute to the newsletter content. Read by content
/// builders, not by the sending job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibrarySettings {
    pub movies_enabled: bool,
    pub series_enabled: bool,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            movies_enabled: true,
            series_enabled: true,
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub templates_dir: Option<PathBuf>,
    /// Archive location for rendered newsletters. Not read by the sending job.
    pub newsletter_dir: Option<PathBuf>,
    /// Archive file name. Not read by the sending job.
    pub newsletter_file_name: Option<String>,
}

impl NewsletterConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from `path`, apply environment overrides and resolve templates.
    ///
    /// A missing file yields the defaults.
    pub async fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();

        let mut config = match fs::read_to_string(path).await {
            Ok(content) => Self::from_toml_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.resolve_templates().await;
        Ok(config)
    }

    /// Apply `NEWSLETTER_*` overrides using `lookup` to read variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(host) = lookup("NEWSLETTER_SMTP_HOST") {
            self.smtp.host = host;
        }
        if let Some(port) = lookup("NEWSLETTER_SMTP_PORT") {
            self.smtp.port = port.parse().map_err(|e| ConfigError::Invalid {
                key: "NEWSLETTER_SMTP_PORT".to_string(),
                reason: format!("{e}"),
            })?;
        }
        if let Some(username) = lookup("NEWSLETTER_SMTP_USERNAME") {
            self.smtp.username = username;
        }
        if let Some(password) = lookup("NEWSLETTER_SMTP_PASSWORD") {
            self.smtp.password = password;
        }
        if let Some(use_ssl) = lookup("NEWSLETTER_SMTP_USE_SSL") {
            self.smtp.use_ssl = parse_bool(&use_ssl).ok_or_else(|| ConfigError::Invalid {
                key: "NEWSLETTER_SMTP_USE_SSL".to_string(),
                reason: format!("expected true/false, got '{use_ssl}'"),
            })?;
        }
        if let Some(to_addr) = lookup("NEWSLETTER_TO_ADDR") {
            self.email.to_addr = to_addr;
        }
        if let Some(subject) = lookup("NEWSLETTER_SUBJECT") {
            self.email.subject = subject;
        }
        Ok(())
    }

    /// Fill empty body/entry HTML from the template directory.
    pub async fn resolve_templates(&mut self) {
        let Some(dir) = self.paths.templates_dir.clone() else {
            return;
        };

        if self.email.body.is_empty() {
            self.email.body = read_template(&dir.join(BODY_TEMPLATE_FILE)).await;
        }
        if self.email.entry.is_empty() {
            self.email.entry = read_template(&dir.join(ENTRY_TEMPLATE_FILE)).await;
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> SmtpEndpoint {
        SmtpEndpoint::new(self.smtp.host.clone(), self.smtp.port, self.smtp.use_ssl)
    }

    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.smtp.username.clone(), self.smtp.password.clone())
    }

    /// The newsletter message; the sender address is the SMTP username.
    #[must_use]
    pub fn message(&self) -> OutboundMessage {
        OutboundMessage {
            sender_name: self.email.sender_name.clone(),
            sender_address: self.smtp.username.clone(),
            recipient: self.email.to_addr.clone(),
            subject: self.email.subject.clone(),
            html_body: self.email.body.clone(),
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.smtp.timeout_secs)
    }

    #[must_use]
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::new(self.timeout(), self.smtp.helo_name.clone())
    }
}

async fn read_template(path: &Path) -> String {
    match fs::read_to_string(path).await {
        Ok(html) => {
            debug!(path = %path.display(), "Loaded template");
            html
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Failed to read template, leaving it empty"
            );
            String::new()
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Where a job reads its configuration from on every run.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> ConfigResult<NewsletterConfig>;
}

#[async_trait]
impl ConfigSource for NewsletterConfig {
    async fn load(&self) -> ConfigResult<NewsletterConfig> {
        Ok(self.clone())
    }
}

/// A TOML file re-read on every run, so edits apply to the next run.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSource for ConfigFile {
    async fn load(&self) -> ConfigResult<NewsletterConfig> {
        NewsletterConfig::from_file(&self.path).await
    }
}
