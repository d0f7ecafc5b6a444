//! Scheduled HTML newsletter delivery over SMTP.
//!
//! This crate provides:
//! - A single-attempt SMTP mailer with implicit TLS or STARTTLS
//! - A scheduler-facing job with cancellation, progress reporting and
//!   failure isolation
//! - TOML/env configuration with HTML template fallback
//! - A fixed-interval host for standalone deployments

pub mod config;
pub mod error;
pub mod job;
pub mod mailer;
pub mod scheduler;

// Re-export main types
pub use config::{ConfigFile, ConfigSource, NewsletterConfig};
pub use error::{ConfigError, MailError};
pub use job::{
    LogProgress, NewsletterJob, ProgressSink, RunOutcome, TaskInfo, Trigger, DEFAULT_INTERVAL,
    NEWSLETTER_TASK,
};
pub use mailer::{
    ConnectOptions, Credentials, DeliveryResult, LettreConnector, Mailer, OutboundMessage,
    Security, SmtpConnector, SmtpEndpoint, SmtpSession,
};
pub use scheduler::{IntervalScheduler, SchedulerStats};
