//! Scheduled newsletter job.
//!
//! [`NewsletterJob::run`] is the entry point an external scheduler calls. A
//! run moves through three phases:
//!
//! - `Started`: progress 0, cancellation checked once
//! - `Sending`: configuration loaded, one [`Mailer::send`] call
//! - `Finished`: progress 100, on every path
//!
//! Nothing that goes wrong inside a run reaches the caller. Configuration
//! errors, delivery failures and panics are logged and reported through
//! [`RunOutcome`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigSource;
use crate::error::MailError;
use crate::mailer::{LettreConnector, Mailer, SmtpConnector};

/// Default interval between runs: one week.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(168 * 60 * 60);

/// Identity surfaced to schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub key: &'static str,
}

/// Descriptor of the newsletter task.
pub const NEWSLETTER_TASK: TaskInfo = TaskInfo {
    name: "Email Newsletter",
    description: "Email Newsletters",
    category: "Newsletters",
    key: "EmailNewsletters",
};

/// When a scheduler should fire the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Interval(Duration),
}

/// Receives progress percentages (0.0 to 100.0) during a run.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(f64) + Send + Sync,
{
    fn report(&self, percent: f64) {
        self(percent);
    }
}

impl ProgressSink for mpsc::UnboundedSender<f64> {
    fn report(&self, percent: f64) {
        // A dropped receiver just means nobody is watching.
        let _ = self.send(percent);
    }
}

/// Progress sink that writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, percent: f64) {
        debug!(task = NEWSLETTER_TASK.key, percent, "Progress");
    }
}

/// How a run ended. Informational only; a run never fails its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Delivered,
    /// The mailer reported a failed delivery attempt.
    Failed(MailError),
    /// Configuration could not be loaded or the sending phase panicked.
    Faulted(String),
    /// Cancelled before sending started.
    Cancelled,
}

impl RunOutcome {
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Sends the configured newsletter once per run.
pub struct NewsletterJob<C = LettreConnector> {
    config: Arc<dyn ConfigSource>,
    mailer: Mailer<C>,
}

impl NewsletterJob<LettreConnector> {
    /// Job sending through lettre.
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self::with_mailer(config, Mailer::with_connector(LettreConnector::new()))
    }
}

impl<C: SmtpConnector> NewsletterJob<C> {
    pub fn with_mailer(config: Arc<dyn ConfigSource>, mailer: Mailer<C>) -> Self {
        Self { config, mailer }
    }

    pub const fn info(&self) -> TaskInfo {
        NEWSLETTER_TASK
    }

    pub fn default_triggers(&self) -> Vec<Trigger> {
        vec![Trigger::Interval(DEFAULT_INTERVAL)]
    }

    pub const fn mailer(&self) -> &Mailer<C> {
        &self.mailer
    }

    /// Execute one run. Always ends by reporting 100.
    ///
    /// Cancellation is only checked before sending; an attempt already in
    /// flight runs to completion.
    pub async fn run(&self, cancel: &CancellationToken, progress: &dyn ProgressSink) -> RunOutcome {
        progress.report(0.0);

        let outcome = if cancel.is_cancelled() {
            info!(task = NEWSLETTER_TASK.key, "Newsletter run cancelled before sending");
            RunOutcome::Cancelled
        } else {
            AssertUnwindSafe(self.send_newsletter())
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let reason = panic_message(panic.as_ref());
                    error!(task = NEWSLETTER_TASK.key, panic = %reason, "Newsletter run panicked");
                    RunOutcome::Faulted(reason)
                })
        };

        progress.report(100.0);
        outcome
    }

    /// Every setting, connection timeout and EHLO name included, comes from
    /// the configuration loaded for this run.
    async fn send_newsletter(&self) -> RunOutcome {
        let config = match self.config.load().await {
            Ok(config) => config,
            Err(e) => {
                error!(task = NEWSLETTER_TASK.key, error = %e, "Failed to load newsletter configuration");
                return RunOutcome::Faulted(e.to_string());
            }
        };

        if config.email.body.is_empty() {
            warn!(task = NEWSLETTER_TASK.key, "Newsletter body is empty");
        }

        let result = self
            .mailer
            .send_with(
                &config.connect_options(),
                &config.endpoint(),
                &config.credentials(),
                &config.message(),
            )
            .await;

        match result.into_result() {
            Ok(()) => {
                info!(task = NEWSLETTER_TASK.key, "Newsletter sent successfully");
                RunOutcome::Delivered
            }
            Err(e) => {
                error!(task = NEWSLETTER_TASK.key, stage = e.stage(), "Failed to send newsletter");
                RunOutcome::Failed(e)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::NewsletterConfig;
    use crate::error::{ConfigError, ConfigResult};
    use crate::mailer::recording::{FailAt, RecordingConnector, Step};
    use crate::mailer::ConnectOptions;

    fn config() -> NewsletterConfig {
        let mut config = NewsletterConfig::default();
        config.smtp.host = "smtp.example.com".to_string();
        config.smtp.username = "news@example.com".to_string();
        config.smtp.password = "hunter2".to_string();
        config.email.to_addr = "reader@example.org".to_string();
        config.email.body = "<h1>New this week</h1>".to_string();
        config
    }

    fn job(config: NewsletterConfig, connector: RecordingConnector) -> NewsletterJob<RecordingConnector> {
        NewsletterJob::with_mailer(Arc::new(config), Mailer::with_connector(connector))
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<f64>>);

    impl ProgressSink for Recorder {
        fn report(&self, percent: f64) {
            self.0.lock().unwrap().push(percent);
        }
    }

    impl Recorder {
        fn reports(&self) -> Vec<f64> {
            self.0.lock().unwrap().clone()
        }
    }

    struct BrokenConfig;

    #[async_trait]
    impl ConfigSource for BrokenConfig {
        async fn load(&self) -> ConfigResult<NewsletterConfig> {
            Err(ConfigError::Read {
                path: "/etc/newsletter.toml".to_string(),
                reason: "permission denied".to_string(),
            })
        }
    }

    struct PanickingConfig;

    #[async_trait]
    impl ConfigSource for PanickingConfig {
        async fn load(&self) -> ConfigResult<NewsletterConfig> {
            panic!("config store unavailable");
        }
    }

    /// Yields the next config on every load, repeating the last one.
    struct ChangingConfig {
        configs: Vec<NewsletterConfig>,
        loads: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ConfigSource for ChangingConfig {
        async fn load(&self) -> ConfigResult<NewsletterConfig> {
            let n = self.loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.configs[n.min(self.configs.len() - 1)].clone())
        }
    }

    #[tokio::test]
    async fn test_successful_run_reports_progress() {
        let job = job(config(), RecordingConnector::new());
        let progress = Recorder::default();

        let outcome = job.run(&CancellationToken::new(), &progress).await;

        assert_eq!(outcome, RunOutcome::Delivered);
        assert_eq!(progress.reports(), vec![0.0, 100.0]);
        assert_eq!(job.mailer().connector().sessions(), 1);
    }

    #[tokio::test]
    async fn test_run_uses_configured_endpoint_and_message() {
        let mut cfg = config();
        cfg.smtp.use_ssl = false;
        cfg.smtp.port = 2525;
        let job = job(cfg, RecordingConnector::new());

        job.run(&CancellationToken::new(), &LogProgress).await;

        let steps = job.mailer().connector().steps();
        assert_eq!(
            steps[0],
            Step::Connect {
                host: "smtp.example.com".to_string(),
                port: 2525,
                implicit_tls: false,
                timeout: Duration::from_secs(30),
                helo_name: "localhost".to_string(),
            }
        );
        assert!(steps.contains(&Step::StartTls));

        let transmitted = job.mailer().connector().transmitted();
        let (from, to, data) = &transmitted[0];
        assert_eq!(from.as_deref(), Some("news@example.com"));
        assert_eq!(to, &vec!["reader@example.org".to_string()]);
        assert!(data.contains("Subject: Jellyfin Newsletter"));
        assert!(data.contains("<h1>New this week</h1>"));
    }

    #[tokio::test]
    async fn test_cancelled_run_never_sends() {
        let job = job(config(), RecordingConnector::new());
        let progress = Recorder::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = job.run(&cancel, &progress).await;

        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(progress.reports().last(), Some(&100.0));
        assert_eq!(job.mailer().connector().sessions(), 0);
    }

    #[tokio::test]
    async fn test_every_failure_still_finishes() {
        for fail_at in [
            FailAt::Connect,
            FailAt::StartTls,
            FailAt::Auth,
            FailAt::Transmit,
        ] {
            let mut cfg = config();
            cfg.smtp.use_ssl = false;
            let job = job(cfg, RecordingConnector::failing_at(fail_at));
            let progress = Recorder::default();

            let outcome = job.run(&CancellationToken::new(), &progress).await;

            assert!(matches!(outcome, RunOutcome::Failed(_)), "{fail_at:?}");
            assert_eq!(progress.reports(), vec![0.0, 100.0], "{fail_at:?}");
        }
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_a_failed_delivery() {
        let mut cfg = config();
        cfg.email.to_addr = String::new();
        let job = job(cfg, RecordingConnector::new());
        let progress = Recorder::default();

        let outcome = job.run(&CancellationToken::new(), &progress).await;

        assert!(matches!(
            outcome,
            RunOutcome::Failed(MailError::InvalidMessage { .. })
        ));
        assert_eq!(progress.reports().last(), Some(&100.0));
    }

    #[tokio::test]
    async fn test_config_error_is_contained() {
        let job = NewsletterJob::with_mailer(
            Arc::new(BrokenConfig),
            Mailer::with_connector(RecordingConnector::new()),
        );
        let progress = Recorder::default();

        let outcome = job.run(&CancellationToken::new(), &progress).await;

        assert!(matches!(outcome, RunOutcome::Faulted(ref reason) if reason.contains("permission denied")));
        assert_eq!(progress.reports(), vec![0.0, 100.0]);
        assert_eq!(job.mailer().connector().sessions(), 0);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let job = NewsletterJob::with_mailer(
            Arc::new(PanickingConfig),
            Mailer::with_connector(RecordingConnector::new()),
        );
        let progress = Recorder::default();

        let outcome = job.run(&CancellationToken::new(), &progress).await;

        assert_eq!(
            outcome,
            RunOutcome::Faulted("config store unavailable".to_string())
        );
        assert_eq!(progress.reports().last(), Some(&100.0));
    }

    #[tokio::test]
    async fn test_runs_are_independent() {
        let job = job(config(), RecordingConnector::new());
        let cancel = CancellationToken::new();

        let first = job.run(&cancel, &LogProgress).await;
        let second = job.run(&cancel, &LogProgress).await;

        assert!(first.is_delivered());
        assert!(second.is_delivered());

        let connector = job.mailer().connector();
        assert_eq!(connector.sessions(), 2);
        assert_eq!(connector.transmitted().len(), 2);
        let quits = connector
            .steps()
            .iter()
            .filter(|s| matches!(s, Step::Quit))
            .count();
        assert_eq!(quits, 2);
    }

    #[tokio::test]
    async fn test_connection_settings_reloaded_each_run() {
        let mut before = config();
        before.smtp.timeout_secs = 5;
        before.smtp.helo_name = "old.example.com".to_string();
        let mut after = config();
        after.smtp.timeout_secs = 60;
        after.smtp.helo_name = "new.example.com".to_string();

        let job = NewsletterJob::with_mailer(
            Arc::new(ChangingConfig {
                configs: vec![before, after],
                loads: std::sync::atomic::AtomicUsize::new(0),
            }),
            Mailer::with_connector(RecordingConnector::new()),
        );
        let cancel = CancellationToken::new();

        assert!(job.run(&cancel, &LogProgress).await.is_delivered());
        assert!(job.run(&cancel, &LogProgress).await.is_delivered());

        let options = job.mailer().connector().connect_options();
        assert_eq!(
            options,
            vec![
                ConnectOptions::new(Duration::from_secs(5), "old.example.com"),
                ConnectOptions::new(Duration::from_secs(60), "new.example.com"),
            ]
        );
    }

    #[tokio::test]
    async fn test_channel_progress_sink() {
        let job = job(config(), RecordingConnector::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        job.run(&CancellationToken::new(), &tx).await;
        drop(tx);

        let mut reports = Vec::new();
        while let Some(p) = rx.recv().await {
            reports.push(p);
        }
        assert_eq!(reports, vec![0.0, 100.0]);
    }

    #[tokio::test]
    async fn test_closure_progress_sink() {
        let job = job(config(), RecordingConnector::new());
        let last = Arc::new(Mutex::new(None));
        let sink = {
            let last = Arc::clone(&last);
            move |p: f64| *last.lock().unwrap() = Some(p)
        };

        job.run(&CancellationToken::new(), &sink).await;
        assert_eq!(*last.lock().unwrap(), Some(100.0));
    }

    #[test]
    fn test_task_descriptor() {
        let job = job(config(), RecordingConnector::new());
        let info = job.info();
        assert_eq!(info.name, "Email Newsletter");
        assert_eq!(info.category, "Newsletters");
        assert_eq!(info.key, "EmailNewsletters");
        assert_eq!(
            job.default_triggers(),
            vec![Trigger::Interval(Duration::from_secs(604_800))]
        );
    }
}
