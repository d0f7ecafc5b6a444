//! Recording SMTP test double.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lettre::Message;

use super::{ConnectOptions, Credentials, SmtpConnector, SmtpEndpoint, SmtpSession};
use crate::error::MailError;

/// Step at which the double rejects the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Connect,
    StartTls,
    Auth,
    Transmit,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Connect {
        host: String,
        port: u16,
        implicit_tls: bool,
        timeout: Duration,
        helo_name: String,
    },
    StartTls,
    Auth {
        username: String,
    },
    Transmit {
        from: Option<String>,
        to: Vec<String>,
        data: String,
    },
    Quit,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::StartTls => "starttls",
            Self::Auth { .. } => "auth",
            Self::Transmit { .. } => "transmit",
            Self::Quit => "quit",
        }
    }
}

/// Connector that records every step across all sessions it opens.
#[derive(Debug, Default)]
pub struct RecordingConnector {
    steps: Arc<Mutex<Vec<Step>>>,
    sessions: AtomicUsize,
    fail_at: Option<FailAt>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(fail_at: FailAt) -> Self {
        Self {
            fail_at: Some(fail_at),
            ..Self::default()
        }
    }

    pub fn steps(&self) -> Vec<Step> {
        self.steps.lock().unwrap().clone()
    }

    /// Number of `connect` calls, successful or not.
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Options passed to each `connect` call, in order.
    pub fn connect_options(&self) -> Vec<ConnectOptions> {
        self.steps()
            .into_iter()
            .filter_map(|step| match step {
                Step::Connect {
                    timeout, helo_name, ..
                } => Some(ConnectOptions { timeout, helo_name }),
                _ => None,
            })
            .collect()
    }

    pub fn transmitted(&self) -> Vec<(Option<String>, Vec<String>, String)> {
        self.steps()
            .into_iter()
            .filter_map(|step| match step {
                Step::Transmit { from, to, data } => Some((from, to, data)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SmtpConnector for RecordingConnector {
    async fn connect(
        &self,
        endpoint: &SmtpEndpoint,
        options: &ConnectOptions,
    ) -> Result<Box<dyn SmtpSession>, MailError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        self.steps.lock().unwrap().push(Step::Connect {
            host: endpoint.host.clone(),
            port: endpoint.port,
            implicit_tls: endpoint.implicit_tls,
            timeout: options.timeout,
            helo_name: options.helo_name.clone(),
        });

        if self.fail_at == Some(FailAt::Connect) {
            return Err(MailError::Connection {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        Ok(Box::new(RecordingSession {
            steps: Arc::clone(&self.steps),
            fail_at: self.fail_at,
        }))
    }
}

struct RecordingSession {
    steps: Arc<Mutex<Vec<Step>>>,
    fail_at: Option<FailAt>,
}

impl RecordingSession {
    fn record(&self, step: Step) {
        self.steps.lock().unwrap().push(step);
    }
}

#[async_trait]
impl SmtpSession for RecordingSession {
    async fn start_tls(&mut self) -> Result<(), MailError> {
        if self.fail_at == Some(FailAt::StartTls) {
            return Err(MailError::SecurityNegotiation {
                reason: "454 TLS not available".to_string(),
            });
        }
        self.record(Step::StartTls);
        Ok(())
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), MailError> {
        if self.fail_at == Some(FailAt::Auth) {
            return Err(MailError::Authentication {
                reason: "535 5.7.8 authentication credentials invalid".to_string(),
            });
        }
        self.record(Step::Auth {
            username: credentials.username.clone(),
        });
        Ok(())
    }

    async fn transmit(&mut self, message: &Message) -> Result<(), MailError> {
        if self.fail_at == Some(FailAt::Transmit) {
            return Err(MailError::Transmission {
                reason: "554 5.7.1 message rejected".to_string(),
            });
        }
        let envelope = message.envelope();
        self.record(Step::Transmit {
            from: envelope.from().map(ToString::to_string),
            to: envelope.to().iter().map(ToString::to_string).collect(),
            data: String::from_utf8_lossy(&message.formatted()).into_owned(),
        });
        Ok(())
    }

    async fn quit(&mut self) -> Result<(), MailError> {
        self.record(Step::Quit);
        if self.fail_at == Some(FailAt::Quit) {
            return Err(MailError::Connection {
                endpoint: "recording".to_string(),
                reason: "connection reset".to_string(),
            });
        }
        Ok(())
    }
}
