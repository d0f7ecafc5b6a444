//! SMTP delivery of a single HTML message.
//!
//! [`Mailer::send`] performs exactly one delivery attempt:
//!
//! 1. build a MIME message with a single `text/html` part
//! 2. connect to the endpoint (TLS-wrapped when implicit TLS is enabled)
//! 3. upgrade with STARTTLS when implicit TLS is disabled
//! 4. authenticate
//! 5. transmit to the single recipient
//! 6. QUIT, on success and on every failure after the connection opened
//!
//! Failures never escape as errors or panics; they come back as a
//! [`DeliveryResult`] carrying the [`MailError`] of the step that failed.

mod transport;

#[cfg(test)]
pub(crate) mod recording;

pub use transport::{LettreConnector, SmtpConnector, SmtpSession};

use std::fmt;
use std::time::Duration;

use lettre::message::{header::ContentType, Mailbox};
use lettre::{Address, Message};
use tracing::{debug, error, info};

use crate::config::{DEFAULT_HELO_NAME, DEFAULT_SMTP_TIMEOUT_SECS};
use crate::error::MailError;

/// Transport security applied to the SMTP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// TLS handshake immediately after the TCP connect (SMTPS).
    ImplicitTls,
    /// Plaintext greeting and EHLO, then upgrade with STARTTLS.
    StartTls,
}

/// Where to deliver and how to secure the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpEndpoint {
    pub host: String,
    pub port: u16,
    pub implicit_tls: bool,
}

impl SmtpEndpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, implicit_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            implicit_tls,
        }
    }

    /// The single security switch of the client.
    #[must_use]
    pub const fn security(&self) -> Security {
        if self.implicit_tls {
            Security::ImplicitTls
        } else {
            Security::StartTls
        }
    }

    fn validate(&self) -> Result<(), MailError> {
        let reason = if self.host.trim().is_empty() {
            "host is empty"
        } else if self.port == 0 {
            "port must be between 1 and 65535"
        } else {
            return Ok(());
        };

        Err(MailError::InvalidEndpoint {
            endpoint: self.to_string(),
            reason: reason.to_string(),
        })
    }
}

impl fmt::Display for SmtpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-connection settings, supplied with every send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Bounds the connect phase and every later command.
    pub timeout: Duration,
    /// Name announced in EHLO.
    pub helo_name: String,
}

impl ConnectOptions {
    #[must_use]
    pub fn new(timeout: Duration, helo_name: impl Into<String>) -> Self {
        Self {
            timeout,
            helo_name: helo_name.into(),
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_SMTP_TIMEOUT_SECS),
            DEFAULT_HELO_NAME,
        )
    }
}

/// SMTP login. The password is never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The newsletter as handed to the mailer, before MIME encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub sender_name: String,
    /// By convention the SMTP username.
    pub sender_address: String,
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
}

impl OutboundMessage {
    /// Encode as a MIME message with a single HTML body part.
    pub fn to_mime(&self) -> Result<Message, MailError> {
        let sender: Address =
            self.sender_address
                .parse()
                .map_err(|e| MailError::InvalidMessage {
                    reason: format!("sender address '{}': {e}", self.sender_address),
                })?;
        let recipient: Mailbox = self
            .recipient
            .parse()
            .map_err(|e| MailError::InvalidMessage {
                reason: format!("recipient address '{}': {e}", self.recipient),
            })?;

        let display_name = (!self.sender_name.is_empty()).then(|| self.sender_name.clone());

        Message::builder()
            .from(Mailbox::new(display_name, sender))
            .to(recipient)
            .subject(self.subject.as_str())
            .header(ContentType::TEXT_HTML)
            .body(self.html_body.clone())
            .map_err(|e| MailError::InvalidMessage {
                reason: e.to_string(),
            })
    }
}

/// Outcome of one [`Mailer::send`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct DeliveryResult {
    pub succeeded: bool,
    pub error: Option<MailError>,
}

impl DeliveryResult {
    pub const fn delivered() -> Self {
        Self {
            succeeded: true,
            error: None,
        }
    }

    pub const fn failed(error: MailError) -> Self {
        Self {
            succeeded: false,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<(), MailError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// SMTP mailer. Holds no connection between calls.
pub struct Mailer<C = LettreConnector> {
    connector: C,
    options: ConnectOptions,
}

impl Mailer<LettreConnector> {
    /// Mailer backed by lettre's async SMTP connection.
    #[must_use]
    pub fn new(timeout: Duration, helo_name: impl Into<String>) -> Self {
        Self::with_connector(LettreConnector::new())
            .with_options(ConnectOptions::new(timeout, helo_name))
    }
}

impl<C: SmtpConnector> Mailer<C> {
    /// Mailer over `connector` with the default [`ConnectOptions`].
    #[must_use]
    pub fn with_connector(connector: C) -> Self {
        Self {
            connector,
            options: ConnectOptions::default(),
        }
    }

    /// Replace the options used by [`Mailer::send`].
    #[must_use]
    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    pub const fn connector(&self) -> &C {
        &self.connector
    }

    pub const fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Perform one delivery attempt. Never panics on SMTP failures and never retries.
    pub async fn send(
        &self,
        endpoint: &SmtpEndpoint,
        credentials: &Credentials,
        message: &OutboundMessage,
    ) -> DeliveryResult {
        self.send_with(&self.options, endpoint, credentials, message).await
    }

    /// [`Mailer::send`] with connection settings chosen by the caller.
    pub async fn send_with(
        &self,
        options: &ConnectOptions,
        endpoint: &SmtpEndpoint,
        credentials: &Credentials,
        message: &OutboundMessage,
    ) -> DeliveryResult {
        match self.try_send(options, endpoint, credentials, message).await {
            Ok(()) => {
                info!(
                    recipient = %message.recipient,
                    subject = %message.subject,
                    endpoint = %endpoint,
                    "Email sent successfully"
                );
                DeliveryResult::delivered()
            }
            Err(e) => {
                error!(
                    recipient = %message.recipient,
                    endpoint = %endpoint,
                    stage = e.stage(),
                    error = %e,
                    "Failed to send email"
                );
                DeliveryResult::failed(e)
            }
        }
    }

    async fn try_send(
        &self,
        options: &ConnectOptions,
        endpoint: &SmtpEndpoint,
        credentials: &Credentials,
        message: &OutboundMessage,
    ) -> Result<(), MailError> {
        endpoint.validate()?;
        let email = message.to_mime()?;

        let security = endpoint.security();
        let mut session = self.connector.connect(endpoint, options).await?;

        let outcome = exchange(session.as_mut(), security, credentials, &email).await;

        // The result of the exchange stands regardless of how QUIT goes.
        if let Err(e) = session.quit().await {
            debug!(endpoint = %endpoint, error = %e, "SMTP QUIT failed");
        }

        outcome
    }
}

async fn exchange(
    session: &mut dyn SmtpSession,
    security: Security,
    credentials: &Credentials,
    email: &Message,
) -> Result<(), MailError> {
    if security == Security::StartTls {
        session.start_tls().await?;
    }
    session.authenticate(credentials).await?;
    session.transmit(email).await
}
