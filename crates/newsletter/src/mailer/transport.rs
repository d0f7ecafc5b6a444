//! SMTP session abstraction and its lettre implementation.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::{Credentials as SmtpCredentials, Mechanism};
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::Message;
use tracing::debug;

use super::{ConnectOptions, Credentials, Security, SmtpEndpoint};
use crate::error::MailError;

/// Mechanisms offered to the server, most preferred first.
const AUTH_MECHANISMS: &[Mechanism] = &[Mechanism::Plain, Mechanism::Login];

/// Opens SMTP sessions.
///
/// The implementation decides how the TCP connection is secured from
/// [`SmtpEndpoint::security`]: implicit TLS must be negotiated inside
/// `connect`, STARTTLS is requested later through [`SmtpSession::start_tls`].
#[async_trait]
pub trait SmtpConnector: Send + Sync {
    /// Connect, read the greeting and say EHLO.
    async fn connect(
        &self,
        endpoint: &SmtpEndpoint,
        options: &ConnectOptions,
    ) -> Result<Box<dyn SmtpSession>, MailError>;
}

/// One open SMTP session, owned by a single send.
#[async_trait]
pub trait SmtpSession: Send {
    async fn start_tls(&mut self) -> Result<(), MailError>;

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), MailError>;

    /// MAIL FROM, RCPT TO and DATA for the message's envelope.
    async fn transmit(&mut self, message: &Message) -> Result<(), MailError>;

    async fn quit(&mut self) -> Result<(), MailError>;
}

/// [`SmtpConnector`] backed by lettre's [`AsyncSmtpConnection`] on Tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct LettreConnector {
    accept_invalid_certs: bool,
}

impl LettreConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            accept_invalid_certs: false,
        }
    }

    /// Skip server certificate verification. Only for test servers with
    /// self-signed certificates.
    #[must_use]
    pub const fn dangerous_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    fn tls_parameters(self, host: &str) -> Result<TlsParameters, MailError> {
        TlsParameters::builder(host.to_string())
            .dangerous_accept_invalid_certs(self.accept_invalid_certs)
            .build()
            .map_err(|e| MailError::SecurityNegotiation {
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl SmtpConnector for LettreConnector {
    async fn connect(
        &self,
        endpoint: &SmtpEndpoint,
        options: &ConnectOptions,
    ) -> Result<Box<dyn SmtpSession>, MailError> {
        let tls = match endpoint.security() {
            Security::ImplicitTls => Some(self.tls_parameters(&endpoint.host)?),
            Security::StartTls => None,
        };
        let hello = ClientId::Domain(options.helo_name.clone());

        debug!(
            endpoint = %endpoint,
            security = ?endpoint.security(),
            timeout_secs = options.timeout.as_secs(),
            helo = %options.helo_name,
            "Opening SMTP connection"
        );

        let connect = AsyncSmtpConnection::connect_tokio1(
            (endpoint.host.as_str(), endpoint.port),
            Some(options.timeout),
            &hello,
            tls,
            None,
        );

        let connection = tokio::time::timeout(options.timeout, connect)
            .await
            .map_err(|_| MailError::Connection {
                endpoint: endpoint.to_string(),
                reason: format!("timed out after {}s", options.timeout.as_secs()),
            })?
            .map_err(|e| {
                if e.is_tls() {
                    MailError::SecurityNegotiation {
                        reason: e.to_string(),
                    }
                } else {
                    MailError::Connection {
                        endpoint: endpoint.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        Ok(Box::new(LettreSession {
            connection,
            connector: *self,
            host: endpoint.host.clone(),
            hello,
        }))
    }
}

struct LettreSession {
    connection: AsyncSmtpConnection,
    connector: LettreConnector,
    host: String,
    hello: ClientId,
}

#[async_trait]
impl SmtpSession for LettreSession {
    async fn start_tls(&mut self) -> Result<(), MailError> {
        if !self.connection.can_starttls() {
            return Err(MailError::SecurityNegotiation {
                reason: format!("{} does not advertise STARTTLS", self.host),
            });
        }

        let params = self.connector.tls_parameters(&self.host)?;
        self.connection
            .starttls(params, &self.hello)
            .await
            .map_err(|e| MailError::SecurityNegotiation {
                reason: e.to_string(),
            })?;

        debug!(host = %self.host, "Connection upgraded with STARTTLS");
        Ok(())
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), MailError> {
        let creds = SmtpCredentials::new(credentials.username.clone(), credentials.password.clone());

        self.connection
            .auth(AUTH_MECHANISMS, &creds)
            .await
            .map(drop)
            .map_err(|e| MailError::Authentication {
                reason: e.to_string(),
            })
    }

    async fn transmit(&mut self, message: &Message) -> Result<(), MailError> {
        self.connection
            .send(message.envelope(), &message.formatted())
            .await
            .map(drop)
            .map_err(|e| MailError::Transmission {
                reason: e.to_string(),
            })
    }

    async fn quit(&mut self) -> Result<(), MailError> {
        if self.connection.has_broken() {
            self.connection.abort();
            return Ok(());
        }

        self.connection
            .quit()
            .await
            .map(drop)
            .map_err(|e| MailError::Connection {
                endpoint: self.host.clone(),
                reason: e.to_string(),
            })
    }
}
