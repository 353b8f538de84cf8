//! Delivery of rewritten messages to the upstream relay.
//!
//! [`UpstreamTransport`] is the blocking, one-connection-per-message send
//! operation; [`SmtpUpstream`] implements it with `lettre`. [`Forwarder`]
//! moves those blocking sends off the session tasks onto Tokio's blocking
//! pool, gated by a semaphore so that the number of outstanding upstream
//! deliveries stays bounded.

use std::{fmt::Display, str::FromStr, sync::Arc};

use lettre::{
    address::Envelope, transport::smtp::authentication::Credentials, Address, SmtpTransport,
    Transport,
};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::{EmailAddress, UpstreamConfig, UpstreamTls};

/// Result type for forwarding operations.
pub type ForwardResult<T> = Result<T, ForwardError>;

/// Errors that can occur while forwarding a message upstream.
///
/// Connect, TLS upgrade, login and send failures all collapse into
/// [`ForwardError::Transport`]; there is no per-recipient reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// The sender or a recipient cannot be used in an SMTP envelope.
    Envelope(String),
    /// The upstream relay could not be reached or refused the message.
    Transport(String),
    /// The blocking worker could not run the delivery.
    Dispatch(String),
}

impl Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Envelope(msg) => {
                write!(f, "Failed to send email via upstream SMTP: invalid envelope: {msg}")
            }
            ForwardError::Transport(msg) => write!(f, "Failed to send email via upstream SMTP: {msg}"),
            ForwardError::Dispatch(msg) => {
                write!(f, "Failed to send email via upstream SMTP: worker error: {msg}")
            }
        }
    }
}

impl std::error::Error for ForwardError {}

/// Trait for the blocking upstream send operation.
///
/// One call is one upstream transaction: a single sender, all recipients
/// and one message payload.
pub trait UpstreamTransport: Send + Sync {
    /// Sends `message` from `sender` to every address in `recipients`.
    ///
    /// Addresses may carry display names, only their address part is put
    /// on the envelope.
    fn send(&self, sender: &str, recipients: &[String], message: &[u8]) -> ForwardResult<()>;

    /// Returns the name of this transport.
    fn name(&self) -> &str;
}

/// Upstream transport backed by `lettre`'s blocking SMTP client.
///
/// The client is built without connection pooling, so each send opens,
/// secures and closes its own connection.
pub struct SmtpUpstream {
    transport: SmtpTransport,
    host: String,
    port: u16,
    debug: bool,
}

impl SmtpUpstream {
    /// Creates a new [`SmtpUpstream`] from the upstream configuration.
    pub fn new(config: &UpstreamConfig) -> ForwardResult<Self> {
        let builder = match config.tls {
            UpstreamTls::Implicit => SmtpTransport::relay(&config.host),
            UpstreamTls::StartTls => SmtpTransport::starttls_relay(&config.host),
        }
        .map_err(|e| {
            error!(host = %config.host, error = %e, "Failed to configure upstream TLS");
            ForwardError::Transport(e.to_string())
        })?;

        let mut builder = builder.port(config.port);
        if let Some(credentials) = &config.credentials {
            builder = builder.credentials(Credentials::new(
                credentials.username.clone(),
                credentials.password.clone(),
            ));
        }

        info!(
            host = %config.host,
            port = config.port,
            tls = ?config.tls,
            login = config.credentials.is_some(),
            "Upstream SMTP transport initialized"
        );
        Ok(Self {
            transport: builder.build(),
            host: config.host.clone(),
            port: config.port,
            debug: config.debug,
        })
    }
}

impl UpstreamTransport for SmtpUpstream {
    fn send(&self, sender: &str, recipients: &[String], message: &[u8]) -> ForwardResult<()> {
        let from = envelope_address(sender)?;
        let to = recipients
            .iter()
            .map(|recipient| envelope_address(recipient))
            .collect::<ForwardResult<Vec<_>>>()?;
        let envelope =
            Envelope::new(Some(from), to).map_err(|e| ForwardError::Envelope(e.to_string()))?;

        if self.debug {
            info!(
                host = %self.host,
                port = self.port,
                sender = %sender,
                recipients = ?recipients,
                size = message.len(),
                "Sending message to upstream relay"
            );
        } else {
            debug!(
                host = %self.host,
                port = self.port,
                recipients = recipients.len(),
                size = message.len(),
                "Sending message to upstream relay"
            );
        }
        self.transport.send_raw(&envelope, message).map_err(|e| {
            error!(host = %self.host, error = %e, "Failed to send email via upstream SMTP");
            ForwardError::Transport(e.to_string())
        })?;
        Ok(())
    }

    fn name(&self) -> &str {
        "smtp"
    }
}

/// Extracts the address part of `value` as a `lettre` address.
fn envelope_address(value: &str) -> ForwardResult<Address> {
    let address = EmailAddress::parse(value)
        .map_err(|e| ForwardError::Envelope(format!("{value:?}: {e}")))?
        .address();
    Address::from_str(&address).map_err(|e| ForwardError::Envelope(format!("{address:?}: {e}")))
}

/// Runs upstream deliveries on the blocking pool, at most `max_concurrent`
/// at a time.
#[derive(Clone)]
pub struct Forwarder {
    transport: Arc<dyn UpstreamTransport>,
    permits: Arc<Semaphore>,
}

impl Forwarder {
    /// Creates a new [`Forwarder`] over `transport`.
    pub fn new(transport: Arc<dyn UpstreamTransport>, max_concurrent: usize) -> Self {
        info!(
            transport = transport.name(),
            max_concurrent = max_concurrent,
            "Forwarder initialized"
        );
        Self {
            transport,
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Forwards one message, suspending the caller until the blocking send
    /// has finished.
    pub async fn forward(
        &self,
        sender: String,
        recipients: Vec<String>,
        message: Vec<u8>,
    ) -> ForwardResult<()> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ForwardError::Dispatch(e.to_string()))?;
        let transport = self.transport.clone();

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            transport.send(&sender, &recipients, &message)
        })
        .await
        .map_err(|e| ForwardError::Dispatch(e.to_string()))?
    }

    /// Number of deliveries that could start right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("transport", &self.transport.name())
            .field("available", &self.available())
            .finish()
    }
}
