use std::{fmt::Display, net::SocketAddr, sync::Arc};

use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::{
    rewrite_recipients, EmailAddress, ForwardError, Forwarder, MailMessage, ParseError,
    ProxyConfig, RewrittenRecipient,
};

/// Raw content of a transaction as delivered by the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    /// Undecoded bytes, the only form that can be forwarded.
    Bytes(Vec<u8>),
    /// Content that was already decoded to text.
    Text(String),
}

/// Sender, recipients and content collected over one SMTP transaction.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Envelope sender as given in `MAIL FROM`.
    pub mail_from: String,

    /// Envelope recipients as given in `RCPT TO`, in order.
    pub rcpt_tos: Vec<String>,

    /// Message data received after `DATA`.
    pub content: MessageContent,

    /// Address of the connecting client.
    pub peer: Option<SocketAddr>,
}

/// Steps of a transaction through the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Received,
    ContentValidated,
    SenderValidated,
    RecipientsRewritten,
    Forwarded,
    Rejected,
}

/// Why a transaction was not forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The content is not a byte sequence.
    InvalidContent,
    /// The envelope sender is not a parsable address.
    SenderUnparsable(ParseError),
    /// The envelope sender is not on the allow-list.
    SenderNotAllowed(String),
    /// The upstream relay could not take the message.
    ForwardFailed(ForwardError),
}

impl Rejection {
    /// Short reason appended to the failure reply.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::InvalidContent => "Received invalid content",
            Rejection::SenderUnparsable(_) => "Internal error",
            Rejection::SenderNotAllowed(_) => "Sender not allowed",
            Rejection::ForwardFailed(_) => "Failed to send",
        }
    }
}

impl Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::InvalidContent => write!(f, "Received message isn't bytes"),
            Rejection::SenderUnparsable(e) => write!(f, "Sender is not a valid address: {e}"),
            Rejection::SenderNotAllowed(sender) => {
                write!(f, "Sender {sender} is not in the allowed senders list")
            }
            Rejection::ForwardFailed(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Rejection {}

/// Reply produced for a transaction, in SMTP terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub message: String,
}

impl SmtpReply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Reply for a forwarded transaction.
    pub fn forwarded() -> Self {
        Self::new(250, "OK")
    }

    /// Permanent failure reply, used for every rejection path.
    pub fn rejected(rejection: &Rejection) -> Self {
        Self::new(
            550,
            format!("Message could not be forwarded: {}", rejection.reason()),
        )
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl Display for SmtpReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Message ready to be handed to the upstream relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMessage {
    pub sender: EmailAddress,
    pub recipients: Vec<RewrittenRecipient>,
    pub message: Vec<u8>,
}

/// Turns one envelope into a forwarded, rewritten message.
///
/// The `From` header becomes the configured upstream identity, every
/// recipient is folded into the sender's mailbox by sub-addressing and the
/// body bytes are passed on untouched.
#[derive(Debug, Clone)]
pub struct EnvelopeHandler {
    config: Arc<ProxyConfig>,
    forwarder: Forwarder,
}

impl EnvelopeHandler {
    pub fn new(config: Arc<ProxyConfig>, forwarder: Forwarder) -> Self {
        info!(
            allowed_senders = config.allowed_senders.len(),
            upstream_from = %config.upstream.from,
            "Envelope handler initialized"
        );
        Self { config, forwarder }
    }

    /// Runs every step up to and including re-serialization.
    pub fn prepare(&self, envelope: &Envelope) -> Result<PreparedMessage, Rejection> {
        let mut state = TransactionState::Received;

        let content = match &envelope.content {
            MessageContent::Bytes(bytes) => bytes,
            MessageContent::Text(_) => return Err(Rejection::InvalidContent),
        };
        advance(&mut state, TransactionState::ContentValidated);

        let mut message = MailMessage::parse(content);
        debug!(from = ?message.header("From"), "Original From (header)");
        message.replace_header("From", &self.config.upstream.from);

        let sender = EmailAddress::parse(&envelope.mail_from).map_err(|e| {
            warn!(mail_from = %envelope.mail_from, error = %e, "Sender doesn't match address grammar");
            Rejection::SenderUnparsable(e)
        })?;
        if !self.config.allowed_senders.permits(&sender) {
            let address = sender.address();
            warn!(sender = %address, "Sender is not in the allowed senders list");
            return Err(Rejection::SenderNotAllowed(address));
        }
        advance(&mut state, TransactionState::SenderValidated);

        let recipients = rewrite_recipients(&sender, &envelope.rcpt_tos)
            .into_iter()
            .filter_map(|result| {
                result
                    .map_err(|e| warn!(recipient = %e.raw, error = %e.error, "Dropping recipient"))
                    .ok()
            })
            .collect::<Vec<_>>();
        debug!(
            original = ?envelope.rcpt_tos,
            rewritten = ?recipients.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Rewrote recipients"
        );
        advance(&mut state, TransactionState::RecipientsRewritten);

        Ok(PreparedMessage {
            sender,
            recipients,
            message: message.to_bytes(),
        })
    }

    /// Handles a complete transaction and returns the reply for the client.
    pub async fn handle(&self, envelope: Envelope) -> SmtpReply {
        let span = tracing::info_span!("transaction", id = %Uuid::new_v4());
        async move {
            debug!(
                peer = ?envelope.peer,
                mail_from = %envelope.mail_from,
                rcpt_tos = ?envelope.rcpt_tos,
                "Receiving message"
            );
            match self.process(&envelope).await {
                Ok(()) => {
                    debug!(state = ?TransactionState::Forwarded, "Message forwarded successfully");
                    SmtpReply::forwarded()
                }
                Err(rejection) => {
                    debug!(state = ?TransactionState::Rejected, reason = %rejection, "Message rejected");
                    SmtpReply::rejected(&rejection)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn process(&self, envelope: &Envelope) -> Result<(), Rejection> {
        let prepared = self.prepare(envelope)?;
        let recipients = prepared
            .recipients
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        self.forwarder
            .forward(
                self.config.upstream.from.clone(),
                recipients,
                prepared.message,
            )
            .await
            .map_err(|e| {
                warn!(error = %e, "Error forwarding message");
                Rejection::ForwardFailed(e)
            })
    }
}

fn advance(state: &mut TransactionState, next: TransactionState) {
    debug!(from = ?*state, to = ?next, "Transaction state");
    *state = next;
}
