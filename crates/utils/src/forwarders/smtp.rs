use lettre::{
    address::Envelope, transport::smtp::authentication::Credentials, Address, AsyncSmtpTransport,
    AsyncTransport, Tokio1Executor,
};
use tracing::{debug, error, info};

use crate::{
    config::{UpstreamConfig, UpstreamTls},
    ForwardError, ForwardFuture, ForwardResult, Forwarder, InboundMessage,
};

/// Forwarder that relays the raw message to an upstream SMTP server.
///
/// The envelope sender is the inbound message's sender and the envelope
/// recipient is the destination address, the message data is sent
/// byte-for-byte as received.
pub struct SmtpForwarder {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    upstream: String,
}

impl SmtpForwarder {
    /// Creates a new [`SmtpForwarder`] for the given upstream configuration.
    ///
    /// No connection is opened here, the transport connects lazily on the
    /// first forward.
    pub fn new(config: &UpstreamConfig) -> ForwardResult<Self> {
        let builder = match config.tls {
            UpstreamTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
            UpstreamTls::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| {
                    error!(host = %config.host, error = %e, "Failed to create STARTTLS transport");
                    ForwardError::Connection(format!("Failed to create SMTP transport: {e}"))
                })?,
            UpstreamTls::Wrapper => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host).map_err(|e| {
                error!(host = %config.host, error = %e, "Failed to create TLS transport");
                ForwardError::Connection(format!("Failed to create SMTP transport: {e}"))
            })?,
        };

        let mut builder = builder.port(config.port);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let upstream = format!("{}:{}", config.host, config.port);
        info!(
            upstream = %upstream,
            tls = ?config.tls,
            authenticated = config.username.is_some(),
            "SMTP forwarder initialized"
        );
        Ok(Self {
            transport: builder.build(),
            upstream,
        })
    }

    /// Returns the `host:port` of the upstream server.
    pub fn upstream(&self) -> &str {
        &self.upstream
    }
}

fn envelope(message: &InboundMessage, address: &str) -> ForwardResult<Envelope> {
    let from = message
        .from
        .as_deref()
        .map(str::parse::<Address>)
        .transpose()
        .map_err(|e| ForwardError::Address(format!("Invalid sender address: {e}")))?;
    let to = address
        .parse::<Address>()
        .map_err(|e| ForwardError::Address(format!("Invalid destination address {address}: {e}")))?;
    Envelope::new(from, vec![to]).map_err(|e| ForwardError::Address(e.to_string()))
}

impl Forwarder for SmtpForwarder {
    fn forward<'a>(&'a self, message: &'a InboundMessage, address: &'a str) -> ForwardFuture<'a> {
        Box::pin(async move {
            let envelope = envelope(message, address)?;

            debug!(
                message_id = %message.message_id,
                upstream = %self.upstream,
                destination = %address,
                size = message.raw().len(),
                "Sending email upstream"
            );

            let response = self
                .transport
                .send_raw(&envelope, message.raw())
                .await
                .map_err(|e| {
                    error!(
                        message_id = %message.message_id,
                        upstream = %self.upstream,
                        destination = %address,
                        error = %e,
                        "Failed to send email upstream"
                    );
                    if e.is_permanent() {
                        ForwardError::Rejected(e.to_string())
                    } else {
                        ForwardError::Connection(e.to_string())
                    }
                })?;

            info!(
                message_id = %message.message_id,
                upstream = %self.upstream,
                destination = %address,
                code = %response.code(),
                "Sent email upstream"
            );
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "smtp"
    }
}
