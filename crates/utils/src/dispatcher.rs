//! Forward-with-fallback delivery of inbound messages.
//!
//! [`ForwardingDispatcher`] validates an [`InboundMessage`], forwards it to
//! the primary destination of a [`ForwardingConfig`] and, only when that
//! attempt fails, to the fallback destination. Attempts are strictly
//! sequential and each destination is tried at most once.

use std::{error::Error, fmt::Display, sync::Arc};

use tracing::{debug, error, info, warn};

use crate::{is_valid_address, ForwardError, ForwardResult, ForwardingConfig, Forwarder, InboundMessage};

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Reason a message was dropped without any forward attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No message was supplied to the invocation.
    MissingMessage,
    /// The sender address is absent or not shaped like an email address.
    InvalidSender,
}

impl Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::MissingMessage => write!(f, "message is missing"),
            Rejection::InvalidSender => write!(f, "message.from is not a valid email address"),
        }
    }
}

/// Outcome of a single dispatch invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The message was accepted by the given destination.
    Delivered(String),
    /// The message was dropped before any forward attempt.
    Rejected(Rejection),
    /// Both the primary and the fallback forward failed.
    Failed(ForwardError, ForwardError),
}

impl DeliveryOutcome {
    /// Converts a [`Failed`](Self::Failed) outcome into the terminal
    /// [`DispatchError`], leaving every other outcome untouched.
    pub fn into_result(self) -> DispatchResult<Self> {
        match self {
            DeliveryOutcome::Failed(primary, fallback) => {
                Err(DispatchError::FallbackFailed { primary, fallback })
            }
            outcome => Ok(outcome),
        }
    }
}

/// Terminal errors raised by a dispatch invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The primary and the fallback destinations both refused the message.
    FallbackFailed {
        primary: ForwardError,
        fallback: ForwardError,
    },
}

impl Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::FallbackFailed { .. } => write!(f, "Fallback forward failed"),
        }
    }
}

impl Error for DispatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DispatchError::FallbackFailed { fallback, .. } => Some(fallback),
        }
    }
}

/// Delivers inbound messages through a [`Forwarder`], falling back to the
/// secondary destination when the primary one fails.
pub struct ForwardingDispatcher {
    forwarder: Arc<dyn Forwarder>,
}

impl std::fmt::Debug for ForwardingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingDispatcher")
            .field("forwarder", &self.forwarder.name())
            .finish()
    }
}

impl ForwardingDispatcher {
    pub fn new(forwarder: Arc<dyn Forwarder>) -> Self {
        Self { forwarder }
    }

    /// Validates `message` and delivers it to the destinations in `config`.
    ///
    /// A missing message or an invalid sender is a soft rejection, logged
    /// and returned as [`DeliveryOutcome::Rejected`]. Only the failure of
    /// both destinations is raised, as [`DispatchError::FallbackFailed`].
    pub async fn dispatch(
        &self,
        message: Option<&InboundMessage>,
        config: &ForwardingConfig,
    ) -> DispatchResult<DeliveryOutcome> {
        let Some(message) = message else {
            warn!("Warning: message is missing. Exiting.");
            return Ok(DeliveryOutcome::Rejected(Rejection::MissingMessage));
        };

        if !message.from.as_deref().is_some_and(is_valid_address) {
            warn!(
                message_id = %message.message_id,
                from = ?message.from,
                "Warning: message.from is not a valid email address. Exiting."
            );
            return Ok(DeliveryOutcome::Rejected(Rejection::InvalidSender));
        }

        self.deliver(message, config).await.into_result()
    }

    /// Forwards a validated message to each destination in order, stopping
    /// at the first one that accepts it.
    ///
    /// Never raises, a total failure is reported as [`DeliveryOutcome::Failed`].
    pub async fn deliver(&self, message: &InboundMessage, config: &ForwardingConfig) -> DeliveryOutcome {
        debug!(
            message_id = %message.message_id,
            from = ?message.from,
            to = ?message.to,
            subject = ?message.subject(),
            client_ip = ?message.client_ip,
            forwarder = self.forwarder.name(),
            "Dispatching email"
        );

        let mut errors = Vec::with_capacity(2);
        for (destination, address) in config.destinations() {
            match self.attempt(message, address).await {
                Ok(()) => {
                    info!(
                        message_id = %message.message_id,
                        destination = %address,
                        "Email forwarded to {destination} address"
                    );
                    return DeliveryOutcome::Delivered(address.to_string());
                }
                Err(e) => {
                    warn!(
                        message_id = %message.message_id,
                        destination = %address,
                        "Warning: {} forward failed: {e}",
                        destination.title()
                    );
                    errors.push(e);
                }
            }
        }

        let Ok([primary_error, fallback_error]) = <[ForwardError; 2]>::try_from(errors) else {
            unreachable!("every destination is attempted before giving up");
        };
        error!(
            message_id = %message.message_id,
            primary_error = %primary_error,
            fallback_error = %fallback_error,
            "Error: Fallback forward failed"
        );
        DeliveryOutcome::Failed(primary_error, fallback_error)
    }

    async fn attempt(&self, message: &InboundMessage, address: &str) -> ForwardResult<()> {
        debug!(
            message_id = %message.message_id,
            destination = %address,
            "Forwarding email"
        );
        message.forward(self.forwarder.as_ref(), address).await
    }
}
