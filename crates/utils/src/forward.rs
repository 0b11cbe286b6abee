use std::{error::Error, fmt::Display, future::Future, pin::Pin};

use crate::InboundMessage;

/// Result type for forward operations.
pub type ForwardResult<T> = Result<T, ForwardError>;

/// Boxed future type for forward operations, enabling object safety.
pub type ForwardFuture<'a> = Pin<Box<dyn Future<Output = ForwardResult<()>> + Send + 'a>>;

/// Errors that can occur while forwarding a message to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// The sender or destination address could not be used.
    Address(String),
    /// The transport could not reach the upstream server.
    Connection(String),
    /// The upstream server refused the message.
    Rejected(String),
}

impl Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Address(msg) => write!(f, "Address error: {msg}"),
            ForwardError::Connection(msg) => write!(f, "Connection error: {msg}"),
            ForwardError::Rejected(msg) => write!(f, "Rejected: {msg}"),
        }
    }
}

impl Error for ForwardError {}

/// Forward capability that performs the actual mail transport.
///
/// Implementations attempt delivery of a message to a single address and
/// report failure through [`ForwardError`]. The dispatcher never calls an
/// implementation concurrently for the same message, the primary attempt
/// completes before any fallback attempt is issued.
pub trait Forwarder: Send + Sync {
    /// Attempts delivery of `message` to `address`.
    fn forward<'a>(&'a self, message: &'a InboundMessage, address: &'a str) -> ForwardFuture<'a>;

    /// Returns the name of this forwarder.
    fn name(&self) -> &str;
}
