//! Concrete [`Forwarder`](crate::Forwarder) implementations.
//!
//! Contains [`SmtpForwarder`], which relays messages to an upstream SMTP
//! server.

pub mod smtp;

pub use smtp::*;
