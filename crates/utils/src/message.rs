//! Inbound email message types handed to the forwarding pipeline.
//!
//! This module defines [`InboundMessage`], the per-invocation view of an
//! email (envelope sender and recipient, parsed headers and the raw RFC 5322
//! bytes that get forwarded), and [`IncomingMessage`], the SMTP envelope
//! collected by a receiving session before it is turned into an
//! [`InboundMessage`].

use std::{collections::HashSet, net::IpAddr};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{parse_raw_headers, Forwarder, ForwardFuture};

/// Represents an inbound email for a single dispatch invocation.
///
/// The message is transient, it is created per invocation and never
/// retained after the forward attempts complete. Headers are parsed once
/// at construction from a lossy UTF-8 view, [`raw`](Self::raw) keeps the
/// received bytes untouched so that 8-bit content is forwarded as is.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Unique identifier for this invocation, used to correlate log lines.
    pub message_id: String,

    /// Envelope sender address, if one was supplied.
    pub from: Option<String>,

    /// Envelope recipient(s), if supplied.
    pub to: Option<String>,

    /// IP address of the client that delivered the message.
    pub client_ip: Option<IpAddr>,

    /// Instant at which the message was received.
    pub received_at: DateTime<Utc>,

    /// Ordered list of MIME headers (case-preserved keys, trimmed values).
    headers: Vec<(String, String)>,

    /// Message body after the blank-line separator.
    body: String,

    /// Full message as received (headers + blank line + body).
    raw: Vec<u8>,
}

impl InboundMessage {
    pub fn new(from: Option<String>, to: Option<String>, raw: impl Into<Vec<u8>>) -> Self {
        let raw = raw.into();
        let text = String::from_utf8_lossy(&raw);
        let (headers, content) = parse_raw_headers(&text);
        let body = content.to_string();
        Self {
            message_id: Uuid::new_v4().to_string(),
            from,
            to,
            client_ip: None,
            received_at: Utc::now(),
            headers,
            body,
            raw,
        }
    }

    pub fn from_raw(from: &str, to: &str, raw: &str) -> Self {
        Self::new(Some(from.to_string()), Some(to.to_string()), raw.to_string())
    }

    /// Returns the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn subject(&self) -> Option<&str> {
        self.header("Subject")
    }

    /// Returns the message body, `None` when the message has no content.
    pub fn body(&self) -> Option<&str> {
        if self.body.is_empty() {
            None
        } else {
            Some(&self.body)
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Forwards this message to `address` using the given forward capability.
    pub fn forward<'a>(&'a self, forwarder: &'a dyn Forwarder, address: &'a str) -> ForwardFuture<'a> {
        forwarder.forward(self, address)
    }
}

/// An email received over SMTP with its envelope and connection metadata.
///
/// The envelope may name several recipients, the relay forwards the
/// message once regardless of how many were given.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Envelope sender address, empty for the null reverse-path `<>`.
    pub from: String,

    /// Set of envelope recipient addresses.
    pub rcpts: HashSet<String>,

    /// Raw message data (headers + content).
    pub raw: Vec<u8>,

    /// IP address of the connecting SMTP client.
    pub client_ip: Option<IpAddr>,
}

impl IncomingMessage {
    /// Creates the [`InboundMessage`] handed to the email entry point.
    ///
    /// Recipients are joined in sorted order so the `to` field is stable.
    pub fn to_inbound_message(&self) -> InboundMessage {
        let from = (!self.from.is_empty()).then(|| self.from.clone());
        let mut rcpts = self.rcpts.iter().map(String::as_str).collect::<Vec<_>>();
        rcpts.sort_unstable();
        let to = (!rcpts.is_empty()).then(|| rcpts.join(", "));

        let mut message = InboundMessage::new(from, to, self.raw.clone());
        message.client_ip = self.client_ip;
        message
    }
}
