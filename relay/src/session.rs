use mailrelay_utils::{
    email, parse_smtp_path, Environment, ExecutionContext, Forwarder, IncomingMessage, RelayError,
};
use std::{collections::HashSet, io, mem::take, net::IpAddr, sync::Arc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Maximum accepted size of the message data, in bytes.
const MAX_MESSAGE_SIZE: usize = 25 * 1024 * 1024;

/// Maximum length of a command line, including the `<CR><LF>`.
const MAX_COMMAND_LINE: usize = 512;

/// Maximum length of a single line of message data, a longer line can
/// never fit in the size limit.
const MAX_DATA_LINE: usize = MAX_MESSAGE_SIZE + 2;

/// Result of reading one line with [`read_line_bounded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line {
    /// A line ending in `<LF>`, or the last bytes before the end of input.
    Complete,
    /// The line exceeded the limit, the rest of it was discarded.
    TooLong,
    /// Nothing left to read.
    Eof,
}

/// What the connection loop should do after a command was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading commands.
    Continue,
    /// The client asked to upgrade the connection to TLS.
    StartTls,
    /// The client quit or closed the connection.
    Close,
}

/// Represents a single SMTP session, created for each incoming connection.
///
/// Stores the envelope of the transaction in progress (sender and
/// recipients) and hands every completed transaction to the email entry
/// point, answering the client according to the outcome.
pub struct SmtpSession {
    hostname: String,
    forwarder: Arc<dyn Forwarder>,
    environment: fn() -> Environment,
    client_ip: Option<IpAddr>,
    from: Option<String>,
    rcpts: HashSet<String>,
    tls_available: bool,
    starttls: bool,
}

impl SmtpSession {
    /// Create a new SMTP session that reads the forwarding configuration
    /// from the process environment for every transaction.
    pub fn new(hostname: String, forwarder: Arc<dyn Forwarder>, client_ip: Option<IpAddr>) -> Self {
        Self {
            hostname,
            forwarder,
            environment: Environment::from_env,
            client_ip,
            from: None,
            rcpts: HashSet::new(),
            tls_available: false,
            starttls: false,
        }
    }

    /// Replaces the source of the forwarding configuration.
    pub fn with_environment(mut self, environment: fn() -> Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Advertises and accepts `STARTTLS`.
    pub fn with_tls(mut self, tls_available: bool) -> Self {
        self.tls_available = tls_available;
        self
    }

    /// Marks the session as running over TLS, the envelope is reset as
    /// required after a successful handshake.
    pub fn upgraded(&mut self) {
        self.starttls = true;
        self.reset();
    }

    pub async fn greet<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        let greeting = format!("{} Mailrelay SMTP", self.hostname);
        self.write_response(writer, 220, &greeting).await
    }

    /// Reads and handles commands until the client quits, closes the
    /// connection or requests a TLS upgrade.
    pub async fn run<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> io::Result<Flow> {
        let mut line = Vec::with_capacity(MAX_COMMAND_LINE);
        loop {
            match read_line_bounded(reader, &mut line, MAX_COMMAND_LINE).await? {
                Line::Complete => (),
                Line::TooLong => {
                    self.write_response(writer, 500, "Line too long").await?;
                    continue;
                }
                Line::Eof => return Ok(Flow::Close),
            }

            let text = String::from_utf8_lossy(&line);
            debug!(tls = self.starttls, "<< {}", text.trim_end());

            let cmd = text.trim_end();
            let (command, argument) = match cmd.split_once(' ') {
                Some((command, argument)) => (command.to_uppercase(), Some(argument.trim())),
                None => (cmd.to_uppercase(), None),
            };

            let flow = self
                .handle_command(reader, writer, &command, argument)
                .await?;
            if flow != Flow::Continue {
                return Ok(flow);
            }
        }
    }

    /// Base handler for the SMTP commands, concentrating all the command
    /// handling in a single place.
    async fn handle_command<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        command: &str,
        argument: Option<&str>,
    ) -> io::Result<Flow> {
        match command {
            "EHLO" => self.handle_ehlo(writer).await?,
            "HELO" => {
                let message = format!("{} greets you", self.hostname);
                self.write_response(writer, 250, &message).await?;
            }
            "MAIL" => self.handle_mail(writer, argument).await?,
            "RCPT" => self.handle_rcpt(writer, argument).await?,
            "DATA" => self.handle_data(reader, writer).await?,
            "RSET" => {
                self.reset();
                self.write_response(writer, 250, "OK").await?;
            }
            "NOOP" => self.write_response(writer, 250, "OK").await?,
            "STARTTLS" if self.tls_available && !self.starttls => {
                self.write_response(writer, 220, "Ready to start TLS").await?;
                return Ok(Flow::StartTls);
            }
            "QUIT" => {
                self.write_response(writer, 221, "Bye").await?;
                return Ok(Flow::Close);
            }
            _ => {
                debug!(command = %command, "Unknown command");
                self.write_response(writer, 502, "Command not implemented")
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_ehlo<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        let greeting = format!("{} greets you", self.hostname);
        let size = format!("SIZE {MAX_MESSAGE_SIZE}");
        let mut lines = vec![greeting.as_str(), size.as_str(), "8BITMIME"];
        if self.tls_available && !self.starttls {
            lines.push("STARTTLS");
        }
        self.write_multiple(writer, 250, &lines).await
    }

    async fn handle_mail<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        argument: Option<&str>,
    ) -> io::Result<()> {
        if self.from.is_some() {
            return self
                .write_response(writer, 503, "Sender already specified")
                .await;
        }
        match argument.and_then(|value| parse_smtp_path(value, "FROM:")) {
            Some(address) => {
                self.from = Some(address.to_string());
                self.write_response(writer, 250, "OK").await
            }
            None => {
                self.write_response(writer, 501, "Syntax error in parameters or arguments")
                    .await
            }
        }
    }

    async fn handle_rcpt<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        argument: Option<&str>,
    ) -> io::Result<()> {
        if self.from.is_none() {
            return self.write_response(writer, 503, "Need MAIL command").await;
        }
        match argument.and_then(|value| parse_smtp_path(value, "TO:")) {
            Some(address) if !address.is_empty() => {
                self.rcpts.insert(address.to_string());
                self.write_response(writer, 250, "OK").await
            }
            _ => {
                self.write_response(writer, 501, "Syntax error in parameters or arguments")
                    .await
            }
        }
    }

    async fn handle_data<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> io::Result<()> {
        if self.from.is_none() {
            return self.write_response(writer, 503, "Need MAIL command").await;
        }
        if self.rcpts.is_empty() {
            return self.write_response(writer, 554, "No valid recipients").await;
        }

        self.write_response(writer, 354, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let Some(raw) = read_data(reader).await? else {
            self.reset();
            return self
                .write_response(writer, 552, "Message size exceeds fixed maximum")
                .await;
        };

        let incoming = IncomingMessage {
            from: take(&mut self.from).unwrap_or_default(),
            rcpts: take(&mut self.rcpts),
            raw,
            client_ip: self.client_ip,
        };
        let message = incoming.to_inbound_message();
        info!(
            message_id = %message.message_id,
            from = %incoming.from,
            rcpts = incoming.rcpts.len(),
            size = incoming.raw.len(),
            "Received email"
        );

        let ctx = ExecutionContext::new();
        let env = (self.environment)();
        let result = email(Some(&message), &env, self.forwarder.clone(), &ctx).await;
        ctx.settle().await;

        match result {
            Ok(outcome) => {
                debug!(message_id = %message.message_id, outcome = ?outcome, "Email handled");
                self.write_response(writer, 250, "Message accepted").await
            }
            Err(RelayError::Config(e)) => {
                warn!(message_id = %message.message_id, error = %e, "Email not forwarded");
                self.write_response(writer, 451, "Local error in processing")
                    .await
            }
            Err(RelayError::Dispatch(e)) => {
                warn!(message_id = %message.message_id, error = %e, "Email not forwarded");
                self.write_response(writer, 451, "Requested action aborted: forward failed")
                    .await
            }
        }
    }

    fn reset(&mut self) {
        self.from = None;
        self.rcpts.clear();
    }

    async fn write_inner<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
        separator: &str,
    ) -> io::Result<()> {
        debug!(tls = self.starttls, ">> {code}{separator}{message}");
        writer
            .write_all(format!("{code}{separator}{message}\r\n").as_bytes())
            .await?;
        writer.flush().await
    }

    async fn write_response<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
    ) -> io::Result<()> {
        self.write_inner(writer, code, message, " ").await
    }

    async fn write_multiple<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        messages: &[&str],
    ) -> io::Result<()> {
        for (index, message) in messages.iter().enumerate() {
            let is_last = index == messages.len() - 1;
            let separator = if is_last { " " } else { "-" };
            self.write_inner(writer, code, message, separator).await?;
        }
        Ok(())
    }
}

/// Reads a single line into `line`, keeping at most `limit` bytes.
///
/// The bytes of a longer line are consumed up to its `<LF>` without being
/// stored, so the memory used stays bounded whatever the client sends.
async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut Vec<u8>,
    limit: usize,
) -> io::Result<Line> {
    line.clear();
    let read = (&mut *reader).take(limit as u64).read_until(b'\n', line).await?;
    if read == 0 {
        return Ok(Line::Eof);
    }
    if line.ends_with(b"\n") || read < limit {
        return Ok(Line::Complete);
    }

    let mut discarded = Vec::with_capacity(limit.min(4096));
    loop {
        discarded.clear();
        let read = (&mut *reader)
            .take(4096)
            .read_until(b'\n', &mut discarded)
            .await?;
        if read == 0 || discarded.ends_with(b"\n") {
            return Ok(Line::TooLong);
        }
    }
}

/// Reads the message data up to the `<CR><LF>.<CR><LF>` terminator,
/// removing dot-stuffing. The bytes are returned as received.
///
/// Returns `None` when the data exceeds [`MAX_MESSAGE_SIZE`], the data is
/// still consumed up to the terminator so the session can continue.
async fn read_data<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut data = Vec::<u8>::new();
    let mut line = Vec::<u8>::new();
    let mut oversized = false;

    loop {
        match read_line_bounded(reader, &mut line, MAX_DATA_LINE).await? {
            Line::Complete => (),
            Line::TooLong => {
                oversized = true;
                continue;
            }
            Line::Eof => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during DATA",
                ))
            }
        }
        if line == b".\r\n" || line == b".\n" {
            break;
        }
        if oversized {
            continue;
        }
        let content = line.strip_prefix(b".").unwrap_or(&line);
        if data.len() + content.len() > MAX_MESSAGE_SIZE {
            oversized = true;
            continue;
        }
        data.extend_from_slice(content);
    }

    if oversized {
        return Ok(None);
    }

    // Drop the line break that belongs to the terminator sequence
    if data.ends_with(b"\r\n") {
        data.truncate(data.len() - 2);
    } else if data.ends_with(b"\n") {
        data.truncate(data.len() - 1);
    }

    Ok(Some(data))
}
