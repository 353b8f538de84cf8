//! Server side of the SMTP dialogue with proxy clients.
//!
//! [`SmtpSession`] collects one envelope per transaction (authenticating
//! the client first when the [`AuthEngine`] requires it) and hands every
//! complete transaction to the [`EnvelopeHandler`]. The session survives
//! failed transactions, only `QUIT`, end of stream or I/O errors end it.

use std::{io, mem::take, net::SocketAddr, sync::Arc};

use base64::{engine::general_purpose, Engine as _};
use tokio::io::{
    split, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufReader,
};
use tracing::{debug, info, warn};

use crate::{
    AuthCredential, AuthEngine, AuthMechanism, Envelope, EnvelopeHandler, MessageContent,
};

/// Largest message accepted after `DATA`, in bytes.
pub const MAX_DATA_SIZE: usize = 32 * 1024 * 1024;

/// Longest command or `AUTH` response line accepted, terminator included.
pub const MAX_LINE_LEN: usize = 4096;

/// Bytes read at once from a message line during `DATA`.
const DATA_CHUNK_LEN: usize = 8192;

/// Shared, read-only state used by every session.
pub struct SessionContext {
    /// Name announced in the greeting and the `EHLO` reply.
    pub hostname: String,
    pub auth: Arc<dyn AuthEngine>,
    pub handler: EnvelopeHandler,
    /// Whether the server can upgrade connections with `STARTTLS`.
    pub tls_available: bool,
}

/// How a call to [`SmtpSession::run`] ended.
#[derive(Debug)]
pub enum SessionEnd<S> {
    /// The client quit or the connection went away.
    Closed,
    /// The client asked for `STARTTLS`; the stream is handed back for the
    /// handshake and the session expects to be run again on the
    /// encrypted stream.
    StartTls(S),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Represents a single SMTP session, created for each incoming connection.
pub struct SmtpSession {
    context: Arc<SessionContext>,
    peer: Option<SocketAddr>,
    greeted: bool,
    helo: Option<String>,
    mail_from: Option<String>,
    rcpt_tos: Vec<String>,
    authenticated: bool,
    encrypted: bool,
}

impl SmtpSession {
    pub fn new(context: Arc<SessionContext>, peer: Option<SocketAddr>) -> Self {
        Self {
            context,
            peer,
            greeted: false,
            helo: None,
            mail_from: None,
            rcpt_tos: Vec::new(),
            authenticated: false,
            encrypted: false,
        }
    }

    /// Drives the dialogue over `stream` until the client quits, the
    /// stream closes or the client requests `STARTTLS`.
    pub async fn run<S>(&mut self, stream: S) -> io::Result<SessionEnd<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = Vec::with_capacity(1024);

        if !self.greeted {
            let greeting = format!("{} ESMTP subrelay", self.context.hostname);
            self.write_response(&mut writer, 220, &greeting).await?;
            self.greeted = true;
        }

        loop {
            line.clear();
            if read_line_capped(&mut reader, &mut line, MAX_LINE_LEN).await? == 0 {
                debug!(peer = ?self.peer, "Client closed the connection");
                return Ok(SessionEnd::Closed);
            }
            if is_truncated(&line, MAX_LINE_LEN) {
                warn!(peer = ?self.peer, "Command line too long");
                if !discard_line(&mut reader).await? {
                    return Ok(SessionEnd::Closed);
                }
                self.write_response(&mut writer, 500, "5.5.2 Error: line too long")
                    .await?;
                continue;
            }

            let (command, argument) = parse_command(&line);
            if command == "AUTH" {
                debug!(tls = self.encrypted, "<< AUTH {}", first_word(&argument));
            } else {
                debug!(tls = self.encrypted, "<< {}", String::from_utf8_lossy(&line).trim_end());
            }

            if command == "STARTTLS" {
                if !argument.is_empty() {
                    self.write_response(&mut writer, 501, "5.5.4 Syntax: STARTTLS")
                        .await?;
                } else if self.encrypted {
                    self.write_response(&mut writer, 503, "5.5.1 Already using TLS")
                        .await?;
                } else if !self.context.tls_available {
                    self.write_response(&mut writer, 454, "4.7.0 TLS not available")
                        .await?;
                } else {
                    self.write_response(&mut writer, 220, "2.0.0 Ready to start TLS")
                        .await?;
                    self.encrypted = true;
                    self.helo = None;
                    self.authenticated = false;
                    self.reset_transaction();
                    return Ok(SessionEnd::StartTls(reader.into_inner().unsplit(writer)));
                }
                continue;
            }

            let flow = self
                .handle_command(&mut reader, &mut writer, &command, &argument)
                .await?;
            if flow == Flow::Quit {
                return Ok(SessionEnd::Closed);
            }
        }
    }

    /// Base handler for the SMTP commands, should concentrate all the
    /// command handling in a single place for better maintainability.
    async fn handle_command<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        command: &str,
        argument: &str,
    ) -> io::Result<Flow>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match command {
            "EHLO" => self.handle_ehlo(writer, argument).await?,
            "HELO" => self.handle_helo(writer, argument).await?,
            "AUTH" => return self.handle_auth(reader, writer, argument).await,
            "MAIL" => self.handle_mail(writer, argument).await?,
            "RCPT" => self.handle_rcpt(writer, argument).await?,
            "DATA" => return self.handle_data(reader, writer, argument).await,
            "RSET" => {
                self.reset_transaction();
                self.write_response(writer, 250, "OK").await?;
            }
            "NOOP" => self.write_response(writer, 250, "OK").await?,
            "HELP" => {
                self.write_response(
                    writer,
                    250,
                    "Supported commands: AUTH DATA EHLO HELO HELP MAIL NOOP QUIT RCPT RSET STARTTLS",
                )
                .await?
            }
            "QUIT" => {
                self.write_response(writer, 221, "Bye").await?;
                return Ok(Flow::Quit);
            }
            "" => self.write_response(writer, 500, "Error: bad syntax").await?,
            _ => {
                self.write_response(writer, 502, "Command not implemented")
                    .await?
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_ehlo<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        argument: &str,
    ) -> io::Result<()> {
        if argument.is_empty() {
            return self.write_response(writer, 501, "Syntax: EHLO hostname").await;
        }
        self.helo = Some(argument.to_string());
        self.reset_transaction();

        let mut lines = vec![
            self.context.hostname.as_str(),
            "8BITMIME",
            "SMTPUTF8",
            "AUTH LOGIN PLAIN",
        ];
        if self.context.tls_available && !self.encrypted {
            lines.push("STARTTLS");
        }
        lines.push("HELP");
        self.write_multiple(writer, 250, &lines).await
    }

    async fn handle_helo<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        argument: &str,
    ) -> io::Result<()> {
        if argument.is_empty() {
            return self.write_response(writer, 501, "Syntax: HELO hostname").await;
        }
        self.helo = Some(argument.to_string());
        self.reset_transaction();
        let hostname = self.context.hostname.clone();
        self.write_response(writer, 250, &hostname).await
    }

    async fn handle_auth<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        argument: &str,
    ) -> io::Result<Flow>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.helo.is_none() {
            self.write_response(writer, 503, "5.5.1 Error: send HELO first")
                .await?;
            return Ok(Flow::Continue);
        }
        if self.authenticated {
            self.write_response(writer, 503, "5.5.1 Already authenticated")
                .await?;
            return Ok(Flow::Continue);
        }

        let mut parts = argument.split_whitespace();
        let Some(mechanism) = parts.next() else {
            self.write_response(writer, 501, "5.5.4 Syntax: AUTH mechanism")
                .await?;
            return Ok(Flow::Continue);
        };
        let mechanism = mechanism.parse::<AuthMechanism>().unwrap_or_else(|e| match e {});
        let initial = parts.next();

        let credential = match mechanism {
            AuthMechanism::Login => {
                let username = match initial {
                    Some("=") => AuthInput::Value(String::new()),
                    Some(value) => AuthInput::decode(value),
                    None => self.prompt(reader, writer, "VXNlcm5hbWU6").await?,
                };
                let username = match username {
                    AuthInput::Value(username) => username,
                    other => return self.auth_input_failure(writer, other).await,
                };
                match self.prompt(reader, writer, "UGFzc3dvcmQ6").await? {
                    AuthInput::Value(password) => AuthCredential::new(username, password),
                    other => return self.auth_input_failure(writer, other).await,
                }
            }
            AuthMechanism::Plain => {
                let response = match initial {
                    Some("=") => AuthInput::Value(String::new()),
                    Some(value) => AuthInput::decode(value),
                    None => self.prompt(reader, writer, "").await?,
                };
                let response = match response {
                    AuthInput::Value(response) => response,
                    other => return self.auth_input_failure(writer, other).await,
                };
                match split_plain(&response) {
                    Some(credential) => credential,
                    None => {
                        self.write_response(writer, 501, "5.5.2 Can't split auth value")
                            .await?;
                        return Ok(Flow::Continue);
                    }
                }
            }
            AuthMechanism::Other(_) => AuthCredential::new("", ""),
        };

        let outcome = self.context.auth.authenticate(&mechanism, &credential);
        if outcome.success {
            self.authenticated = true;
            self.write_response(writer, 235, "2.7.0 Authentication successful")
                .await?;
        } else if outcome.handled {
            let message = outcome.message.unwrap_or_default();
            self.write_response(writer, 535, &message).await?;
        } else if matches!(mechanism, AuthMechanism::Other(_)) {
            self.write_response(writer, 504, "5.5.4 Unrecognized authentication type")
                .await?;
        } else {
            self.write_response(writer, 535, "5.7.8 Authentication credentials invalid")
                .await?;
        }
        Ok(Flow::Continue)
    }

    async fn prompt<R, W>(&self, reader: &mut R, writer: &mut W, challenge: &str) -> io::Result<AuthInput>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.write_response(writer, 334, challenge).await?;
        let mut line = Vec::new();
        if read_line_capped(reader, &mut line, MAX_LINE_LEN).await? == 0 {
            return Ok(AuthInput::Closed);
        }
        if is_truncated(&line, MAX_LINE_LEN) {
            if !discard_line(reader).await? {
                return Ok(AuthInput::Closed);
            }
            return Ok(AuthInput::Undecodable);
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text == "*" {
            return Ok(AuthInput::Cancelled);
        }
        Ok(AuthInput::decode(text))
    }

    async fn auth_input_failure<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        input: AuthInput,
    ) -> io::Result<Flow> {
        match input {
            AuthInput::Closed => return Ok(Flow::Quit),
            AuthInput::Cancelled => {
                self.write_response(writer, 501, "5.7.0 Auth aborted").await?
            }
            AuthInput::Undecodable | AuthInput::Value(_) => {
                self.write_response(writer, 501, "5.5.2 Can't decode base64")
                    .await?
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_mail<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        argument: &str,
    ) -> io::Result<()> {
        if let Some((code, message)) = self.transaction_gate() {
            return self.write_response(writer, code, message).await;
        }
        if self.mail_from.is_some() {
            return self
                .write_response(writer, 503, "5.5.1 Error: nested MAIL command")
                .await;
        }

        let Some((path, params)) = strip_keyword(argument, "FROM:").and_then(parse_path) else {
            return self
                .write_response(writer, 501, "5.5.4 Syntax: MAIL FROM: <address>")
                .await;
        };

        for param in params.split_whitespace() {
            let (key, value) = param.split_once('=').unwrap_or((param, ""));
            match key.to_ascii_uppercase().as_str() {
                "SMTPUTF8" if value.is_empty() => {}
                "BODY" if matches!(value.to_ascii_uppercase().as_str(), "7BIT" | "8BITMIME") => {}
                "SIZE" => match value.parse::<usize>() {
                    Ok(size) if size <= MAX_DATA_SIZE => {}
                    Ok(_) => {
                        return self
                            .write_response(
                                writer,
                                552,
                                "5.3.4 Error: message size exceeds fixed maximum message size",
                            )
                            .await
                    }
                    Err(_) => {
                        return self
                            .write_response(writer, 501, "5.5.4 Syntax: SIZE=<number>")
                            .await
                    }
                },
                _ => {
                    return self
                        .write_response(
                            writer,
                            555,
                            "5.5.4 MAIL FROM parameters not recognized or not implemented",
                        )
                        .await
                }
            }
        }

        debug!(mail_from = %path, "Sender accepted");
        self.mail_from = Some(path);
        self.write_response(writer, 250, "OK").await
    }

    async fn handle_rcpt<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        argument: &str,
    ) -> io::Result<()> {
        if let Some((code, message)) = self.transaction_gate() {
            return self.write_response(writer, code, message).await;
        }
        if self.mail_from.is_none() {
            return self
                .write_response(writer, 503, "5.5.1 Error: need MAIL command")
                .await;
        }

        let Some((path, params)) = strip_keyword(argument, "TO:").and_then(parse_path) else {
            return self
                .write_response(writer, 501, "5.5.4 Syntax: RCPT TO: <address>")
                .await;
        };
        if path.is_empty() {
            return self
                .write_response(writer, 501, "5.5.4 Syntax: RCPT TO: <address>")
                .await;
        }
        if !params.trim().is_empty() {
            return self
                .write_response(
                    writer,
                    555,
                    "5.5.4 RCPT TO parameters not recognized or not implemented",
                )
                .await;
        }

        debug!(rcpt_to = %path, "Recipient accepted");
        self.rcpt_tos.push(path);
        self.write_response(writer, 250, "OK").await
    }

    async fn handle_data<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        argument: &str,
    ) -> io::Result<Flow>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if let Some((code, message)) = self.transaction_gate() {
            self.write_response(writer, code, message).await?;
            return Ok(Flow::Continue);
        }
        if !argument.is_empty() {
            self.write_response(writer, 501, "5.5.4 Syntax: DATA").await?;
            return Ok(Flow::Continue);
        }
        if self.mail_from.is_none() {
            self.write_response(writer, 503, "5.5.1 Error: need MAIL command")
                .await?;
            return Ok(Flow::Continue);
        }
        if self.rcpt_tos.is_empty() {
            self.write_response(writer, 503, "5.5.1 Error: need RCPT command")
                .await?;
            return Ok(Flow::Continue);
        }

        self.write_response(writer, 354, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let mut data = Vec::new();
        let mut line = Vec::with_capacity(1024);
        let mut too_big = false;
        let mut line_start = true;
        loop {
            line.clear();
            if read_line_capped(reader, &mut line, DATA_CHUNK_LEN).await? == 0 {
                warn!(peer = ?self.peer, "Connection closed during DATA");
                return Ok(Flow::Quit);
            }
            // Long lines arrive in chunks, only the first one starts a line
            let at_line_start = line_start;
            line_start = line.ends_with(b"\n");
            if at_line_start && (line == b".\r\n" || line == b".\n") {
                break;
            }
            // Remove the transparency dot added by the client
            let chunk = match line.first() {
                Some(b'.') if at_line_start => &line[1..],
                _ => &line[..],
            };
            if too_big || data.len() + chunk.len() > MAX_DATA_SIZE {
                too_big = true;
                continue;
            }
            data.extend_from_slice(chunk);
        }

        let envelope = Envelope {
            mail_from: self.mail_from.take().unwrap_or_default(),
            rcpt_tos: take(&mut self.rcpt_tos),
            content: MessageContent::Bytes(data),
            peer: self.peer,
        };

        if too_big {
            self.write_response(writer, 552, "5.3.4 Error: Too much mail data")
                .await?;
            return Ok(Flow::Continue);
        }

        info!(
            peer = ?self.peer,
            mail_from = %envelope.mail_from,
            recipients = envelope.rcpt_tos.len(),
            "Message received"
        );
        let reply = self.context.handler.handle(envelope).await;
        self.write_response(writer, reply.code, &reply.message)
            .await?;
        Ok(Flow::Continue)
    }

    /// Checks the preconditions shared by `MAIL`, `RCPT` and `DATA`.
    fn transaction_gate(&self) -> Option<(u16, &'static str)> {
        if self.helo.is_none() {
            return Some((503, "5.5.1 Error: send HELO first"));
        }
        if self.context.auth.auth_required() && !self.authenticated {
            return Some((530, "5.7.0 Authentication required"));
        }
        None
    }

    fn reset_transaction(&mut self) {
        self.mail_from = None;
        self.rcpt_tos.clear();
    }

    async fn write_inner<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
        separator: &str,
    ) -> io::Result<()> {
        debug!(tls = self.encrypted, ">> {code}{separator}{message}");
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

/// Reads up to `limit` bytes of one line into `buf`, returning the number
/// of bytes read (zero at end of stream).
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    (&mut *reader).take(limit as u64).read_until(b'\n', buf).await
}

/// Whether a capped read stopped at the limit before the line ended.
fn is_truncated(line: &[u8], limit: usize) -> bool {
    line.len() >= limit && !line.ends_with(b"\n")
}

/// Skips the rest of the current line. Returns `false` when the stream
/// ends first.
async fn discard_line<R>(reader: &mut R) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    let mut scratch = Vec::with_capacity(MAX_LINE_LEN);
    loop {
        scratch.clear();
        if read_line_capped(reader, &mut scratch, MAX_LINE_LEN).await? == 0 {
            return Ok(false);
        }
        if scratch.ends_with(b"\n") {
            return Ok(true);
        }
    }
}

/// A client answer during an `AUTH` exchange.
enum AuthInput {
    Value(String),
    Cancelled,
    Undecodable,
    Closed,
}

impl AuthInput {
    fn decode(value: &str) -> Self {
        match general_purpose::STANDARD.decode(value.trim()) {
            Ok(bytes) => AuthInput::Value(String::from_utf8_lossy(&bytes).into_owned()),
            Err(_) => AuthInput::Undecodable,
        }
    }
}

/// Splits a decoded `PLAIN` response (`authzid NUL authcid NUL passwd`).
fn split_plain(response: &str) -> Option<AuthCredential> {
    let mut parts = response.split('\0');
    let _authzid = parts.next()?;
    let username = parts.next()?;
    let password = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some(AuthCredential::new(username, password))
}

/// Splits a raw command line into the upper-cased verb and its argument.
fn parse_command(line: &[u8]) -> (String, String) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    match text.split_once(char::is_whitespace) {
        Some((command, argument)) => (command.to_ascii_uppercase(), argument.trim().to_string()),
        None => (text.to_ascii_uppercase(), String::new()),
    }
}

fn first_word(text: &str) -> &str {
    text.split_whitespace().next().unwrap_or_default()
}

/// Strips a case-insensitive keyword such as `FROM:` from the argument.
fn strip_keyword<'a>(argument: &'a str, keyword: &str) -> Option<&'a str> {
    let head = argument.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| argument[keyword.len()..].trim_start())
}

/// Splits `<path> params` (angle brackets optional) into the path and the
/// remaining parameter string.
fn parse_path(text: &str) -> Option<(String, &str)> {
    if let Some(rest) = text.strip_prefix('<') {
        let close = rest.find('>')?;
        Some((rest[..close].trim().to_string(), &rest[close + 1..]))
    } else {
        let mut parts = text.splitn(2, char::is_whitespace);
        let path = parts.next().filter(|path| !path.is_empty())?;
        Some((path.to_string(), parts.next().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::{
        io::{DuplexStream, ReadHalf, WriteHalf},
        task::JoinHandle,
    };

    use super::*;
    use crate::{
        ForwardError, ForwardResult, Forwarder, LoginCredentials, ProxyConfig,
        SingleIdentityAuthEngine, UpstreamTransport,
    };

    type Sent = (String, Vec<String>, Vec<u8>);

    /// Transport failing the first `failures` sends, then succeeding.
    struct FlakyTransport {
        failures: Mutex<usize>,
        sent: Mutex<Vec<Sent>>,
    }

    impl FlakyTransport {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl UpstreamTransport for FlakyTransport {
        fn send(&self, sender: &str, recipients: &[String], message: &[u8]) -> ForwardResult<()> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ForwardError::Transport("connection refused".to_string()));
            }
            self.sent.lock().unwrap().push((
                sender.to_string(),
                recipients.to_vec(),
                message.to_vec(),
            ));
            Ok(())
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }

        async fn reply(&mut self) -> (u16, Vec<String>) {
            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                self.reader.read_line(&mut line).await.unwrap();
                let line = line.trim_end();
                let code = line[..3].parse().unwrap();
                lines.push(line.get(4..).unwrap_or_default().to_string());
                if line.as_bytes().get(3) != Some(&b'-') {
                    return (code, lines);
                }
            }
        }

        async fn command(&mut self, line: &str) -> (u16, Vec<String>) {
            self.send(line).await;
            self.reply().await
        }

        async fn code(&mut self, line: &str) -> u16 {
            self.command(line).await.0
        }
    }

    fn context(
        transport: Arc<FlakyTransport>,
        identity: Option<LoginCredentials>,
        tls_available: bool,
    ) -> Arc<SessionContext> {
        let config = ProxyConfig::from_vars([
            ("UPSTREAM_HOST", "smtp.example.net"),
            ("UPSTREAM_FROM", "relay@example.net"),
            ("PROXY_ALLOWED_SENDER", "alice@example.com"),
        ])
        .unwrap();
        Arc::new(SessionContext {
            hostname: "relay.test".to_string(),
            auth: Arc::new(SingleIdentityAuthEngine::new(identity)),
            handler: EnvelopeHandler::new(Arc::new(config), Forwarder::new(transport, 2)),
            tls_available,
        })
    }

    async fn start(
        context: Arc<SessionContext>,
    ) -> (Client, JoinHandle<io::Result<SessionEnd<DuplexStream>>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            let mut session = SmtpSession::new(context, None);
            session.run(server).await
        });
        let (reader, writer) = split(client);
        let mut client = Client {
            reader: BufReader::new(reader),
            writer,
        };
        let (code, lines) = client.reply().await;
        assert_eq!(code, 220);
        assert_eq!(lines, vec!["relay.test ESMTP subrelay".to_string()]);
        (client, handle)
    }

    async fn send_message(client: &mut Client, body: &str) -> (u16, Vec<String>) {
        assert_eq!(client.code("DATA").await, 354);
        client.send(&format!("{body}\r\n.")).await;
        client.reply().await
    }

    fn b64(value: &str) -> String {
        general_purpose::STANDARD.encode(value)
    }

    #[tokio::test]
    async fn test_full_transaction_without_auth() {
        let transport = FlakyTransport::new(0);
        let (mut client, handle) = start(context(transport.clone(), None, false)).await;

        let (code, lines) = client.command("EHLO client.test").await;
        assert_eq!(code, 250);
        assert_eq!(lines[0], "relay.test");
        assert!(lines.contains(&"AUTH LOGIN PLAIN".to_string()));
        assert!(lines.contains(&"SMTPUTF8".to_string()));
        assert!(lines.contains(&"8BITMIME".to_string()));
        assert!(!lines.contains(&"STARTTLS".to_string()));

        assert_eq!(
            client
                .code("MAIL FROM:<alice@example.com> BODY=8BITMIME SMTPUTF8")
                .await,
            250
        );
        assert_eq!(client.code("RCPT TO:<bob@other.org>").await, 250);
        assert_eq!(client.code("RCPT TO:<carol@third.net>").await, 250);
        let (code, lines) = send_message(
            &mut client,
            "From: Alice <alice@example.com>\r\nSubject: Hi\r\n\r\nHello\r\n..leading dot",
        )
        .await;
        assert_eq!(code, 250);
        assert_eq!(lines, vec!["OK".to_string()]);

        assert_eq!(client.code("QUIT").await, 221);
        assert!(matches!(handle.await.unwrap().unwrap(), SessionEnd::Closed));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "relay@example.net");
        assert_eq!(
            sent[0].1,
            vec![
                "alice+bob=other.org@example.com".to_string(),
                "alice+carol=third.net@example.com".to_string(),
            ]
        );
        assert_eq!(
            sent[0].2,
            b"From: relay@example.net\r\nSubject: Hi\r\n\r\nHello\r\n.leading dot\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_auth_required_before_mail() {
        let transport = FlakyTransport::new(0);
        let identity = Some(LoginCredentials::new("proxy", "s3cret"));
        let (mut client, _handle) = start(context(transport, identity, false)).await;

        assert_eq!(client.code("EHLO client.test").await, 250);
        assert_eq!(client.code("MAIL FROM:<alice@example.com>").await, 530);
        assert_eq!(client.code("RCPT TO:<bob@other.org>").await, 530);

        let (code, lines) = client.command("AUTH LOGIN").await;
        assert_eq!((code, lines[0].as_str()), (334, "VXNlcm5hbWU6"));
        let (code, lines) = client.command(&b64("proxy")).await;
        assert_eq!((code, lines[0].as_str()), (334, "UGFzc3dvcmQ6"));
        assert_eq!(client.code(&b64("s3cret")).await, 235);

        assert_eq!(client.code("AUTH LOGIN").await, 503);
        assert_eq!(client.code("MAIL FROM:<alice@example.com>").await, 250);
    }

    #[tokio::test]
    async fn test_auth_login_with_initial_username() {
        let identity = Some(LoginCredentials::new("proxy", "s3cret"));
        let (mut client, _handle) = start(context(FlakyTransport::new(0), identity, false)).await;

        assert_eq!(client.code("EHLO client.test").await, 250);
        let (code, _) = client.command(&format!("AUTH LOGIN {}", b64("proxy"))).await;
        assert_eq!(code, 334);
        assert_eq!(client.code(&b64("wrong")).await, 535);
        assert_eq!(client.code("MAIL FROM:<alice@example.com>").await, 530);
    }

    #[tokio::test]
    async fn test_auth_plain() {
        let identity = Some(LoginCredentials::new("proxy", "s3cret"));
        let (mut client, _handle) = start(context(FlakyTransport::new(0), identity, false)).await;

        assert_eq!(client.code("EHLO client.test").await, 250);
        let wrong = b64("\0proxy\0guess");
        let (code, lines) = client.command(&format!("AUTH PLAIN {wrong}")).await;
        assert_eq!(code, 535);
        assert_eq!(lines[0], "5.7.8 Authentication credentials invalid");

        assert_eq!(client.code("AUTH PLAIN").await, 334);
        assert_eq!(client.code(&b64("\0proxy\0s3cret")).await, 235);
    }

    #[tokio::test]
    async fn test_auth_unsupported_and_malformed() {
        let identity = Some(LoginCredentials::new("proxy", "s3cret"));
        let (mut client, _handle) = start(context(FlakyTransport::new(0), identity, false)).await;

        assert_eq!(client.code("EHLO client.test").await, 250);
        assert_eq!(client.code("AUTH CRAM-MD5").await, 504);
        assert_eq!(client.code("AUTH").await, 501);
        assert_eq!(client.code("AUTH PLAIN !!!notbase64").await, 501);
        assert_eq!(client.code(&format!("AUTH PLAIN {}", b64("no-separators"))).await, 501);

        assert_eq!(client.code("AUTH LOGIN").await, 334);
        assert_eq!(client.code("*").await, 501);
        assert_eq!(client.code("NOOP").await, 250);
    }

    #[tokio::test]
    async fn test_upstream_failure_keeps_connection_usable() {
        let transport = FlakyTransport::new(1);
        let (mut client, handle) = start(context(transport.clone(), None, false)).await;

        assert_eq!(client.code("EHLO client.test").await, 250);
        assert_eq!(client.code("MAIL FROM:<alice@example.com>").await, 250);
        assert_eq!(client.code("RCPT TO:<bob@other.org>").await, 250);
        let (code, lines) = send_message(&mut client, "Subject: one\r\n\r\nfirst").await;
        assert_eq!(code, 550);
        assert_eq!(lines[0], "Message could not be forwarded: Failed to send");

        assert_eq!(client.code("MAIL FROM:<alice@example.com>").await, 250);
        assert_eq!(client.code("RCPT TO:<bob@other.org>").await, 250);
        let (code, _) = send_message(&mut client, "Subject: two\r\n\r\nsecond").await;
        assert_eq!(code, 250);

        assert_eq!(client.code("QUIT").await, 221);
        handle.await.unwrap().unwrap();
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_sender_not_allowed() {
        let transport = FlakyTransport::new(0);
        let (mut client, _handle) = start(context(transport.clone(), None, false)).await;

        assert_eq!(client.code("HELO client.test").await, 250);
        assert_eq!(client.code("MAIL FROM:<mallory@example.com>").await, 250);
        assert_eq!(client.code("RCPT TO:<bob@other.org>").await, 250);
        let (code, lines) = send_message(&mut client, "Subject: x\r\n\r\nbody").await;
        assert_eq!(code, 550);
        assert_eq!(lines[0], "Message could not be forwarded: Sender not allowed");
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_command_sequencing() {
        let (mut client, _handle) = start(context(FlakyTransport::new(0), None, false)).await;

        assert_eq!(client.code("MAIL FROM:<alice@example.com>").await, 503);
        assert_eq!(client.code("EHLO").await, 501);
        assert_eq!(client.code("EHLO client.test").await, 250);
        assert_eq!(client.code("RCPT TO:<bob@other.org>").await, 503);
        assert_eq!(client.code("DATA").await, 503);
        assert_eq!(client.code("MAIL FROM alice@example.com").await, 501);
        assert_eq!(client.code("MAIL FROM:<alice@example.com> FOO=BAR").await, 555);
        assert_eq!(client.code("MAIL FROM:<alice@example.com> SIZE=99999999999").await, 552);
        assert_eq!(client.code("MAIL FROM:alice@example.com SIZE=1024").await, 250);
        assert_eq!(client.code("MAIL FROM:<alice@example.com>").await, 503);
        assert_eq!(client.code("DATA").await, 503);
        assert_eq!(client.code("RCPT TO:<>").await, 501);
        assert_eq!(client.code("RCPT TO:<bob@other.org> NOTIFY=NEVER").await, 555);
        assert_eq!(client.code("RSET").await, 250);
        assert_eq!(client.code("RCPT TO:<bob@other.org>").await, 503);
        assert_eq!(client.code("VRFY bob").await, 502);
        assert_eq!(client.code("HELP").await, 250);
    }

    #[tokio::test]
    async fn test_starttls_not_available() {
        let (mut client, _handle) = start(context(FlakyTransport::new(0), None, false)).await;
        assert_eq!(client.code("EHLO client.test").await, 250);
        assert_eq!(client.code("STARTTLS").await, 454);
    }

    #[tokio::test]
    async fn test_starttls_hands_stream_back() {
        let (mut client, handle) = start(context(FlakyTransport::new(0), None, true)).await;

        let (_, lines) = client.command("EHLO client.test").await;
        assert!(lines.contains(&"STARTTLS".to_string()));
        assert_eq!(client.code("STARTTLS").await, 220);
        assert!(matches!(
            handle.await.unwrap().unwrap(),
            SessionEnd::StartTls(_)
        ));
    }

    #[tokio::test]
    async fn test_auth_login_empty_initial_response() {
        let identity = Some(LoginCredentials::new("proxy", "s3cret"));
        let (mut client, _handle) = start(context(FlakyTransport::new(0), identity, false)).await;

        assert_eq!(client.code("EHLO client.test").await, 250);
        let (code, lines) = client.command("AUTH LOGIN =").await;
        assert_eq!((code, lines[0].as_str()), (334, "UGFzc3dvcmQ6"));
        assert_eq!(client.code(&b64("s3cret")).await, 535);
    }

    #[tokio::test]
    async fn test_long_command_line_is_rejected() {
        let (mut client, _handle) = start(context(FlakyTransport::new(0), None, false)).await;

        let long = format!("NOOP {}", "x".repeat(3 * MAX_LINE_LEN));
        let (code, lines) = client.command(&long).await;
        assert_eq!(code, 500);
        assert_eq!(lines[0], "5.5.2 Error: line too long");
        assert_eq!(client.code("NOOP").await, 250);
    }

    #[tokio::test]
    async fn test_long_auth_response_is_rejected() {
        let identity = Some(LoginCredentials::new("proxy", "s3cret"));
        let (mut client, _handle) = start(context(FlakyTransport::new(0), identity, false)).await;

        assert_eq!(client.code("EHLO client.test").await, 250);
        assert_eq!(client.code("AUTH LOGIN").await, 334);
        assert_eq!(client.code(&"A".repeat(2 * MAX_LINE_LEN)).await, 501);
        assert_eq!(client.code("NOOP").await, 250);
    }

    #[tokio::test]
    async fn test_long_data_lines_are_read_in_chunks() {
        let transport = FlakyTransport::new(0);
        let (mut client, _handle) = start(context(transport.clone(), None, false)).await;

        assert_eq!(client.code("EHLO client.test").await, 250);
        assert_eq!(client.code("MAIL FROM:<alice@example.com>").await, 250);
        assert_eq!(client.code("RCPT TO:<bob@other.org>").await, 250);

        let long = "a".repeat(100_000);
        // The dot lands at the start of the second chunk, mid-line
        let boundary = format!("{}.", "b".repeat(DATA_CHUNK_LEN));
        let body = format!("Subject: long\r\n\r\n{long}\r\n{boundary}\r\n..dot");
        let (code, _) = send_message(&mut client, &body).await;
        assert_eq!(code, 250);

        let expected = format!("\r\n\r\n{long}\r\n{boundary}\r\n.dot\r\n");
        let sent = transport.sent();
        assert!(sent[0].2.ends_with(expected.as_bytes()));
    }

    #[tokio::test]
    async fn test_eof_closes_session() {
        let (client, handle) = start(context(FlakyTransport::new(0), None, false)).await;
        drop(client);
        assert!(matches!(handle.await.unwrap().unwrap(), SessionEnd::Closed));
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command(b"mail FROM:<a@b.c>  SIZE=10\r\n"),
            ("MAIL".to_string(), "FROM:<a@b.c>  SIZE=10".to_string())
        );
        assert_eq!(parse_command(b"quit\r\n"), ("QUIT".to_string(), String::new()));
        assert_eq!(parse_command(b"\r\n"), (String::new(), String::new()));
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("<a@b.c> SIZE=10"),
            Some(("a@b.c".to_string(), " SIZE=10"))
        );
        assert_eq!(parse_path("a@b.c"), Some(("a@b.c".to_string(), "")));
        assert_eq!(parse_path("<>"), Some((String::new(), "")));
        assert_eq!(parse_path("<a@b.c"), None);
        assert_eq!(parse_path(""), None);
    }

    #[test]
    fn test_strip_keyword() {
        assert_eq!(strip_keyword("from: <a@b.c>", "FROM:"), Some("<a@b.c>"));
        assert_eq!(strip_keyword("TO:<a@b.c>", "FROM:"), None);
        assert_eq!(strip_keyword("FR", "FROM:"), None);
    }

    #[test]
    fn test_split_plain() {
        assert_eq!(
            split_plain("\0user\0pass"),
            Some(AuthCredential::new("user", "pass"))
        );
        assert_eq!(
            split_plain("admin\0user\0pass"),
            Some(AuthCredential::new("user", "pass"))
        );
        assert_eq!(split_plain("user"), None);
        assert_eq!(split_plain("a\0b\0c\0d"), None);
    }
}
