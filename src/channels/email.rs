//! Email channel — IMAP polling for inbound, SMTP via lettre for outbound.
//!
//! Implements both `Mailbox` and `ActionExecutor` over a Gmail-style
//! server: unread fetch uses `UID SEARCH UNSEEN` with a peek fetch (so
//! nothing is marked read until the pipeline resolves it), replies go
//! out over SMTP with proper threading headers, drafts are APPENDed to
//! the drafts folder, labels use the X-GM-LABELS extension, and
//! archiving sets `\Deleted` and expunges.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox as LettreMailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::MessageParser;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{ActionExecutor, Mailbox};
use crate::error::{ConfigError, ExecutorError, MailboxError};
use crate::pipeline::types::{ActionKind, InboundEmail};

// ── Configuration ───────────────────────────────────────────────────

/// Email server configuration, built from environment variables.
/// Credentials never pass through the config file.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub drafts_mailbox: String,
}

impl EmailConfig {
    /// Build config from environment variables.
    ///
    /// `EMAIL_IMAP_HOST`, `EMAIL_USERNAME`, and `EMAIL_PASSWORD` are
    /// required; the rest have sensible defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let require = |key: &str| {
            std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
        };

        let imap_host = require("EMAIL_IMAP_HOST")?;
        let username = require("EMAIL_USERNAME")?;
        let password = SecretString::from(require("EMAIL_PASSWORD")?);

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let from_address =
            std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        let drafts_mailbox = std::env::var("EMAIL_DRAFTS_MAILBOX")
            .unwrap_or_else(|_| "[Gmail]/Drafts".to_string());

        Ok(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            drafts_mailbox,
        })
    }
}

// ── Channel ─────────────────────────────────────────────────────────

/// Email channel — IMAP (inbound, label, archive, drafts) + SMTP (replies).
pub struct EmailChannel {
    config: EmailConfig,
    /// Senders we may act on. `*` allows all; `@domain` or `domain`
    /// match a domain; a full address matches exactly.
    allowed_senders: Vec<String>,
}

impl EmailChannel {
    pub fn new(config: EmailConfig, allowed_senders: Vec<String>) -> Self {
        Self {
            config,
            allowed_senders,
        }
    }

    /// Send a reply via SMTP with threading headers.
    fn send_reply(&self, email: &InboundEmail, body: &str) -> Result<(), ExecutorError> {
        let message = build_outbound_message(&self.config.from_address, email, body)
            .map_err(|reason| ExecutorError::Send {
                to: email.sender.clone(),
                reason,
            })?;

        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&self.config.smtp_host)
            .map_err(|e| ExecutorError::Send {
                to: email.sender.clone(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(self.config.smtp_port)
            .credentials(creds)
            .build();

        transport.send(&message).map_err(|e| ExecutorError::Send {
            to: email.sender.clone(),
            reason: format!("SMTP send failed: {e}"),
        })?;

        info!(to = %email.sender, "Reply sent");
        Ok(())
    }

    /// Save a reply to the drafts folder via IMAP APPEND.
    fn save_draft(&self, email: &InboundEmail, body: &str) -> Result<(), ExecutorError> {
        let message = build_outbound_message(&self.config.from_address, email, body)
            .map_err(ExecutorError::Draft)?;

        let mut session = ImapSession::login(&self.config)
            .map_err(|e| ExecutorError::Draft(e.to_string()))?;
        session
            .append(&self.config.drafts_mailbox, &message.formatted())
            .map_err(|e| ExecutorError::Draft(e.to_string()))?;
        session.logout();

        info!(to = %email.sender, "Draft saved");
        Ok(())
    }

    /// Apply a Gmail label via the X-GM-LABELS extension.
    fn apply_label(&self, email: &InboundEmail, label: &str) -> Result<(), ExecutorError> {
        let wrap = |e: ImapError| ExecutorError::Label {
            label: label.to_string(),
            reason: e.to_string(),
        };

        let mut session = ImapSession::login(&self.config).map_err(wrap)?;
        session.select_inbox().map_err(wrap)?;
        // Create first so the store cannot fail on a missing label;
        // an "already exists" response is fine.
        let _ = session.command(&format!("CREATE \"{label}\""));
        session
            .command_ok(
                &format!("UID STORE {} +X-GM-LABELS (\"{label}\")", email.uid),
                "label store",
            )
            .map_err(wrap)?;
        session.logout();

        info!(uid = %email.uid, label, "Label applied");
        Ok(())
    }

    /// Archive by flagging deleted in the inbox and expunging — on
    /// Gmail the message survives in All Mail.
    fn archive(&self, email: &InboundEmail) -> Result<(), ExecutorError> {
        let wrap = |e: ImapError| ExecutorError::Archive {
            id: email.uid.clone(),
            reason: e.to_string(),
        };

        let mut session = ImapSession::login(&self.config).map_err(wrap)?;
        session.select_inbox().map_err(wrap)?;
        session
            .command_ok(
                &format!("UID STORE {} +FLAGS (\\Deleted)", email.uid),
                "archive store",
            )
            .map_err(wrap)?;
        session.command_ok("EXPUNGE", "expunge").map_err(wrap)?;
        session.logout();

        info!(uid = %email.uid, "Message archived");
        Ok(())
    }
}

#[async_trait]
impl Mailbox for EmailChannel {
    async fn fetch_unread(&self, limit: usize) -> Result<Vec<InboundEmail>, MailboxError> {
        let config = self.config.clone();
        let allowed = self.allowed_senders.clone();

        tokio::task::spawn_blocking(move || fetch_unread_imap(&config, &allowed, limit))
            .await
            .map_err(|e| MailboxError::Fetch(format!("fetch task panicked: {e}")))?
    }

    async fn mark_read(&self, email: &InboundEmail) -> Result<(), MailboxError> {
        let config = self.config.clone();
        let uid = email.uid.clone();
        let message_id = email.message_id.clone();

        tokio::task::spawn_blocking(move || {
            let wrap = |e: ImapError| MailboxError::MarkRead {
                id: message_id.clone(),
                reason: e.to_string(),
            };
            let mut session = ImapSession::login(&config).map_err(wrap)?;
            session.select_inbox().map_err(wrap)?;
            session
                .command_ok(&format!("UID STORE {uid} +FLAGS (\\Seen)"), "mark read")
                .map_err(wrap)?;
            session.logout();
            Ok(())
        })
        .await
        .map_err(|e| MailboxError::Fetch(format!("mark-read task panicked: {e}")))?
    }
}

#[async_trait]
impl ActionExecutor for EmailChannel {
    async fn execute(
        &self,
        action: &ActionKind,
        email: &InboundEmail,
        payload: Option<&str>,
    ) -> Result<(), ExecutorError> {
        let channel = Self {
            config: self.config.clone(),
            allowed_senders: self.allowed_senders.clone(),
        };
        let action = action.clone();
        let email = email.clone();
        let payload = payload.map(String::from);

        tokio::task::spawn_blocking(move || match &action {
            ActionKind::Reply => {
                let body = payload.as_deref().unwrap_or_default();
                channel.send_reply(&email, body)
            }
            ActionKind::Draft => {
                let body = payload.as_deref().unwrap_or_default();
                channel.save_draft(&email, body)
            }
            ActionKind::Label { name } => channel.apply_label(&email, name),
            ActionKind::Archive => channel.archive(&email),
            ActionKind::NoOp => Ok(()),
        })
        .await
        .map_err(|e| ExecutorError::Unsupported(format!("executor task panicked: {e}")))?
    }
}

// ── Outbound message construction ───────────────────────────────────

/// Build a threaded reply message for SMTP send or draft append.
fn build_outbound_message(
    from: &str,
    email: &InboundEmail,
    body: &str,
) -> Result<Message, String> {
    let from: LettreMailbox = from
        .parse()
        .map_err(|e| format!("invalid from address: {e}"))?;
    let to: LettreMailbox = email
        .sender
        .parse()
        .map_err(|e| format!("invalid recipient address: {e}"))?;

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(reply_subject(email.subject.as_deref()));

    if !email.message_id.is_empty() {
        builder = builder.in_reply_to(email.message_id.clone());
        builder = builder.references(append_references(
            email.references.as_deref(),
            &email.message_id,
        ));
    }

    builder
        .body(body.to_string())
        .map_err(|e| format!("failed to build message: {e}"))
}

/// Prefix `Re:` unless the subject already carries one.
fn reply_subject(subject: Option<&str>) -> String {
    match subject {
        Some(s) if s.trim_start().to_ascii_lowercase().starts_with("re:") => s.to_string(),
        Some(s) => format!("Re: {s}"),
        None => "Re: (no subject)".to_string(),
    }
}

/// Extend an existing References chain with the replied-to message id.
fn append_references(existing: Option<&str>, message_id: &str) -> String {
    match existing.map(str::trim).filter(|r| !r.is_empty()) {
        Some(chain) => format!("{chain} {message_id}"),
        None => message_id.to_string(),
    }
}

// ── Sender allowlist ────────────────────────────────────────────────

/// Check if a sender email is in the allowlist.
///
/// - Empty list → deny all
/// - `*` in list → allow all
/// - `@example.com` or `example.com` → domain match
/// - `user@example.com` → exact email match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── IMAP session (blocking — run in spawn_blocking) ─────────────────

type ImapError = Box<dyn std::error::Error + Send + Sync>;

/// Minimal IMAP client over rustls, enough for the commands we issue.
struct ImapSession {
    tls: rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
    tag: u32,
}

impl ImapSession {
    /// Connect over TLS and authenticate.
    fn login(config: &EmailConfig) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = std::sync::Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'_> =
            rustls::pki_types::ServerName::try_from(config.imap_host.clone())?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)?;
        let tls = rustls::StreamOwned::new(conn, tcp);

        let mut session = Self { tls, tag: 0 };
        let _greeting = session.read_line()?;

        session.command_ok(
            &format!(
                "LOGIN \"{}\" \"{}\"",
                config.username,
                config.password.expose_secret()
            ),
            "login",
        )?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.tls, &mut byte) {
                Ok(0) => return Err("IMAP connection closed".into()),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn next_tag(&mut self) -> String {
        self.tag += 1;
        format!("A{}", self.tag)
    }

    /// Send a command and collect response lines through the tagged line.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, ImapError> {
        let tag = self.next_tag();
        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(&mut self.tls, full.as_bytes())?;
        IoWrite::flush(&mut self.tls)?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }

    /// Like [`Self::command`], but the server must answer OK.
    fn command_ok(&mut self, cmd: &str, what: &str) -> Result<Vec<String>, ImapError> {
        let lines = self.command(cmd)?;
        if lines.last().is_some_and(|l| l.contains("OK")) {
            Ok(lines)
        } else {
            Err(format!("IMAP {what} failed: {}", lines.last().map_or("", |l| l.trim())).into())
        }
    }

    fn select_inbox(&mut self) -> Result<(), ImapError> {
        self.command_ok("SELECT \"INBOX\"", "select")?;
        Ok(())
    }

    /// APPEND a complete RFC 822 message to a mailbox (literal upload).
    fn append(&mut self, mailbox: &str, body: &[u8]) -> Result<(), ImapError> {
        let tag = self.next_tag();
        let cmd = format!("{tag} APPEND \"{mailbox}\" {{{}}}\r\n", body.len());
        IoWrite::write_all(&mut self.tls, cmd.as_bytes())?;
        IoWrite::flush(&mut self.tls)?;

        let go_ahead = self.read_line()?;
        if !go_ahead.starts_with('+') {
            return Err(format!("IMAP append rejected: {}", go_ahead.trim()).into());
        }

        IoWrite::write_all(&mut self.tls, body)?;
        IoWrite::write_all(&mut self.tls, b"\r\n")?;
        IoWrite::flush(&mut self.tls)?;

        loop {
            let line = self.read_line()?;
            if line.starts_with(&tag) {
                if line.contains("OK") {
                    return Ok(());
                }
                return Err(format!("IMAP append failed: {}", line.trim()).into());
            }
        }
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

// ── Inbound fetch ───────────────────────────────────────────────────

/// Fetch unread messages without marking them read (blocking).
///
/// Senders outside the allowlist are marked read and dropped — they
/// never enter the decision pipeline.
fn fetch_unread_imap(
    config: &EmailConfig,
    allowed: &[String],
    limit: usize,
) -> Result<Vec<InboundEmail>, MailboxError> {
    let mut session = ImapSession::login(config).map_err(|e| MailboxError::Connect {
        host: config.imap_host.clone(),
        reason: e.to_string(),
    })?;
    session
        .select_inbox()
        .map_err(|e| MailboxError::Fetch(e.to_string()))?;

    let search_resp = session
        .command_ok("UID SEARCH UNSEEN", "search")
        .map_err(|e| MailboxError::Fetch(e.to_string()))?;

    let mut uids: Vec<String> = Vec::new();
    for line in &search_resp {
        if line.starts_with("* SEARCH") {
            uids.extend(line.split_whitespace().skip(2).map(String::from));
        }
    }
    debug!(unseen = uids.len(), "IMAP search complete");

    // Process strictly the most recent `limit` messages.
    let start = uids.len().saturating_sub(limit);
    let mut results = Vec::new();

    for uid in &uids[start..] {
        let fetch_resp = match session.command_ok(&format!("UID FETCH {uid} (BODY.PEEK[])"), "fetch")
        {
            Ok(lines) => lines,
            Err(e) => {
                warn!(uid = %uid, error = %e, "Skipping unfetchable message");
                continue;
            }
        };

        let raw: String = fetch_resp
            .iter()
            .skip(1)
            .take(fetch_resp.len().saturating_sub(2))
            .cloned()
            .collect();

        let Some(parsed) = MessageParser::default().parse(raw.as_bytes()) else {
            warn!(uid = %uid, "Skipping unparseable message");
            continue;
        };

        let sender = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into());

        if !is_sender_allowed(allowed, &sender) {
            warn!(uid = %uid, sender = %sender, "Sender not allowed, marking read and skipping");
            let _ = session.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"));
            continue;
        }

        let body = if let Some(text) = parsed.body_text(0) {
            text.to_string()
        } else if let Some(html) = parsed.body_html(0) {
            strip_html(html.as_ref())
        } else {
            "(no readable content)".to_string()
        };

        let message_id = parsed
            .message_id()
            .map(|s| format!("<{s}>"))
            .unwrap_or_else(|| format!("<gen-{}@inbox-agent>", Uuid::new_v4()));

        let received_at = parsed
            .date()
            .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0))
            .unwrap_or_else(chrono::Utc::now);

        results.push(InboundEmail {
            uid: uid.clone(),
            message_id,
            sender,
            subject: parsed.subject().map(String::from),
            body,
            references: parsed
                .header_raw("References")
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
            in_reply_to: parsed
                .header_raw("In-Reply-To")
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
            received_at,
        });
    }

    session.logout();
    Ok(results)
}
