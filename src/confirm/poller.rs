//! Mailbox polling for confirmation codes.
//!
//! One mailbox (a catch-all inbox) serves every identity, so all waits are
//! serialized behind a single mutex: this bounds connection pressure on the
//! server and keeps concurrent scans from interfering with each other.
//!
//! The IMAP client connects, scans and logs out per cycle, inside
//! `spawn_blocking`; the connection lifecycle is scoped to one scan.

use std::net::TcpStream;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use secrecy::ExposeSecret;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::confirm::codes::extract_code;
use crate::error::MailboxError;
use crate::identity::MailboxConfig;
use crate::util::poll_until;

/// A message pulled from the confirmation mailbox.
#[derive(Debug, Clone)]
pub struct MailMessage {
    /// Raw `To` header (may list several recipients).
    pub to: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Read-only view of the confirmation mailbox.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Fetch up to `limit` of the most recent messages delivered since
    /// `since`, oldest first.
    async fn recent_messages(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MailMessage>, MailboxError>;
}

/// Waits for a short numeric code addressed to a specific identity.
pub struct ConfirmationPoller {
    mailbox: Box<dyn Mailbox>,
    /// Serializes all waits across concurrent tasks.
    gate: Mutex<()>,
    scan_depth: usize,
}

impl ConfirmationPoller {
    pub fn new(mailbox: Box<dyn Mailbox>, scan_depth: usize) -> Self {
        Self {
            mailbox,
            gate: Mutex::new(()),
            scan_depth,
        }
    }

    /// Wait for a code addressed to `target`, scanning the mailbox every
    /// `poll_interval` until `timeout` elapses. Only messages delivered
    /// within `since_window` are considered, most recent first.
    ///
    /// `None` means the code never showed up, a normal outcome the caller
    /// records as a failed attempt, not an error.
    pub async fn wait_for_code(
        &self,
        target: &str,
        timeout: Duration,
        poll_interval: Duration,
        since_window: Duration,
    ) -> Option<String> {
        let _serialized = self.gate.lock().await;
        let since = Utc::now() - chrono::Duration::from_std(since_window).unwrap_or_default();

        let found = poll_until(timeout, poll_interval, || self.scan_once(target, since)).await;

        match &found {
            Some(code) => info!(target, code, "Confirmation code received"),
            None => debug!(target, ?timeout, "Confirmation wait timed out"),
        }
        found
    }

    async fn scan_once(&self, target: &str, since: DateTime<Utc>) -> Option<String> {
        let messages = match self.mailbox.recent_messages(since, self.scan_depth).await {
            Ok(messages) => messages,
            Err(e) => {
                // Transient mailbox trouble: log and let the next cycle retry.
                warn!(error = %e, "Mailbox scan failed");
                return None;
            }
        };

        let target_lower = target.to_lowercase();
        for message in messages.iter().rev() {
            if !message.to.to_lowercase().contains(&target_lower) {
                continue;
            }
            if let Some(code) = extract_code(&message.body) {
                return Some(code);
            }
        }
        None
    }
}

/// Placeholder used when no mailbox has been configured. Every scan fails,
/// so confirmation waits run out their timeout and the task records a
/// `ConfirmationTimeout`.
pub struct UnconfiguredMailbox;

#[async_trait]
impl Mailbox for UnconfiguredMailbox {
    async fn recent_messages(
        &self,
        _since: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<MailMessage>, MailboxError> {
        Err(MailboxError::Connect("mailbox not configured".into()))
    }
}

// ── IMAP mailbox ────────────────────────────────────────────────────

/// IMAP-over-TLS implementation of [`Mailbox`].
pub struct ImapMailbox {
    config: MailboxConfig,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn recent_messages(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MailMessage>, MailboxError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || scan_inbox(&config, since, limit))
            .await
            .map_err(|e| MailboxError::Protocol(format!("scan task panicked: {e}")))?
    }
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// One full scan cycle: connect → LOGIN → SELECT INBOX → SEARCH SINCE →
/// FETCH the most recent `limit` messages → LOGOUT.
/// Blocking; run in `spawn_blocking`.
fn scan_inbox(
    config: &MailboxConfig,
    since: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<MailMessage>, MailboxError> {
    use std::sync::Arc as StdArc;

    let tcp = TcpStream::connect((&*config.host, config.port))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = StdArc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name: rustls::pki_types::ServerName<'_> =
        rustls::pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| MailboxError::Connect(e.to_string()))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| MailboxError::Connect(e.to_string()))?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);

    let _greeting = read_line(&mut tls)?;

    let login_resp = send_cmd(
        &mut tls,
        "A1",
        &format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.secret.expose_secret()
        ),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err(MailboxError::Login {
            username: config.username.clone(),
        });
    }

    let _select = send_cmd(&mut tls, "A2", "SELECT \"INBOX\"")?;

    let since_date = since.format("%d-%b-%Y").to_string();
    let search_resp = send_cmd(&mut tls, "A3", &format!("SEARCH SINCE \"{since_date}\""))?;
    let mut uids: Vec<String> = Vec::new();
    for line in &search_resp {
        if line.starts_with("* SEARCH") {
            uids.extend(line.split_whitespace().skip(2).map(str::to_string));
        }
    }

    // Only the tail of the result set matters; the poller inspects
    // most-recent-first.
    let skip = uids.len().saturating_sub(limit);
    let mut messages = Vec::new();
    let mut tag_counter = 4_u32;

    for uid in &uids[skip..] {
        let tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch_resp = send_cmd(&mut tls, &tag, &format!("FETCH {uid} RFC822"))?;

        let raw: String = fetch_resp
            .iter()
            .skip(1)
            .take(fetch_resp.len().saturating_sub(2))
            .cloned()
            .collect();

        if let Some(parsed) = MessageParser::default().parse(raw.as_bytes()) {
            messages.push(MailMessage {
                to: extract_recipients(&parsed),
                body: extract_body(&parsed),
                received_at: extract_date(&parsed),
            });
        }
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    Ok(messages)
}

fn read_line(tls: &mut TlsStream) -> Result<String, MailboxError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err(MailboxError::Protocol("connection closed".into())),
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

fn send_cmd(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, MailboxError> {
    use std::io::Write;

    let full = format!("{tag} {cmd}\r\n");
    tls.write_all(full.as_bytes())?;
    tls.flush()?;

    let mut lines = Vec::new();
    loop {
        let line = read_line(tls)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            break;
        }
    }
    Ok(lines)
}

/// Join every address in the `To` header.
fn extract_recipients(parsed: &mail_parser::Message) -> String {
    parsed
        .to()
        .map(|addrs| {
            addrs
                .iter()
                .filter_map(|a| a.address())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

/// Prefer the plain-text body, fall back to stripped HTML.
fn extract_body(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Delivery time from the `Date` header, normalized to UTC (the header
/// carries the sender's offset).
fn extract_date(parsed: &mail_parser::Message) -> DateTime<Utc> {
    parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now)
}

/// Strip HTML tags from content (basic).
fn strip_html(html: &str) -> String {
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

#[cfg(test)]
mod tests {
    use super::*;

    struct StubMailbox {
        messages: Vec<MailMessage>,
    }

    #[async_trait]
    impl Mailbox for StubMailbox {
        async fn recent_messages(
            &self,
            _since: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<MailMessage>, MailboxError> {
            let skip = self.messages.len().saturating_sub(limit);
            Ok(self.messages[skip..].to_vec())
        }
    }

    struct FailingMailbox;

    #[async_trait]
    impl Mailbox for FailingMailbox {
        async fn recent_messages(
            &self,
            _since: DateTime<Utc>,
            _limit: usize,
        ) -> Result<Vec<MailMessage>, MailboxError> {
            Err(MailboxError::Protocol("flaky".into()))
        }
    }

    fn msg(to: &str, body: &str) -> MailMessage {
        MailMessage {
            to: to.into(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn finds_code_within_one_cycle() {
        let poller = ConfirmationPoller::new(
            Box::new(StubMailbox {
                messages: vec![msg("user1@x.test", "Verification code: 482910")],
            }),
            20,
        );

        let code = poller
            .wait_for_code(
                "user1@x.test",
                Duration::from_secs(10),
                Duration::from_secs(1),
                Duration::from_secs(300),
            )
            .await;
        assert_eq!(code, Some("482910".into()));
    }

    #[tokio::test]
    async fn recipient_match_is_case_insensitive_substring() {
        let poller = ConfirmationPoller::new(
            Box::new(StubMailbox {
                messages: vec![msg("Alice <USER1@X.TEST>, ops@x.test", "code: 111222")],
            }),
            20,
        );

        let code = poller
            .wait_for_code(
                "user1@x.test",
                Duration::from_secs(5),
                Duration::from_secs(1),
                Duration::from_secs(300),
            )
            .await;
        assert_eq!(code, Some("111222".into()));
    }

    #[tokio::test]
    async fn newest_matching_message_wins() {
        let poller = ConfirmationPoller::new(
            Box::new(StubMailbox {
                messages: vec![
                    msg("user1@x.test", "Verification code: 000001"),
                    msg("user1@x.test", "Verification code: 999999"),
                ],
            }),
            20,
        );

        let code = poller
            .wait_for_code(
                "user1@x.test",
                Duration::from_secs(5),
                Duration::from_secs(1),
                Duration::from_secs(300),
            )
            .await;
        assert_eq!(code, Some("999999".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_with_no_match_returns_none() {
        let poller = ConfirmationPoller::new(
            Box::new(StubMailbox {
                messages: vec![msg("other@x.test", "Verification code: 482910")],
            }),
            20,
        );

        let code = poller
            .wait_for_code(
                "user1@x.test",
                Duration::from_secs(10),
                Duration::from_secs(2),
                Duration::from_secs(300),
            )
            .await;
        assert_eq!(code, None);
    }

    #[test]
    fn header_date_is_normalized_to_utc() {
        let raw = b"From: sender@x.test\r\nTo: user1@x.test\r\n\
Date: Mon, 1 Jul 2024 12:00:00 +0800\r\n\r\ncode: 482910";
        let parsed = MessageParser::default().parse(raw.as_slice()).unwrap();

        let at = extract_date(&parsed);
        assert_eq!(at, chrono::DateTime::parse_from_rfc3339("2024-07-01T04:00:00Z").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_errors_are_swallowed_until_timeout() {
        let poller = ConfirmationPoller::new(Box::new(FailingMailbox), 20);
        let code = poller
            .wait_for_code(
                "user1@x.test",
                Duration::from_secs(6),
                Duration::from_secs(2),
                Duration::from_secs(300),
            )
            .await;
        assert_eq!(code, None);
    }
}
