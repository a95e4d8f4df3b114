//! IMAP mail poller.
//!
//! The `imap` crate is blocking, so every session interaction runs under
//! `spawn_blocking`; the session object moves in and out of the closures.
//! Messages are fetched with BODY.PEEK[] and never flagged \Seen on the
//! server: the processed-mail token upsert is the dedup safeguard, and
//! idempotent rescans of the same mailbox state must stay cheap.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use mailparse::MailHeaderMap;
use sha1::{Digest, Sha1};
use tokio::task;
use tracing::{info, warn};

use medsignal_common::config::EmailConfig;
use medsignal_common::RawMail;
use medsignal_store::{MailUpsert, Store};

type ImapSession = imap::Session<native_tls::TlsStream<std::net::TcpStream>>;

pub struct MailPoller {
    config: EmailConfig,
    subject_pattern: regex::Regex,
}

struct MailboxState {
    session: ImapSession,
    uid_validity: Option<u32>,
}

impl MailPoller {
    pub fn new(config: EmailConfig) -> Result<Self> {
        let subject_pattern = regex::Regex::new(&config.rules.subject_pattern)
            .with_context(|| format!("invalid subject pattern: {}", config.rules.subject_pattern))?;
        Ok(Self {
            config,
            subject_pattern,
        })
    }

    /// Fetch new matching mails. Already-processed tokens are skipped via
    /// the store upsert, so partial progress from a failed tick is kept.
    pub async fn poll(&self, store: &dyn Store) -> Result<Vec<RawMail>> {
        let config = self.config.clone();
        let state = task::spawn_blocking(move || connect_and_select(&config)).await??;

        let sender = self.config.rules.sender.clone();
        let (uids, mut state) = task::spawn_blocking(move || {
            let mut state = state;
            let criteria = format!("UNSEEN FROM \"{sender}\"");
            let uids = state
                .session
                .uid_search(&criteria)
                .context("IMAP UID SEARCH failed")?;
            let mut uids: Vec<u32> = uids.into_iter().collect();
            uids.sort_unstable();
            Ok::<_, anyhow::Error>((uids, state))
        })
        .await??;

        info!(count = uids.len(), "Unseen matching mails");
        if uids.is_empty() {
            logout(state).await;
            return Ok(Vec::new());
        }

        // With a stable UIDVALIDITY the token is known before any body
        // fetch; skip already-processed mails without downloading them.
        // The row itself is only written after parsing, so it carries the
        // real hospital and mail date.
        let mut wanted: Vec<(u32, Option<String>)> = Vec::new();
        for uid in uids {
            match state.uid_validity {
                Some(validity) => {
                    let token = format!("{validity}:{uid}");
                    if !store.processed_mail_exists(&token).await? {
                        wanted.push((uid, Some(token)));
                    }
                }
                None => wanted.push((uid, None)),
            }
        }

        if wanted.is_empty() {
            logout(state).await;
            return Ok(Vec::new());
        }

        let fetch_uids: Vec<u32> = wanted.iter().map(|(uid, _)| *uid).collect();
        let (bodies, state) = task::spawn_blocking(move || {
            let mut fetched = Vec::new();
            for uid in fetch_uids {
                let messages = state
                    .session
                    .uid_fetch(uid.to_string(), "BODY.PEEK[]")
                    .with_context(|| format!("IMAP UID FETCH failed for {uid}"))?;
                let body = messages
                    .iter()
                    .next()
                    .and_then(|m| m.body())
                    .map(|b| b.to_vec());
                fetched.push((uid, body));
            }
            Ok::<_, anyhow::Error>((fetched, state))
        })
        .await??;

        let mut mails = Vec::new();
        for ((uid, token), (_, body)) in wanted.into_iter().zip(bodies) {
            let Some(raw) = body else {
                warn!(uid, "Fetched message had no body");
                continue;
            };
            let Some(parsed) = parse_message(&raw, &self.subject_pattern) else {
                continue;
            };

            // Stable UID token when the server gave one; message-id +
            // date hash otherwise.
            let token = token
                .unwrap_or_else(|| fallback_token(&parsed.message_id, &parsed.date_header));
            match store
                .upsert_processed_mail(&token, &parsed.hospital, parsed.received_at)
                .await?
            {
                MailUpsert::Inserted => {}
                MailUpsert::Existed => continue,
            }

            info!(subject = %parsed.subject, hospital = %parsed.hospital, "New mail accepted");
            mails.push(RawMail {
                token,
                subject: parsed.subject,
                body: parsed.body,
                sender: parsed.sender,
                received_at: parsed.received_at,
                hospital: parsed.hospital,
            });
        }

        logout(state).await;
        Ok(mails)
    }
}

fn connect_and_select(config: &EmailConfig) -> Result<MailboxState> {
    let tls = native_tls::TlsConnector::new().context("TLS connector init failed")?;
    let client = imap::connect(
        (config.imap_server.as_str(), config.imap_port),
        config.imap_server.as_str(),
        &tls,
    )
    .with_context(|| format!("IMAP connect to {} failed", config.imap_server))?;

    let mut session = client
        .login(&config.email_address, &config.app_password)
        .map_err(|(e, _)| anyhow::anyhow!("IMAP login failed: {e}"))?;

    let mailbox = match session.select("INBOX") {
        Ok(mb) => mb,
        Err(_) => {
            // Some servers refuse SELECT INBOX outright; fall back to
            // listing mailboxes and picking the one named like an inbox.
            let names = session.list(None, Some("*")).context("IMAP LIST failed")?;
            let inbox = names
                .iter()
                .map(|n| n.name().to_string())
                .find(|n| n.to_uppercase().contains("INBOX"))
                .context("no mailbox containing INBOX found")?;
            session
                .select(&inbox)
                .with_context(|| format!("IMAP SELECT {inbox} failed"))?
        }
    };

    info!(
        account = %config.email_address,
        uid_validity = ?mailbox.uid_validity,
        "Mailbox selected"
    );

    Ok(MailboxState {
        session,
        uid_validity: mailbox.uid_validity,
    })
}

async fn logout(mut state: MailboxState) {
    let _ = task::spawn_blocking(move || {
        let _ = state.session.logout();
    })
    .await;
}

struct ParsedMessage {
    subject: String,
    sender: String,
    body: String,
    message_id: String,
    date_header: String,
    received_at: DateTime<Utc>,
    hospital: String,
}

/// Decode headers and body; returns None when the subject filter rejects
/// the mail (a normal outcome, not an error).
fn parse_message(raw: &[u8], subject_pattern: &regex::Regex) -> Option<ParsedMessage> {
    let parsed = match mailparse::parse_mail(raw) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "Failed to parse mail, skipping");
            return None;
        }
    };

    let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
    if !subject_pattern.is_match(&subject) {
        info!(subject = %subject, "Skipping mail (subject does not match)");
        return None;
    }

    let sender = parsed.headers.get_first_value("From").unwrap_or_default();
    let message_id = parsed
        .headers
        .get_first_value("Message-ID")
        .unwrap_or_default();
    let date_header = parsed.headers.get_first_value("Date").unwrap_or_default();
    let received_at = mailparse::dateparse(&date_header)
        .ok()
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
        .unwrap_or_else(Utc::now);

    let body = extract_body(&parsed);
    let hospital = extract_hospital(&body, &subject);

    Some(ParsedMessage {
        subject,
        sender,
        body,
        message_id,
        date_header,
        received_at,
        hospital,
    })
}

/// Pick the best text part: text/html preferred, text/plain fallback,
/// whole-message body as a last resort. mailparse applies the part's
/// declared charset; UTF-8 is its own fallback.
fn extract_body(mail: &mailparse::ParsedMail<'_>) -> String {
    fn find_part<'a>(
        part: &'a mailparse::ParsedMail<'a>,
        mime: &str,
    ) -> Option<&'a mailparse::ParsedMail<'a>> {
        if part.ctype.mimetype.eq_ignore_ascii_case(mime) {
            return Some(part);
        }
        part.subparts.iter().find_map(|p| find_part(p, mime))
    }

    for mime in ["text/html", "text/plain"] {
        if let Some(part) = find_part(mail, mime) {
            if let Ok(body) = part.get_body() {
                if !body.trim().is_empty() {
                    return body;
                }
            }
        }
    }
    mail.get_body().unwrap_or_default()
}

/// SHA-1 over message-id + date, used when UIDVALIDITY is unavailable.
fn fallback_token(message_id: &str, date: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(message_id.as_bytes());
    hasher.update(date.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hospital name: labelled body line first, then subject patterns tuned
/// for hospital-suffix tokens, then 未知.
pub fn extract_hospital(body: &str, subject: &str) -> String {
    let body_label =
        regex::Regex::new(r"以下是(.*?)方案的网路舆情信息").expect("valid regex");
    if let Some(captures) = body_label.captures(body) {
        let name = captures[1].trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }

    let subject_patterns = [
        r"([一-龥A-Za-z0-9]+(?:医院|卫生院|保健院|医疗中心))",
        r"([一-龥]{2,20}(?:院区|分院))",
    ];
    for pattern in subject_patterns {
        let re = regex::Regex::new(pattern).expect("valid regex");
        if let Some(captures) = re.captures(subject) {
            return captures[1].to_string();
        }
    }

    "未知".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hospital_from_body_label() {
        let body = "您好：\n以下是东莞市第九人民医院方案的网路舆情信息，请查收。";
        assert_eq!(extract_hospital(body, ""), "东莞市第九人民医院");
    }

    #[test]
    fn hospital_from_subject_suffix() {
        assert_eq!(
            extract_hospital("no label here", "XX市第一人民医院负面舆情提醒"),
            "XX市第一人民医院"
        );
    }

    #[test]
    fn hospital_falls_back_to_unknown() {
        assert_eq!(extract_hospital("nothing", "weekly digest"), "未知");
    }

    #[test]
    fn fallback_token_is_stable_and_distinct() {
        let a = fallback_token("<m1@example>", "Mon, 1 Jan 2026 00:00:00 +0000");
        let b = fallback_token("<m1@example>", "Mon, 1 Jan 2026 00:00:00 +0000");
        let c = fallback_token("<m2@example>", "Mon, 1 Jan 2026 00:00:00 +0000");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn parse_message_decodes_plain_body() {
        let raw = b"From: report@vendor.example\r\n\
            Subject: =?UTF-8?B?6IiG5oOF?=\r\n\
            Message-ID: <m1@vendor.example>\r\n\
            Date: Mon, 1 Jan 2026 08:00:00 +0000\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            \r\n\
            \xe4\xbb\xa5\xe4\xb8\x8b\xe6\x98\xaf\xe5\xb8\x82\xe4\xb8\x80\xe5\x8c\xbb\xe9\x99\xa2\xe6\x96\xb9\xe6\xa1\x88\xe7\x9a\x84\xe7\xbd\x91\xe8\xb7\xaf\xe8\x88\x86\xe6\x83\x85\xe4\xbf\xa1\xe6\x81\xaf\r\n";
        let pattern = regex::Regex::new("舆情").unwrap();
        let parsed = parse_message(raw, &pattern).expect("should parse");
        assert_eq!(parsed.subject, "舆情");
        assert_eq!(parsed.hospital, "市一医院");
        assert_eq!(parsed.message_id, "<m1@vendor.example>");
    }

    #[test]
    fn parse_message_rejects_non_matching_subject() {
        let raw = b"From: x@example.com\r\n\
            Subject: newsletter\r\n\
            \r\n\
            hello\r\n";
        let pattern = regex::Regex::new("舆情").unwrap();
        assert!(parse_message(raw, &pattern).is_none());
    }

    #[test]
    fn multipart_prefers_html_part() {
        let raw = b"From: x@example.com\r\n\
            Subject: test\r\n\
            Content-Type: multipart/alternative; boundary=sep\r\n\
            \r\n\
            --sep\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            \r\n\
            plain text\r\n\
            --sep\r\n\
            Content-Type: text/html; charset=utf-8\r\n\
            \r\n\
            <p>html body</p>\r\n\
            --sep--\r\n";
        let parsed = mailparse::parse_mail(raw).unwrap();
        let body = extract_body(&parsed);
        assert!(body.contains("html body"));
    }
}
