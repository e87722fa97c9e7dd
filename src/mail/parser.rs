use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};

use super::types::{Address, Attachment, EmailFlags, FetchedMessage, Message};
use crate::constants::UID_HEADER;

/// Build a normalized [`Message`] from one fetched server message.
///
/// Missing envelope fields become empty strings, a missing date becomes the
/// server's internal date or the epoch. Only bytes that are not a message at
/// all produce an error.
pub fn parse_message(account_id: &str, folder: &str, fetched: &FetchedMessage) -> Result<Message> {
    let message = MessageParser::default()
        .parse(&fetched.raw)
        .with_context(|| format!("Unparseable message UID {} in '{}'", fetched.uid, folder))?;

    let id = Message::make_id(account_id, folder, fetched.uid);

    let from = message
        .from()
        .and_then(|addrs| addrs.first())
        .map(|addr| Address::new(addr.name(), addr.address().unwrap_or_default()))
        .unwrap_or_default();

    let date = message
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .or(fetched.internal_date)
        .unwrap_or(DateTime::UNIX_EPOCH);

    let mut headers = collect_headers(&message);
    headers.insert(UID_HEADER.to_string(), fetched.uid.to_string());

    let attachments = collect_attachments(&message, &id);

    Ok(Message {
        id,
        account_id: account_id.to_string(),
        folder: folder.to_string(),
        uid: fetched.uid,
        message_id: message.message_id().unwrap_or_default().to_string(),
        from,
        to: address_list(message.to()),
        cc: address_list(message.cc()),
        bcc: address_list(message.bcc()),
        subject: message.subject().unwrap_or_default().to_string(),
        date,
        is_read: fetched.flags.contains(EmailFlags::SEEN),
        has_attachments: !attachments.is_empty(),
        headers,
        text_content: extract_text_body(&message),
        html_content: extract_html_body(&message),
        attachments,
    })
}

fn address_list(addrs: Option<&mail_parser::Address>) -> Vec<Address> {
    addrs
        .map(|addrs| {
            addrs
                .iter()
                .filter_map(|addr| Some(Address::new(addr.name(), addr.address()?)))
                .collect()
        })
        .unwrap_or_default()
}

/// Top-level headers as raw, unfolded text. Repeated headers are joined.
fn collect_headers(message: &mail_parser::Message) -> BTreeMap<String, String> {
    let raw = message.raw_message();
    let mut headers: BTreeMap<String, String> = BTreeMap::new();

    for header in message.headers() {
        let start = header.offset_start as usize;
        let end = header.offset_end as usize;
        let Some(bytes) = raw.get(start..end) else {
            continue;
        };
        let value = String::from_utf8_lossy(bytes)
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        headers
            .entry(header.name().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    headers
}

/// Walk the MIME tree from the root and collect every part that is an
/// attachment by disposition or carries a filename, descending into nested
/// multiparts.
fn collect_attachments(message: &mail_parser::Message, email_id: &str) -> Vec<Attachment> {
    let mut found = Vec::new();
    if !message.parts.is_empty() {
        visit_part(message, 0, &mut found);
    }

    found
        .into_iter()
        .enumerate()
        .map(|(n, part_id)| {
            let part = &message.parts[part_id];
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());

            Attachment {
                id: format!("{}-{}", email_id, n),
                email_id: email_id.to_string(),
                filename: part.attachment_name().unwrap_or_default().to_string(),
                content_type,
                size: part.contents().len(),
                content_id: part.content_id().map(|s| s.to_string()),
            }
        })
        .collect()
}

fn visit_part(message: &mail_parser::Message, part_id: usize, found: &mut Vec<usize>) {
    let Some(part) = message.parts.get(part_id) else {
        return;
    };

    if let PartType::Multipart(children) = &part.body {
        for child in children {
            visit_part(message, *child as usize, found);
        }
        return;
    }

    let by_disposition = part
        .content_disposition()
        .is_some_and(|cd| cd.ctype().eq_ignore_ascii_case("attachment"));
    let by_filename = part.attachment_name().is_some_and(|name| !name.is_empty());

    if by_disposition || by_filename {
        found.push(part_id);
    }
}

fn extract_text_body(message: &mail_parser::Message) -> Option<String> {
    // First try to get text body parts
    for part in message.text_bodies() {
        if let PartType::Text(text) = &part.body {
            return Some(text.to_string());
        }
    }

    None
}

fn extract_html_body(message: &mail_parser::Message) -> Option<String> {
    for part in message.html_bodies() {
        if let PartType::Html(html) = &part.body {
            return Some(html.to_string());
        }
    }

    None
}

pub fn parse_flags_from_imap(flags: &[async_imap::types::Flag<'_>]) -> EmailFlags {
    let mut result = EmailFlags::empty();

    for flag in flags {
        match flag {
            async_imap::types::Flag::Seen => result |= EmailFlags::SEEN,
            async_imap::types::Flag::Answered => result |= EmailFlags::ANSWERED,
            async_imap::types::Flag::Flagged => result |= EmailFlags::FLAGGED,
            async_imap::types::Flag::Deleted => result |= EmailFlags::DELETED,
            async_imap::types::Flag::Draft => result |= EmailFlags::DRAFT,
            _ => {}
        }
    }

    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mail_builder::MessageBuilder;

    /// Parsed unread message with a PDF attachment, built the way a mail client would send it.
    pub(crate) fn sample_message(account_id: &str, folder: &str, uid: u32) -> Message {
        let subject = format!("Message {}", uid);
        let message_id = format!("{}@example.com", uid);
        let raw = MessageBuilder::new()
            .from(("Sender Name", "sender@example.com"))
            .to(vec![("Me", "me@example.com")])
            .subject(subject.as_str())
            .message_id(message_id.as_str())
            .date(1704110400i64)
            .text_body("Hello from the builder")
            .attachment("application/pdf", "report.pdf", &b"%PDF-1.4"[..])
            .write_to_vec()
            .unwrap();
        parse_message(account_id, folder, &fetched(uid, EmailFlags::empty(), &raw)).unwrap()
    }

    fn fetched(uid: u32, flags: EmailFlags, raw: &[u8]) -> FetchedMessage {
        FetchedMessage {
            uid,
            flags,
            internal_date: None,
            size: Some(raw.len() as u32),
            raw: raw.to_vec(),
        }
    }

    #[test]
    fn test_parse_simple_email() {
        let raw = b"From: Sender Name <sender@example.com>\r\n\
                    To: a@example.com, B <b@example.com>\r\n\
                    Subject: Test Email\r\n\
                    Date: Mon, 1 Jan 2024 12:00:00 +0000\r\n\
                    Message-ID: <test@example.com>\r\n\
                    \r\n\
                    Hello, this is a test email.";

        let message = parse_message("acct", "INBOX", &fetched(7, EmailFlags::SEEN, raw)).unwrap();
        assert_eq!(message.id, "acct-INBOX-7");
        assert_eq!(message.subject, "Test Email");
        assert_eq!(message.from.email, "sender@example.com");
        assert_eq!(message.from.name.as_deref(), Some("Sender Name"));
        assert_eq!(message.to.len(), 2);
        assert_eq!(message.message_id, "test@example.com");
        assert_eq!(message.date.timestamp(), 1704110400);
        assert!(message.is_read);
        assert!(!message.has_attachments);
        assert_eq!(message.headers.get(UID_HEADER).map(String::as_str), Some("7"));
        assert_eq!(message.headers.get("Subject").map(String::as_str), Some("Test Email"));
        assert!(message.text_content.unwrap().contains("Hello"));
    }

    #[test]
    fn test_parse_builder_message() {
        let message = sample_message("acct", "Archive", 12);
        assert_eq!(message.id, "acct-Archive-12");
        assert_eq!(message.subject, "Message 12");
        assert_eq!(message.message_id, "12@example.com");
        assert_eq!(message.to, vec![Address::new(Some("Me"), "me@example.com")]);
        assert!(message.has_attachments);
        assert_eq!(message.attachments[0].filename, "report.pdf");
        assert!(!message.is_read);
    }

    #[test]
    fn test_missing_envelope_fields_default_to_empty() {
        let raw = b"X-Custom: value\r\n\r\nbody only";

        let message = parse_message("acct", "INBOX", &fetched(3, EmailFlags::empty(), raw)).unwrap();
        assert_eq!(message.subject, "");
        assert_eq!(message.from.email, "");
        assert_eq!(message.message_id, "");
        assert_eq!(message.date, DateTime::UNIX_EPOCH);
        assert!(!message.is_read);
        assert!(message.to.is_empty());
    }

    #[test]
    fn test_detects_attachment_in_nested_multipart() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "Subject: nested\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
            "\r\n",
            "--outer\r\n",
            "Content-Type: multipart/alternative; boundary=\"inner\"\r\n",
            "\r\n",
            "--inner\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "plain body\r\n",
            "--inner\r\n",
            "Content-Type: multipart/related; boundary=\"deep\"\r\n",
            "\r\n",
            "--deep\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>html body</p>\r\n",
            "--deep\r\n",
            "Content-Type: image/png; name=\"logo.png\"\r\n",
            "Content-ID: <logo@example>\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "iVBORw0KGgo=\r\n",
            "--deep--\r\n",
            "--inner--\r\n",
            "--outer\r\n",
            "Content-Type: application/pdf\r\n",
            "Content-Disposition: attachment; filename=\"report.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "JVBERi0xLjQ=\r\n",
            "--outer--\r\n",
        );

        let message =
            parse_message("acct", "INBOX", &fetched(9, EmailFlags::empty(), raw.as_bytes())).unwrap();

        assert!(message.has_attachments);
        let names: Vec<&str> = message
            .attachments
            .iter()
            .map(|a| a.filename.as_str())
            .collect();
        assert_eq!(names, vec!["logo.png", "report.pdf"]);
        assert_eq!(message.attachments[0].id, "acct-INBOX-9-0");
        assert_eq!(message.attachments[0].content_type, "image/png");
        assert!(
            message.attachments[0]
                .content_id
                .as_deref()
                .is_some_and(|cid| cid.contains("logo@example"))
        );
        assert_eq!(message.attachments[1].content_type, "application/pdf");
        assert!(message.text_content.unwrap().contains("plain body"));
        assert!(message.html_content.unwrap().contains("html body"));
    }
}
