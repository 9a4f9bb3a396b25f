//! `mailparse`-backed MIME decoding

use base64::prelude::*;
use chrono::{TimeZone, Utc};
use mailparse::{DispositionType, MailAddr, MailHeader, MailHeaderMap, ParsedMail, SingleInfo};

use super::{AddressField, DecodedEnvelope, Mailbox, MimeDecoder};
use crate::error::ParseError;
use crate::models::Attachment;

/// Default decoder built on the `mailparse` crate
pub struct MailparseDecoder;

impl MimeDecoder for MailparseDecoder {
    fn decode(&self, raw: &[u8]) -> Result<DecodedEnvelope, ParseError> {
        let parsed =
            mailparse::parse_mail(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;

        let to = address_field(parsed.headers.get_first_header("To"));
        let from = address_field(parsed.headers.get_first_header("From"));
        let subject = parsed.headers.get_first_value("Subject");

        let date = parsed
            .headers
            .get_first_value("Date")
            .and_then(|d| mailparse::dateparse(&d).ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        let mut envelope = DecodedEnvelope {
            to,
            from,
            subject,
            date,
            ..Default::default()
        };
        collect_parts(&parsed, &mut envelope);

        Ok(envelope)
    }
}

/// Convert an address header into an [`AddressField`]
fn address_field(header: Option<&MailHeader>) -> AddressField {
    let Some(header) = header else {
        return AddressField::Missing;
    };

    match mailparse::addrparse_header(header) {
        Ok(list) => {
            let mut mailboxes: Vec<Mailbox> = Vec::new();
            for addr in list.iter() {
                match addr {
                    MailAddr::Single(info) => mailboxes.push(mailbox(info)),
                    MailAddr::Group(group) => mailboxes.extend(group.addrs.iter().map(mailbox)),
                }
            }
            match mailboxes.len() {
                0 => AddressField::List(Vec::new()),
                1 => AddressField::Single(mailboxes.remove(0)),
                _ => AddressField::List(mailboxes),
            }
        }
        Err(_) => AddressField::Raw(header.get_value()),
    }
}

fn mailbox(info: &SingleInfo) -> Mailbox {
    Mailbox::new(info.addr.clone(), info.display_name.clone())
}

/// Walk the MIME tree collecting the first text and HTML bodies and any attachments
fn collect_parts(part: &ParsedMail, envelope: &mut DecodedEnvelope) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, envelope);
        }
        return;
    }

    let mime = part.ctype.mimetype.to_ascii_lowercase();
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();
    let is_attachment = disposition.disposition == DispositionType::Attachment
        || (filename.is_some() && !mime.starts_with("text/"));

    if !is_attachment {
        if mime == "text/plain" && envelope.text.is_none() {
            envelope.text = part.get_body().ok();
            return;
        }
        if mime == "text/html" && envelope.html.is_none() {
            envelope.html = part.get_body().ok();
            return;
        }
        if mime.starts_with("text/") {
            return;
        }
    }

    match part.get_body_raw() {
        Ok(bytes) => envelope.attachments.push(Attachment {
            filename,
            mime_type: mime,
            disposition: Some(disposition_name(&disposition.disposition)),
            content_id: part.headers.get_first_value("Content-ID"),
            size: bytes.len(),
            content: BASE64_STANDARD.encode(&bytes),
        }),
        Err(e) => log::warn!("[PARSE] Skipping undecodable {} part: {}", mime, e),
    }
}

fn disposition_name(disposition: &DispositionType) -> String {
    match disposition {
        DispositionType::Inline => "inline".to_string(),
        DispositionType::Attachment => "attachment".to_string(),
        DispositionType::FormData => "form-data".to_string(),
        DispositionType::Extension(other) => other.to_ascii_lowercase(),
    }
}
