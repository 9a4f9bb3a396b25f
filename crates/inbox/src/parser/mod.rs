//! Raw mail → canonical [`Message`] conversion
//!
//! MIME decoding happens behind the [`MimeDecoder`] trait. The parser only
//! deals with the decoded envelope: resolving the recipient and sender from
//! whatever shape the header took, defaulting the date, and deriving the id.

mod mime;

use chrono::{DateTime, SubsecRound, Utc};

use crate::error::{ParseError, Result};
use crate::models::{
    Attachment, InboxAddress, Message, Sender, UNKNOWN_SENDER, normalize_name, now_millis,
};

pub use mime::MailparseDecoder;

/// One address as produced by the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub address: String,
    pub name: Option<String>,
}

impl Mailbox {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }
}

/// An address header in whichever shape the decoder could produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressField {
    /// Header absent
    Missing,
    /// Header present but not structurally parseable
    Raw(String),
    Single(Mailbox),
    List(Vec<Mailbox>),
}

impl AddressField {
    /// Resolve to a single mailbox: the only one, or the first of a list.
    pub fn first(&self) -> Option<Mailbox> {
        let mailbox = match self {
            AddressField::Missing => None,
            AddressField::Raw(value) => {
                let sender = Sender::parse(value);
                if sender.address.is_empty() {
                    None
                } else {
                    Some(Mailbox::new(sender.address, sender.display_name))
                }
            }
            AddressField::Single(mailbox) => Some(mailbox.clone()),
            AddressField::List(list) => list.first().cloned(),
        };
        mailbox.filter(|m| !m.address.trim().is_empty())
    }
}

/// Result of MIME decoding, before any canonicalization
#[derive(Debug, Clone)]
pub struct DecodedEnvelope {
    pub to: AddressField,
    pub from: AddressField,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl Default for DecodedEnvelope {
    fn default() -> Self {
        Self {
            to: AddressField::Missing,
            from: AddressField::Missing,
            subject: None,
            date: None,
            html: None,
            text: None,
            attachments: Vec::new(),
        }
    }
}

/// MIME decoding capability consumed by the parser
pub trait MimeDecoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<DecodedEnvelope, ParseError>;
}

/// Turns raw payloads into [`Message`] records
pub struct MessageParser {
    decoder: Box<dyn MimeDecoder>,
}

impl MessageParser {
    /// Parser backed by `mailparse`
    pub fn new() -> Self {
        Self::with_decoder(Box::new(MailparseDecoder))
    }

    pub fn with_decoder(decoder: Box<dyn MimeDecoder>) -> Self {
        Self { decoder }
    }

    /// Parse a raw payload; messages without a `Date` header are stamped now.
    pub fn parse(&self, raw: &[u8]) -> Result<Message> {
        self.parse_at(raw, now_millis())
    }

    /// Parse a raw payload, using `now` when the envelope has no date
    pub fn parse_at(&self, raw: &[u8], now: DateTime<Utc>) -> Result<Message> {
        let envelope = self.decoder.decode(raw)?;
        Ok(canonicalize(envelope, now)?)
    }
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the canonical message from a decoded envelope
pub fn canonicalize(envelope: DecodedEnvelope, now: DateTime<Utc>) -> Result<Message, ParseError> {
    let to = envelope
        .to
        .first()
        .ok_or(ParseError::UnresolvableRecipient)?;
    let to = InboxAddress::parse(to.address.trim()).map_err(|e| {
        log::warn!("[PARSE] Recipient {:?} is not an address: {}", to.address, e);
        ParseError::UnresolvableRecipient
    })?;

    let from = match envelope.from.first() {
        Some(mailbox) => Sender {
            address: mailbox.address.trim().to_string(),
            display_name: normalize_name(mailbox.name),
        },
        None => Sender::new(UNKNOWN_SENDER),
    };

    let received_at = envelope.date.unwrap_or(now).trunc_subsecs(3);
    let html = envelope.html.unwrap_or_default();
    let text = envelope.text.unwrap_or_default();
    if html.is_empty() && text.is_empty() {
        log::warn!("[PARSE] Message to {} has neither text nor HTML body", to);
    }

    Ok(Message::builder(to.as_str())
        .from(from)
        .subject(envelope.subject.unwrap_or_default())
        .html_body(html)
        .text_body(text)
        .attachments(envelope.attachments)
        .received_at(received_at)
        .build())
}
