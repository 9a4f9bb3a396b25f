//! Message model representing a mail delivered to a disposable address

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sender used when the envelope carries no usable `From`
pub const UNKNOWN_SENDER: &str = "unknown@unknown.com";

/// Unique identifier for a message
///
/// Derived from `(from address, subject, received_at)` so that duplicate
/// deliveries and retried writes land on the same identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the identifier for a message.
    ///
    /// Each field is length-prefixed before hashing, so no choice of subject
    /// can make two different tuples produce the same preimage.
    pub fn derive(from_address: &str, subject: &str, received_at: &DateTime<Utc>) -> Self {
        let timestamp = canonical_timestamp(received_at);
        let mut hasher = Sha256::new();
        for field in [from_address, subject, timestamp.as_str()] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical textual form of a timestamp: RFC 3339, UTC, millisecond precision.
///
/// Strings in this form sort lexicographically in chronological order, which
/// the SQL stores rely on for `ORDER BY date_received`.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time at the precision messages are stored with
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Sender of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    /// Email address (e.g., "john@example.com")
    pub address: String,
    /// Display name (e.g., "John Doe"); never an empty string
    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
}

impl Sender {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: None,
        }
    }

    /// Create a sender with a display name. Blank names are dropped.
    pub fn with_name(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: normalize_name(Some(name.into())),
        }
    }

    /// Parse an address from a string like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let address = s[angle_start + 1..angle_end].trim();
            return Self {
                address: address.to_string(),
                display_name: normalize_name(Some(name.to_string())),
            };
        }

        Self::new(s)
    }

    /// Format the sender for display
    pub fn display(&self) -> String {
        match &self.display_name {
            Some(name) => format!("{} <{}>", name, self.address),
            None => self.address.clone(),
        }
    }
}

/// Map blank names to `None`
pub fn normalize_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

/// Attachment descriptor, passed through storage untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: Option<String>,
    pub mime_type: String,
    pub disposition: Option<String>,
    pub content_id: Option<String>,
    /// Decoded size in bytes
    pub size: usize,
    /// Base64 encoded content
    pub content: String,
}

/// A message delivered to a disposable address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    /// Disposable address the message was delivered to
    pub to_address: String,
    pub from: Sender,
    pub subject: String,
    #[serde(default)]
    pub html_body: String,
    #[serde(default)]
    pub text_body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub received_at: DateTime<Utc>,
    /// Soft-delete flag; deleted messages never appear in listings
    #[serde(default)]
    pub deleted: bool,
}

impl Message {
    /// Create a new message builder
    pub fn builder(to_address: impl Into<String>) -> MessageBuilder {
        MessageBuilder::new(to_address.into())
    }

    /// Key/value key for this message: `"<address>:<id>"`
    pub fn storage_key(&self) -> String {
        storage_key(&self.to_address, &self.id)
    }
}

/// Key/value key for a message: `"<address>:<id>"`
pub fn storage_key(address: &str, id: &MessageId) -> String {
    format!("{}:{}", address, id.as_str())
}

/// Key prefix covering every message of an address
pub fn storage_prefix(address: &str) -> String {
    format!("{}:", address)
}

/// Sort messages newest first, ties broken by id descending
pub fn sort_newest_first(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        b.received_at
            .cmp(&a.received_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Builder for creating Message instances
///
/// The id is derived on [`build`](MessageBuilder::build) unless one was given.
pub struct MessageBuilder {
    id: Option<MessageId>,
    to_address: String,
    from: Option<Sender>,
    subject: String,
    html_body: String,
    text_body: String,
    attachments: Vec<Attachment>,
    received_at: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    fn new(to_address: String) -> Self {
        Self {
            id: None,
            to_address,
            from: None,
            subject: String::new(),
            html_body: String::new(),
            text_body: String::new(),
            attachments: Vec::new(),
            received_at: None,
        }
    }

    pub fn id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn from(mut self, from: Sender) -> Self {
        self.from = Some(from);
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn html_body(mut self, html: impl Into<String>) -> Self {
        self.html_body = html.into();
        self
    }

    pub fn text_body(mut self, text: impl Into<String>) -> Self {
        self.text_body = text.into();
        self
    }

    pub fn attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at.trunc_subsecs(3));
        self
    }

    pub fn build(self) -> Message {
        let from = self.from.unwrap_or_else(|| Sender::new(UNKNOWN_SENDER));
        let received_at = self.received_at.unwrap_or_else(now_millis);
        let id = self
            .id
            .unwrap_or_else(|| MessageId::derive(&from.address, &self.subject, &received_at));

        Message {
            id,
            to_address: self.to_address,
            from,
            subject: self.subject,
            html_body: self.html_body,
            text_body: self.text_body,
            attachments: self.attachments,
            received_at,
            deleted: false,
        }
    }
}
