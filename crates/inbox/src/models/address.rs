//! Validated disposable address

use serde::{Deserialize, Serialize};

use crate::error::{InboxError, Result};

/// Longest address accepted by any entry point
pub const MAX_ADDRESS_LEN: usize = 255;

/// A syntactically valid email address used as the partition key for messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InboxAddress(String);

impl InboxAddress {
    /// Validate an address.
    ///
    /// Accepts `local@domain.tld` where no part contains whitespace or a
    /// second `@`, up to [`MAX_ADDRESS_LEN`] characters.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(InboxError::Validation("email address is required".into()));
        }
        if s.chars().count() > MAX_ADDRESS_LEN {
            return Err(InboxError::Validation(format!(
                "email address exceeds {} characters",
                MAX_ADDRESS_LEN
            )));
        }
        if !is_valid_email(s) {
            return Err(InboxError::Validation(format!("invalid email format: {}", s)));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InboxAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for InboxAddress {
    type Error = InboxError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<InboxAddress> for String {
    fn from(value: InboxAddress) -> Self {
        value.0
    }
}

impl AsRef<str> for InboxAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// `^[^\s@]+@[^\s@]+\.[^\s@]+$`
fn is_valid_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    // Some dot must have non-empty text on both sides within the domain.
    domain
        .match_indices('.')
        .any(|(i, _)| i > 0 && i + 1 < domain.len())
}
