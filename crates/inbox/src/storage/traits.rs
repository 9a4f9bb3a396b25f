//! Storage trait definitions

use crate::error::Result;
use crate::models::{InboxAddress, Message, MessageId};

/// Trait for message storage operations
///
/// Every backend variant (structured, key/value, remote) implements the same
/// contract:
/// - `append` is idempotent: writing an id that already exists for the
///   address is a no-op success and never clears a soft-delete.
/// - `list_by_address` returns live messages, newest first, ties broken by id
///   descending.
/// - `soft_delete` only matches messages of the given address; anything else
///   is `InboxError::NotFound`.
pub trait MessageStore: Send + Sync {
    /// Store a message
    fn append(&self, message: &Message) -> Result<()>;

    /// List non-deleted messages delivered to `address`
    fn list_by_address(&self, address: &InboxAddress) -> Result<Vec<Message>>;

    /// Hide a message from listings
    fn soft_delete(&self, address: &InboxAddress, id: &MessageId) -> Result<()>;
}

/// Underlying storage family of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreFamily {
    Structured,
    KeyValue,
}

/// Backend variants, in routing preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BackendKind {
    /// Directly reachable structured store
    Primary,
    /// Directly reachable key/value store
    KeyValue,
    /// Structured store reached over HTTP
    RemotePrimary,
    /// Key/value store reached over HTTP
    RemoteKeyValue,
}

impl BackendKind {
    /// All variants, most preferred first
    pub const PREFERENCE: [BackendKind; 4] = [
        BackendKind::Primary,
        BackendKind::KeyValue,
        BackendKind::RemotePrimary,
        BackendKind::RemoteKeyValue,
    ];

    pub fn family(&self) -> StoreFamily {
        match self {
            BackendKind::Primary | BackendKind::RemotePrimary => StoreFamily::Structured,
            BackendKind::KeyValue | BackendKind::RemoteKeyValue => StoreFamily::KeyValue,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Primary => "primary",
            BackendKind::KeyValue => "kv",
            BackendKind::RemotePrimary => "remote-primary",
            BackendKind::RemoteKeyValue => "remote-kv",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
