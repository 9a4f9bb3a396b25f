//! Domain models for disposable inbox entities

mod address;
mod message;

pub use address::{InboxAddress, MAX_ADDRESS_LEN};
pub use message::{
    Attachment, Message, MessageBuilder, MessageId, Sender, UNKNOWN_SENDER, canonical_timestamp,
    normalize_name, now_millis, sort_newest_first, storage_key, storage_prefix,
};
