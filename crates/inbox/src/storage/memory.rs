//! In-memory storage implementation
//!
//! Used by tests. Each instance owns its own map, so state lives exactly as
//! long as the test that created it; nothing here is process-wide.

use std::collections::HashMap;
use std::sync::RwLock;

use super::MessageStore;
use crate::error::{InboxError, Result};
use crate::models::{InboxAddress, Message, MessageId, sort_newest_first};

/// In-memory implementation of MessageStore
#[derive(Default)]
pub struct InMemoryMessageStore {
    /// (address, id) -> message
    messages: RwLock<HashMap<(String, String), Message>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, deleted ones included
    pub fn len(&self) -> usize {
        self.messages.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageStore for InMemoryMessageStore {
    fn append(&self, message: &Message) -> Result<()> {
        let mut messages = self.messages.write().unwrap();
        messages
            .entry((message.to_address.clone(), message.id.0.clone()))
            .or_insert_with(|| message.clone());
        Ok(())
    }

    fn list_by_address(&self, address: &InboxAddress) -> Result<Vec<Message>> {
        let messages = self.messages.read().unwrap();
        let mut list: Vec<Message> = messages
            .values()
            .filter(|m| m.to_address == address.as_str() && !m.deleted)
            .cloned()
            .collect();
        sort_newest_first(&mut list);
        Ok(list)
    }

    fn soft_delete(&self, address: &InboxAddress, id: &MessageId) -> Result<()> {
        let mut messages = self.messages.write().unwrap();
        match messages.get_mut(&(address.to_string(), id.0.clone())) {
            Some(message) if !message.deleted => {
                message.deleted = true;
                Ok(())
            }
            _ => Err(InboxError::NotFound {
                address: address.to_string(),
                id: id.to_string(),
            }),
        }
    }
}
