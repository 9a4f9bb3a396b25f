//! Key/value store using heed3 (LMDB)
//!
//! Keys are `"<address>:<id>"`, so listing an inbox is a prefix scan. Each
//! value carries its own expiry; expired entries are skipped on read and
//! removed by [`HeedMessageStore::purge_expired`].

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use heed3::types::{Bytes, Str};
use heed3::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::MessageStore;
use crate::error::{InboxError, Result};
use crate::models::{InboxAddress, Message, MessageId, sort_newest_first, storage_key, storage_prefix};

/// Default map size: 1 GB (LMDB requires pre-allocated map size)
const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

/// Value stored under each key
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
    message: Message,
    expires_at: DateTime<Utc>,
}

impl StoredEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Key/value message store using heed3/LMDB
pub struct HeedMessageStore {
    env: Arc<Env>,
    /// messages table: "<address>:<id>" -> StoredEntry (JSON)
    messages: Database<Str, Bytes>,
    ttl: Duration,
}

impl HeedMessageStore {
    /// Open (or create) a store at `path` whose entries live for `ttl`
    pub fn new(path: impl AsRef<Path>, ttl: Duration) -> Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create LMDB directory {:?}", path))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(DEFAULT_MAP_SIZE)
                .max_dbs(2)
                .open(path)
                .with_context(|| format!("Failed to open LMDB environment at {:?}", path))?
        };

        let mut wtxn = env.write_txn().context("Failed to begin LMDB transaction")?;
        let messages = env
            .create_database(&mut wtxn, Some("messages"))
            .context("Failed to create messages database")?;
        wtxn.commit().context("Failed to commit LMDB transaction")?;

        Ok(Self {
            env: Arc::new(env),
            messages,
            ttl,
        })
    }

    fn read_entry(&self, key: &str) -> Result<Option<StoredEntry>> {
        let rtxn = self.env.read_txn().context("Failed to begin read transaction")?;
        let entry = match self.messages.get(&rtxn, key).context("LMDB read failed")? {
            Some(data) => Some(serde_json::from_slice(data).context("Corrupt KV entry")?),
            None => None,
        };
        Ok(entry)
    }

    fn write_entry(&self, key: &str, entry: &StoredEntry) -> Result<()> {
        let data = serde_json::to_vec(entry).context("Failed to encode KV entry")?;
        let mut wtxn = self.env.write_txn().context("Failed to begin write transaction")?;
        self.messages
            .put(&mut wtxn, key, &data)
            .context("LMDB write failed")?;
        wtxn.commit().context("Failed to commit LMDB write")?;
        Ok(())
    }

    /// Physically remove expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let expired: Vec<String> = {
            let rtxn = self.env.read_txn().context("Failed to begin read transaction")?;
            let mut keys = Vec::new();
            for item in self.messages.iter(&rtxn).context("LMDB scan failed")? {
                let (key, data) = item.context("LMDB scan failed")?;
                let expired = serde_json::from_slice::<StoredEntry>(data)
                    .map(|entry| entry.is_expired(now))
                    .unwrap_or(false);
                if expired {
                    keys.push(key.to_string());
                }
            }
            keys
        };

        if expired.is_empty() {
            return Ok(0);
        }

        let mut wtxn = self.env.write_txn().context("Failed to begin write transaction")?;
        for key in &expired {
            self.messages
                .delete(&mut wtxn, key)
                .context("LMDB delete failed")?;
        }
        wtxn.commit().context("Failed to commit LMDB purge")?;

        log::info!("[STORE] Purged {} expired KV entries", expired.len());
        Ok(expired.len())
    }
}

impl MessageStore for HeedMessageStore {
    fn append(&self, message: &Message) -> Result<()> {
        let key = message.storage_key();

        let existing = self
            .read_entry(&key)
            .map_err(|e| InboxError::Write(format!("kv lookup failed: {}", e)))?;
        if existing.is_some_and(|entry| !entry.is_expired(Utc::now())) {
            log::debug!("[STORE] KV key {} already present, skipping", key);
            return Ok(());
        }

        let entry = StoredEntry {
            message: message.clone(),
            expires_at: Utc::now() + self.ttl,
        };
        self.write_entry(&key, &entry)
            .map_err(|e| InboxError::Write(format!("kv put failed: {}", e)))
    }

    fn list_by_address(&self, address: &InboxAddress) -> Result<Vec<Message>> {
        let now = Utc::now();
        let prefix = storage_prefix(address.as_str());
        let rtxn = self.env.read_txn().context("Failed to begin read transaction")?;

        let mut messages = Vec::new();
        for item in self
            .messages
            .prefix_iter(&rtxn, &prefix)
            .context("LMDB prefix scan failed")?
        {
            let (key, data) = item.context("LMDB prefix scan failed")?;
            let entry: StoredEntry = match serde_json::from_slice(data) {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("[STORE] Dropping undecodable KV entry {}: {}", key, e);
                    continue;
                }
            };
            // "a@b.co:" is also a prefix of keys belonging to "a@b.co:x@y.z".
            if entry.message.to_address != address.as_str() {
                continue;
            }
            if entry.is_expired(now) || entry.message.deleted {
                continue;
            }
            messages.push(entry.message);
        }

        sort_newest_first(&mut messages);
        Ok(messages)
    }

    fn soft_delete(&self, address: &InboxAddress, id: &MessageId) -> Result<()> {
        let key = storage_key(address.as_str(), id);
        let not_found = || InboxError::NotFound {
            address: address.to_string(),
            id: id.to_string(),
        };

        let Some(mut entry) = self.read_entry(&key)? else {
            return Err(not_found());
        };
        if entry.message.deleted || entry.is_expired(Utc::now()) {
            return Err(not_found());
        }

        entry.message.deleted = true;
        self.write_entry(&key, &entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sender;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn create_test_store(ttl: Duration) -> (HeedMessageStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = HeedMessageStore::new(dir.path().join("kv.test"), ttl).unwrap();
        (store, dir)
    }

    fn addr(s: &str) -> InboxAddress {
        InboxAddress::parse(s).unwrap()
    }

    fn make_message(to: &str, subject: &str, secs: i64) -> Message {
        Message::builder(to)
            .from(Sender::new("sender@example.com"))
            .subject(subject)
            .text_body("body")
            .received_at(Utc.timestamp_opt(secs, 0).unwrap())
            .build()
    }

    #[test]
    fn test_append_list_and_order() {
        let (store, _dir) = create_test_store(Duration::days(1));
        let older = make_message("user@domain.com", "older", 100);
        let newer = make_message("user@domain.com", "newer", 200);
        store.append(&older).unwrap();
        store.append(&newer).unwrap();
        store.append(&newer).unwrap();

        let listed = store.list_by_address(&addr("user@domain.com")).unwrap();
        assert_eq!(listed, vec![newer, older]);
    }

    #[test]
    fn test_prefix_of_other_address_is_not_listed() {
        let (store, _dir) = create_test_store(Duration::days(1));
        store
            .append(&make_message("user@domain.com", "mine", 100))
            .unwrap();
        store
            .append(&make_message("user@domain.com:x@y.z", "not mine", 200))
            .unwrap();

        let listed = store.list_by_address(&addr("user@domain.com")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].subject, "mine");
    }

    #[test]
    fn test_soft_delete_keeps_key_but_hides_message() {
        let (store, _dir) = create_test_store(Duration::days(1));
        let message = make_message("user@domain.com", "bye", 100);
        store.append(&message).unwrap();

        store
            .soft_delete(&addr("user@domain.com"), &message.id)
            .unwrap();
        assert!(store.list_by_address(&addr("user@domain.com")).unwrap().is_empty());

        // Key still present, flagged deleted; re-append is a no-op
        let entry = store.read_entry(&message.storage_key()).unwrap().unwrap();
        assert!(entry.message.deleted);
        store.append(&message).unwrap();
        assert!(store.list_by_address(&addr("user@domain.com")).unwrap().is_empty());
    }

    #[test]
    fn test_soft_delete_wrong_address() {
        let (store, _dir) = create_test_store(Duration::days(1));
        let message = make_message("user@domain.com", "x", 100);
        store.append(&message).unwrap();

        let err = store
            .soft_delete(&addr("other@domain.com"), &message.id)
            .unwrap_err();
        assert!(matches!(err, InboxError::NotFound { .. }));
    }

    #[test]
    fn test_expired_entries_are_hidden_and_purged() {
        let (store, _dir) = create_test_store(Duration::seconds(-1));
        store
            .append(&make_message("user@domain.com", "stale", 100))
            .unwrap();

        assert!(store.list_by_address(&addr("user@domain.com")).unwrap().is_empty());
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.purge_expired().unwrap(), 0);
    }
}
