//! SQLite-backed primary store

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use rusqlite_migration::{M, Migrations};

use super::MessageStore;
use crate::error::{InboxError, Result};
use crate::models::{
    Attachment, InboxAddress, Message, MessageId, Sender, canonical_timestamp, normalize_name,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE emails (
                id TEXT NOT NULL,
                to_address TEXT NOT NULL,
                from_address TEXT NOT NULL,
                from_name TEXT,
                subject TEXT NOT NULL DEFAULT '',
                html_content TEXT NOT NULL DEFAULT '',
                text_content TEXT NOT NULL DEFAULT '',
                attachments TEXT NOT NULL DEFAULT '[]',  -- JSON array
                date_received TEXT NOT NULL,             -- RFC 3339, UTC, millis
                PRIMARY KEY (to_address, id)
            );
            "#,
        ),
        // Migration 2: Soft delete
        M::up(
            r#"
            ALTER TABLE emails ADD COLUMN is_deleted INTEGER NOT NULL DEFAULT 0;

            CREATE INDEX idx_emails_inbox
                ON emails(to_address, is_deleted, date_received DESC, id DESC);
            "#,
        ),
    ])
}

const SELECT_COLUMNS: &str = "id, to_address, from_address, from_name, subject, \
     html_content, text_content, attachments, date_received, is_deleted";

/// SQLite-based message storage
///
/// Rows follow the shared `emails` table layout, so the same queries work
/// against the remote structured store.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::from_connection(conn)
    }

    /// In-memory database, mostly useful for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets stream pollers read while ingestion writes.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            "#,
        )
        .context("Failed to configure database")?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Convert an `emails` row into a message
fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let attachments_json: String = row.get(7)?;
    let date_received: String = row.get(8)?;

    Ok(Message {
        to_address: row.get(1)?,
        from: Sender {
            address: row.get(2)?,
            display_name: normalize_name(row.get(3)?),
        },
        subject: row.get(4)?,
        html_body: row.get(5)?,
        text_body: row.get(6)?,
        attachments: parse_attachments(&id, &attachments_json),
        received_at: parse_timestamp(&date_received).unwrap_or_default(),
        deleted: row.get(9)?,
        id: MessageId::new(id),
    })
}

/// Decode the attachments column, treating bad JSON as no attachments
pub(crate) fn parse_attachments(id: &str, json: &str) -> Vec<Attachment> {
    serde_json::from_str(json).unwrap_or_else(|e| {
        log::warn!("[STORE] Bad attachments JSON on message {}: {}", id, e);
        Vec::new()
    })
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            log::warn!("[STORE] Bad date_received {:?}: {}", value, e);
            None
        }
    }
}

pub(crate) fn attachments_json(message: &Message) -> Result<String> {
    Ok(serde_json::to_string(&message.attachments).context("Failed to encode attachments")?)
}

impl MessageStore for SqliteMessageStore {
    fn append(&self, message: &Message) -> Result<()> {
        let attachments = attachments_json(message)?;
        let conn = self.conn.lock().unwrap();

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO emails (
                    id, to_address, from_address, from_name, subject,
                    html_content, text_content, attachments, date_received
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    message.id.as_str(),
                    message.to_address,
                    message.from.address,
                    message.from.display_name,
                    message.subject,
                    message.html_body,
                    message.text_body,
                    attachments,
                    canonical_timestamp(&message.received_at),
                ],
            )
            .map_err(|e| InboxError::Write(format!("sqlite insert failed: {}", e)))?;

        if inserted == 0 {
            log::debug!("[STORE] Message {} already stored, skipping", message.id);
        }
        Ok(())
    }

    fn list_by_address(&self, address: &InboxAddress) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();

        let sql = format!(
            "SELECT {} FROM emails
             WHERE to_address = ? AND is_deleted = 0
             ORDER BY date_received DESC, id DESC",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).context("Failed to prepare inbox query")?;
        let messages = stmt
            .query_map([address.as_str()], row_to_message)
            .context("Failed to query inbox")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read inbox rows")?;

        Ok(messages)
    }

    fn soft_delete(&self, address: &InboxAddress, id: &MessageId) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let changed = conn
            .execute(
                "UPDATE emails SET is_deleted = 1
                 WHERE to_address = ? AND id = ? AND is_deleted = 0",
                params![address.as_str(), id.as_str()],
            )
            .context("Failed to soft-delete message")?;

        if changed == 0 {
            return Err(InboxError::NotFound {
                address: address.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn create_test_store() -> (SqliteMessageStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        // Use .test.sqlite extension to clearly distinguish from production databases
        let db_path = dir.path().join("inbox.test.sqlite");
        let store = SqliteMessageStore::new(&db_path).unwrap();
        (store, dir)
    }

    fn addr(s: &str) -> InboxAddress {
        InboxAddress::parse(s).unwrap()
    }

    fn make_message(to: &str, subject: &str, secs: i64) -> Message {
        Message::builder(to)
            .from(Sender::with_name("Sender", "sender@example.com"))
            .subject(subject)
            .html_body("<p>hi</p>")
            .text_body("hi")
            .attachments(vec![Attachment {
                filename: Some("a.txt".into()),
                mime_type: "text/plain".into(),
                disposition: Some("attachment".into()),
                content_id: None,
                size: 2,
                content: "aGk=".into(),
            }])
            .received_at(Utc.timestamp_opt(secs, 0).unwrap())
            .build()
    }

    #[test]
    fn test_append_and_list_round_trip() {
        let (store, _dir) = create_test_store();
        let message = make_message("user@domain.com", "Hello", 1_700_000_000);

        store.append(&message).unwrap();
        let listed = store.list_by_address(&addr("user@domain.com")).unwrap();

        assert_eq!(listed, vec![message]);
    }

    #[test]
    fn test_append_twice_keeps_one_record() {
        let (store, _dir) = create_test_store();
        let message = make_message("user@domain.com", "Hello", 1_700_000_000);

        store.append(&message).unwrap();
        store.append(&message).unwrap();

        assert_eq!(store.list_by_address(&addr("user@domain.com")).unwrap().len(), 1);
    }

    #[test]
    fn test_same_id_for_two_recipients() {
        let (store, _dir) = create_test_store();
        let first = make_message("one@domain.com", "Hello", 1_700_000_000);
        let second = make_message("two@domain.com", "Hello", 1_700_000_000);
        assert_eq!(first.id, second.id);

        store.append(&first).unwrap();
        store.append(&second).unwrap();

        assert_eq!(store.list_by_address(&addr("one@domain.com")).unwrap().len(), 1);
        assert_eq!(store.list_by_address(&addr("two@domain.com")).unwrap().len(), 1);
    }

    #[test]
    fn test_list_orders_newest_first_with_id_tiebreak() {
        let (store, _dir) = create_test_store();
        let old = make_message("user@domain.com", "old", 100);
        let tie_a = make_message("user@domain.com", "tie a", 200);
        let tie_b = make_message("user@domain.com", "tie b", 200);
        let new = make_message("user@domain.com", "new", 300);
        for m in [&old, &tie_a, &tie_b, &new] {
            store.append(m).unwrap();
        }

        let listed = store.list_by_address(&addr("user@domain.com")).unwrap();
        let (hi, lo) = if tie_a.id > tie_b.id {
            (&tie_a, &tie_b)
        } else {
            (&tie_b, &tie_a)
        };
        let ids: Vec<&MessageId> = listed.iter().map(|m| &m.id).collect();
        assert_eq!(ids, vec![&new.id, &hi.id, &lo.id, &old.id]);
    }

    #[test]
    fn test_soft_delete_hides_message() {
        let (store, _dir) = create_test_store();
        let message = make_message("user@domain.com", "Hello", 100);
        store.append(&message).unwrap();

        store
            .soft_delete(&addr("user@domain.com"), &message.id)
            .unwrap();

        assert!(store.list_by_address(&addr("user@domain.com")).unwrap().is_empty());
        // Re-delivery does not bring it back
        store.append(&message).unwrap();
        assert!(store.list_by_address(&addr("user@domain.com")).unwrap().is_empty());
    }

    #[test]
    fn test_soft_delete_wrong_address_is_not_found() {
        let (store, _dir) = create_test_store();
        let message = make_message("user@domain.com", "Hello", 100);
        store.append(&message).unwrap();

        let err = store
            .soft_delete(&addr("intruder@domain.com"), &message.id)
            .unwrap_err();
        assert!(matches!(err, InboxError::NotFound { .. }));

        let again = store.soft_delete(&addr("user@domain.com"), &message.id);
        assert!(again.is_ok());
        let twice = store.soft_delete(&addr("user@domain.com"), &message.id);
        assert!(matches!(twice, Err(InboxError::NotFound { .. })));
    }

    #[test]
    fn test_migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("inbox.test.sqlite");
        let message = make_message("user@domain.com", "Hello", 100);

        {
            let store = SqliteMessageStore::new(&db_path).unwrap();
            store.append(&message).unwrap();
        }

        let store = SqliteMessageStore::new(&db_path).unwrap();
        assert_eq!(store.list_by_address(&addr("user@domain.com")).unwrap().len(), 1);
    }
}
