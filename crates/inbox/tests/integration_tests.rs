//! Integration tests for the inbox crate
//!
//! These tests drive the full flow from raw MIME ingestion through on-disk
//! stores to the read API.

use std::sync::Arc;

use inbox::api::{self, DeleteRequest};
use inbox::notify::MemoryPublisher;
use inbox::storage::{HeedMessageStore, MessageStore, SqliteMessageStore};
use inbox::{BackendKind, Bindings, FallbackRouter, InboxAddress, InboxConfig, Ingestor};
use tempfile::TempDir;

/// Helper to build a raw message
fn raw_mail(to: &str, subject: &str, date: &str) -> String {
    format!(
        "From: \"Test Sender\" <sender@example.com>\r\n\
         To: {to}\r\n\
         Subject: {subject}\r\n\
         Date: {date}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         Body of {subject}\r\n"
    )
}

struct Fixture {
    _dir: TempDir,
    sqlite: Arc<SqliteMessageStore>,
    kv: Arc<HeedMessageStore>,
    router: Arc<FallbackRouter>,
    publisher: Arc<MemoryPublisher>,
    ingestor: Ingestor,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let sqlite = Arc::new(SqliteMessageStore::new(dir.path().join("inbox.test.sqlite")).unwrap());
    let kv = Arc::new(HeedMessageStore::new(dir.path().join("kv.test"), chrono::Duration::days(1)).unwrap());
    let router = Arc::new(FallbackRouter::new(
        Bindings::new()
            .with_primary(sqlite.clone())
            .with_key_value(kv.clone()),
    ));
    let publisher = Arc::new(MemoryPublisher::new());
    let ingestor = Ingestor::new(router.clone()).with_publisher(publisher.clone());
    Fixture {
        _dir: dir,
        sqlite,
        kv,
        router,
        publisher,
        ingestor,
    }
}

#[test]
fn test_ingest_list_delete_flow() {
    let f = fixture();
    let to = "user@domain.com";

    let t1 = f
        .ingestor
        .ingest(raw_mail(to, "first", "Mon, 01 Jan 2024 10:00:00 +0000").as_bytes())
        .unwrap();
    let t3 = f
        .ingestor
        .ingest(raw_mail(to, "third", "Mon, 01 Jan 2024 12:00:00 +0000").as_bytes())
        .unwrap();
    let t2 = f
        .ingestor
        .ingest(raw_mail(to, "second", "Mon, 01 Jan 2024 11:00:00 +0000").as_bytes())
        .unwrap();

    assert_eq!(t1.stored_in, BackendKind::Primary);
    assert_eq!(t1.mirrored_to, Some(BackendKind::KeyValue));
    assert_eq!(f.publisher.published().len(), 3);

    let ids: Vec<_> = f
        .router
        .list_by_address(to)
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec![t3.message_id.clone(), t2.message_id.clone(), t1.message_id.clone()]);

    let response = api::delete_message(
        &f.router,
        Some(to),
        &DeleteRequest {
            email_id: Some(t2.message_id.to_string()),
        },
    );
    assert_eq!(response.status, 200);

    let address = InboxAddress::parse(to).unwrap();
    let stores: [Arc<dyn MessageStore>; 2] = [f.sqlite.clone(), f.kv.clone()];
    for store in stores {
        let ids: Vec<_> = store
            .list_by_address(&address)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![t3.message_id.clone(), t1.message_id.clone()]);
    }
}

#[test]
fn test_redelivery_after_delete_stays_deleted() {
    let f = fixture();
    let raw = raw_mail("user@domain.com", "once", "Tue, 02 Jan 2024 09:30:00 +0000");

    let outcome = f.ingestor.ingest(raw.as_bytes()).unwrap();
    f.router
        .soft_delete("user@domain.com", outcome.message_id.as_str())
        .unwrap();

    let again = f.ingestor.ingest(raw.as_bytes()).unwrap();
    assert_eq!(again.message_id, outcome.message_id);
    assert!(f.router.list_by_address("user@domain.com").unwrap().is_empty());
}

#[test]
fn test_inboxes_are_isolated() {
    let f = fixture();
    let mine = f
        .ingestor
        .ingest(raw_mail("alice@domain.com", "hello", "Mon, 01 Jan 2024 10:00:00 +0000").as_bytes())
        .unwrap();
    f.ingestor
        .ingest(raw_mail("bob@domain.com", "hello", "Mon, 01 Jan 2024 10:00:00 +0000").as_bytes())
        .unwrap();

    // Same sender, subject and date: same id, separate records
    let bob = api::get_inbox(&f.router, Some("bob@domain.com"));
    assert_eq!(bob.body[0]["id"], mine.message_id.as_str());

    let response = api::delete_message(
        &f.router,
        Some("bob@domain.com"),
        &DeleteRequest {
            email_id: Some(mine.message_id.to_string()),
        },
    );
    assert_eq!(response.status, 200);
    assert_eq!(api::get_inbox(&f.router, Some("alice@domain.com")).body.as_array().unwrap().len(), 1);
    assert_eq!(api::get_inbox(&f.router, Some("bob@domain.com")).body.as_array().unwrap().len(), 0);
}

#[test]
fn test_malformed_mail_is_rejected() {
    let f = fixture();
    let err = f
        .ingestor
        .ingest(b"Subject: nobody\r\n\r\nno recipient here\r\n")
        .unwrap_err();
    assert_eq!(err.status_code(), 422);
    assert!(f.publisher.published().is_empty());
}

#[test]
fn test_bindings_from_config() {
    let dir = TempDir::new().unwrap();
    let config = InboxConfig {
        sqlite_path: Some(dir.path().join("inbox.test.sqlite")),
        kv_path: Some(dir.path().join("kv.test")),
        ..Default::default()
    }
    .validated()
    .unwrap();

    let bindings = Bindings::from_config(&config).unwrap();
    assert_eq!(
        bindings.available(),
        vec![BackendKind::Primary, BackendKind::KeyValue]
    );
    assert!(Bindings::from_config(&InboxConfig::default()).unwrap().is_empty());
}
