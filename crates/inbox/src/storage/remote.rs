//! Stores reached over the Cloudflare HTTP API
//!
//! [`RemoteSqlStore`] runs the same `emails` queries as the local SQLite
//! store against a D1 database. [`RemoteKvStore`] mirrors the LMDB layout in
//! a Workers KV namespace: one JSON message per `"<address>:<id>"` key.
//!
//! Values written by the older mail worker (`{id, from, to, subject, html,
//! text, attachments, date}`) are still read; they are rewritten in the
//! current shape on soft-delete.

use anyhow::Context;
use chrono::{DateTime, SubsecRound, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use super::MessageStore;
use super::sqlite::{attachments_json, parse_attachments, parse_timestamp};
use crate::cloudflare::api::EmailRow;
use crate::cloudflare::{CloudflareClient, KvExpiry};
use crate::error::{InboxError, Result};
use crate::models::{
    Attachment, InboxAddress, Message, MessageId, Sender, UNKNOWN_SENDER, canonical_timestamp,
    normalize_name, sort_newest_first, storage_key, storage_prefix,
};

/// Keep rate limiting distinct; everything else on a write path is a write failure
fn write_error(err: InboxError, what: &str) -> InboxError {
    match err {
        InboxError::Storage(e) => InboxError::Write(format!("{}: {:#}", what, e)),
        other => other,
    }
}

fn not_found(address: &InboxAddress, id: &MessageId) -> InboxError {
    InboxError::NotFound {
        address: address.to_string(),
        id: id.to_string(),
    }
}

/// Structured store behind the D1 query endpoint
pub struct RemoteSqlStore {
    client: Arc<CloudflareClient>,
    database_id: String,
}

impl RemoteSqlStore {
    pub fn new(client: Arc<CloudflareClient>, database_id: impl Into<String>) -> Self {
        Self {
            client,
            database_id: database_id.into(),
        }
    }
}

impl From<EmailRow> for Message {
    fn from(row: EmailRow) -> Self {
        let attachments = row
            .attachments
            .as_deref()
            .map(|json| parse_attachments(&row.id, json))
            .unwrap_or_default();

        Message {
            to_address: row.to_address,
            from: Sender {
                address: row.from_address,
                display_name: normalize_name(row.from_name),
            },
            subject: row.subject.unwrap_or_default(),
            html_body: row.html_content.unwrap_or_default(),
            text_body: row.text_content.unwrap_or_default(),
            attachments,
            received_at: parse_timestamp(&row.date_received).unwrap_or_default(),
            deleted: row.is_deleted.unwrap_or(0) != 0,
            id: MessageId::new(row.id),
        }
    }
}

impl MessageStore for RemoteSqlStore {
    fn append(&self, message: &Message) -> Result<()> {
        let params = vec![
            json!(message.id.as_str()),
            json!(message.to_address),
            json!(message.from.address),
            json!(message.from.display_name),
            json!(message.subject),
            json!(message.html_body),
            json!(message.text_body),
            json!(attachments_json(message)?),
            json!(canonical_timestamp(&message.received_at)),
        ];

        let result = self
            .client
            .d1_query(
                &self.database_id,
                "INSERT OR IGNORE INTO emails (
                    id, to_address, from_address, from_name, subject,
                    html_content, text_content, attachments, date_received
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params,
                self.client.retry_budgets().fetch,
            )
            .map_err(|e| write_error(e, "remote insert failed"))?;

        if result.changes() == 0 {
            log::debug!("[STORE] Message {} already stored remotely, skipping", message.id);
        }
        Ok(())
    }

    fn list_by_address(&self, address: &InboxAddress) -> Result<Vec<Message>> {
        let result = self.client.d1_query(
            &self.database_id,
            "SELECT id, to_address, from_address, from_name, subject,
                    html_content, text_content, attachments, date_received, is_deleted
             FROM emails
             WHERE to_address = ? AND is_deleted = 0
             ORDER BY date_received DESC, id DESC",
            vec![json!(address.as_str())],
            self.client.retry_budgets().list,
        )?;

        let mut messages: Vec<Message> = result
            .results
            .into_iter()
            .filter_map(|row| match serde_json::from_value::<EmailRow>(row) {
                Ok(row) => Some(Message::from(row)),
                Err(e) => {
                    log::warn!("[STORE] Dropping undecodable remote row: {}", e);
                    None
                }
            })
            .filter(|m| !m.deleted)
            .collect();

        // Legacy rows may carry other timestamp spellings, so SQL text order is not trusted.
        sort_newest_first(&mut messages);
        Ok(messages)
    }

    fn soft_delete(&self, address: &InboxAddress, id: &MessageId) -> Result<()> {
        let result = self.client.d1_query(
            &self.database_id,
            "UPDATE emails SET is_deleted = 1
             WHERE to_address = ? AND id = ? AND is_deleted = 0",
            vec![json!(address.as_str()), json!(id.as_str())],
            self.client.retry_budgets().fetch,
        )?;

        if result.changes() == 0 {
            return Err(not_found(address, id));
        }
        Ok(())
    }
}

/// Address as the older worker stored it: a bare string or `{address, name}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyAddress {
    Plain(String),
    Mailbox {
        #[serde(default)]
        address: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
}

/// KV value shape written by the older mail worker
#[derive(Debug, Deserialize)]
struct LegacyKvValue {
    id: String,
    #[serde(default)]
    from: Option<LegacyAddress>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    attachments: Option<serde_json::Value>,
    date: String,
}

impl LegacyKvValue {
    /// The key's address is authoritative; the stored `to` is ignored.
    fn into_message(self, address: &str) -> Option<Message> {
        let received_at = DateTime::parse_from_rfc3339(&self.date)
            .or_else(|_| DateTime::parse_from_rfc2822(&self.date))
            .ok()?
            .with_timezone(&Utc)
            .trunc_subsecs(3);

        let from = match self.from {
            Some(LegacyAddress::Plain(s)) => Sender::parse(&s),
            Some(LegacyAddress::Mailbox { address, name }) => Sender {
                address: address.unwrap_or_default(),
                display_name: normalize_name(name),
            },
            None => Sender::new(UNKNOWN_SENDER),
        };
        let from = if from.address.trim().is_empty() {
            Sender::new(UNKNOWN_SENDER)
        } else {
            from
        };

        // Attachments from the old parser rarely match the current shape
        let attachments = self
            .attachments
            .and_then(|v| serde_json::from_value::<Vec<Attachment>>(v).ok())
            .unwrap_or_default();

        Some(Message {
            id: MessageId::new(self.id),
            to_address: address.to_string(),
            from,
            subject: self.subject.unwrap_or_default(),
            html_body: self.html.unwrap_or_default(),
            text_body: self.text.unwrap_or_default(),
            attachments,
            received_at,
            deleted: false,
        })
    }
}

/// Key/value store in a Workers KV namespace
pub struct RemoteKvStore {
    client: Arc<CloudflareClient>,
    namespace_id: String,
    ttl_secs: u64,
}

impl RemoteKvStore {
    pub fn new(client: Arc<CloudflareClient>, namespace_id: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            client,
            namespace_id: namespace_id.into(),
            ttl_secs,
        }
    }

    /// Decode a stored value in the current shape, falling back to the legacy one
    fn decode(key: &str, body: &str, address: &str) -> Option<Message> {
        let err = match serde_json::from_str::<Message>(body) {
            Ok(message) => return Some(message),
            Err(e) => e,
        };
        let legacy = serde_json::from_str::<LegacyKvValue>(body)
            .ok()
            .and_then(|legacy| legacy.into_message(address));
        if legacy.is_none() {
            log::warn!("[STORE] Dropping undecodable remote KV value {}: {}", key, err);
        }
        legacy
    }

    /// Current absolute expiry of `key`, read from the key listing
    fn current_expiry(&self, key: &str) -> Result<Option<i64>> {
        let keys = self.client.kv_list_keys(&self.namespace_id, key)?;
        Ok(keys
            .into_iter()
            .find(|k| k.name == key)
            .and_then(|k| k.expiration))
    }
}

impl MessageStore for RemoteKvStore {
    fn append(&self, message: &Message) -> Result<()> {
        let key = message.storage_key();

        let existing = self
            .client
            .kv_get(&self.namespace_id, &key)
            .map_err(|e| write_error(e, "remote kv lookup failed"))?;
        if let Some(body) = existing {
            if Self::decode(&key, &body, &message.to_address).is_some() {
                log::debug!("[STORE] Remote KV key {} already present, skipping", key);
                return Ok(());
            }
        }

        let value = serde_json::to_string(message).context("Failed to encode message")?;
        self.client
            .kv_put(&self.namespace_id, &key, &value, KvExpiry::Ttl(self.ttl_secs))
            .map_err(|e| write_error(e, "remote kv put failed"))
    }

    fn list_by_address(&self, address: &InboxAddress) -> Result<Vec<Message>> {
        let started = Instant::now();
        let deadline = self.client.retry_budgets().list.deadline;
        let prefix = storage_prefix(address.as_str());
        let keys = self.client.kv_list_keys(&self.namespace_id, &prefix)?;

        let total = keys.len();
        let mut messages = Vec::with_capacity(total);
        for (fetched, key) in keys.into_iter().enumerate() {
            if started.elapsed() > deadline {
                log::warn!(
                    "[STORE] Remote KV listing for {} hit its {:?} deadline, returning {} of {} keys",
                    address,
                    deadline,
                    fetched,
                    total
                );
                break;
            }
            let body = match self.client.kv_get(&self.namespace_id, &key.name) {
                Ok(Some(body)) => body,
                // Expired or removed between listing and fetch
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("[STORE] Skipping remote KV value {}: {}", key.name, e);
                    continue;
                }
            };
            let Some(message) = Self::decode(&key.name, &body, address.as_str()) else {
                continue;
            };
            if message.to_address != address.as_str() || message.deleted {
                continue;
            }
            messages.push(message);
        }

        sort_newest_first(&mut messages);
        Ok(messages)
    }

    fn soft_delete(&self, address: &InboxAddress, id: &MessageId) -> Result<()> {
        let key = storage_key(address.as_str(), id);

        let Some(body) = self.client.kv_get(&self.namespace_id, &key)? else {
            return Err(not_found(address, id));
        };
        let mut message = Self::decode(&key, &body, address.as_str())
            .ok_or_else(|| anyhow::anyhow!("Corrupt remote KV value {}", key))?;
        if message.deleted || message.to_address != address.as_str() {
            return Err(not_found(address, id));
        }

        message.deleted = true;
        let expiry = match self.current_expiry(&key)? {
            Some(at) => KvExpiry::At(at),
            None => KvExpiry::Ttl(self.ttl_secs),
        };
        let value = serde_json::to_string(&message).context("Failed to encode message")?;
        self.client
            .kv_put(&self.namespace_id, &key, &value, expiry)
            .map_err(|e| write_error(e, "remote kv put failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudflare::testing::{FnTransport, rate_limited, respond};
    use crate::cloudflare::{HttpMethod, HttpRequest, HttpResponse};
    use crate::retry::{RetryBudgets, RetryPolicy};
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use url::Url;

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

    fn make_client(transport: &Arc<FnTransport>) -> Arc<CloudflareClient> {
        Arc::new(
            CloudflareClient::new(transport.clone(), "acct", "token").with_retry(RetryBudgets {
                list: RetryPolicy::new(3, Duration::ZERO),
                fetch: RetryPolicy::new(2, Duration::ZERO),
            }),
        )
    }

    /// Minimal Workers KV namespace: values plus their absolute expiry
    #[derive(Default)]
    struct FakeNamespace {
        values: Mutex<HashMap<String, (String, Option<i64>)>>,
    }

    impl FakeNamespace {
        fn handle(&self, req: &HttpRequest) -> anyhow::Result<HttpResponse> {
            let url = Url::parse(&req.url)?;
            let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
            let last = url.path_segments().and_then(|mut s| s.next_back()).unwrap_or("");
            let mut values = self.values.lock().unwrap();

            if url.path().ends_with("/keys") {
                let prefix = query.get("prefix").cloned().unwrap_or_default();
                let mut names: Vec<_> = values
                    .iter()
                    .filter(|(k, _)| k.starts_with(&prefix))
                    .map(|(k, (_, exp))| json!({"name": k, "expiration": exp}))
                    .collect();
                names.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
                return respond(200, json!({"success": true, "result": names, "result_info": {"cursor": ""}}).to_string());
            }

            let key = urlencoding::decode(last)?.into_owned();
            match req.method {
                HttpMethod::Get => match values.get(&key) {
                    Some((body, _)) => respond(200, body.clone()),
                    None => respond(404, ""),
                },
                HttpMethod::Put => {
                    let expiration = match (query.get("expiration"), query.get("expiration_ttl")) {
                        (Some(at), _) => Some(at.parse()?),
                        (None, Some(ttl)) => Some(1_000_000_000 + ttl.parse::<i64>()?),
                        (None, None) => None,
                    };
                    values.insert(key, (req.body.clone().unwrap_or_default(), expiration));
                    respond(200, r#"{"success":true,"result":null}"#)
                }
                _ => respond(405, ""),
            }
        }
    }

    fn kv_fixture() -> (Arc<FakeNamespace>, Arc<FnTransport>, RemoteKvStore) {
        let namespace = Arc::new(FakeNamespace::default());
        let ns = namespace.clone();
        let transport = Arc::new(FnTransport::new(move |req| ns.handle(req)));
        let store = RemoteKvStore::new(make_client(&transport), "ns", 86_400);
        (namespace, transport, store)
    }

    #[test]
    fn test_kv_append_list_delete() {
        let (namespace, _transport, store) = kv_fixture();
        let older = make_message("user@domain.com", "older", 100);
        let newer = make_message("user@domain.com", "newer", 200);
        store.append(&older).unwrap();
        store.append(&newer).unwrap();
        store.append(&newer).unwrap();
        store
            .append(&make_message("user@domain.com:x@y.z", "elsewhere", 300))
            .unwrap();

        let listed = store.list_by_address(&addr("user@domain.com")).unwrap();
        assert_eq!(listed, vec![newer.clone(), older.clone()]);

        store.soft_delete(&addr("user@domain.com"), &newer.id).unwrap();
        let listed = store.list_by_address(&addr("user@domain.com")).unwrap();
        assert_eq!(listed, vec![older]);

        // Expiry written at append time survives the soft-delete rewrite
        let values = namespace.values.lock().unwrap();
        let (body, expiration) = &values[&newer.storage_key()];
        assert!(body.contains("\"deleted\":true"));
        assert_eq!(*expiration, Some(1_000_086_400));
    }

    #[test]
    fn test_kv_delete_other_address_or_twice_is_not_found() {
        let (_namespace, _transport, store) = kv_fixture();
        let message = make_message("user@domain.com", "x", 100);
        store.append(&message).unwrap();

        let err = store.soft_delete(&addr("other@domain.com"), &message.id).unwrap_err();
        assert!(matches!(err, InboxError::NotFound { .. }));

        store.soft_delete(&addr("user@domain.com"), &message.id).unwrap();
        let err = store.soft_delete(&addr("user@domain.com"), &message.id).unwrap_err();
        assert!(matches!(err, InboxError::NotFound { .. }));

        // Re-delivery keeps it hidden
        store.append(&message).unwrap();
        assert!(store.list_by_address(&addr("user@domain.com")).unwrap().is_empty());
    }

    #[test]
    fn test_kv_list_survives_failed_fetch() {
        let namespace = Arc::new(FakeNamespace::default());
        let good = make_message("user@domain.com", "good", 100);
        let bad = make_message("user@domain.com", "bad", 200);
        {
            let mut values = namespace.values.lock().unwrap();
            for m in [&good, &bad] {
                values.insert(m.storage_key(), (serde_json::to_string(m).unwrap(), None));
            }
        }
        let bad_key = urlencoding::encode(&bad.storage_key()).into_owned();
        let failing = bad_key.clone();
        let ns = namespace.clone();
        let transport = Arc::new(FnTransport::new(move |req| {
            if req.url.ends_with(&failing) {
                rate_limited(None)
            } else {
                ns.handle(req)
            }
        }));
        let store = RemoteKvStore::new(make_client(&transport), "ns", 86_400);

        let listed = store.list_by_address(&addr("user@domain.com")).unwrap();
        assert_eq!(listed, vec![good]);
        // fetch budget is two attempts
        assert_eq!(transport.count(|r| r.url.ends_with(&bad_key)), 2);
    }

    #[test]
    fn test_kv_list_rate_limit_surfaces_exhaustion() {
        let transport = Arc::new(FnTransport::new(|_| rate_limited(Some(Duration::ZERO))));
        let store = RemoteKvStore::new(make_client(&transport), "ns", 86_400);

        let err = store.list_by_address(&addr("user@domain.com")).unwrap_err();
        assert!(matches!(err, InboxError::RetriesExhausted { attempts: 3, .. }));
    }

    #[test]
    fn test_kv_append_lookup_failure_is_write_error() {
        let transport = Arc::new(FnTransport::new(|_| respond(500, "upstream unavailable")));
        let store = RemoteKvStore::new(make_client(&transport), "ns", 86_400);

        let err = store
            .append(&make_message("user@domain.com", "x", 100))
            .unwrap_err();
        assert!(matches!(err, InboxError::Write(_)));
        assert_eq!(transport.count(|r| r.method == HttpMethod::Put), 0);
    }

    #[test]
    fn test_kv_reads_values_from_older_worker() {
        let (namespace, _transport, store) = kv_fixture();
        let current = make_message("user@domain.com", "current", 100);
        store.append(&current).unwrap();
        {
            let mut values = namespace.values.lock().unwrap();
            values.insert(
                "user@domain.com:alice@example.com-Old-2024-01-01T00:00:00.000Z".to_string(),
                (
                    json!({
                        "id": "alice@example.com-Old-2024-01-01T00:00:00.000Z",
                        "from": {"address": "alice@example.com", "name": "Alice"},
                        "to": [{"address": "user@domain.com", "name": ""}],
                        "subject": "Old",
                        "html": "<p>old</p>",
                        "text": "old",
                        "attachments": [{"filename": "a.txt", "mimeType": "text/plain", "content": {}}],
                        "date": "2024-01-01T00:00:00.000Z"
                    })
                    .to_string(),
                    Some(1_000_000_500),
                ),
            );
        }

        let listed = store.list_by_address(&addr("user@domain.com")).unwrap();
        assert_eq!(listed.len(), 2);
        let old = &listed[0];
        assert_eq!(old.subject, "Old");
        assert_eq!(old.from.display_name.as_deref(), Some("Alice"));
        assert_eq!(old.to_address, "user@domain.com");
        assert!(old.attachments.is_empty());
        assert_eq!(listed[1], current);

        store.soft_delete(&addr("user@domain.com"), &old.id).unwrap();
        let listed = store.list_by_address(&addr("user@domain.com")).unwrap();
        assert_eq!(listed, vec![current]);
    }

    #[test]
    fn test_kv_list_stops_at_deadline() {
        let namespace = Arc::new(FakeNamespace::default());
        {
            let mut values = namespace.values.lock().unwrap();
            for m in [make_message("user@domain.com", "a", 100), make_message("user@domain.com", "b", 200)] {
                values.insert(m.storage_key(), (serde_json::to_string(&m).unwrap(), None));
            }
        }
        let ns = namespace.clone();
        let transport = Arc::new(FnTransport::new(move |req| {
            if req.url.contains("/keys") {
                std::thread::sleep(Duration::from_millis(20));
            }
            ns.handle(req)
        }));
        let client = CloudflareClient::new(transport.clone(), "acct", "token").with_retry(RetryBudgets {
            list: RetryPolicy::new(1, Duration::ZERO).with_deadline(Duration::from_millis(5)),
            fetch: RetryPolicy::new(1, Duration::ZERO),
        });
        let store = RemoteKvStore::new(Arc::new(client), "ns", 86_400);

        let listed = store.list_by_address(&addr("user@domain.com")).unwrap();
        assert!(listed.is_empty());
        assert_eq!(transport.count(|r| r.url.contains("/values/")), 0);
    }

    fn d1_response(results: serde_json::Value, changes: u64) -> anyhow::Result<HttpResponse> {
        respond(
            200,
            json!({
                "success": true,
                "errors": [],
                "result": [{"results": results, "success": true, "meta": {"changes": changes}}]
            })
            .to_string(),
        )
    }

    #[test]
    fn test_sql_list_decodes_and_sorts_rows() {
        let transport = Arc::new(FnTransport::new(|_| {
            d1_response(
                json!([
                    {
                        "id": "a", "to_address": "user@domain.com", "from_address": "x@y.z",
                        "from_name": "", "subject": "old", "html_content": null, "text_content": "t",
                        "attachments": "[]", "date_received": "2024-01-01T00:00:00.000Z", "is_deleted": 0
                    },
                    {"id": "broken"},
                    {
                        "id": "b", "to_address": "user@domain.com", "from_address": "x@y.z",
                        "from_name": "X", "subject": "new", "html_content": "<p>h</p>", "text_content": null,
                        "attachments": "not json", "date_received": "2024-02-01T00:00:00+00:00", "is_deleted": 0
                    }
                ]),
                0,
            )
        }));
        let store = RemoteSqlStore::new(make_client(&transport), "db");

        let listed = store.list_by_address(&addr("user@domain.com")).unwrap();
        let subjects: Vec<&str> = listed.iter().map(|m| m.subject.as_str()).collect();
        assert_eq!(subjects, vec!["new", "old"]);
        assert_eq!(listed[0].from.display_name.as_deref(), Some("X"));
        assert_eq!(listed[1].from.display_name, None);
        assert!(listed[0].attachments.is_empty());

        let requests = transport.requests.lock().unwrap();
        let body: serde_json::Value = serde_json::from_str(requests[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(body["params"], json!(["user@domain.com"]));
        assert!(body["sql"].as_str().unwrap().contains("is_deleted = 0"));
    }

    #[test]
    fn test_sql_delete_without_changes_is_not_found() {
        let transport = Arc::new(FnTransport::new(|_| d1_response(json!([]), 0)));
        let store = RemoteSqlStore::new(make_client(&transport), "db");

        let err = store
            .soft_delete(&addr("user@domain.com"), &MessageId::new("abc"))
            .unwrap_err();
        assert!(matches!(err, InboxError::NotFound { .. }));
    }

    #[test]
    fn test_sql_append_failure_is_write_error() {
        let transport = Arc::new(FnTransport::new(|_| {
            respond(500, r#"{"success":false,"errors":[{"code":1,"message":"boom"}]}"#)
        }));
        let store = RemoteSqlStore::new(make_client(&transport), "db");

        let err = store
            .append(&make_message("user@domain.com", "x", 100))
            .unwrap_err();
        assert!(matches!(err, InboxError::Write(_)));
    }
}
