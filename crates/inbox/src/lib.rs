//! Inbox crate - Disposable email ingestion and retrieval
//!
//! This crate provides:
//! - Raw MIME parsing into canonical messages with deterministic ids
//! - Storage trait with SQLite, LMDB and Cloudflare (D1 / KV) backends
//! - Preference-ordered backend routing with best-effort mirroring
//! - Bounded retry for rate-limited remote calls
//! - Polling change streams framed as Server-Sent Events
//! - New-mail notifications over Redis pub/sub
//! - Email Routing logs from the Cloudflare GraphQL API
//!
//! Everything is synchronous; the only threads are the per-subscription
//! stream pollers.

pub mod api;
pub mod cloudflare;
pub mod config;
pub mod error;
pub mod ingest;
pub mod models;
pub mod notify;
pub mod parser;
pub mod retry;
pub mod router;
pub mod storage;
pub mod stream;

pub use self::config::InboxConfig;
pub use api::ApiResponse;
pub use cloudflare::{CloudflareClient, HttpTransport, UreqTransport};
pub use error::{InboxError, ParseError, Result};
pub use ingest::{IngestOutcome, Ingestor};
pub use models::{Attachment, InboxAddress, Message, MessageId, Sender};
pub use notify::{
    MemoryPublisher, NoopPublisher, Notification, NotificationPublisher, RedisPublisher,
    manual_publisher_from_config, publisher_from_config,
};
pub use parser::{MessageParser, MimeDecoder};
pub use retry::{RetryBudgets, RetryPolicy};
pub use router::{AppendOutcome, Bindings, FallbackRouter, select_backend};
pub use storage::{
    BackendKind, HeedMessageStore, InMemoryMessageStore, MessageStore, RemoteKvStore,
    RemoteSqlStore, SqliteMessageStore, StoreFamily,
};
pub use stream::{ChangeStream, StreamEvent, Subscription};
