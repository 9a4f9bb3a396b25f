//! Storage traits and implementations
//!
//! Four backend variants share the [`MessageStore`] contract: local SQLite,
//! local LMDB key/value, and their remote counterparts reached over HTTP.
//! The in-memory store is for tests.

mod heed;
mod memory;
mod remote;
mod sqlite;
mod traits;

pub use self::heed::HeedMessageStore;
pub use memory::InMemoryMessageStore;
pub use remote::{RemoteKvStore, RemoteSqlStore};
pub use sqlite::SqliteMessageStore;
pub use traits::{BackendKind, MessageStore, StoreFamily};
