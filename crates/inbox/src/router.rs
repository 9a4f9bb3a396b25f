//! Backend selection with a fixed preference order
//!
//! The router picks the most preferred store present in [`Bindings`] for
//! every call. A failure in the selected store is returned as is; the only
//! cross-store traffic is the best-effort mirror into the other storage
//! family after a successful append or soft-delete.

use std::sync::Arc;

use crate::cloudflare::CloudflareClient;
use crate::config::InboxConfig;
use crate::error::{InboxError, Result};
use crate::models::{InboxAddress, Message, MessageId};
use crate::storage::{
    BackendKind, HeedMessageStore, MessageStore, RemoteKvStore, RemoteSqlStore,
    SqliteMessageStore,
};

/// Storage handles available in the current execution context
#[derive(Default, Clone)]
pub struct Bindings {
    primary: Option<Arc<dyn MessageStore>>,
    key_value: Option<Arc<dyn MessageStore>>,
    remote_primary: Option<Arc<dyn MessageStore>>,
    remote_key_value: Option<Arc<dyn MessageStore>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `store` as the given variant, replacing any previous binding
    pub fn with(mut self, kind: BackendKind, store: Arc<dyn MessageStore>) -> Self {
        *self.slot_mut(kind) = Some(store);
        self
    }

    pub fn with_primary(self, store: Arc<dyn MessageStore>) -> Self {
        self.with(BackendKind::Primary, store)
    }

    pub fn with_key_value(self, store: Arc<dyn MessageStore>) -> Self {
        self.with(BackendKind::KeyValue, store)
    }

    pub fn with_remote_primary(self, store: Arc<dyn MessageStore>) -> Self {
        self.with(BackendKind::RemotePrimary, store)
    }

    pub fn with_remote_key_value(self, store: Arc<dyn MessageStore>) -> Self {
        self.with(BackendKind::RemoteKeyValue, store)
    }

    pub fn get(&self, kind: BackendKind) -> Option<&Arc<dyn MessageStore>> {
        match kind {
            BackendKind::Primary => self.primary.as_ref(),
            BackendKind::KeyValue => self.key_value.as_ref(),
            BackendKind::RemotePrimary => self.remote_primary.as_ref(),
            BackendKind::RemoteKeyValue => self.remote_key_value.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: BackendKind) -> &mut Option<Arc<dyn MessageStore>> {
        match kind {
            BackendKind::Primary => &mut self.primary,
            BackendKind::KeyValue => &mut self.key_value,
            BackendKind::RemotePrimary => &mut self.remote_primary,
            BackendKind::RemoteKeyValue => &mut self.remote_key_value,
        }
    }

    /// Bound variants, most preferred first
    pub fn available(&self) -> Vec<BackendKind> {
        BackendKind::PREFERENCE
            .into_iter()
            .filter(|kind| self.get(*kind).is_some())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.available().is_empty()
    }

    /// Open every store the configuration describes
    pub fn from_config(config: &InboxConfig) -> Result<Self> {
        let mut bindings = Bindings::new();

        if let Some(path) = &config.sqlite_path {
            bindings = bindings.with_primary(Arc::new(SqliteMessageStore::new(path)?));
        }
        if let Some(path) = &config.kv_path {
            bindings = bindings.with_key_value(Arc::new(HeedMessageStore::new(path, config.kv_ttl())?));
        }

        let cf = &config.cloudflare;
        if let Some(client) = CloudflareClient::from_config(config)? {
            let client = Arc::new(client);

            if let Some(database_id) = &cf.database_id {
                bindings = bindings
                    .with_remote_primary(Arc::new(RemoteSqlStore::new(client.clone(), database_id.as_str())));
            }
            if let Some(namespace_id) = &cf.kv_namespace_id {
                bindings = bindings.with_remote_key_value(Arc::new(RemoteKvStore::new(
                    client,
                    namespace_id.as_str(),
                    config.kv_ttl_secs(),
                )));
            }
        }

        if bindings.is_empty() {
            log::warn!("[ROUTER] No storage bindings configured");
        } else {
            log::info!("[ROUTER] Bound backends: {:?}", bindings.available());
        }
        Ok(bindings)
    }
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings")
            .field("available", &self.available())
            .finish()
    }
}

/// Most preferred bound variant
pub fn select_backend(bindings: &Bindings) -> Result<BackendKind> {
    BackendKind::PREFERENCE
        .into_iter()
        .find(|kind| bindings.get(*kind).is_some())
        .ok_or(InboxError::BackendUnavailable)
}

/// Most preferred bound variant of the other storage family
fn mirror_target(bindings: &Bindings, selected: BackendKind) -> Option<BackendKind> {
    BackendKind::PREFERENCE
        .into_iter()
        .find(|kind| kind.family() != selected.family() && bindings.get(*kind).is_some())
}

/// Where an append landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub stored_in: BackendKind,
    /// Set only when the mirror write succeeded
    pub mirrored_to: Option<BackendKind>,
}

pub struct FallbackRouter {
    bindings: Bindings,
}

impl FallbackRouter {
    pub fn new(bindings: Bindings) -> Self {
        Self { bindings }
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Selected variant and its store
    pub fn select(&self) -> Result<(BackendKind, &Arc<dyn MessageStore>)> {
        let kind = select_backend(&self.bindings)?;
        let store = self.bindings.get(kind).ok_or(InboxError::BackendUnavailable)?;
        Ok((kind, store))
    }

    pub fn append(&self, message: &Message) -> Result<AppendOutcome> {
        InboxAddress::parse(&message.to_address)?;
        validate_id(message.id.as_str())?;

        let (kind, store) = self.select()?;
        store.append(message)?;
        log::debug!("[ROUTER] Stored {} in {}", message.id, kind);

        let mirrored_to = mirror_target(&self.bindings, kind).and_then(|target| {
            let store = self.bindings.get(target)?;
            match store.append(message) {
                Ok(()) => Some(target),
                Err(e) => {
                    log::warn!("[ROUTER] Mirror append of {} to {} failed: {}", message.id, target, e);
                    None
                }
            }
        });

        Ok(AppendOutcome {
            stored_in: kind,
            mirrored_to,
        })
    }

    pub fn list_by_address(&self, address: &str) -> Result<Vec<Message>> {
        let address = InboxAddress::parse(address)?;
        let (_, store) = self.select()?;
        store.list_by_address(&address)
    }

    pub fn soft_delete(&self, address: &str, id: &str) -> Result<()> {
        let address = InboxAddress::parse(address)?;
        validate_id(id)?;
        let id = MessageId::new(id);

        let (kind, store) = self.select()?;
        store.soft_delete(&address, &id)?;
        log::info!("[ROUTER] Soft-deleted {} for {} in {}", id, address, kind);

        let mirror = mirror_target(&self.bindings, kind)
            .and_then(|target| Some((target, self.bindings.get(target)?)));
        if let Some((target, store)) = mirror {
            match store.soft_delete(&address, &id) {
                Ok(()) => {}
                Err(InboxError::NotFound { .. }) => {
                    log::debug!("[ROUTER] {} not present in mirror {}", id, target)
                }
                Err(e) => log::warn!("[ROUTER] Mirror delete of {} in {} failed: {}", id, target, e),
            }
        }
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(InboxError::Validation("message id is required".to_string()));
    }
    Ok(())
}
