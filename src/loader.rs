//! Many files over one connection.
//!
//! A [`Loader`] owns a control session (`load`/`unload`) and a map from
//! channel key to the load of that file. Each loaded file is its own
//! [`ResourceChannel`], keyed by `(protocol_handler(name), file_hasher(name))`.
//!
//! Concurrent loads of one name share a single in-flight load: the first
//! caller inserts the entry before anything is awaited and later callers
//! wait on the same future. Entries leave the map when their channel closes
//! or their load fails, so a later load starts fresh.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::channel::{ChannelConfig, ResourceChannel, Role, DEFAULT_PROTOCOL};
use crate::codec::{Bool, Utf8};
use crate::error::{RamuxError, Result};
use crate::mux::{ChannelKey, Mux};
use crate::rpc::{Dispatcher, Rpc, RpcBuilder, DEFAULT_TIMEOUT};
use crate::storage::RandomAccess;

/// Default protocol namespace of the control session.
pub const DEFAULT_LOADER_PROTOCOL: &str = "randomAccessChannelLoader";

/// Builds the backing resource for a file name.
pub type StorageFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn RandomAccess>> + Send + Sync>;
/// Maps a file name to its channel id.
pub type FileHasher = Arc<dyn Fn(&str) -> Bytes + Send + Sync>;
/// Maps a file name to its channel protocol.
pub type ProtocolHandler = Arc<dyn Fn(&str) -> String + Send + Sync>;

type LoadOutput = std::result::Result<ResourceChannel, Arc<RamuxError>>;
type LoadFuture = Shared<BoxFuture<'static, LoadOutput>>;

/// Loader settings.
#[derive(Clone)]
pub struct LoaderConfig {
    /// Control session namespace.
    pub protocol: String,
    /// Control session id.
    pub id: Bytes,
    /// Request timeout for the control session and every file channel.
    pub timeout: Duration,
    file_hasher: FileHasher,
    protocol_handler: ProtocolHandler,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_LOADER_PROTOCOL.to_string(),
            id: Bytes::new(),
            timeout: DEFAULT_TIMEOUT,
            file_hasher: Arc::new(|name: &str| Bytes::copy_from_slice(name.as_bytes())),
            protocol_handler: Arc::new(|_: &str| DEFAULT_PROTOCOL.to_string()),
        }
    }
}

impl LoaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn id(mut self, id: impl Into<Bytes>) -> Self {
        self.id = id.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Derive channel ids from file names. Defaults to the UTF-8 bytes.
    pub fn file_hasher<F>(mut self, hasher: F) -> Self
    where
        F: Fn(&str) -> Bytes + Send + Sync + 'static,
    {
        self.file_hasher = Arc::new(hasher);
        self
    }

    /// Choose the channel protocol per file name.
    pub fn protocol_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.protocol_handler = Arc::new(handler);
        self
    }

    fn key_for(&self, name: &str) -> ChannelKey {
        ChannelKey::new((self.protocol_handler)(name), (self.file_hasher)(name))
    }
}

impl fmt::Debug for LoaderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderConfig")
            .field("protocol", &self.protocol)
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

struct Entry {
    generation: u64,
    load: LoadFuture,
}

impl Entry {
    /// A finished load whose channel has since closed.
    fn is_stale(&self) -> bool {
        matches!(self.load.peek(), Some(Ok(channel)) if channel.is_closed())
    }

    /// The channel of a load that has finished successfully.
    fn settled(&self) -> Option<ResourceChannel> {
        match self.load.peek() {
            Some(Ok(channel)) => Some(channel.clone()),
            _ => None,
        }
    }
}

/// How a load was started.
#[derive(Clone, Copy)]
enum Origin {
    /// Called on this side.
    Local,
    /// Accepted from the peer's `load` request; wait for its attach first.
    Remote,
}

pub(crate) struct LoaderInner {
    role: Role,
    mux: Mux,
    rpc: Rpc,
    config: LoaderConfig,
    factory: Option<StorageFactory>,
    files: Mutex<HashMap<ChannelKey, Entry>>,
    generation: AtomicU64,
}

impl LoaderInner {
    fn files(&self) -> MutexGuard<'_, HashMap<ChannelKey, Entry>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove_entry(&self, key: &ChannelKey, generation: u64) {
        let mut files = self.files();
        if files.get(key).is_some_and(|e| e.generation == generation) {
            files.remove(key);
            tracing::trace!(key = %key, "file entry removed");
        }
    }
}

/// Loads files by name over one connection. Cheap to clone.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

impl Loader {
    /// Serve files built by `factory`.
    pub async fn serve<F>(mux: &Mux, factory: F, config: LoaderConfig) -> Result<Self>
    where
        F: Fn(&str) -> Result<Arc<dyn RandomAccess>> + Send + Sync + 'static,
    {
        let cell: Arc<OnceLock<Weak<LoaderInner>>> = Arc::new(OnceLock::new());

        let load_cell = cell.clone();
        let unload_cell = cell.clone();
        let builder = RpcBuilder::new()
            .timeout(config.timeout)
            .respond::<Utf8, _, _>("load", move |name, ctx| {
                let loader = upgrade(&load_cell);
                async move {
                    let accepted = loader?.accept_remote_load(&name);
                    ctx.respond::<Bool>(&accepted).await
                }
            })
            .respond::<Utf8, _, _>("unload", move |name, ctx| {
                let loader = upgrade(&unload_cell);
                async move {
                    loader?.unload(&name).await?;
                    ctx.respond::<Bool>(&true).await
                }
            });

        let factory: StorageFactory = Arc::new(factory);
        let (loader, dispatcher) =
            Self::start(mux, builder, Role::Server, Some(factory), config).await?;
        let _ = cell.set(Arc::downgrade(&loader.inner));
        dispatcher.spawn();
        Ok(loader)
    }

    /// Attach to a peer's loader.
    pub async fn connect(mux: &Mux, config: LoaderConfig) -> Result<Self> {
        let builder = RpcBuilder::new().timeout(config.timeout);
        let (loader, dispatcher) = Self::start(mux, builder, Role::Client, None, config).await?;
        dispatcher.spawn();
        Ok(loader)
    }

    async fn start(
        mux: &Mux,
        builder: RpcBuilder,
        role: Role,
        factory: Option<StorageFactory>,
        config: LoaderConfig,
    ) -> Result<(Self, Dispatcher)> {
        let key = ChannelKey::new(config.protocol.clone(), config.id.clone());
        let (rpc, dispatcher) = builder.open(mux, key, Bytes::new()).await?;
        tracing::debug!(key = %rpc.key(), ?role, "loader started");

        let inner = LoaderInner {
            role,
            mux: mux.clone(),
            rpc,
            config,
            factory,
            files: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            dispatcher,
        ))
    }

    pub(crate) fn from_inner(inner: Arc<LoaderInner>) -> Self {
        Self { inner }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_server(&self) -> bool {
        self.inner.role == Role::Server
    }

    pub fn mux(&self) -> &Mux {
        &self.inner.mux
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Wait for the peer's loader to attach.
    pub async fn opened(&self) -> Result<()> {
        self.inner.rpc.opened().await.map(|_| ())
    }

    /// Wait until the control session closes.
    pub async fn closed(&self) {
        self.inner.rpc.closed().await
    }

    /// Channel key a file name maps to.
    pub fn key_for(&self, name: &str) -> ChannelKey {
        self.inner.config.key_for(name)
    }

    /// Keys of every tracked file, loaded or loading.
    pub fn loaded_files(&self) -> Vec<ChannelKey> {
        self.inner
            .files()
            .iter()
            .filter(|(_, e)| !e.is_stale())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        let key = self.key_for(name);
        self.inner.files().get(&key).is_some_and(|e| !e.is_stale())
    }

    /// Load `name`, or join the load already in flight for it.
    pub async fn load(&self, name: &str) -> Result<ResourceChannel> {
        let key = self.key_for(name);
        let load = {
            let mut files = self.inner.files();
            match files.get(&key) {
                Some(entry) if !entry.is_stale() => entry.load.clone(),
                _ => {
                    let entry = self.start_load(key.clone(), name, Origin::Local, None);
                    let load = entry.load.clone();
                    files.insert(key, entry);
                    load
                }
            }
        };
        load.await.map_err(RamuxError::Shared)
    }

    /// Handle a peer's `load` request: `true` if the file is (being) served.
    fn accept_remote_load(&self, name: &str) -> bool {
        let key = self.key_for(name);
        let mut files = self.inner.files();
        if files.get(&key).is_some_and(|e| !e.is_stale()) {
            return true;
        }

        let resource = match self.build_resource(name) {
            Ok(resource) => resource,
            Err(e) => {
                tracing::warn!(file = name, error = %e, "refusing remote load");
                return false;
            }
        };
        let entry = self.start_load(key.clone(), name, Origin::Remote, Some(resource));
        files.insert(key, entry);
        true
    }

    fn build_resource(&self, name: &str) -> Result<Arc<dyn RandomAccess>> {
        let factory = self
            .inner
            .factory
            .as_ref()
            .ok_or_else(|| RamuxError::Config("loader has no storage factory".into()))?;
        factory(name)
    }

    /// Build the entry for a new load and start driving it.
    ///
    /// Called with the files lock held; nothing here awaits.
    fn start_load(
        &self,
        key: ChannelKey,
        name: &str,
        origin: Origin,
        resource: Option<Arc<dyn RandomAccess>>,
    ) -> Entry {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let loader = self.clone();
        let name = name.to_string();

        let load = async move {
            let result = loader.open_file(&key, &name, origin, resource).await;
            match result {
                Ok(channel) => {
                    loader.track(&channel, key, generation);
                    Ok(channel)
                }
                Err(e) => {
                    tracing::debug!(file = %name, error = %e, "load failed");
                    loader.inner.remove_entry(&key, generation);
                    Err(Arc::new(e))
                }
            }
        }
        .boxed()
        .shared();

        // Drive the load even if no caller awaits it (remote loads).
        tokio::spawn(load.clone().map(|_| ()));

        Entry { generation, load }
    }

    async fn open_file(
        &self,
        key: &ChannelKey,
        name: &str,
        origin: Origin,
        resource: Option<Arc<dyn RandomAccess>>,
    ) -> Result<ResourceChannel> {
        let inner = &self.inner;
        let config = ChannelConfig::default()
            .protocol(key.protocol.clone())
            .id(key.id.clone())
            .timeout(inner.config.timeout);

        match inner.role {
            Role::Server => {
                if let Origin::Remote = origin {
                    let pair = tokio::time::timeout(inner.config.timeout, inner.mux.pair(key));
                    let paired = match pair.await {
                        Ok(paired) => paired,
                        Err(_) => Err(RamuxError::Timeout(inner.config.timeout)),
                    };
                    if let Err(e) = paired {
                        if let Some(resource) = &resource {
                            if let Err(close) = resource.close().await {
                                tracing::trace!(file = name, error = %close, "unserved resource not closed");
                            }
                        }
                        return Err(e);
                    }
                }
                let resource = match resource {
                    Some(resource) => resource,
                    None => self.build_resource(name)?,
                };
                ResourceChannel::serve(&inner.mux, move || Ok(resource), &config).await
            }
            Role::Client => {
                let accepted = inner
                    .rpc
                    .request::<Utf8, Bool>("load", &name.to_string())
                    .await?;
                if !accepted {
                    return Err(RamuxError::LoadFailed(name.to_string()));
                }
                ResourceChannel::connect(&inner.mux, &config).await
            }
        }
    }

    /// Attach metadata and drop the entry once the channel closes.
    fn track(&self, channel: &ResourceChannel, key: ChannelKey, generation: u64) {
        channel.attach_metadata(Arc::downgrade(&self.inner), key.id.clone());

        let weak = Arc::downgrade(&self.inner);
        let watched = channel.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if let Some(inner) = weak.upgrade() {
                inner.remove_entry(&key, generation);
            }
        });
        tracing::debug!(key = %channel.key(), "file loaded");
    }

    /// Unload `name`.
    ///
    /// On the server this closes the file's channel, which also closes the
    /// peer's handle. A load still in flight is left alone. On the client it
    /// asks the server to unload.
    pub async fn unload(&self, name: &str) -> Result<()> {
        match self.inner.role {
            Role::Server => {
                let key = self.key_for(name);
                let settled = self.inner.files().get(&key).and_then(Entry::settled);
                match settled {
                    Some(channel) => channel.close().await,
                    None => Ok(()),
                }
            }
            Role::Client => {
                self.inner
                    .rpc
                    .request::<Utf8, Bool>("unload", &name.to_string())
                    .await?;
                Ok(())
            }
        }
    }

    /// Close every file served by this loader.
    pub async fn unload_all(&self) -> Result<()> {
        if self.inner.role == Role::Client {
            return Err(RamuxError::Config(
                "a file name is required to unload from the client side".into(),
            ));
        }
        let channels: Vec<ResourceChannel> =
            self.inner.files().values().filter_map(Entry::settled).collect();
        let mut first_error = None;
        for channel in channels {
            if let Err(e) = channel.close().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drop the local entry for `name` without telling the peer.
    ///
    /// The channel stays open. Returns whether an entry existed.
    pub fn forget(&self, name: &str) -> bool {
        let key = self.key_for(name);
        self.inner.files().remove(&key).is_some()
    }
}

fn upgrade(cell: &OnceLock<Weak<LoaderInner>>) -> Result<Loader> {
    cell.get()
        .and_then(Weak::upgrade)
        .map(Loader::from_inner)
        .ok_or(RamuxError::ChannelClosed)
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("role", &self.inner.role)
            .field("key", self.inner.rpc.key())
            .field("files", &self.inner.files().len())
            .finish()
    }
}
