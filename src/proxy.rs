//! Handles usable before their file has loaded.
//!
//! A [`DeferredFile`] starts loading on construction. Operations issued
//! while the load is in flight are queued and replayed in order, one at a
//! time, once the channel is available; after the queue drains, calls go
//! straight to the channel.
//!
//! [`FileFactory`] hands out one `DeferredFile` per file name.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::oneshot;

use crate::capability::CapabilitySet;
use crate::channel::ResourceChannel;
use crate::error::{RamuxError, Result};
use crate::loader::{Loader, LoaderConfig};
use crate::mux::{ChannelKey, Mux};
use crate::storage::{RandomAccess, Stat};

type Loaded = std::result::Result<ResourceChannel, Arc<RamuxError>>;
type Deferred = Box<dyn FnOnce(Loaded) -> BoxFuture<'static, ()> + Send>;

enum State {
    /// Load in flight, or queue still draining.
    Pending(VecDeque<Deferred>),
    Ready(ResourceChannel),
    Failed(Arc<RamuxError>),
}

impl State {
    fn settled(loaded: &Loaded) -> Self {
        match loaded {
            Ok(channel) => State::Ready(channel.clone()),
            Err(e) => State::Failed(e.clone()),
        }
    }
}

enum Next<T> {
    Run(ResourceChannel),
    Fail(Arc<RamuxError>),
    Wait(oneshot::Receiver<Result<T>>),
}

/// A file handle that queues operations until its load completes.
#[derive(Clone)]
pub struct DeferredFile {
    name: Arc<str>,
    loader: Loader,
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeferredFile {
    /// Start loading `name` through `loader`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(loader: Loader, name: &str) -> Self {
        let file = Self {
            name: Arc::from(name),
            loader,
            state: Arc::new(Mutex::new(State::Pending(VecDeque::new()))),
        };

        let loader = file.loader.clone();
        let state = file.state.clone();
        let name = file.name.clone();
        tokio::spawn(async move {
            let loaded = match loader.load(&name).await {
                Ok(channel) => match channel.open().await {
                    Ok(()) => Ok(channel),
                    Err(e) => {
                        tracing::debug!(file = %name, error = %e, "open after load failed");
                        Err(Arc::new(e))
                    }
                },
                Err(e) => Err(Arc::new(e)),
            };
            settle(&state, loaded).await;
        });

        file
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    /// Check if calls now go straight to the channel.
    pub fn is_ready(&self) -> bool {
        matches!(*lock(&self.state), State::Ready(_))
    }

    /// The loaded channel, if available.
    pub fn channel(&self) -> Option<ResourceChannel> {
        match &*lock(&self.state) {
            State::Ready(channel) => Some(channel.clone()),
            _ => None,
        }
    }

    /// Wait for the load (and anything queued before this call).
    pub async fn ready(&self) -> Result<ResourceChannel> {
        self.call(|channel| async move { Ok(channel) }).await
    }

    /// Check if both handles share the same state.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(ResourceChannel) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut op = Some(op);
        let next = {
            let mut state = lock(&self.state);
            match &mut *state {
                State::Ready(channel) => Next::Run(channel.clone()),
                State::Failed(e) => Next::Fail(e.clone()),
                State::Pending(queue) => {
                    let (tx, rx) = oneshot::channel();
                    if let Some(op) = op.take() {
                        queue.push_back(defer(op, tx));
                    }
                    Next::Wait(rx)
                }
            }
        };

        match (next, op) {
            (Next::Run(channel), Some(op)) => op(channel).await,
            (Next::Run(_), None) => Err(RamuxError::ChannelClosed),
            (Next::Fail(e), _) => Err(RamuxError::Shared(e)),
            (Next::Wait(rx), _) => rx.await.map_err(|_| RamuxError::ChannelClosed)?,
        }
    }
}

/// Package `op` to run once the load settles, reporting through `tx`.
fn defer<T, F, Fut>(op: F, tx: oneshot::Sender<Result<T>>) -> Deferred
where
    T: Send + 'static,
    F: FnOnce(ResourceChannel) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Box::new(move |loaded: Loaded| {
        async move {
            let result = match loaded {
                Ok(channel) => op(channel).await,
                Err(e) => Err(RamuxError::Shared(e)),
            };
            let _ = tx.send(result);
        }
        .boxed()
    })
}

/// Replay queued calls in order, then switch to direct delegation.
async fn settle(state: &Mutex<State>, loaded: Loaded) {
    let mut replayed = 0usize;
    loop {
        let next = {
            let mut guard = lock(state);
            let popped = match &mut *guard {
                State::Pending(queue) => queue.pop_front(),
                _ => None,
            };
            if popped.is_none() {
                *guard = State::settled(&loaded);
            }
            popped
        };
        match next {
            Some(deferred) => {
                deferred(loaded.clone()).await;
                replayed += 1;
            }
            None => break,
        }
    }
    tracing::trace!(replayed, ok = loaded.is_ok(), "deferred file settled");
}

#[async_trait]
impl RandomAccess for DeferredFile {
    /// Empty until the load has completed.
    fn capabilities(&self) -> CapabilitySet {
        self.channel()
            .map(|channel| channel.capabilities())
            .unwrap_or_default()
    }

    async fn open(&self) -> Result<()> {
        self.call(|channel| async move { channel.open().await }).await
    }

    async fn read(&self, offset: u64, size: u64) -> Result<Bytes> {
        self.call(move |channel| async move { channel.read(offset, size).await })
            .await
    }

    async fn write(&self, offset: u64, data: Bytes) -> Result<()> {
        self.call(move |channel| async move { channel.write(offset, data).await })
            .await
    }

    async fn del(&self, offset: u64, size: u64) -> Result<()> {
        self.call(move |channel| async move { channel.del(offset, size).await })
            .await
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        self.call(move |channel| async move { channel.truncate(size).await })
            .await
    }

    async fn stat(&self) -> Result<Stat> {
        self.call(|channel| async move { channel.stat().await }).await
    }

    async fn unlink(&self) -> Result<()> {
        self.call(|channel| async move { channel.unlink().await }).await
    }

    async fn close(&self) -> Result<()> {
        self.call(|channel| async move { channel.close().await }).await
    }
}

impl fmt::Debug for DeferredFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*lock(&self.state) {
            State::Pending(queue) => format!("pending({})", queue.len()),
            State::Ready(_) => "ready".to_string(),
            State::Failed(e) => format!("failed({})", e),
        };
        f.debug_struct("DeferredFile")
            .field("name", &self.name)
            .field("state", &state)
            .finish()
    }
}

/// Memoized [`DeferredFile`]s over one client loader.
#[derive(Clone)]
pub struct FileFactory {
    loader: Loader,
    files: Arc<Mutex<HashMap<ChannelKey, DeferredFile>>>,
}

impl FileFactory {
    pub fn new(loader: Loader) -> Self {
        Self {
            loader,
            files: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connect a client loader on `mux` and wrap it.
    pub async fn connect(mux: &Mux, config: LoaderConfig) -> Result<Self> {
        Ok(Self::new(Loader::connect(mux, config).await?))
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    /// The handle for `name`. Every call for the same file returns the
    /// same handle, so the file is loaded once.
    pub fn file(&self, name: &str) -> DeferredFile {
        let key = self.loader.key_for(name);
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files
            .entry(key)
            .or_insert_with(|| DeferredFile::new(self.loader.clone(), name))
            .clone()
    }
}

impl fmt::Debug for FileFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.files.lock().map(|files| files.len()).unwrap_or(0);
        f.debug_struct("FileFactory")
            .field("loader", &self.loader)
            .field("files", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::MuxConfig;
    use crate::storage::MemoryFolder;
    use tokio::io::duplex;

    async fn setup(folder: MemoryFolder) -> (Loader, FileFactory) {
        let (a, b) = duplex(256 * 1024);
        let left = Mux::new(a, MuxConfig::default());
        let right = Mux::new(b, MuxConfig::default());
        let server = Loader::serve(
            &left,
            move |name: &str| Ok(Arc::new(folder.storage(name)) as Arc<dyn RandomAccess>),
            LoaderConfig::default(),
        )
        .await
        .unwrap();
        let factory = FileFactory::connect(&right, LoaderConfig::default())
            .await
            .unwrap();
        (server, factory)
    }

    #[tokio::test]
    async fn test_operations_queue_until_loaded() {
        let (_server, factory) = setup(MemoryFolder::new()).await;
        let file = factory.file("queued");
        assert!(!file.is_ready());

        // Issued before the load finishes; replayed in order.
        let (w, r, s) = tokio::join!(
            file.write(0, Bytes::from_static(b"abc")),
            file.read(0, 3),
            file.stat(),
        );
        w.unwrap();
        assert_eq!(&r.unwrap()[..], b"abc");
        assert_eq!(s.unwrap().size, 3);

        assert!(file.is_ready());
        assert!(file.capabilities().readable());
    }

    #[tokio::test]
    async fn test_factory_memoizes_by_name() {
        let (_server, factory) = setup(MemoryFolder::new()).await;
        let a = factory.file("same");
        let b = factory.file("same");
        let c = factory.file("other");
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));

        let channel = a.ready().await.unwrap();
        assert!(channel.ptr_eq(&b.ready().await.unwrap()));
    }

    #[tokio::test]
    async fn test_missing_file_reports_not_found() {
        let folder = MemoryFolder::strict();
        folder.create("present", b"here".to_vec());
        let (_server, factory) = setup(folder).await;

        let missing = factory.file("absent");
        let err = missing.read(0, 1).await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
        assert!(missing.stat().await.unwrap_err().is_not_found());
        assert!(!missing.is_ready());

        let present = factory.file("present");
        assert_eq!(&present.read(0, 4).await.unwrap()[..], b"here");
    }

    #[tokio::test]
    async fn test_failed_load_fails_queued_operations() {
        let (a, b) = duplex(64 * 1024);
        let left = Mux::new(a, MuxConfig::default());
        let right = Mux::new(b, MuxConfig::default());
        let _server = Loader::serve(
            &left,
            |name: &str| Err(RamuxError::NotFound(name.to_string())),
            LoaderConfig::default(),
        )
        .await
        .unwrap();
        let factory = FileFactory::connect(&right, LoaderConfig::default())
            .await
            .unwrap();

        let file = factory.file("nope");
        let err = file.read(0, 1).await.unwrap_err();
        assert!(matches!(err.root(), RamuxError::LoadFailed(_)));
        assert!(file.stat().await.is_err());
        assert!(!file.is_ready());
    }
}
