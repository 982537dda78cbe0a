//! Loader integration tests: many files over one connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ramux::storage::MemoryFolder;
use ramux::{
    FileFactory, Loader, LoaderConfig, Mux, MuxConfig, RamuxError, RandomAccess,
};
use tokio::io::duplex;

struct Setup {
    folder: MemoryFolder,
    calls: Arc<AtomicUsize>,
    server: Loader,
    client: Loader,
}

async fn setup() -> Setup {
    let (a, b) = duplex(1024 * 1024);
    let left = Mux::new(a, MuxConfig::default());
    let right = Mux::new(b, MuxConfig::default());

    let folder = MemoryFolder::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let factory = {
        let folder = folder.clone();
        let calls = calls.clone();
        move |name: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(folder.storage(name)) as Arc<dyn RandomAccess>)
        }
    };

    let server = Loader::serve(&left, factory, LoaderConfig::default())
        .await
        .unwrap();
    let client = Loader::connect(&right, LoaderConfig::default())
        .await
        .unwrap();
    client.opened().await.unwrap();

    Setup {
        folder,
        calls,
        server,
        client,
    }
}

/// Server writes a file, client loads it, reads and extends it.
#[tokio::test]
async fn test_loader_scenario() {
    let s = setup().await;

    let served = s.server.load("f").await.unwrap();
    served.write(0, Bytes::from_static(b"hello")).await.unwrap();

    let file = s.client.load("f").await.unwrap();
    assert_eq!(&file.read(0, 5).await.unwrap()[..], b"hello");
    file.write(5, Bytes::from_static(b"!!!")).await.unwrap();
    assert_eq!(file.stat().await.unwrap().size, 8);
    assert_eq!(&file.read(0, 8).await.unwrap()[..], b"hello!!!");

    assert_eq!(s.folder.contents("f").unwrap(), b"hello!!!");
    assert_eq!(s.calls.load(Ordering::SeqCst), 1);
    assert_eq!(file.file_hash().map(|h| h.to_vec()), Some(b"f".to_vec()));
}

/// A client can load a file the server never touched.
#[tokio::test]
async fn test_client_load_creates_server_file() {
    let s = setup().await;

    let file = s.client.load("new.bin").await.unwrap();
    file.write(0, Bytes::from_static(b"remote")).await.unwrap();

    assert!(s.server.is_loaded("new.bin"));
    assert_eq!(s.folder.contents("new.bin").unwrap(), b"remote");
}

/// Concurrent client loads of one name share one channel and one resource.
#[tokio::test]
async fn test_concurrent_loads_dedup() {
    let s = setup().await;

    let (a, b, c) = tokio::join!(
        s.client.load("a.txt"),
        s.client.load("a.txt"),
        s.client.load("a.txt"),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert!(a.ptr_eq(&b) && b.ptr_eq(&c));
    assert_eq!(s.calls.load(Ordering::SeqCst), 1);
    assert_eq!(s.client.loaded_files(), vec![s.client.key_for("a.txt")]);
}

/// Server unload closes the client's handle; client forget does not
/// affect the server's handle.
#[tokio::test]
async fn test_unload_asymmetry() {
    let s = setup().await;

    let served = s.server.load("a").await.unwrap();
    served.write(0, Bytes::from_static(b"data")).await.unwrap();
    let remote = s.client.load("a").await.unwrap();
    remote.read(0, 4).await.unwrap();

    assert!(s.client.forget("a"));
    assert_eq!(&served.read(0, 4).await.unwrap()[..], b"data");
    assert_eq!(&remote.read(0, 4).await.unwrap()[..], b"data");

    s.server.unload("a").await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), remote.closed())
        .await
        .unwrap();
    let err = remote.read(0, 4).await.unwrap_err();
    assert!(matches!(err, RamuxError::ChannelClosed));
}

/// Client unload asks the server to close the file.
#[tokio::test]
async fn test_client_unload_request() {
    let s = setup().await;

    let file = s.client.load("u").await.unwrap();
    file.write(0, Bytes::from_static(b"x")).await.unwrap();

    s.client.unload("u").await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), file.closed())
        .await
        .unwrap();
    assert!(!s.server.is_loaded("u"));

    // A fresh load after unload gets a new channel over the same bytes.
    let again = s.client.load("u").await.unwrap();
    assert!(!again.ptr_eq(&file));
    assert_eq!(&again.read(0, 1).await.unwrap()[..], b"x");
}

/// A declined load reports failure and leaves the name loadable.
#[tokio::test]
async fn test_load_failure_then_retry() {
    let (a, b) = duplex(256 * 1024);
    let left = Mux::new(a, MuxConfig::default());
    let right = Mux::new(b, MuxConfig::default());
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();

    let _server = Loader::serve(
        &left,
        move |name: &str| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RamuxError::NotFound(name.to_string()))
            } else {
                Ok(Arc::new(ramux::storage::MemoryStorage::new()) as Arc<dyn RandomAccess>)
            }
        },
        LoaderConfig::default(),
    )
    .await
    .unwrap();
    let client = Loader::connect(&right, LoaderConfig::default())
        .await
        .unwrap();

    let err = client.load("retry").await.unwrap_err();
    assert!(matches!(err.root(), RamuxError::LoadFailed(name) if name == "retry"));
    assert!(!client.is_loaded("retry"));

    let file = client.load("retry").await.unwrap();
    file.write(0, Bytes::from_static(b"ok")).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

/// Deferred files accept operations before they have loaded.
#[tokio::test]
async fn test_file_factory() {
    let (a, b) = duplex(256 * 1024);
    let left = Mux::new(a, MuxConfig::default());
    let right = Mux::new(b, MuxConfig::default());
    let folder = MemoryFolder::new();
    folder.create("doc", b"content".to_vec());

    let factory_folder = folder.clone();
    let _server = Loader::serve(
        &left,
        move |name: &str| Ok(Arc::new(factory_folder.storage(name)) as Arc<dyn RandomAccess>),
        LoaderConfig::default(),
    )
    .await
    .unwrap();
    let files = FileFactory::connect(&right, LoaderConfig::default())
        .await
        .unwrap();

    let doc = files.file("doc");
    assert_eq!(&doc.read(0, 7).await.unwrap()[..], b"content");
    assert!(files.file("doc").ptr_eq(&doc));

    doc.truncate(3).await.unwrap();
    doc.close().await.unwrap();
    assert_eq!(folder.contents("doc").unwrap(), b"con");
}

/// Custom hashing and protocol selection route names to their own channels.
#[tokio::test]
async fn test_custom_key_derivation() {
    let (a, b) = duplex(256 * 1024);
    let left = Mux::new(a, MuxConfig::default());
    let right = Mux::new(b, MuxConfig::default());
    let config = LoaderConfig::default()
        .protocol("files")
        .file_hasher(|name| Bytes::from(name.len().to_be_bytes().to_vec()))
        .protocol_handler(|name| {
            if name.ends_with(".log") {
                "logs".to_string()
            } else {
                "data".to_string()
            }
        });

    let folder = MemoryFolder::new();
    let factory_folder = folder.clone();
    let _server = Loader::serve(
        &left,
        move |name: &str| Ok(Arc::new(factory_folder.storage(name)) as Arc<dyn RandomAccess>),
        config.clone(),
    )
    .await
    .unwrap();
    let client = Loader::connect(&right, config).await.unwrap();

    let log = client.load("app.log").await.unwrap();
    let data = client.load("app.dat").await.unwrap();
    assert_eq!(log.key().protocol, "logs");
    assert_eq!(data.key().protocol, "data");
    assert_eq!(log.key().id, data.key().id);

    log.write(0, Bytes::from_static(b"L")).await.unwrap();
    data.write(0, Bytes::from_static(b"D")).await.unwrap();
    assert_eq!(folder.contents("app.log").unwrap(), b"L");
    assert_eq!(folder.contents("app.dat").unwrap(), b"D");
}

/// Many files load independently over one connection.
#[tokio::test]
async fn test_many_files() {
    let s = setup().await;

    let names: Vec<String> = (0..20).map(|i| format!("file-{i}")).collect();
    let loads = names.iter().map(|name| s.client.load(name));
    let files = futures::future::try_join_all(loads).await.unwrap();

    for (i, file) in files.iter().enumerate() {
        file.write(0, Bytes::from(vec![i as u8; 16])).await.unwrap();
    }
    for (i, name) in names.iter().enumerate() {
        assert_eq!(s.folder.contents(name).unwrap(), vec![i as u8; 16]);
    }
    assert_eq!(s.client.loaded_files().len(), 20);
    assert_eq!(s.calls.load(Ordering::SeqCst), 20);
}
