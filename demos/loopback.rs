//! Serve an in-memory folder over an in-process connection and use it
//! from a client loader.
//!
//! Run with: `RUST_LOG=ramux=debug cargo run --example loopback`

use std::sync::Arc;

use bytes::Bytes;
use ramux::storage::MemoryFolder;
use ramux::{FileFactory, Loader, LoaderConfig, Mux, MuxConfig, RandomAccess};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ramux::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let (a, b) = tokio::io::duplex(1024 * 1024);
    let server_mux = Mux::new(a, MuxConfig::default());
    let client_mux = Mux::new(b, MuxConfig::default());

    let folder = MemoryFolder::new();
    let factory_folder = folder.clone();
    let server = Loader::serve(
        &server_mux,
        move |name: &str| Ok(Arc::new(factory_folder.storage(name)) as Arc<dyn RandomAccess>),
        LoaderConfig::default(),
    )
    .await?;

    let greeting = server.load("greeting.txt").await?;
    greeting.write(0, Bytes::from_static(b"hello")).await?;

    let files = FileFactory::connect(&client_mux, LoaderConfig::default()).await?;
    let remote = files.file("greeting.txt");
    remote.write(5, Bytes::from_static(b", world")).await?;

    let stat = remote.stat().await?;
    let text = remote.read(0, stat.size).await?;
    tracing::info!(size = stat.size, text = %String::from_utf8_lossy(&text), "read back");

    server.unload_all().await?;
    match remote.read(0, 1).await {
        Err(e) => tracing::info!(error = %e, "closed after unload"),
        Ok(_) => tracing::warn!("read succeeded after unload"),
    }

    if let Some(contents) = folder.contents("greeting.txt") {
        println!("{}", String::from_utf8_lossy(&contents));
    }
    Ok(())
}
