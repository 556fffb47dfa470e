//! Resolve - connect to a lookup server and follow one virtual network.
//!
//! This demo:
//! - Resolves a single MAC address
//! - Walks the network's mappings page by page
//! - Subscribes to the network's log and keeps the cache current until
//!   the server closes the connection or Ctrl-C is pressed
//!
//! # Running
//!
//! ```text
//! RUST_LOG=overlay_lookup=debug cargo run --example resolve -- 127.0.0.1:1296 7 aa:bb:cc:dd:ee:ff
//! ```

use std::net::SocketAddr;

use overlay_lookup::{Client, Cursor, Lookup, MacAddr, MemoryCache, VnetId};
use tokio::net::TcpStream;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let server: SocketAddr = args.next().unwrap_or_else(|| "127.0.0.1:1296".into()).parse()?;
    let vnet = VnetId(args.next().map_or(Ok(7), |v| v.parse())?);
    let mac: MacAddr = args
        .next()
        .unwrap_or_else(|| "aa:bb:cc:dd:ee:ff".into())
        .parse()?;

    let stream = TcpStream::connect(server).await?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();

    let cache = std::sync::Arc::new(MemoryCache::new());
    let client = Client::builder().cache(cache.clone()).start(reader, writer)?;
    info!(%server, "connected");

    match client.resolve_vl2(vnet, mac).await? {
        Lookup::Found(underlay) => info!(%vnet, %mac, %underlay, "resolved"),
        Lookup::Stale(underlay) => info!(%vnet, %mac, %underlay, "resolved, invalidated meanwhile"),
        Lookup::NotFound => info!(%vnet, %mac, "no mapping"),
    }

    let mut cursor = Cursor::start();
    let mut pages = 0;
    loop {
        let page = client.bulk_resolve(vnet, cursor).await?;
        pages += 1;
        if page.is_done() {
            break;
        }
        cursor = page.next.unwrap_or_default();
    }
    info!(%vnet, pages, cached = cache.len(vnet), "bulk walk complete");

    client.subscribe_log(vnet, 1).await?;
    info!(%vnet, "following log");

    tokio::select! {
        reason = client.closed() => info!(?reason, "connection ended"),
        _ = tokio::signal::ctrl_c() => client.shutdown(),
    }

    info!(
        cached = cache.len(vnet),
        shootdowns = client.shootdowns_handled(),
        resume = ?client.resume_point(vnet),
        "done"
    );
    Ok(())
}
