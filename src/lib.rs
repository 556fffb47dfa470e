//! # overlay-lookup
//!
//! Client core for an overlay-network lookup service.
//!
//! A port daemon uses this crate to resolve virtual network identities over a
//! single byte stream to the lookup service:
//!
//! - **VL2**: virtual MAC to the underlay endpoint hosting it
//! - **VL3**: virtual IP to its owning MAC and underlay endpoint
//! - **Bulk**: a network's mappings page by page, driven by the caller
//! - **Log**: server-pushed mapping changes, applied in sequence order, with
//!   resynchronization on gaps and periodic checkpoints
//! - **Shootdown**: server-pushed invalidations that win races against
//!   in-flight resolutions
//!
//! Establishing the connection is the caller's job. The client takes over a
//! connected reader/writer pair and reports when the connection ends.
//!
//! ## Example
//!
//! ```ignore
//! use overlay_lookup::{Client, Cursor, VnetId};
//!
//! let client = Client::builder().start(reader, writer)?;
//!
//! let mut cursor = Cursor::start();
//! loop {
//!     let page = client.bulk_resolve(VnetId(7), cursor).await?;
//!     println!("{} records", page.records.len());
//!     match page.next {
//!         Some(next) => cursor = next,
//!         None => break,
//!     }
//! }
//! client.subscribe_log(VnetId(7), 1).await?;
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod log_stream;
pub mod protocol;
pub mod shootdown;
pub mod tracker;
pub mod types;
pub mod writer;

mod client;

pub use cache::{MappingCache, MemoryCache, Stamp, StampClock};
pub use client::{Client, ClientBuilder, ConnectionState, DisconnectReason};
pub use config::ClientConfig;
pub use error::{LookupError, Result};
pub use log_stream::LogState;
pub use types::{
    BulkPage, Cursor, Lookup, MacAddr, MappingKey, MappingRecord, Vl2Mapping, Vl3Mapping,
    Vl3Resolution, VnetId,
};
