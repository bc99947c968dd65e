//! PF_KEY v2 key engine.
//!
//! This crate implements the kernel side of the PF_KEY v2 key management
//! interface (RFC 2367 with the KAME policy extensions): a Security Policy
//! Database, a Security Association Database, SPI allocation, acquire
//! notifications, and lifetime expiry, driven by PF_KEY messages.
//!
//! # Features
//!
//! - `serde` - Deserialize [`key::KeyConfig`] from JSON
//! - `output` - JSON/text output formatting of dump replies
//! - `full` - All features enabled
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pfkey::key::{ChannelSink, DefaultAlgorithms, KeyConfig, KeyManager, MonotonicClock};
//! use pfkey::key::{SadbState, StaticAddresses};
//!
//! #[tokio::main]
//! async fn main() -> pfkey::Result<()> {
//!     let state = SadbState::new(
//!         KeyConfig::default(),
//!         Arc::new(StaticAddresses::new().with("192.0.2.1".parse().unwrap(), 32)),
//!         Arc::new(DefaultAlgorithms),
//!     );
//!     let sink = Arc::new(ChannelSink::new(64));
//!     let (handle, task) = KeyManager::new(state, sink, MonotonicClock::new()).spawn();
//!
//!     // Feed PF_KEY messages with handle.send(socket, bytes)
//!
//!     handle.shutdown().await?;
//!     task.await.ok();
//!     Ok(())
//! }
//! ```

// Core modules (always available)
pub mod key;
pub mod util;

// Feature-gated modules
#[cfg(feature = "output")]
pub mod output;

// Re-export common types at crate root for convenience
pub use key::{Error, KeyHandle, KeyManager, Result, SadbState};
