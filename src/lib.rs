//! Carousel - Rotating Proxy Pool Router
//!
//! A rotating proxy pool router with a built-in verification lifecycle.
//!
//! ## Features
//!
//! - Sharded, actor-based pool of verified proxies with per-entry health
//!   records and hourly circuit breaking
//! - Serialized routing with cross-shard retry, in-band 552/429 statuses and
//!   leaky-bucket backpressure
//! - Verification lifecycle engine: source intake, checker workers, bounded
//!   reverify loop and a deduplicated failure blacklist
//! - Crash-safe binary snapshots with backup fallback
//! - HTTP, HTTPS, SOCKS4 and SOCKS5 proxy identifiers

pub mod clock;
pub mod collab;
pub mod config;
pub mod error;
pub mod models;
pub mod persist;
pub mod pool;
pub mod probe;

pub use config::Config;
pub use error::{CarouselError, Result};
pub use models::{Entry, Protocol, ProxyId};
pub use pool::{Pool, ProxyRequest};
pub use probe::Probe;
