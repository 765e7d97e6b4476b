//! Core data model: proxy identifiers and per-proxy health records

mod entry;
mod proxy;

pub use entry::{Entry, EvictionThresholds};
pub use proxy::{Protocol, ProxyId};
